//! HTTP client for one CalDAV source.
//!
//! Requests go out unauthenticated until the server answers 401; the
//! challenge is then answered once (Digest when offered, Basic otherwise)
//! and a Digest challenge is reused for later requests.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, ETAG, WWW_AUTHENTICATE};
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, trace};

use calsync_core::mask_secret;

use crate::error::{ProviderError, ProviderResult};

use super::auth::{DigestChallenge, basic_auth};
use super::config::CalDavConfig;

const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";
const ICS_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

/// Status, ETag and body of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavReply {
    pub status: u16,
    pub etag: Option<String>,
    pub body: String,
}

impl DavReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts a non-2xx reply into an error.
    pub fn into_success(self, context: impl std::fmt::Display) -> ProviderResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProviderError::from_status(self.status, context))
        }
    }
}

/// One request: method, target and optional payload.
struct DavRequest<'a> {
    method: Method,
    url: &'a str,
    body: Option<(&'a str, &'static str)>,
    headers: Vec<(&'static str, String)>,
}

/// HTTP client bound to one source's settings.
pub struct CalDavClient {
    client: Client,
    config: CalDavConfig,
    timeout: Duration,
    digest: Option<DigestChallenge>,
}

impl CalDavClient {
    /// Wraps a shared `reqwest` client with per-source settings.
    pub fn new(client: Client, config: CalDavConfig, timeout: Duration) -> Self {
        Self {
            client,
            config,
            timeout,
            digest: None,
        }
    }

    pub fn config(&self) -> &CalDavConfig {
        &self.config
    }

    /// PROPFIND; 207 and 200 are success.
    pub async fn propfind(&mut self, url: &str, body: &str, depth: u8) -> ProviderResult<String> {
        let reply = self
            .send(DavRequest {
                method: dav_method("PROPFIND")?,
                url,
                body: Some((body, XML_CONTENT_TYPE)),
                headers: vec![("Depth", depth.to_string())],
            })
            .await?;
        Ok(reply.into_success(format_args!("PROPFIND {}", url))?.body)
    }

    /// REPORT at depth 1.
    pub async fn report(&mut self, url: &str, body: &str) -> ProviderResult<String> {
        let reply = self
            .send(DavRequest {
                method: dav_method("REPORT")?,
                url,
                body: Some((body, XML_CONTENT_TYPE)),
                headers: vec![("Depth", "1".to_string())],
            })
            .await?;
        Ok(reply.into_success(format_args!("REPORT {}", url))?.body)
    }

    /// PUT an iCalendar object. The reply is returned whatever its status.
    pub async fn put(
        &mut self,
        url: &str,
        ics: &str,
        headers: Vec<(&'static str, String)>,
    ) -> ProviderResult<DavReply> {
        self.send(DavRequest {
            method: Method::PUT,
            url,
            body: Some((ics, ICS_CONTENT_TYPE)),
            headers,
        })
        .await
    }

    /// DELETE an object. The reply is returned whatever its status.
    pub async fn delete(
        &mut self,
        url: &str,
        headers: Vec<(&'static str, String)>,
    ) -> ProviderResult<DavReply> {
        self.send(DavRequest {
            method: Method::DELETE,
            url,
            body: None,
            headers,
        })
        .await
    }

    async fn send(&mut self, request: DavRequest<'_>) -> ProviderResult<DavReply> {
        let authorization = self.digest_authorization(&request);
        let response = self.dispatch(&request, authorization).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return read_reply(response).await;
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let (Some(username), Some(password)) = (self.config.username.clone(), self.config.password.clone())
        else {
            return Err(ProviderError::authentication(
                "Server requires authentication but no credentials are configured",
            )
            .with_status(401));
        };

        debug!(
            url = %request.url,
            username = %username,
            password = %mask_secret(&password),
            "Answering authentication challenge"
        );

        let header = match challenge.as_deref().and_then(DigestChallenge::parse) {
            Some(mut digest) => {
                let header = digest.authorize(
                    request.method.as_str(),
                    &request_path(request.url),
                    &username,
                    &password,
                );
                self.digest = Some(digest);
                header
            }
            None => basic_auth(&username, &password),
        };

        let response = self.dispatch(&request, Some(header)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.digest = None;
            return Err(ProviderError::authentication("Credentials rejected by server").with_status(401));
        }
        read_reply(response).await
    }

    fn digest_authorization(&mut self, request: &DavRequest<'_>) -> Option<String> {
        let digest = self.digest.as_mut()?;
        let (username, password) = (self.config.username.as_deref()?, self.config.password.as_deref()?);
        Some(digest.authorize(
            request.method.as_str(),
            &request_path(request.url),
            username,
            password,
        ))
    }

    async fn dispatch(
        &self,
        request: &DavRequest<'_>,
        authorization: Option<String>,
    ) -> ProviderResult<reqwest::Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url)
            .timeout(self.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if let Some((body, content_type)) = request.body {
            builder = builder.header(CONTENT_TYPE, content_type).body(body.to_string());
        }
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }

        trace!(method = %request.method, url = %request.url, "Sending request");

        builder.send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("{} {} timed out", request.method, request.url)
            } else {
                format!("{} {} failed: {}", request.method, request.url, e)
            };
            ProviderError::network(message).with_source(e)
        })
    }
}

async fn read_reply(response: reqwest::Response) -> ProviderResult<DavReply> {
    let status = response.status().as_u16();
    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::network(format!("Failed to read response: {}", e)))?;
    trace!(status, "Received response");
    Ok(DavReply { status, etag, body })
}

fn dav_method(name: &str) -> ProviderResult<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|_| ProviderError::internal(format!("Invalid HTTP method: {}", name)))
}

/// Request-URI used in the Digest response.
fn request_path(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| match u.query() {
            Some(query) => format!("{}?{}", u.path(), query),
            None => u.path().to_string(),
        })
        .unwrap_or_else(|_| url.to_string())
}
