//! WebDAV request bodies and multistatus parsing.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, Event};

use crate::error::{ProviderError, ProviderResult};

pub const DAV_NS: &str = "DAV:";
pub const CALDAV_NS: &str = "urn:ietf:params:xml:ns:caldav";
/// CalendarServer extensions (`getctag`).
pub const CS_NS: &str = "http://calendarserver.org/ns/";

/// A calendar collection found by PROPFIND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCalendar {
    pub href: String,
    pub display_name: Option<String>,
    /// Collection tag, changes whenever any object in the calendar changes.
    pub ctag: Option<String>,
}

/// One `<response>` of a calendar-query REPORT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarObject {
    pub href: String,
    pub etag: Option<String>,
    pub data: String,
}

struct XmlBody {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlBody {
    fn new() -> Self {
        Self {
            writer: Writer::new(Cursor::new(Vec::new())),
        }
    }

    fn write(&mut self, event: Event<'_>) -> ProviderResult<&mut Self> {
        self.writer
            .write_event(event)
            .map_err(|e| ProviderError::internal(format!("Failed to write XML: {}", e)))?;
        Ok(self)
    }

    fn open(&mut self, element: BytesStart<'_>) -> ProviderResult<&mut Self> {
        self.write(Event::Start(element))
    }

    fn close(&mut self, name: &str) -> ProviderResult<&mut Self> {
        self.write(Event::End(BytesEnd::new(name)))
    }

    fn empty(&mut self, name: &str) -> ProviderResult<&mut Self> {
        self.write(Event::Empty(BytesStart::new(name)))
    }

    fn finish(self) -> ProviderResult<String> {
        String::from_utf8(self.writer.into_inner().into_inner())
            .map_err(|e| ProviderError::internal(format!("XML body is not UTF-8: {}", e)))
    }
}

fn root(name: &str, namespaces: &[(&str, &str)]) -> BytesStart<'static> {
    let mut element = BytesStart::new(name.to_string());
    for ns in namespaces {
        element.push_attribute(*ns);
    }
    element
}

/// PROPFIND body asking for name, type and CTag.
pub fn propfind_calendars_body() -> ProviderResult<String> {
    let mut body = XmlBody::new();
    body.open(root(
        "d:propfind",
        &[("xmlns:d", DAV_NS), ("xmlns:c", CALDAV_NS), ("xmlns:cs", CS_NS)],
    ))?
    .open(BytesStart::new("d:prop"))?
    .empty("d:displayname")?
    .empty("d:resourcetype")?
    .empty("cs:getctag")?
    .close("d:prop")?
    .close("d:propfind")?;
    body.finish()
}

/// calendar-query REPORT body for VEVENTs overlapping `[start, end)`.
pub fn calendar_query_body(start: DateTime<Utc>, end: DateTime<Utc>) -> ProviderResult<String> {
    let mut time_range = BytesStart::new("c:time-range");
    time_range.push_attribute(("start", format_utc(start).as_str()));
    time_range.push_attribute(("end", format_utc(end).as_str()));

    let mut vcalendar = BytesStart::new("c:comp-filter");
    vcalendar.push_attribute(("name", "VCALENDAR"));
    let mut vevent = BytesStart::new("c:comp-filter");
    vevent.push_attribute(("name", "VEVENT"));

    let mut body = XmlBody::new();
    body.open(root(
        "c:calendar-query",
        &[("xmlns:d", DAV_NS), ("xmlns:c", CALDAV_NS)],
    ))?
    .open(BytesStart::new("d:prop"))?
    .empty("d:getetag")?
    .empty("c:calendar-data")?
    .close("d:prop")?
    .open(BytesStart::new("c:filter"))?
    .open(vcalendar)?
    .open(vevent)?
    .write(Event::Empty(time_range))?
    .close("c:comp-filter")?
    .close("c:comp-filter")?
    .close("c:filter")?
    .close("c:calendar-query")?;
    body.finish()
}

/// Which text-bearing element the reader is inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Href,
    DisplayName,
    CTag,
    ETag,
    CalendarData,
}

impl Field {
    fn from_local(local: &str) -> Option<Self> {
        match local {
            "href" => Some(Self::Href),
            "displayname" => Some(Self::DisplayName),
            "getctag" => Some(Self::CTag),
            "getetag" => Some(Self::ETag),
            "calendar-data" => Some(Self::CalendarData),
            _ => None,
        }
    }
}

/// Accumulated properties of one `<response>`.
#[derive(Default)]
struct ResponseProps {
    href: Option<String>,
    display_name: Option<String>,
    ctag: Option<String>,
    etag: Option<String>,
    data: Option<String>,
    is_calendar: bool,
}

impl ResponseProps {
    fn set(&mut self, field: Field, text: String) {
        let slot = match field {
            Field::Href => &mut self.href,
            Field::DisplayName => &mut self.display_name,
            Field::CTag => &mut self.ctag,
            Field::ETag => &mut self.etag,
            Field::CalendarData => &mut self.data,
        };
        match slot {
            // calendar-data may arrive as several text/CDATA chunks
            Some(existing) if field == Field::CalendarData => existing.push_str(&text),
            _ => *slot = Some(text),
        }
    }
}

/// Walks a multistatus document, yielding each `<response>`'s properties.
fn scan_multistatus(xml: &str) -> ProviderResult<Vec<ResponseProps>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut responses = Vec::new();
    let mut current: Option<ResponseProps> = None;
    let mut field: Option<Field> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            ProviderError::invalid_response(format!(
                "Malformed multistatus at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match local_name(&name) {
                    "response" => current = Some(ResponseProps::default()),
                    "calendar" => {
                        if let Some(props) = current.as_mut() {
                            props.is_calendar = true;
                        }
                    }
                    local => field = Field::from_local(local),
                }
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if local_name(&name) == "calendar" {
                    if let Some(props) = current.as_mut() {
                        props.is_calendar = true;
                    }
                }
            }
            Event::Text(e) => {
                if let (Some(f), Some(props)) = (field, current.as_mut()) {
                    let text = e
                        .unescape()
                        .map_err(|e| ProviderError::invalid_response(format!("Bad XML text: {}", e)))?;
                    props.set(f, text.into_owned());
                }
            }
            Event::CData(e) => {
                if let (Some(f), Some(props)) = (field, current.as_mut()) {
                    props.set(f, String::from_utf8_lossy(&e).into_owned());
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if local_name(&name) == "response" {
                    responses.extend(current.take());
                }
                field = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(responses)
}

/// Extracts the calendar collections of a PROPFIND reply.
pub fn parse_propfind_response(xml: &str) -> ProviderResult<Vec<DiscoveredCalendar>> {
    Ok(scan_multistatus(xml)?
        .into_iter()
        .filter(|props| props.is_calendar)
        .filter_map(|props| {
            Some(DiscoveredCalendar {
                href: props.href?,
                display_name: props.display_name,
                ctag: props.ctag,
            })
        })
        .collect())
}

/// Extracts the calendar objects of a REPORT reply.
pub fn parse_report_response(xml: &str) -> ProviderResult<Vec<CalendarObject>> {
    Ok(scan_multistatus(xml)?
        .into_iter()
        .filter_map(|props| {
            Some(CalendarObject {
                href: props.href?,
                etag: props.etag,
                data: props.data?,
            })
        })
        .collect())
}

/// Returns true if a depth-0 PROPFIND reply describes a reachable resource.
pub fn has_any_response(xml: &str) -> bool {
    scan_multistatus(xml).is_ok_and(|responses| !responses.is_empty())
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn format_utc(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn propfind_body() {
        let body = propfind_calendars_body().unwrap();
        assert!(body.starts_with("<d:propfind xmlns:d=\"DAV:\""));
        assert!(body.contains("<d:displayname/>"));
        assert!(body.contains("<cs:getctag/>"));
        assert!(body.ends_with("</d:propfind>"));
    }

    #[test]
    fn calendar_query_body_has_time_range() {
        let start = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 2, 28, 23, 59, 59).unwrap();
        let body = calendar_query_body(start, end).unwrap();
        assert!(body.contains(r#"<c:time-range start="20250201T000000Z" end="20250228T235959Z"/>"#));
        assert!(body.contains(r#"<c:comp-filter name="VEVENT">"#));
    }

    #[test]
    fn parses_calendars_with_ctag() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav" xmlns:cs="http://calendarserver.org/ns/">
  <d:response>
    <d:href>/calendars/alice/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/calendars/alice/work/</d:href>
    <d:propstat>
      <d:prop>
        <d:displayname>Work &amp; Projects</d:displayname>
        <d:resourcetype><d:collection/><C:calendar/></d:resourcetype>
        <cs:getctag>"ctag-7"</cs:getctag>
      </d:prop>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

        let calendars = parse_propfind_response(xml).unwrap();
        assert_eq!(
            calendars,
            vec![DiscoveredCalendar {
                href: "/calendars/alice/work/".into(),
                display_name: Some("Work & Projects".into()),
                ctag: Some("\"ctag-7\"".into()),
            }]
        );
    }

    #[test]
    fn parses_report_objects() {
        let xml = r#"<multistatus xmlns="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <response>
    <href>/calendars/alice/work/e1.ics</href>
    <propstat><prop>
      <getetag>"abc123"</getetag>
      <C:calendar-data><![CDATA[BEGIN:VCALENDAR
BEGIN:VEVENT
UID:e1
SUMMARY:Team Meeting
DTSTART:20250205T100000Z
END:VEVENT
END:VCALENDAR]]></C:calendar-data>
    </prop></propstat>
  </response>
  <response>
    <href>/calendars/alice/work/gone.ics</href>
    <status>HTTP/1.1 404 Not Found</status>
  </response>
</multistatus>"#;

        let objects = parse_report_response(xml).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].href, "/calendars/alice/work/e1.ics");
        assert_eq!(objects[0].etag.as_deref(), Some("\"abc123\""));
        assert!(objects[0].data.contains("Team Meeting"));
    }

    #[test]
    fn malformed_xml_is_invalid_response() {
        let err = parse_report_response("<multistatus><response></multistatus>").unwrap_err();
        assert_eq!(err.code(), crate::ProviderErrorCode::InvalidResponse);
        assert!(!has_any_response("<oops"));
    }
}
