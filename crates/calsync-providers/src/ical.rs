//! Line-scanning iCalendar codec shared by the feed and CalDAV adapters.
//!
//! Parsing is lenient: folded lines are joined, unknown properties and
//! nested components (VALARM, VTIMEZONE) are skipped, and a VEVENT without
//! a parseable `DTSTART` is dropped instead of failing the document.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use tracing::debug;

use calsync_core::{EventContent, EventStatus};

use crate::raw_event::{RawEvent, RawEventTime};

const PRODID: &str = "-//calsync//calsync//EN";

/// Folding limit in octets, excluding the CRLF.
const MAX_LINE_OCTETS: usize = 75;

static BREAK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p\s*>|</div\s*>|</li\s*>").expect("Invalid break regex"));

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("Invalid tag regex"));

/// Joins folded continuation lines.
pub fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = line.strip_prefix([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

/// A property line split into name, parameters and value.
#[derive(Debug, PartialEq, Eq)]
struct ContentLine<'a> {
    name: String,
    params: Vec<(String, String)>,
    value: &'a str,
}

impl ContentLine<'_> {
    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

fn split_line(line: &str) -> Option<ContentLine<'_>> {
    let mut in_quotes = false;
    let colon = line.char_indices().find_map(|(i, c)| match c {
        '"' => {
            in_quotes = !in_quotes;
            None
        }
        ':' if !in_quotes => Some(i),
        _ => None,
    })?;

    let (head, value) = (&line[..colon], &line[colon + 1..]);
    let mut parts = head.split(';');
    let name = parts.next()?.trim().to_ascii_uppercase();
    let params = parts
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.trim().to_ascii_uppercase(), v.trim_matches('"').to_string()))
        .collect();
    Some(ContentLine {
        name,
        params,
        value,
    })
}

#[derive(Default)]
struct VEventBuilder {
    uid: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    start: Option<RawEventTime>,
    end: Option<RawEventTime>,
    duration: Option<Duration>,
    status: Option<String>,
    recurrence_id: Option<String>,
    rrule: Option<String>,
}

impl VEventBuilder {
    fn apply(&mut self, line: &ContentLine<'_>) {
        let value = line.value;
        match line.name.as_str() {
            "UID" => self.uid = non_empty(value.trim()),
            "SUMMARY" => self.summary = non_empty(&unescape_text(value)),
            "DESCRIPTION" => self.description = non_empty(&strip_html(&unescape_text(value))),
            "LOCATION" => self.location = non_empty(&unescape_text(value)),
            "DTSTART" => self.start = parse_ics_datetime(value, line.param("VALUE")),
            "DTEND" => self.end = parse_ics_datetime(value, line.param("VALUE")),
            "DURATION" => self.duration = parse_duration(value),
            "STATUS" => self.status = non_empty(value.trim()),
            "RECURRENCE-ID" => {
                self.recurrence_id = parse_ics_datetime(value, line.param("VALUE"))
                    .map(|t| format_utc(t.to_utc()))
                    .or_else(|| non_empty(value.trim()));
            }
            "RRULE" => self.rrule = non_empty(value.trim()),
            _ => {}
        }
    }

    fn finish(self) -> Option<RawEvent> {
        let start = self.start?;
        let end = self.end.or_else(|| {
            self.duration
                .map(|d| RawEventTime::DateTime(start.to_utc() + d))
        });
        Some(RawEvent {
            uid: self.uid,
            summary: self.summary,
            description: self.description,
            location: self.location,
            start,
            end,
            status: self.status,
            recurrence_id: self.recurrence_id,
            rrule: self.rrule,
            href: None,
            etag: None,
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Extracts every VEVENT of a document.
///
/// Events without a usable start are dropped. Completeness (UID, title,
/// end) is left to the caller.
pub fn parse_events(ics: &str) -> Vec<RawEvent> {
    let mut events = Vec::new();
    let mut current: Option<VEventBuilder> = None;
    let mut nested = 0usize;

    for line in unfold(ics) {
        let Some(content) = split_line(&line) else {
            continue;
        };
        let value = content.value.trim().to_ascii_uppercase();
        match (content.name.as_str(), current.as_mut()) {
            ("BEGIN", None) if value == "VEVENT" => {
                current = Some(VEventBuilder::default());
                nested = 0;
            }
            ("BEGIN", Some(_)) => nested += 1,
            ("END", Some(_)) if nested > 0 => nested -= 1,
            ("END", Some(_)) if value == "VEVENT" => {
                if let Some(builder) = current.take() {
                    match builder.finish() {
                        Some(event) => events.push(event),
                        None => debug!("skipping VEVENT without a usable DTSTART"),
                    }
                }
            }
            (_, Some(builder)) if nested == 0 => builder.apply(&content),
            _ => {}
        }
    }

    events
}

/// Parses `DTSTART`/`DTEND` style values.
///
/// `YYYYMMDD` (or `VALUE=DATE`) is a date, `...Z` is UTC, a floating
/// timestamp is treated as UTC, and anything else is tried as RFC 3339.
pub fn parse_ics_datetime(value: &str, value_type: Option<&str>) -> Option<RawEventTime> {
    let value = value.trim();
    let date_only = value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit());
    if date_only || value_type.is_some_and(|t| t.eq_ignore_ascii_case("DATE")) {
        return NaiveDate::parse_from_str(value, "%Y%m%d")
            .ok()
            .map(RawEventTime::Date);
    }
    if let Some(utc) = value.strip_suffix('Z') {
        if let Ok(dt) = NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S") {
            return Some(RawEventTime::DateTime(dt.and_utc()));
        }
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S") {
        return Some(RawEventTime::DateTime(dt.and_utc()));
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| RawEventTime::DateTime(dt.with_timezone(&Utc)))
}

/// Parses an RFC 5545 duration such as `PT1H30M` or `-P1D`.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (sign, body) = match value.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, value.strip_prefix('+').unwrap_or(value)),
    };
    let body = body.strip_prefix('P')?;
    let mut total = Duration::zero();
    let mut number = String::new();
    let mut in_time = false;
    for c in body.chars() {
        match c {
            'T' => in_time = true,
            '0'..='9' => number.push(c),
            unit => {
                let n: i64 = number.parse().ok()?;
                number.clear();
                total += match (unit, in_time) {
                    ('W', false) => Duration::weeks(n),
                    ('D', false) => Duration::days(n),
                    ('H', true) => Duration::hours(n),
                    ('M', true) => Duration::minutes(n),
                    ('S', true) => Duration::seconds(n),
                    _ => return None,
                };
            }
        }
    }
    number.is_empty().then_some(total * sign)
}

/// Decodes `\n`, `\N`, `\,`, `\;` and `\\`.
pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Escapes text for a TEXT property value.
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            other => out.push(other),
        }
    }
    out
}

/// Removes HTML markup from a description, keeping line breaks.
pub fn strip_html(text: &str) -> String {
    if !text.contains('<') && !text.contains('&') {
        return text.to_string();
    }
    let with_breaks = BREAK_REGEX.replace_all(text, "\n");
    let without_tags = TAG_REGEX.replace_all(&with_breaks, "");
    without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

fn format_utc(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Splits a content line into folded physical lines.
fn fold_line(line: &str, out: &mut String) {
    let mut width = 0;
    for c in line.chars() {
        let len = c.len_utf8();
        if width + len > MAX_LINE_OCTETS {
            out.push_str("\r\n ");
            width = 1;
        }
        out.push(c);
        width += len;
    }
    out.push_str("\r\n");
}

/// Serializes one event as a single-VEVENT VCALENDAR document.
pub fn serialize_event(uid: &str, content: &EventContent, stamp: DateTime<Utc>) -> String {
    let mut lines = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        format!("PRODID:{}", PRODID),
        "BEGIN:VEVENT".to_string(),
        format!("UID:{}", uid),
        format!("DTSTAMP:{}", format_utc(stamp)),
    ];

    if content.all_day {
        lines.push(format!("DTSTART;VALUE=DATE:{}", content.start.format("%Y%m%d")));
        lines.push(format!("DTEND;VALUE=DATE:{}", content.end.format("%Y%m%d")));
    } else {
        lines.push(format!("DTSTART:{}", format_utc(content.start)));
        lines.push(format!("DTEND:{}", format_utc(content.end)));
    }

    lines.push(format!("SUMMARY:{}", escape_text(&content.title)));
    if let Some(ref description) = content.description {
        lines.push(format!("DESCRIPTION:{}", escape_text(description)));
    }
    if let Some(ref location) = content.location {
        lines.push(format!("LOCATION:{}", escape_text(location)));
    }
    let status = match content.status {
        EventStatus::Cancelled => "CANCELLED",
        _ => "CONFIRMED",
    };
    lines.push(format!("STATUS:{}", status));
    lines.push("END:VEVENT".to_string());
    lines.push("END:VCALENDAR".to_string());

    let mut out = String::new();
    for line in &lines {
        fold_line(line, &mut out);
    }
    out
}
