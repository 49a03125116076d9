//! Recurrence rules: parsing, expansion and next-due-date solving.
//!
//! Exact occurrences always come from the `rrule` expander. The
//! frequency-specific arithmetic in this module is only a bounded-cost
//! approximation, used as a cross-check and as the fallback when the
//! expander cannot produce an answer.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc, Weekday};
use rrule::RRuleSet;
use tracing::{debug, warn};

use crate::time::{TimeWindow, end_of_day, start_of_day};

/// Results requested from the expander when looking for the next due date.
const EXACT_SEARCH_LIMIT: u16 = 100;

/// Instances generated at most when expanding a recurring event.
pub const EXPANSION_LIMIT: u16 = 1000;

/// Recurrence frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Yearly => "YEARLY",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DAILY" => Some(Self::Daily),
            "WEEKLY" => Some(Self::Weekly),
            "MONTHLY" => Some(Self::Monthly),
            "YEARLY" => Some(Self::Yearly),
            _ => None,
        }
    }
}

/// A `BYDAY` entry, e.g. `FR` or `-1SU`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByDay {
    /// Position within the month/year (`1` first, `-1` last).
    pub ordinal: Option<i16>,
    pub weekday: Weekday,
}

impl ByDay {
    /// Every occurrence of `weekday`.
    pub fn every(weekday: Weekday) -> Self {
        Self {
            ordinal: None,
            weekday,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_uppercase();
        if value.len() < 2 || !value.is_ascii() {
            return None;
        }
        let (prefix, code) = value.split_at(value.len() - 2);
        let weekday = weekday_from_code(code)?;
        let ordinal = if prefix.is_empty() {
            None
        } else {
            let n: i16 = prefix.parse().ok()?;
            if n == 0 || !(-53..=53).contains(&n) {
                return None;
            }
            Some(n)
        };
        Some(Self { ordinal, weekday })
    }
}

impl fmt::Display for ByDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(n) = self.ordinal {
            write!(f, "{}", n)?;
        }
        f.write_str(weekday_code(self.weekday))
    }
}

fn weekday_code(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

fn weekday_from_code(code: &str) -> Option<Weekday> {
    match code {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

/// A parsed recurrence rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub frequency: Frequency,
    /// Always at least 1.
    pub interval: u32,
    pub by_day: Vec<ByDay>,
    /// Months 1..=12.
    pub by_month: Vec<u32>,
    pub count: Option<u32>,
    pub until: Option<DateTime<Utc>>,
}

impl Rule {
    /// A rule firing every period.
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: 1,
            by_day: Vec::new(),
            by_month: Vec::new(),
            count: None,
            until: None,
        }
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval.max(1);
        self
    }

    pub fn with_by_day(mut self, days: impl IntoIterator<Item = ByDay>) -> Self {
        self.by_day = days.into_iter().collect();
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Plain (ordinal-free) weekdays of `BYDAY`.
    fn weekdays(&self) -> Vec<Weekday> {
        self.by_day
            .iter()
            .filter(|d| d.ordinal.is_none())
            .map(|d| d.weekday)
            .collect()
    }

    fn to_rrule_set(&self, dtstart: DateTime<Utc>) -> Result<RRuleSet, rrule::RRuleError> {
        format!(
            "DTSTART:{}\nRRULE:{}",
            dtstart.format("%Y%m%dT%H%M%SZ"),
            self
        )
        .parse::<RRuleSet>()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FREQ={}", self.frequency.as_str())?;
        if self.interval != 1 {
            write!(f, ";INTERVAL={}", self.interval)?;
        }
        if !self.by_day.is_empty() {
            let days: Vec<String> = self.by_day.iter().map(ToString::to_string).collect();
            write!(f, ";BYDAY={}", days.join(","))?;
        }
        if !self.by_month.is_empty() {
            let months: Vec<String> = self.by_month.iter().map(ToString::to_string).collect();
            write!(f, ";BYMONTH={}", months.join(","))?;
        }
        if let Some(count) = self.count {
            write!(f, ";COUNT={}", count)?;
        }
        if let Some(until) = self.until {
            write!(f, ";UNTIL={}", until.format("%Y%m%dT%H%M%SZ"))?;
        }
        Ok(())
    }
}

/// Parses `FREQ=...;INTERVAL=...;BYDAY=...;BYMONTH=...;COUNT=...;UNTIL=...`.
///
/// A leading `RRULE:` is accepted and keys are case-insensitive. Returns
/// `None` when there is no usable frequency, which means "no recurrence".
pub fn parse_rule(text: &str) -> Option<Rule> {
    let mut body = text.trim();
    if body
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("RRULE:"))
    {
        body = &body[6..];
    }

    let mut frequency = None;
    let mut rule = Rule::new(Frequency::Daily);
    for part in body.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_uppercase().as_str() {
            "FREQ" => frequency = Frequency::parse(value),
            "INTERVAL" => {
                rule.interval = value.parse().ok().filter(|n: &u32| *n >= 1).unwrap_or(1);
            }
            "BYDAY" => rule.by_day = value.split(',').filter_map(ByDay::parse).collect(),
            "BYMONTH" => {
                rule.by_month = value
                    .split(',')
                    .filter_map(|m| m.trim().parse().ok())
                    .filter(|m| (1..=12).contains(m))
                    .collect();
            }
            "COUNT" => rule.count = value.parse().ok(),
            "UNTIL" => rule.until = parse_until(value),
            _ => {}
        }
    }

    rule.frequency = frequency?;
    Some(rule)
}

/// `UNTIL` accepts UTC, floating and date-only forms; a bare date means the
/// end of that day.
fn parse_until(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S") {
        return Some(dt.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
        return date.and_hms_opt(23, 59, 59).map(|dt| dt.and_utc());
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Expands a recurring event into `(start, end)` instances starting inside
/// `window`.
///
/// Each instance keeps the seed's duration. At most [`EXPANSION_LIMIT`]
/// instances are produced. If the rule cannot be expanded the seed itself
/// is returned.
pub fn expand(
    rule: &Rule,
    window: TimeWindow,
    seed_start: DateTime<Utc>,
    seed_end: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let set = match rule.to_rrule_set(seed_start) {
        Ok(set) => set,
        Err(e) => {
            warn!(rule = %rule, error = %e, "cannot expand recurrence, keeping seed event");
            return vec![(seed_start, seed_end)];
        }
    };

    let tz: rrule::Tz = Utc.into();
    let result = set
        .after((window.start - Duration::seconds(1)).with_timezone(&tz))
        .before(window.end.with_timezone(&tz))
        .all(EXPANSION_LIMIT);
    if result.limited {
        debug!(rule = %rule, limit = EXPANSION_LIMIT, "recurrence expansion truncated");
    }

    let duration = seed_end - seed_start;
    result
        .dates
        .iter()
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|start| window.contains(*start))
        .map(|start| (start, start + duration))
        .collect()
}

/// Returns the next due date strictly after `max(previous_due, reference)`.
///
/// Dates are compared at day granularity and the result is normalized to
/// 23:59:59.999 of the due day. `None` means the series has no further
/// occurrences.
pub fn next_due_date(
    rule: &Rule,
    anchor: NaiveDate,
    previous_due: Option<NaiveDate>,
    reference: NaiveDate,
) -> Option<NaiveDateTime> {
    let compare = previous_due.map_or(reference, |prev| prev.max(reference));
    let approx = fast_path(rule, anchor, compare);

    let date = match exact_next(rule, anchor, compare) {
        Ok(Some(date)) => {
            if approx != Some(date) {
                debug!(rule = %rule, exact = %date, approx = ?approx, "fast path disagrees with expander");
            }
            Some(date)
        }
        Ok(None) => None,
        Err(reason) => {
            debug!(rule = %rule, %reason, "falling back to fast-path due date");
            let until = rule.until.map(|u| u.date_naive());
            approx.filter(|d| until.is_none_or(|u| *d <= u))
        }
    };

    date.map(end_of_day)
}

/// Returns the first due date on or after `anchor`, for seeding a new series.
pub fn first_due_date(rule: &Rule, anchor: NaiveDate) -> Option<NaiveDateTime> {
    next_due_date(rule, anchor, None, anchor.pred_opt()?)
}

/// `Ok(None)` when the series is exhausted; `Err` when the expander could not decide.
fn exact_next(rule: &Rule, anchor: NaiveDate, compare: NaiveDate) -> Result<Option<NaiveDate>, String> {
    let set = rule
        .to_rrule_set(start_of_day(anchor))
        .map_err(|e| e.to_string())?;

    let tz: rrule::Tz = Utc.into();
    let last_second = start_of_day(compare) + Duration::days(1) - Duration::seconds(1);
    let result = set
        .after(last_second.with_timezone(&tz))
        .all(EXACT_SEARCH_LIMIT);

    match result.dates.first() {
        Some(dt) => Ok(Some(dt.date_naive())),
        None if result.limited => Err("iteration limit reached".to_string()),
        None => Ok(None),
    }
}

fn fast_path(rule: &Rule, anchor: NaiveDate, compare: NaiveDate) -> Option<NaiveDate> {
    let interval = i64::from(rule.interval.max(1));
    match rule.frequency {
        Frequency::Daily => daily_fast_path(rule, anchor, compare, interval),
        Frequency::Weekly => weekly_fast_path(rule, anchor, compare, interval),
        Frequency::Monthly => months_fast_path(rule, anchor, compare, interval),
        Frequency::Yearly => months_fast_path(rule, anchor, compare, interval * 12),
    }
}

fn daily_fast_path(rule: &Rule, anchor: NaiveDate, compare: NaiveDate, interval: i64) -> Option<NaiveDate> {
    let mut steps = if anchor > compare {
        0
    } else {
        (compare - anchor).num_days() / interval + 1
    };
    let weekdays = rule.weekdays();
    let mut candidate = anchor.checked_add_signed(Duration::days(steps * interval))?;
    for _ in 0..7 {
        if weekdays.is_empty() || weekdays.contains(&candidate.weekday()) {
            break;
        }
        steps += 1;
        candidate = candidate.checked_add_signed(Duration::days(interval))?;
    }
    within_count(rule, steps, candidate)
}

/// Walks forward day by day; a day qualifies when its week is a multiple of
/// `interval` weeks from the anchor's week and its weekday is selected.
fn weekly_fast_path(rule: &Rule, anchor: NaiveDate, compare: NaiveDate, interval: i64) -> Option<NaiveDate> {
    let mut weekdays = rule.weekdays();
    if weekdays.is_empty() {
        weekdays.push(anchor.weekday());
    }
    let anchor_week = week_start(anchor);
    let mut day = compare.succ_opt()?.max(anchor);
    for _ in 0..7 * (interval + 1) {
        let weeks = (week_start(day) - anchor_week).num_days() / 7;
        if weeks % interval == 0 && weekdays.contains(&day.weekday()) {
            return Some(day);
        }
        day = day.succ_opt()?;
    }
    None
}

fn months_fast_path(rule: &Rule, anchor: NaiveDate, compare: NaiveDate, step_months: i64) -> Option<NaiveDate> {
    if anchor > compare {
        return within_count(rule, 0, anchor);
    }
    let months_between = i64::from(compare.year() - anchor.year()) * 12 + i64::from(compare.month())
        - i64::from(anchor.month());
    let mut steps = (months_between / step_months).max(0);
    for _ in 0..3 {
        let candidate = add_months_clamped(anchor, steps * step_months)?;
        if candidate > compare {
            return within_count(rule, steps, candidate);
        }
        steps += 1;
    }
    None
}

/// Applies `COUNT` when the step index is meaningful (no BY* filters).
fn within_count(rule: &Rule, index: i64, date: NaiveDate) -> Option<NaiveDate> {
    if !rule.by_day.is_empty() || !rule.by_month.is_empty() {
        return Some(date);
    }
    match rule.count {
        Some(count) if index >= i64::from(count) => None,
        _ => Some(date),
    }
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

fn add_months_clamped(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let total = i64::from(date.year()) * 12 + i64::from(date.month0()) + months;
    let year = i32::try_from(total.div_euclid(12)).ok()?;
    let month = u32::try_from(total.rem_euclid(12)).ok()? + 1;
    let day = date.day().min(days_in_month(year, month)?);
    NaiveDate::from_ymd_opt(year, month, day)
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|d| d.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn due(y: i32, m: u32, d: u32) -> NaiveDateTime {
        date(y, m, d).and_hms_milli_opt(23, 59, 59, 999).unwrap()
    }

    #[test]
    fn parses_full_rule() {
        let rule = parse_rule("RRULE:freq=weekly;INTERVAL=2;BYDAY=MO,-1FR;BYMONTH=1,13,6;COUNT=4").unwrap();
        assert_eq!(rule.frequency, Frequency::Weekly);
        assert_eq!(rule.interval, 2);
        assert_eq!(
            rule.by_day,
            vec![
                ByDay::every(Weekday::Mon),
                ByDay {
                    ordinal: Some(-1),
                    weekday: Weekday::Fri
                }
            ]
        );
        assert_eq!(rule.by_month, vec![1, 6]);
        assert_eq!(rule.count, Some(4));
    }

    #[test]
    fn missing_or_unsupported_frequency_is_no_recurrence() {
        assert!(parse_rule("").is_none());
        assert!(parse_rule("INTERVAL=2;BYDAY=MO").is_none());
        assert!(parse_rule("FREQ=HOURLY").is_none());
        assert!(parse_rule("not a rule").is_none());
    }

    #[test]
    fn until_forms() {
        let utc = parse_rule("FREQ=DAILY;UNTIL=20250131T120000Z").unwrap();
        assert_eq!(utc.until, Some(Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap()));
        let date_only = parse_rule("FREQ=DAILY;UNTIL=20250131").unwrap();
        assert_eq!(date_only.until, Some(Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 59).unwrap()));
    }

    #[test]
    fn serialization_round_trips() {
        for text in [
            "FREQ=DAILY",
            "FREQ=DAILY;INTERVAL=3;COUNT=10",
            "FREQ=WEEKLY;INTERVAL=2;BYDAY=MO,WE,FR",
            "FREQ=MONTHLY;BYDAY=-1SU",
            "FREQ=YEARLY;BYMONTH=3,9;UNTIL=20301231T000000Z",
        ] {
            let rule = parse_rule(text).unwrap();
            assert_eq!(rule.to_string(), text);
            assert_eq!(parse_rule(&rule.to_string()), Some(rule));
        }
        let implicit = parse_rule("FREQ=DAILY;INTERVAL=1").unwrap();
        assert_eq!(implicit.to_string(), "FREQ=DAILY");
    }

    #[test]
    fn daily_next_due() {
        let rule = parse_rule("FREQ=DAILY;INTERVAL=1").unwrap();
        let next = next_due_date(&rule, date(2025, 1, 10), Some(date(2025, 1, 14)), date(2025, 1, 14));
        assert_eq!(next, Some(due(2025, 1, 15)));
    }

    #[test]
    fn weekly_friday_next_due() {
        let rule = parse_rule("FREQ=WEEKLY;BYDAY=FR").unwrap();
        let next = next_due_date(&rule, date(2025, 1, 10), Some(date(2025, 1, 17)), date(2025, 1, 12));
        assert_eq!(next, Some(due(2025, 1, 24)));
    }

    #[test]
    fn weekly_interval_skips_off_weeks() {
        let rule = parse_rule("FREQ=WEEKLY;INTERVAL=2;BYDAY=MO,WE").unwrap();
        let anchor = date(2025, 1, 6);
        assert_eq!(fast_path(&rule, anchor, date(2025, 1, 8)), Some(date(2025, 1, 20)));
        assert_eq!(
            next_due_date(&rule, anchor, Some(date(2025, 1, 8)), date(2025, 1, 8)),
            Some(due(2025, 1, 20))
        );
    }

    #[test]
    fn monthly_fast_path_clamps_but_expander_wins() {
        let rule = parse_rule("FREQ=MONTHLY").unwrap();
        let anchor = date(2025, 1, 31);
        assert_eq!(fast_path(&rule, anchor, date(2025, 2, 1)), Some(date(2025, 2, 28)));
        assert_eq!(
            next_due_date(&rule, anchor, Some(date(2025, 1, 31)), date(2025, 2, 1)),
            Some(due(2025, 3, 31))
        );
    }

    #[test]
    fn exhausted_series_returns_none() {
        let until = parse_rule("FREQ=DAILY;UNTIL=20250115").unwrap();
        assert_eq!(
            next_due_date(&until, date(2025, 1, 10), Some(date(2025, 1, 15)), date(2025, 1, 15)),
            None
        );

        let count = parse_rule("FREQ=DAILY;COUNT=3").unwrap();
        assert_eq!(
            next_due_date(&count, date(2025, 1, 10), Some(date(2025, 1, 11)), date(2025, 1, 11)),
            Some(due(2025, 1, 12))
        );
        assert_eq!(
            next_due_date(&count, date(2025, 1, 10), Some(date(2025, 1, 12)), date(2025, 1, 12)),
            None
        );
    }

    #[test]
    fn result_is_strictly_after_compare_point_and_deterministic() {
        let rules = [
            "FREQ=DAILY;INTERVAL=2",
            "FREQ=WEEKLY;BYDAY=TU,TH",
            "FREQ=WEEKLY;INTERVAL=3",
            "FREQ=MONTHLY",
            "FREQ=YEARLY",
        ];
        let anchor = date(2024, 12, 30);
        for text in rules {
            let rule = parse_rule(text).unwrap();
            for offset in 0..60 {
                let prev = anchor + Duration::days(offset);
                let reference = anchor + Duration::days(offset * 2 % 45);
                let first = next_due_date(&rule, anchor, Some(prev), reference);
                let second = next_due_date(&rule, anchor, Some(prev), reference);
                assert_eq!(first, second, "{text}");
                let next = first.unwrap();
                assert!(next.date() > prev.max(reference), "{text} after {prev}/{reference}");
            }
        }
    }

    #[test]
    fn first_due_date_includes_matching_anchor() {
        let fridays = parse_rule("FREQ=WEEKLY;BYDAY=FR").unwrap();
        assert_eq!(first_due_date(&fridays, date(2025, 1, 8)), Some(due(2025, 1, 10)));
        assert_eq!(first_due_date(&fridays, date(2025, 1, 10)), Some(due(2025, 1, 10)));

        let daily = parse_rule("FREQ=DAILY").unwrap();
        assert_eq!(first_due_date(&daily, date(2025, 3, 1)), Some(due(2025, 3, 1)));
    }

    #[test]
    fn expand_keeps_seed_duration() {
        let rule = parse_rule("FREQ=WEEKLY;BYDAY=MO").unwrap();
        let seed_start = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap();
        let seed_end = seed_start + Duration::hours(1);
        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
        );
        let instances = expand(&rule, window, seed_start, seed_end);
        let starts: Vec<u32> = instances.iter().map(|(s, _)| s.day()).collect();
        assert_eq!(starts, vec![6, 13, 20, 27]);
        assert!(instances.iter().all(|(s, e)| *e - *s == Duration::hours(1)));
    }

    #[test]
    fn expand_respects_window_start() {
        let rule = parse_rule("FREQ=DAILY;COUNT=10").unwrap();
        let seed_start = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 7, 0, 0, 0).unwrap(),
        );
        let instances = expand(&rule, window, seed_start, seed_start + Duration::minutes(30));
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].0, Utc.with_ymd_and_hms(2025, 1, 5, 8, 0, 0).unwrap());
    }

    #[test]
    fn month_arithmetic() {
        assert_eq!(add_months_clamped(date(2024, 1, 31), 1), Some(date(2024, 2, 29)));
        assert_eq!(add_months_clamped(date(2024, 11, 15), 3), Some(date(2025, 2, 15)));
        assert_eq!(days_in_month(2025, 12), Some(31));
    }
}
