//! `next-due`: the recurrence solver from the command line.

use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;

use calsync_core::{next_due_date, parse_rule};

use crate::commands::print_json;
use crate::error::{CliError, CliResult};

#[derive(Debug, Serialize)]
struct NextDue {
    rule: String,
    next_due: Option<NaiveDateTime>,
}

pub fn show(
    rule: &str,
    anchor: NaiveDate,
    previous: Option<NaiveDate>,
    reference: Option<NaiveDate>,
    json: bool,
) -> CliResult<()> {
    let result = compute(rule, anchor, previous, reference.unwrap_or_else(|| Utc::now().date_naive()))?;
    if json {
        return print_json(&result);
    }
    match result.next_due {
        Some(due) => println!("{}", due.format("%Y-%m-%dT%H:%M:%S%.3f")),
        None => println!("series ended ({})", result.rule),
    }
    Ok(())
}

fn compute(
    rule: &str,
    anchor: NaiveDate,
    previous: Option<NaiveDate>,
    reference: NaiveDate,
) -> CliResult<NextDue> {
    let parsed = parse_rule(rule).ok_or_else(|| CliError::Argument(format!("invalid recurrence rule: {}", rule)))?;
    Ok(NextDue {
        next_due: next_due_date(&parsed, anchor, previous, reference),
        rule: parsed.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekly_friday() {
        let result = compute("RRULE:FREQ=WEEKLY;BYDAY=FR", date(2025, 1, 10), Some(date(2025, 1, 17)), date(2025, 1, 12))
            .unwrap();
        assert_eq!(result.rule, "FREQ=WEEKLY;BYDAY=FR");
        assert_eq!(result.next_due.map(|d| d.date()), Some(date(2025, 1, 24)));
    }

    #[test]
    fn invalid_rule_is_argument_error() {
        let err = compute("every tuesday", date(2025, 1, 13), None, date(2025, 1, 13)).unwrap_err();
        assert!(matches!(err, CliError::Argument(_)));
    }
}
