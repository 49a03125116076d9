//! `events`: the merged timeline for a range of days.

use chrono::{Duration, NaiveDate, Utc};

use calsync_core::{EventOrigin, MergedEvent, TimeWindow, start_of_day};
use calsync_server::{Engine, SyncConfig};

use crate::commands::print_json;
use crate::error::{CliError, CliResult};

pub fn show(config: &SyncConfig, from: Option<NaiveDate>, days: u32, json: bool) -> CliResult<()> {
    if days == 0 {
        return Err(CliError::Argument("--days must be at least 1".into()));
    }
    let first = from.unwrap_or_else(|| Utc::now().date_naive());
    let start = start_of_day(first);
    let window = TimeWindow::new(start, start + Duration::days(i64::from(days)));

    let engine = Engine::open(config)?;
    let events = engine.merger.get_merged_events(&window)?;

    if json {
        return print_json(&events);
    }
    if events.is_empty() {
        println!("No events between {} and {}.", first, first + Duration::days(i64::from(days)));
        return Ok(());
    }
    for event in &events {
        println!("{}", render(event));
    }
    Ok(())
}

fn render(event: &MergedEvent) -> String {
    let when = if event.content.all_day {
        format!("{} (all day)      ", event.content.start.format("%Y-%m-%d"))
    } else {
        format!(
            "{}-{}",
            event.content.start.format("%Y-%m-%d %H:%M"),
            event.content.end.format("%H:%M")
        )
    };
    let origin = match event.origin {
        EventOrigin::Local => "local",
        EventOrigin::CalDav => "caldav",
        EventOrigin::Ics => "ics",
    };
    let mut line = format!("{}  [{:<6}] {}", when, origin, event.content.title);
    if let Some(location) = &event.content.location {
        line.push_str(&format!(" @ {}", location));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::EventContent;
    use chrono::TimeZone;

    #[test]
    fn renders_timed_and_all_day() {
        let start = Utc.with_ymd_and_hms(2025, 2, 5, 9, 30, 0).unwrap();
        let timed = MergedEvent {
            id: "e1".into(),
            origin: EventOrigin::CalDav,
            source_id: Some("caldav-1".into()),
            content: EventContent::new("Standup", start, start + Duration::minutes(15)).with_location("Room 4"),
        };
        assert_eq!(render(&timed), "2025-02-05 09:30-09:45  [caldav] Standup @ Room 4");

        let day = Utc.with_ymd_and_hms(2025, 2, 6, 0, 0, 0).unwrap();
        let holiday = MergedEvent {
            id: "h1".into(),
            origin: EventOrigin::Ics,
            source_id: None,
            content: EventContent::new("Holiday", day, day + Duration::days(1)).with_all_day(true),
        };
        assert!(render(&holiday).starts_with("2025-02-06 (all day)"));
    }
}
