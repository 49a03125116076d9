//! Recurring to-do items.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one todo instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoState {
    /// The live instance of its group.
    #[default]
    Open,
    Completed,
    Deleted,
}

impl TodoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for TodoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TodoState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "completed" => Ok(Self::Completed),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown todo state: {}", other)),
        }
    }
}

/// One instance of a (possibly recurring) todo.
///
/// All instances spawned from one recurrence definition share
/// `recurring_group_id`; at most one of them is [`TodoState::Open`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringTodo {
    pub id: String,
    pub title: String,
    /// RRULE text, `None` for one-off todos.
    pub rrule: Option<String>,
    pub recurring_group_id: String,
    /// The series' original anchor date.
    pub anchor: NaiveDate,
    /// End-of-day due timestamp.
    pub due: Option<NaiveDateTime>,
    pub state: TodoState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringTodo {
    /// Returns true if this instance belongs to a recurring series.
    pub fn is_recurring(&self) -> bool {
        self.rrule.is_some()
    }

    /// Returns the due date (without time), if any.
    pub fn due_date(&self) -> Option<NaiveDate> {
        self.due.map(|d| d.date())
    }
}
