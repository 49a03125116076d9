//! Recurring todo advancement.
//!
//! A recurring todo is a group of instances sharing `recurring_group_id`,
//! of which at most one is open. Closing the open instance spawns the next
//! one in the same transaction, unless the rule is exhausted.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use calsync_core::{RecurringTodo, Rule, TodoState, end_of_day, first_due_date, next_due_date, parse_rule};

use crate::error::{ServerError, ServerResult};
use crate::store::Store;

/// Result of completing or deleting an open todo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TodoAdvance {
    pub closed: RecurringTodo,
    /// The spawned instance; `None` when the series ended.
    pub next: Option<RecurringTodo>,
}

#[derive(Debug, Clone)]
pub struct TodoService {
    store: Arc<Store>,
}

impl TodoService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Creates a todo. With a rule, the first due date is the first
    /// occurrence on or after `anchor`; without one it is `anchor` itself.
    pub fn create(&self, title: &str, rrule: Option<&str>, anchor: NaiveDate) -> ServerResult<RecurringTodo> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ServerError::validation("todo title must not be empty"));
        }

        let (rrule, due) = match rrule {
            Some(text) => {
                let rule = parse_rule(text)
                    .ok_or_else(|| ServerError::validation(format!("invalid recurrence rule: {}", text)))?;
                let due = first_due_date(&rule, anchor)
                    .ok_or_else(|| ServerError::validation("recurrence rule has no occurrence"))?;
                (Some(rule.to_string()), due)
            }
            None => (None, end_of_day(anchor)),
        };

        let now = self.store.clock().now();
        let todo = RecurringTodo {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            rrule,
            recurring_group_id: Uuid::new_v4().to_string(),
            anchor,
            due: Some(due),
            state: TodoState::Open,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_todo(&todo)?;
        info!(todo_id = %todo.id, group = %todo.recurring_group_id, due = %due, "todo created");
        Ok(todo)
    }

    /// Completes the open instance. The next due date is computed against
    /// the store clock's [`today`](calsync_core::Clock::today).
    pub fn complete(&self, id: &str) -> ServerResult<TodoAdvance> {
        self.close(id, TodoState::Completed)
    }

    pub fn delete(&self, id: &str) -> ServerResult<TodoAdvance> {
        self.close(id, TodoState::Deleted)
    }

    /// Open todos, soonest due first.
    pub fn list_open(&self) -> ServerResult<Vec<RecurringTodo>> {
        self.store.open_todos()
    }

    pub fn history(&self, group_id: &str) -> ServerResult<Vec<RecurringTodo>> {
        self.store.todos_in_group(group_id)
    }

    /// Computes a next due date without touching the store.
    pub fn next_due_date(
        &self,
        rule: &Rule,
        anchor: NaiveDate,
        previous_due: Option<NaiveDate>,
        reference: NaiveDate,
    ) -> Option<NaiveDateTime> {
        next_due_date(rule, anchor, previous_due, reference)
    }

    fn close(&self, id: &str, state: TodoState) -> ServerResult<TodoAdvance> {
        let todo = self
            .store
            .get_todo(id)?
            .ok_or_else(|| ServerError::not_found("todo", id))?;
        if todo.state != TodoState::Open {
            return Err(ServerError::validation(format!("todo {} is already {}", id, todo.state)));
        }

        let now = self.store.clock().now();
        let today = self.store.clock().today();
        let next = match todo.rrule.as_deref().and_then(parse_rule) {
            Some(rule) => next_due_date(&rule, todo.anchor, todo.due_date(), today).map(|due| {
                RecurringTodo {
                    id: Uuid::new_v4().to_string(),
                    title: todo.title.clone(),
                    rrule: todo.rrule.clone(),
                    recurring_group_id: todo.recurring_group_id.clone(),
                    anchor: todo.anchor,
                    due: Some(due),
                    state: TodoState::Open,
                    created_at: now,
                    updated_at: now,
                }
            }),
            None => None,
        };

        self.store.close_todo(id, state, next.as_ref())?;
        match &next {
            Some(next) => debug!(todo_id = %id, next_id = %next.id, due = ?next.due, "todo advanced"),
            None => debug!(todo_id = %id, "todo closed, series ended"),
        }

        let closed = RecurringTodo {
            state,
            updated_at: now,
            ..todo
        };
        Ok(TodoAdvance { closed, next })
    }
}
