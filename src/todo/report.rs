//! Final execution report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use uuid::Uuid;

use super::item::{Attempt, TodoItem, TodoStatus};
use super::list::TodoList;

/// Terminal summary of one item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub id: String,
    pub action: String,
    pub success_criteria: String,
    pub dependencies: BTreeSet<String>,
    pub status: TodoStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub rewrites: u32,
    pub attempts: Vec<Attempt>,
}

impl From<&TodoItem> for ItemReport {
    fn from(item: &TodoItem) -> Self {
        Self {
            id: item.id().to_string(),
            action: item.action().description.clone(),
            success_criteria: item.success_criteria().to_string(),
            dependencies: item.dependencies().clone(),
            status: item.status(),
            reason: item.status_reason().map(str::to_string),
            rewrites: item.rewrites(),
            attempts: item.attempts().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub aborted: usize,
    /// Items that never reached a terminal status
    pub unfinished: usize,
}

impl StatusCounts {
    fn tally(statuses: impl Iterator<Item = TodoStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            match status {
                TodoStatus::Completed => counts.completed += 1,
                TodoStatus::Failed => counts.failed += 1,
                TodoStatus::Skipped => counts.skipped += 1,
                TodoStatus::Aborted => counts.aborted += 1,
                TodoStatus::Pending
                | TodoStatus::Ready
                | TodoStatus::Executing
                | TodoStatus::Verifying => counts.unfinished += 1,
            }
        }
        counts
    }
}

/// Everything an executor run produced, ready for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub list_id: Uuid,
    pub original_request: String,
    pub items: Vec<ItemReport>,
    /// Items removed from the list by a replan
    pub replaced: Vec<ItemReport>,
    pub counts: StatusCounts,
    pub replans: u32,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn from_list(
        list: &TodoList,
        replaced: Vec<ItemReport>,
        replans: u32,
        cancelled: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            list_id: list.id(),
            original_request: list.original_request().to_string(),
            items: list.items().iter().map(ItemReport::from).collect(),
            replaced,
            counts: StatusCounts::tally(list.items().iter().map(|i| i.status())),
            replans,
            cancelled,
            started_at,
            ended_at: Utc::now(),
        }
    }

    /// Whether every item completed.
    pub fn succeeded(&self) -> bool {
        !self.cancelled && self.items.iter().all(|i| i.status == TodoStatus::Completed)
    }

    /// Report for a request that could not be planned.
    pub fn unplanned(original_request: &str, started_at: DateTime<Utc>, cancelled: bool) -> Self {
        Self {
            list_id: Uuid::new_v4(),
            original_request: original_request.to_string(),
            items: Vec::new(),
            replaced: Vec::new(),
            counts: StatusCounts::default(),
            replans: 0,
            cancelled,
            started_at,
            ended_at: Utc::now(),
        }
    }
}
