//! Stage domain model.
//!
//! A stage is a named group of tasks that are conceptually the same
//! pipeline step. Stages organize and report; they do not constrain
//! ordering — only task edges do that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::Status;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: i64,
    pub workflow_id: i64,
    /// Unique within the workflow; whitespace normalized to underscores.
    pub name: String,
    /// Monotonic insertion index, cleared on resume so the DSL re-numbers
    /// stages on replay.
    pub order_in_workflow: Option<i64>,
    pub status: Status,
    pub created_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

impl Stage {
    pub fn new(workflow_id: i64, name: &str, order_in_workflow: i64) -> Self {
        Self {
            id: 0,
            workflow_id,
            name: super::workflow::normalize_name(name),
            order_in_workflow: Some(order_in_workflow),
            status: Status::NoAttempt,
            created_on: Utc::now(),
            started_on: None,
            finished_on: None,
        }
    }

    /// Derived flag: a stage is successful iff its status says so.
    pub fn successful(&self) -> bool {
        self.status == Status::Successful
    }

    /// True once every task in the stage has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }
}
