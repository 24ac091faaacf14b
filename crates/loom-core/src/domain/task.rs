//! Runtime task snapshot reported by workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::TaskState;

/// Snapshot of one task as seen by its runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: String,
    pub state: TaskState,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
}

impl TaskReport {
    /// Placeholder for a task that has not run yet.
    pub fn init(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: TaskState::Init,
            ok: false,
            err: None,
            output: String::new(),
            started: None,
            ended: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
