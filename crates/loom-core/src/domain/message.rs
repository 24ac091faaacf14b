//! Message: a job plus its broker-side lifecycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::MessageId;
use super::job::{Job, Retry, TaskConfig};
use super::task::TaskReport;

/// Broker-side message state.
///
/// - PENDING -> RECEIVED (dispatch / subscribe)
/// - RECEIVED -> SUCCESS (job done)
/// - RECEIVED -> PENDING (retry timeout)
/// - PENDING | RECEIVED -> FAILURE (retry budget exhausted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageState {
    Pending,
    Received,
    Success,
    Failure,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Success | MessageState::Failure)
    }
}

/// Latest task map reported by the worker holding the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResults {
    pub worker_id: String,
    pub tasks: BTreeMap<String, TaskReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub job: Job,
    pub created: DateTime<Utc>,
    pub state: MessageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<TaskResults>,
}

impl Message {
    pub fn new(id: MessageId, job: Job, created: DateTime<Utc>) -> Self {
        Self {
            id,
            job,
            created,
            state: MessageState::Pending,
            results: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn set_results(&mut self, worker_id: &str, tasks: BTreeMap<String, TaskReport>) {
        self.results = Some(TaskResults {
            worker_id: worker_id.to_string(),
            tasks,
        });
    }

    pub fn view(&self) -> MessageView<'_> {
        MessageView {
            id: self.id,
            tasks: &self.job.tasks,
            created: self.created,
            state: self.state,
            retry: self.job.retry.as_ref(),
            results: self.results.as_ref(),
        }
    }
}

/// Public JSON shape of a message (API responses, finish webhook).
#[derive(Debug, Serialize)]
pub struct MessageView<'a> {
    pub id: MessageId,
    pub tasks: &'a [TaskConfig],
    pub created: DateTime<Utc>,
    pub state: MessageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<&'a Retry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<&'a TaskResults>,
}
