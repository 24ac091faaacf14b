//! Worker protocol payloads.

use serde::{Deserialize, Serialize};

use super::ids::MessageId;
use super::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscribeStatus {
    NoJob,
    NewJob,
}

/// Answer to `subscribe_job`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub status: SubscribeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
}

impl SubscribeResponse {
    pub fn no_job() -> Self {
        Self {
            status: SubscribeStatus::NoJob,
            job_id: None,
            job: None,
        }
    }

    pub fn new_job(id: MessageId, job: Job) -> Self {
        Self {
            status: SubscribeStatus::NewJob,
            job_id: Some(id),
            job: Some(job),
        }
    }

    /// The delivered job, if any.
    pub fn into_job(self) -> Option<(MessageId, Job)> {
        match (self.status, self.job_id, self.job) {
            (SubscribeStatus::NewJob, Some(id), Some(job)) => Some((id, job)),
            _ => None,
        }
    }
}
