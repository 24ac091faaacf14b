use serde::{Deserialize, Serialize};

use crate::domain::MessageState;

/// Per-topic message counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCounts {
    /// In the in-memory queue right now.
    pub queued: usize,
    pub pending: usize,
    pub received: usize,
    pub success: usize,
    pub failure: usize,
}

impl TopicCounts {
    pub fn record(&mut self, state: MessageState) {
        match state {
            MessageState::Pending => self.pending += 1,
            MessageState::Received => self.received += 1,
            MessageState::Success => self.success += 1,
            MessageState::Failure => self.failure += 1,
        }
    }
}
