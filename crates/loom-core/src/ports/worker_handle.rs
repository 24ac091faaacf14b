//! WorkerHandle port - dispatcher から見たワーカー
//!
//! dispatcher はワーカーの実体を知らない。`working()` で受け入れ可否を聞き、
//! `send_message()` でジョブを渡すだけ。

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Message;
use crate::queue::DispatcherLink;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Worker refused: full, shutting down or duplicate.
    #[error("worker {worker} rejected message: {reason}")]
    Rejected { worker: String, reason: String },

    #[error("transport to worker {worker}: {reason}")]
    Transport { worker: String, reason: String },
}

#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Available and below its job capacity.
    fn working(&self) -> bool;

    async fn send_message(&self, msg: &Message) -> Result<(), SendError>;

    /// Called once when registered, so the worker can report capacity changes.
    fn on_attach(&self, _link: DispatcherLink) {}
}
