//! BrokerClient port - ワーカーから見たブローカー
//!
//! 転送方式（RPC / REST）はこの trait の向こう側。プロセス内では
//! `impls::LocalBrokerClient` を使う。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{MessageId, SubscribeResponse, TaskReport};
use crate::error::Result;
use crate::ports::WorkerHandle;

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Pull one job, or `NO_JOB`.
    async fn subscribe_job(&self, worker: &str, topic: &str) -> Result<SubscribeResponse>;

    /// Progress: the worker's full task map for the job.
    async fn report_job(
        &self,
        job_id: MessageId,
        topic: &str,
        worker: &str,
        tasks: BTreeMap<String, TaskReport>,
    ) -> Result<()>;

    async fn report_job_done(&self, job_id: MessageId, topic: &str, worker: &str) -> Result<()>;

    /// Push mode: let the topic's dispatcher deliver to `handle`.
    async fn register_worker(&self, topic: &str, handle: Arc<dyn WorkerHandle>) -> Result<()>;

    async fn unregister_worker(&self, topic: &str, worker: &str) -> Result<()>;
}
