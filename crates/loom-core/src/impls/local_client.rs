//! In-process `BrokerClient`: calls the broker directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::app::Broker;
use crate::domain::{MessageId, SubscribeResponse, TaskReport};
use crate::error::Result;
use crate::ports::{BrokerClient, WorkerHandle};

#[derive(Clone)]
pub struct LocalBrokerClient {
    broker: Arc<Broker>,
}

impl LocalBrokerClient {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl BrokerClient for LocalBrokerClient {
    async fn subscribe_job(&self, worker: &str, topic: &str) -> Result<SubscribeResponse> {
        self.broker.subscribe_job(worker, topic).await
    }

    async fn report_job(
        &self,
        job_id: MessageId,
        topic: &str,
        worker: &str,
        tasks: BTreeMap<String, TaskReport>,
    ) -> Result<()> {
        self.broker.report_job(&job_id, topic, worker, tasks)?;
        Ok(())
    }

    async fn report_job_done(&self, job_id: MessageId, topic: &str, worker: &str) -> Result<()> {
        self.broker.report_job_done(&job_id, topic, worker)?;
        Ok(())
    }

    async fn register_worker(&self, topic: &str, handle: Arc<dyn WorkerHandle>) -> Result<()> {
        self.broker.add_worker(topic, handle).await
    }

    async fn unregister_worker(&self, topic: &str, worker: &str) -> Result<()> {
        self.broker.remove_worker(topic, worker)?;
        Ok(())
    }
}
