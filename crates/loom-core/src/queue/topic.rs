//! Topic: one FIFO + one store + one dispatcher.
//!
//! # バックグラウンドタスク
//! - feeder: dispatcher が動いている間、FIFO から pop して dispatcher に渡す
//! - requeue: dispatcher から戻ってきたメッセージを PENDING に戻して再投入
//!
//! 再送スキャン（`check_retry_jobs`）は `app::ReaperLoop` が定期的に呼ぶ。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{Message, MessageId, MessageState, TaskReport};
use crate::error::Result;
use crate::observability::TopicCounts;
use crate::ports::{TopicStore, WorkerHandle};
use crate::queue::retry::{RetryVerdict, evaluate};
use crate::queue::{Dispatcher, MessageFifo, MessageStore};

pub struct Topic {
    name: String,
    store: Arc<MessageStore>,
    fifo: Arc<MessageFifo>,
    dispatcher: Arc<Dispatcher>,
    http: reqwest::Client,
    token: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Topic {
    /// Open a topic over `store` and start its background tasks.
    ///
    /// Call `init()` afterwards to reload pending messages.
    pub fn open(
        name: impl Into<String>,
        store: Arc<dyn TopicStore>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let name = name.into();
        let token = parent.child_token();
        let store = Arc::new(MessageStore::new(store));
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            name.clone(),
            Arc::clone(&store),
            requeue_tx,
            token.child_token(),
        );

        let topic = Arc::new(Self {
            name,
            store,
            fifo: Arc::new(MessageFifo::new()),
            dispatcher,
            http: reqwest::Client::new(),
            token,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let feeder = tokio::spawn(feed_loop(
            Arc::clone(&topic.fifo),
            Arc::clone(&topic.dispatcher),
            topic.token.clone(),
        ));
        let requeue = tokio::spawn(requeue_loop(Arc::downgrade(&topic), requeue_rx, topic.token.clone()));
        topic
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([feeder, requeue]);

        topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rebuild the in-memory queue from the pending bucket.
    pub fn init(&self) -> Result<usize> {
        self.fifo.clear();
        let mut restored = 0;
        for msg in self.store.pending()? {
            if msg.state == MessageState::Pending && self.fifo.push(msg) {
                restored += 1;
            }
        }
        info!(topic = %self.name, restored, "topic initialised");
        Ok(restored)
    }

    /// Persist as PENDING and enqueue.
    pub fn push_message(&self, mut msg: Message) -> Result<Message> {
        msg.state = MessageState::Pending;
        self.store.persist(&msg)?;
        self.fifo.push(msg.clone());
        debug!(topic = %self.name, id = %msg.id, "message queued");
        Ok(msg)
    }

    /// Put a message handed back by the dispatcher into the queue again.
    pub fn requeue(&self, id: &MessageId) -> Result<()> {
        let (msg, _) = self.store.update(id, |m| {
            if m.is_terminal() || m.state == MessageState::Pending {
                return false;
            }
            m.state = MessageState::Pending;
            true
        })?;
        if msg.is_terminal() {
            debug!(topic = %self.name, %id, "terminal message not requeued");
            return Ok(());
        }
        self.fifo.push(msg);
        Ok(())
    }

    /// Pull path: take the head of the queue and mark it RECEIVED.
    pub fn pop_message(&self) -> Result<Option<Message>> {
        while let Some(msg) = self.fifo.pop() {
            let result = self.store.update(&msg.id, |m| {
                if m.is_terminal() {
                    return false;
                }
                m.state = MessageState::Received;
                true
            });
            match result {
                Ok((current, true)) => return Ok(Some(current)),
                Ok(_) => continue,
                Err(crate::ports::StoreError::NotFound(id)) => {
                    warn!(topic = %self.name, %id, "queued message missing from store");
                    continue;
                }
                Err(e) => {
                    self.fifo.push_front(msg);
                    return Err(e.into());
                }
            }
        }
        Ok(None)
    }

    pub fn get_message(&self, id: &MessageId) -> Result<Message> {
        Ok(self.store.get(id)?)
    }

    /// Attach the worker's latest task map.
    pub fn report_results(
        &self,
        id: &MessageId,
        worker: &str,
        tasks: BTreeMap<String, TaskReport>,
    ) -> Result<Message> {
        let (msg, _) = self.store.update(id, |m| {
            m.set_results(worker, tasks);
            if m.state == MessageState::Pending {
                m.state = MessageState::Received;
            }
            true
        })?;
        Ok(msg)
    }

    /// Mark SUCCESS. Repeated calls and already-failed messages are no-ops.
    pub fn finish_message(&self, id: &MessageId) -> Result<Message> {
        let (msg, changed) = self.store.update(id, |m| {
            if m.is_terminal() {
                return false;
            }
            m.state = MessageState::Success;
            true
        })?;

        if !changed {
            debug!(topic = %self.name, %id, state = ?msg.state, "finish ignored");
            return Ok(msg);
        }

        info!(topic = %self.name, %id, "message finished");
        if let Some(url) = msg.job.finish_report_url.clone() {
            self.spawn_finish_report(url, &msg);
        }
        Ok(msg)
    }

    fn spawn_finish_report(&self, url: String, msg: &Message) {
        let body = match serde_json::to_value(msg.view()) {
            Ok(v) => v,
            Err(e) => {
                error!(topic = %self.name, id = %msg.id, error = %e, "finish report encode failed");
                return;
            }
        };
        let client = self.http.clone();
        let topic = self.name.clone();
        let id = msg.id;
        tokio::spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(%topic, %id, %url, "finish report delivered");
                }
                Ok(resp) => {
                    warn!(%topic, %id, %url, status = %resp.status(), "finish report rejected");
                }
                Err(e) => {
                    warn!(%topic, %id, %url, error = %e, "finish report failed");
                }
            }
        });
    }

    /// One retry-timeout scan over the pending bucket.
    pub fn check_retry_jobs(&self, now: DateTime<Utc>) -> Result<()> {
        for pending in self.store.pending()? {
            if pending.job.retry.is_none() {
                continue;
            }
            let mut verdict = RetryVerdict::Skip;
            let result = self.store.update(&pending.id, |m| {
                let Some(retry) = m.job.retry.as_mut() else {
                    return false;
                };
                if m.state.is_terminal() {
                    return false;
                }
                verdict = evaluate(retry, m.created, now);
                match verdict {
                    RetryVerdict::Skip => false,
                    RetryVerdict::Requeue => {
                        m.state = MessageState::Pending;
                        true
                    }
                    RetryVerdict::Exhausted => {
                        m.state = MessageState::Failure;
                        true
                    }
                }
            });

            let msg = match result {
                Ok((msg, _)) => msg,
                Err(e) => {
                    error!(topic = %self.name, id = %pending.id, error = %e, "retry check failed");
                    continue;
                }
            };
            match verdict {
                RetryVerdict::Skip => {}
                RetryVerdict::Requeue => {
                    let num_retry = msg.job.retry.as_ref().map_or(0, |r| r.num_retry);
                    info!(topic = %self.name, id = %msg.id, num_retry, "timed out; queueing again");
                    self.fifo.push(msg);
                }
                RetryVerdict::Exhausted => {
                    error!(topic = %self.name, id = %msg.id, "retry budget exhausted");
                }
            }
        }
        Ok(())
    }

    pub fn add_worker(&self, worker: Arc<dyn WorkerHandle>) {
        self.dispatcher.add_worker(worker);
    }

    pub fn remove_worker(&self, worker_id: &str) -> bool {
        self.dispatcher.remove_worker(worker_id)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Messages waiting in the queue, head first.
    pub fn queued(&self) -> Vec<Message> {
        self.fifo.list()
    }

    pub fn counts(&self) -> Result<TopicCounts> {
        let mut counts = TopicCounts {
            queued: self.fifo.len(),
            ..TopicCounts::default()
        };
        for msg in self.store.history()? {
            counts.record(msg.state);
        }
        Ok(counts)
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop background tasks and flush the store.
    pub async fn close(&self) -> Result<()> {
        self.dispatcher.close();
        self.token.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        self.store.flush()?;
        info!(topic = %self.name, "topic closed");
        Ok(())
    }
}

async fn feed_loop(fifo: Arc<MessageFifo>, dispatcher: Arc<Dispatcher>, token: CancellationToken) {
    let pop_tx = dispatcher.pop_sender();
    let mut running = dispatcher.running();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            ok = async { running.wait_for(|r| *r).await.is_ok() } => if !ok { break },
        }
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            msg = fifo.pop_wait() => msg,
        };
        // 止まっている間に pop したものは先頭に戻す
        if !dispatcher.is_running() {
            fifo.push_front(msg);
            continue;
        }
        // 枠を確保してから渡す。確保前にキャンセルされてもメッセージは手元に残る
        let permit = tokio::select! {
            _ = token.cancelled() => {
                fifo.push_front(msg);
                break;
            }
            res = pop_tx.reserve() => match res {
                Ok(permit) => permit,
                Err(_) => {
                    fifo.push_front(msg);
                    break;
                }
            },
        };
        permit.send(msg);
    }
}

async fn requeue_loop(
    topic: std::sync::Weak<Topic>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    token: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let Some(topic) = topic.upgrade() else {
            break;
        };
        if let Err(e) = topic.requeue(&msg.id) {
            warn!(topic = %topic.name, id = %msg.id, error = %e, "requeue failed");
        }
    }
}
