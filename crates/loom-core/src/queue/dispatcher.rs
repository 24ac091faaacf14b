//! Dispatcher: hands popped messages to registered workers.
//!
//! # フロー
//! 1. topic の feeder が FIFO から pop して `pop` チャネルへ
//! 2. dispatch ループが受け取り、現在の状態を確認（終端なら捨てる）
//! 3. 最初に見つかった `working()` なワーカーを選ぶ（公平性は無い）
//! 4. RECEIVED にして保存 → 送信。送信失敗・ワーカー不在なら requeue
//!
//! ループは working なワーカーがいる間だけ動く。

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{Message, MessageState};
use crate::ports::{StoreError, WorkerHandle};
use crate::queue::MessageStore;

/// Weak back-reference given to workers on registration.
#[derive(Clone)]
pub struct DispatcherLink {
    inner: Weak<Dispatcher>,
}

impl DispatcherLink {
    /// Tell the dispatcher a worker's capacity changed.
    pub fn notify(&self) {
        if let Some(dispatcher) = self.inner.upgrade() {
            dispatcher.notify_worker_state();
        }
    }

    pub fn topic(&self) -> Option<String> {
        self.inner.upgrade().map(|d| d.topic.clone())
    }
}

#[derive(Default)]
struct LoopState {
    token: Option<CancellationToken>,
    generation: u64,
}

pub struct Dispatcher {
    topic: String,
    me: Weak<Dispatcher>,
    store: Arc<MessageStore>,
    workers: Mutex<Vec<Arc<dyn WorkerHandle>>>,
    pop_tx: mpsc::Sender<Message>,
    pop_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    requeue_tx: mpsc::UnboundedSender<Message>,
    running: watch::Sender<bool>,
    loop_state: Mutex<LoopState>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        topic: impl Into<String>,
        store: Arc<MessageStore>,
        requeue_tx: mpsc::UnboundedSender<Message>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (pop_tx, pop_rx) = mpsc::channel(1);
        let (running, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            topic: topic.into(),
            me: me.clone(),
            store,
            workers: Mutex::new(Vec::new()),
            pop_tx,
            pop_rx: tokio::sync::Mutex::new(pop_rx),
            requeue_tx,
            running,
            loop_state: Mutex::new(LoopState::default()),
            shutdown,
        })
    }

    /// Sender the topic's feeder writes popped messages into.
    pub fn pop_sender(&self) -> mpsc::Sender<Message> {
        self.pop_tx.clone()
    }

    /// `true` while the dispatch loop accepts messages.
    pub fn running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn add_worker(&self, worker: Arc<dyn WorkerHandle>) {
        {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            match workers.iter_mut().find(|w| w.id() == worker.id()) {
                Some(slot) => *slot = Arc::clone(&worker),
                None => workers.push(Arc::clone(&worker)),
            }
        }
        info!(topic = %self.topic, worker = worker.id(), "worker added");
        worker.on_attach(DispatcherLink {
            inner: self.me.clone(),
        });
        self.notify_worker_state();
    }

    pub fn remove_worker(&self, worker_id: &str) -> bool {
        let removed = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            let before = workers.len();
            workers.retain(|w| w.id() != worker_id);
            workers.len() != before
        };
        if removed {
            info!(topic = %self.topic, worker = worker_id, "worker removed");
            self.notify_worker_state();
        }
        removed
    }

    pub fn worker_ids(&self) -> Vec<String> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.iter().map(|w| w.id().to_string()).collect()
    }

    /// Start the loop if someone can take work, stop it otherwise.
    pub fn notify_worker_state(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self.select_worker().is_some() {
            self.start();
        } else {
            self.stop();
        }
    }

    fn select_worker(&self) -> Option<Arc<dyn WorkerHandle>> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.iter().find(|w| w.working()).cloned()
    }

    fn start(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let mut state = self.loop_state.lock().unwrap_or_else(|e| e.into_inner());
        if state.token.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }
        let token = self.shutdown.child_token();
        state.generation += 1;
        state.token = Some(token.clone());
        let generation = state.generation;
        drop(state);

        self.running.send_replace(true);
        debug!(topic = %self.topic, generation, "dispatch loop started");
        tokio::spawn(me.run_loop(token, generation));
    }

    fn stop(&self) {
        let mut state = self.loop_state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = state.token.take() {
            token.cancel();
            self.running.send_replace(false);
            debug!(topic = %self.topic, "dispatch loop stopped");
        }
    }

    /// Called by the loop when it exits on its own.
    fn finished(&self, generation: u64) {
        let mut state = self.loop_state.lock().unwrap_or_else(|e| e.into_inner());
        if state.generation == generation {
            state.token = None;
            self.running.send_replace(false);
        }
    }

    async fn run_loop(self: Arc<Self>, token: CancellationToken, generation: u64) {
        let mut rx = self.pop_rx.lock().await;
        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if !self.dispatch(msg).await {
                break;
            }
        }

        self.finished(generation);
        // feeder が既に渡したものは取り戻してキューへ
        while let Ok(msg) = rx.try_recv() {
            self.requeue(msg);
        }
    }

    /// Returns `false` when no worker could take the message.
    async fn dispatch(&self, msg: Message) -> bool {
        let Some(worker) = self.select_worker() else {
            info!(topic = %self.topic, id = %msg.id, "no available worker; requeue");
            self.requeue(msg);
            return false;
        };

        // 送信前に RECEIVED を保存する。送信と完了報告の競合で SUCCESS を上書きしないため
        let received = self.store.update(&msg.id, |m| {
            if m.is_terminal() {
                return false;
            }
            m.state = MessageState::Received;
            true
        });
        let current = match received {
            Ok((current, true)) => current,
            Ok((current, false)) => {
                debug!(topic = %self.topic, id = %current.id, state = ?current.state, "terminal message dropped");
                return true;
            }
            Err(StoreError::NotFound(id)) => {
                warn!(topic = %self.topic, %id, "message vanished before dispatch");
                return true;
            }
            Err(e) => {
                warn!(topic = %self.topic, id = %msg.id, error = %e, "mark received failed; requeue");
                self.requeue(msg);
                return true;
            }
        };

        match worker.send_message(&current).await {
            Ok(()) => {
                info!(topic = %self.topic, id = %current.id, worker = worker.id(), "message dispatched");
            }
            Err(e) => {
                warn!(topic = %self.topic, id = %current.id, error = %e, "send failed; requeue");
                self.requeue(current);
            }
        }
        true
    }

    fn requeue(&self, msg: Message) {
        if self.requeue_tx.send(msg).is_err() {
            debug!(topic = %self.topic, "requeue channel closed");
        }
    }

    pub fn close(&self) {
        self.stop();
        self.shutdown.cancel();
    }
}
