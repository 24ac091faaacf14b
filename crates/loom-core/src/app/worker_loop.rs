//! WorkerGroup - ジョブ受け取りと実行
//!
//! # フロー
//! 1. push: dispatcher が `WorkerHandle::send_message` で渡してくる
//!    pull: poll ループが `subscribe_job` で取りに行く
//! 2. どちらも message ID で重複を弾いてから bounded チャネルへ
//! 3. processor（`max_job_size` 本）が JobRunner を回し、タスクが変わるたびに `report_job`
//! 4. 終わったら `report_job_done`（受理されるか shutdown までリトライ）
//! 5. 空きができたら dispatcher に通知
//!
//! `request_shutdown()` は新規受け取りを止めるだけで、実行中のジョブは最後まで走る。
//! ジョブを止めたいときは `spawn` に渡したトークンをキャンセルする。

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerSettings;
use crate::domain::{Job, Message, MessageId, TaskReport};
use crate::error::{LoomError, Result};
use crate::ports::{BrokerClient, SendError, WorkerHandle};
use crate::queue::DispatcherLink;
use crate::runner::JobRunner;

struct Assignment {
    id: MessageId,
    job: Job,
}

struct Shared {
    settings: WorkerSettings,
    client: Arc<dyn BrokerClient>,
    active: Mutex<HashSet<MessageId>>,
    available: AtomicBool,
    links: Mutex<Vec<DispatcherLink>>,
    capacity: Notify,
    /// Taken on shutdown so processors drain and exit.
    jobs_tx: Mutex<Option<mpsc::Sender<Assignment>>>,
    /// Stops intake (poll loop, push handle).
    stop: CancellationToken,
    /// Parent of every job token.
    jobs: CancellationToken,
    http: reqwest::Client,
}

impl Shared {
    fn has_capacity(&self) -> bool {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len() < self.settings.max_job_size
    }

    /// Reserve a slot for `id`. `Ok(false)` when `id` is already running.
    fn reserve(&self, id: MessageId) -> std::result::Result<bool, &'static str> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains(&id) {
            return Ok(false);
        }
        if active.len() >= self.settings.max_job_size {
            return Err("no capacity");
        }
        active.insert(id);
        Ok(true)
    }

    fn release(&self, id: &MessageId) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        self.capacity.notify_waiters();
        let links = self.links.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for link in links {
            link.notify();
        }
    }

    /// Hand a job to the processors. `Ok(false)` means it was already running
    /// and nothing new was queued.
    fn enqueue(&self, id: MessageId, job: Job) -> std::result::Result<bool, &'static str> {
        let jobs_tx = self.jobs_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = jobs_tx.as_ref() else {
            return Err("shutting down");
        };
        if !self.reserve(id)? {
            return Ok(false);
        }
        if tx.try_send(Assignment { id, job }).is_err() {
            self.active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err("job channel full");
        }
        Ok(true)
    }
}

/// Dispatcher-facing side of a worker.
struct PushHandle(Arc<Shared>);

#[async_trait]
impl WorkerHandle for PushHandle {
    fn id(&self) -> &str {
        &self.0.settings.name
    }

    fn working(&self) -> bool {
        self.0.available.load(Ordering::Acquire) && self.0.has_capacity()
    }

    async fn send_message(&self, msg: &Message) -> std::result::Result<(), SendError> {
        if !self.0.available.load(Ordering::Acquire) {
            return Err(SendError::Rejected {
                worker: self.0.settings.name.clone(),
                reason: "shutting down".to_string(),
            });
        }
        let queued = self
            .0
            .enqueue(msg.id, msg.job.clone())
            .map_err(|reason| SendError::Rejected {
                worker: self.0.settings.name.clone(),
                reason: reason.to_string(),
            })?;
        // 再配信された実行中ジョブは受理扱い。完了報告は走っている方が出す
        if queued {
            debug!(worker = %self.0.settings.name, id = %msg.id, "job accepted");
        } else {
            debug!(worker = %self.0.settings.name, id = %msg.id, "job already running");
        }
        Ok(())
    }

    fn on_attach(&self, link: DispatcherLink) {
        self.0
            .links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(link);
    }
}

/// Worker group handle.
/// - `request_shutdown()` で受け取りを止める
/// - `shutdown_and_join()` で実行中のジョブの完了まで待つ
pub struct WorkerGroup {
    shared: Arc<Shared>,
    registered: bool,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Start processors, the poll loop (if `poll_interval` is set) and
    /// register for push delivery (if `push` is set).
    pub async fn spawn(
        settings: WorkerSettings,
        client: Arc<dyn BrokerClient>,
        token: CancellationToken,
    ) -> Result<Self> {
        if settings.max_job_size == 0 {
            return Err(LoomError::Config("max_job_size must be > 0".to_string()));
        }
        let (jobs_tx, jobs_rx) = mpsc::channel(settings.max_job_size);
        let shared = Arc::new(Shared {
            client,
            active: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
            links: Mutex::new(Vec::new()),
            capacity: Notify::new(),
            jobs_tx: Mutex::new(Some(jobs_tx)),
            stop: token.child_token(),
            jobs: token.child_token(),
            http: reqwest::Client::new(),
            settings,
        });

        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        let mut joins = Vec::with_capacity(shared.settings.max_job_size + 1);
        for slot in 0..shared.settings.max_job_size {
            let s = Arc::clone(&shared);
            let rx = Arc::clone(&jobs_rx);
            joins.push(tokio::spawn(processor(slot, s, rx)));
        }
        if let Some(interval) = shared.settings.poll_interval {
            joins.push(tokio::spawn(poll_loop(Arc::clone(&shared), interval)));
        }

        let mut registered = false;
        if shared.settings.push {
            let handle: Arc<dyn WorkerHandle> = Arc::new(PushHandle(Arc::clone(&shared)));
            if let Err(e) = shared
                .client
                .register_worker(&shared.settings.topic, handle)
                .await
            {
                shared.stop.cancel();
                shared.jobs_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
                return Err(e);
            }
            registered = true;
        }

        info!(
            worker = %shared.settings.name,
            topic = %shared.settings.topic,
            max_job_size = shared.settings.max_job_size,
            push = registered,
            poll = shared.settings.poll_interval.is_some(),
            "worker started"
        );
        Ok(Self {
            shared,
            registered,
            joins,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.settings.name
    }

    /// IDs of jobs accepted and not yet reported done.
    pub fn active_jobs(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .shared
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// Stop taking new jobs. In-flight jobs keep running.
    pub fn request_shutdown(&self) {
        self.shared.available.store(false, Ordering::Release);
        self.shared.stop.cancel();
        self.shared
            .jobs_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Cancel every running job.
    pub fn cancel_jobs(&self) {
        self.shared.jobs.cancel();
    }

    /// Shutdown and wait for processors to drain.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if self.registered
            && let Err(e) = self
                .shared
                .client
                .unregister_worker(&self.shared.settings.topic, &self.shared.settings.name)
                .await
        {
            warn!(worker = %self.shared.settings.name, error = %e, "unregister failed");
        }

        // 送信側は閉じてあるので、processor は残りを処理してから抜ける
        for j in self.joins {
            let _ = j.await;
        }
        info!(worker = %self.shared.settings.name, "worker stopped");
    }
}

async fn processor(
    slot: usize,
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Assignment>>>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(assignment) = next else {
            break;
        };
        process(&shared, assignment).await;
    }
    debug!(worker = %shared.settings.name, slot, "processor stopped");
}

async fn process(shared: &Shared, assignment: Assignment) {
    let Assignment { id, job } = assignment;
    let worker = shared.settings.name.as_str();
    let topic = shared.settings.topic.as_str();

    match JobRunner::new(id, &job, &shared.jobs) {
        Ok(runner) => {
            let (tx, rx) = mpsc::unbounded_channel();
            let reporter = tokio::spawn(report_progress(
                Arc::clone(&shared.client),
                id,
                topic.to_string(),
                worker.to_string(),
                rx,
            ));
            let result = runner
                .with_progress(tx)
                .with_http_client(shared.http.clone())
                .run()
                .await;
            // runner が drop されると progress の送信側も閉じる
            let _ = reporter.await;
            match result {
                Ok(report) => info!(%worker, %topic, job = %id, state = %report.state, "job finished"),
                Err(e) => warn!(%worker, %topic, job = %id, error = %e, "job rejected"),
            }
        }
        Err(e) => {
            warn!(%worker, %topic, job = %id, error = %e, "invalid job");
        }
    }

    report_done(shared, id).await;
    shared.release(&id);
}

/// Forward progress, skipping to the newest snapshot when behind.
async fn report_progress(
    client: Arc<dyn BrokerClient>,
    id: MessageId,
    topic: String,
    worker: String,
    mut rx: mpsc::UnboundedReceiver<BTreeMap<String, TaskReport>>,
) {
    while let Some(mut tasks) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            tasks = newer;
        }
        if let Err(e) = client.report_job(id, &topic, &worker, tasks).await {
            warn!(%worker, %topic, job = %id, error = %e, "progress report failed");
        }
    }
}

async fn report_done(shared: &Shared, id: MessageId) {
    let worker = shared.settings.name.as_str();
    let topic = shared.settings.topic.as_str();
    loop {
        match shared.client.report_job_done(id, topic, worker).await {
            Ok(()) => {
                debug!(%worker, %topic, job = %id, "job done reported");
                return;
            }
            Err(e) => {
                error!(%worker, %topic, job = %id, error = %e, "report job done failed");
            }
        }
        if shared.jobs.is_cancelled() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(shared.settings.report_backoff) => {}
            _ = shared.jobs.cancelled() => return,
        }
    }
}

async fn poll_loop(shared: Arc<Shared>, interval: Duration) {
    let worker = shared.settings.name.clone();
    let topic = shared.settings.topic.clone();
    loop {
        if shared.stop.is_cancelled() {
            break;
        }
        if !shared.has_capacity() {
            let freed = shared.capacity.notified();
            tokio::pin!(freed);
            // 登録してから再確認しないと通知を取りこぼす
            freed.as_mut().enable();
            if !shared.has_capacity() {
                tokio::select! {
                    _ = freed => {}
                    _ = shared.stop.cancelled() => break,
                }
            }
            continue;
        }

        let wait = match shared.client.subscribe_job(&worker, &topic).await {
            Ok(resp) => match resp.into_job() {
                Some((id, job)) => {
                    match shared.enqueue(id, job) {
                        Ok(true) => {}
                        Ok(false) => debug!(%worker, %topic, job = %id, "pulled job already running"),
                        Err(reason) => warn!(%worker, %topic, job = %id, reason, "pulled job dropped"),
                    }
                    false
                }
                None => true,
            },
            Err(e) => {
                warn!(%worker, %topic, error = %e, "subscribe failed");
                true
            }
        };
        if wait {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shared.stop.cancelled() => break,
            }
        }
    }
    debug!(%worker, "poll loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SubscribeResponse, TaskConfig, TaskState};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Recorded {
        progress: Vec<(MessageId, BTreeMap<String, TaskReport>)>,
        done: Vec<MessageId>,
        registered: Vec<String>,
        unregistered: Vec<String>,
    }

    /// Scripted broker: hands out `queue` on subscribe and records reports.
    #[derive(Default)]
    struct FakeClient {
        queue: Mutex<VecDeque<(MessageId, Job)>>,
        rec: Mutex<Recorded>,
        fail_done: Mutex<usize>,
        handle: Mutex<Option<Arc<dyn WorkerHandle>>>,
    }

    #[async_trait]
    impl BrokerClient for FakeClient {
        async fn subscribe_job(&self, _worker: &str, _topic: &str) -> Result<SubscribeResponse> {
            Ok(match self.queue.lock().unwrap().pop_front() {
                Some((id, job)) => SubscribeResponse::new_job(id, job),
                None => SubscribeResponse::no_job(),
            })
        }

        async fn report_job(
            &self,
            job_id: MessageId,
            _topic: &str,
            _worker: &str,
            tasks: BTreeMap<String, TaskReport>,
        ) -> Result<()> {
            self.rec.lock().unwrap().progress.push((job_id, tasks));
            Ok(())
        }

        async fn report_job_done(&self, job_id: MessageId, _topic: &str, _worker: &str) -> Result<()> {
            let mut fail = self.fail_done.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(LoomError::Transport("broker unavailable".to_string()));
            }
            self.rec.lock().unwrap().done.push(job_id);
            Ok(())
        }

        async fn register_worker(&self, _topic: &str, handle: Arc<dyn WorkerHandle>) -> Result<()> {
            self.rec.lock().unwrap().registered.push(handle.id().to_string());
            *self.handle.lock().unwrap() = Some(handle);
            Ok(())
        }

        async fn unregister_worker(&self, _topic: &str, worker: &str) -> Result<()> {
            self.rec.lock().unwrap().unregistered.push(worker.to_string());
            Ok(())
        }
    }

    fn settings(push: bool, poll: Option<Duration>, max_job_size: usize) -> WorkerSettings {
        WorkerSettings {
            name: "w1".to_string(),
            topic: "jobs".to_string(),
            max_job_size,
            poll_interval: poll,
            report_backoff: Duration::from_millis(10),
            push,
        }
    }

    fn job(cmd: &str) -> Job {
        Job::new(vec![TaskConfig::command("a", cmd)])
    }

    async fn wait_done(client: &FakeClient, n: usize) {
        for _ in 0..200 {
            if client.rec.lock().unwrap().done.len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("jobs not reported done");
    }

    #[tokio::test]
    async fn pull_runs_job_and_reports() {
        let client = Arc::new(FakeClient::default());
        let id = MessageId::from_u64(7);
        client.queue.lock().unwrap().push_back((id, job("echo hi")));

        let group = WorkerGroup::spawn(
            settings(false, Some(Duration::from_millis(20)), 1),
            client.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        wait_done(&client, 1).await;
        group.shutdown_and_join().await;

        let rec = client.rec.lock().unwrap();
        assert_eq!(rec.done, vec![id]);
        let (pid, last) = rec.progress.last().unwrap();
        assert_eq!(*pid, id);
        assert_eq!(last["a"].state, TaskState::Done);
        assert_eq!(last["a"].output.trim(), "hi");
        assert!(rec.registered.is_empty());
    }

    #[tokio::test]
    async fn push_handle_accepts_duplicates_and_respects_capacity() {
        let client = Arc::new(FakeClient::default());
        let group = WorkerGroup::spawn(settings(true, None, 1), client.clone(), CancellationToken::new())
            .await
            .unwrap();
        let handle = client.handle.lock().unwrap().clone().unwrap();
        assert_eq!(handle.id(), "w1");
        assert!(handle.working());

        let msg = Message::new(MessageId::from_u64(1), job("sleep 0.3"), chrono::Utc::now());
        handle.send_message(&msg).await.unwrap();
        assert!(!handle.working());
        handle.send_message(&msg).await.unwrap();
        let other = Message::new(MessageId::from_u64(2), job("true"), chrono::Utc::now());
        assert!(handle.send_message(&other).await.is_err());

        wait_done(&client, 1).await;
        for _ in 0..50 {
            if handle.working() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.working());
        group.shutdown_and_join().await;

        let rec = client.rec.lock().unwrap();
        assert_eq!(rec.done, vec![msg.id]);
        assert_eq!(rec.unregistered, vec!["w1"]);
    }

    #[tokio::test]
    async fn redelivered_running_job_is_accepted_once() {
        let client = Arc::new(FakeClient::default());
        let group = WorkerGroup::spawn(settings(true, None, 2), client.clone(), CancellationToken::new())
            .await
            .unwrap();
        let handle = client.handle.lock().unwrap().clone().unwrap();

        let msg = Message::new(MessageId::from_u64(7), job("sleep 0.2"), chrono::Utc::now());
        handle.send_message(&msg).await.unwrap();
        for _ in 0..3 {
            handle.send_message(&msg).await.unwrap();
        }
        assert_eq!(group.active_jobs(), vec![msg.id]);
        assert!(handle.working());

        wait_done(&client, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        group.shutdown_and_join().await;
        assert_eq!(client.rec.lock().unwrap().done, vec![msg.id]);
    }

    #[tokio::test]
    async fn invalid_job_is_still_reported_done() {
        let client = Arc::new(FakeClient::default());
        let id = MessageId::from_u64(3);
        let bad = Job::new(vec![TaskConfig::command("a", "true").when("missing")]);
        client.queue.lock().unwrap().push_back((id, bad));

        let group = WorkerGroup::spawn(
            settings(false, Some(Duration::from_millis(20)), 1),
            client.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        wait_done(&client, 1).await;
        group.shutdown_and_join().await;
        assert_eq!(client.rec.lock().unwrap().done, vec![id]);
    }

    #[tokio::test]
    async fn done_report_is_retried() {
        let client = Arc::new(FakeClient::default());
        *client.fail_done.lock().unwrap() = 2;
        let id = MessageId::from_u64(4);
        client.queue.lock().unwrap().push_back((id, job("true")));

        let group = WorkerGroup::spawn(
            settings(false, Some(Duration::from_millis(20)), 1),
            client.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        wait_done(&client, 1).await;
        group.shutdown_and_join().await;
        assert_eq!(*client.fail_done.lock().unwrap(), 0);
        assert_eq!(client.rec.lock().unwrap().done, vec![id]);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_pushes() {
        let client = Arc::new(FakeClient::default());
        let group = WorkerGroup::spawn(settings(true, None, 2), client.clone(), CancellationToken::new())
            .await
            .unwrap();
        let handle = client.handle.lock().unwrap().clone().unwrap();
        group.request_shutdown();

        assert!(!handle.working());
        let msg = Message::new(MessageId::from_u64(1), job("true"), chrono::Utc::now());
        assert!(handle.send_message(&msg).await.is_err());
        group.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn zero_capacity_is_rejected() {
        let client = Arc::new(FakeClient::default());
        let err = WorkerGroup::spawn(settings(false, None, 0), client, CancellationToken::new()).await;
        assert!(matches!(err, Err(LoomError::Config(_))));
    }
}
