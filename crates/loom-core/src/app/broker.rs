//! Broker: topic registry and the producer / worker entry points.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::ReaperLoop;
use crate::config::BrokerSettings;
use crate::domain::{Job, Message, MessageId, SubscribeResponse, TaskReport};
use crate::error::{LoomError, Result};
use crate::impls::{SledStoreProvider, SweepConfig};
use crate::observability::TopicCounts;
use crate::ports::{IdError, IdGenerator, SnowflakeGenerator, StoreProvider, SystemClock, WorkerHandle};
use crate::queue::Topic;

const ID_ATTEMPTS: usize = 16;
const ID_BACKOFF: Duration = Duration::from_millis(1);

type TopicCell = Arc<OnceCell<Arc<Topic>>>;

pub struct Broker {
    provider: Arc<dyn StoreProvider>,
    ids: Box<dyn IdGenerator>,
    retry_check_interval: Duration,
    topics: Mutex<HashMap<String, TopicCell>>,
    reapers: Mutex<Vec<JoinHandle<()>>>,
    token: CancellationToken,
}

impl Broker {
    /// sled stores under `settings.db_path`, Snowflake ids.
    pub fn new(settings: &BrokerSettings) -> Result<Self> {
        let provider = SledStoreProvider::new(
            settings.db_path.clone(),
            Some(SweepConfig {
                ttl: settings.message_ttl,
                batch: settings.sweep_batch,
            }),
        );
        let ids = SnowflakeGenerator::new(SystemClock, settings.instance_id)?;
        Ok(Self::with_parts(
            Arc::new(provider),
            Box::new(ids),
            settings.retry_check_interval,
        ))
    }

    pub fn with_parts(
        provider: Arc<dyn StoreProvider>,
        ids: Box<dyn IdGenerator>,
        retry_check_interval: Duration,
    ) -> Self {
        Self {
            provider,
            ids,
            retry_check_interval,
            topics: Mutex::new(HashMap::new()),
            reapers: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        }
    }

    /// Open every topic that already has a store.
    pub async fn init(&self) -> Result<Vec<String>> {
        let root = self.provider.root();
        tokio::fs::create_dir_all(&root).await?;
        let names = self.provider.existing_topics()?;
        for name in &names {
            self.topic(name).await?;
        }
        info!(root = %root.display(), topics = names.len(), "broker initialised");
        Ok(names)
    }

    /// Lookup-or-create. The store is opened outside the map lock.
    pub async fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        if self.token.is_cancelled() {
            return Err(LoomError::Closed);
        }
        validate_topic_name(name)?;
        let cell = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(topics.entry(name.to_string()).or_default())
        };
        let topic = cell
            .get_or_try_init(|| async {
                let store = self.provider.open(name)?;
                let topic = Topic::open(name, store, &self.token);
                topic.init()?;
                let reaper = ReaperLoop::new(
                    Arc::downgrade(&topic),
                    self.retry_check_interval,
                    self.token.child_token(),
                )
                .spawn();
                self.reapers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(reaper);
                info!(topic = name, "topic opened");
                Ok::<_, LoomError>(topic)
            })
            .await?;
        Ok(Arc::clone(topic))
    }

    /// Existing topic only.
    pub fn find_topic(&self, name: &str) -> Result<Arc<Topic>> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .get(name)
            .and_then(|cell| cell.get().cloned())
            .ok_or_else(|| LoomError::TopicNotFound(name.to_string()))
    }

    pub fn topic_names(&self) -> Vec<String> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = topics
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    async fn new_id(&self) -> Result<MessageId> {
        let mut last = None;
        for _ in 0..ID_ATTEMPTS {
            match self.ids.new_id() {
                Ok(id) => return Ok(id),
                Err(e @ (IdError::ClockMovedBackwards { .. } | IdError::SequenceExhausted(_))) => {
                    debug!(error = %e, "id generation backing off");
                    last = Some(e);
                    tokio::time::sleep(ID_BACKOFF).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        let err = last.unwrap_or(IdError::BeforeEpoch);
        warn!(error = %err, "id generation gave up");
        Err(err.into())
    }

    pub async fn push_message(&self, topic: &str, job: Job) -> Result<Message> {
        let topic = self.topic(topic).await?;
        let id = self.new_id().await?;
        let msg = topic.push_message(Message::new(id, job, Utc::now()))?;
        info!(topic = topic.name(), %id, "message pushed");
        Ok(msg)
    }

    pub fn get_message(&self, topic: &str, id: &MessageId) -> Result<Message> {
        self.find_topic(topic)?.get_message(id)
    }

    /// Look up a stored message without starting a broker.
    ///
    /// Only the store of `topic` is opened; no queue, dispatcher or reaper
    /// runs, and history is not swept.
    pub fn read_message(settings: &BrokerSettings, topic: &str, id: &MessageId) -> Result<Message> {
        validate_topic_name(topic)?;
        let provider = SledStoreProvider::new(settings.db_path.clone(), None);
        if !provider.existing_topics()?.iter().any(|t| t == topic) {
            return Err(LoomError::TopicNotFound(topic.to_string()));
        }
        let store = provider.open(topic)?;
        Ok(store.messages().get(id)?)
    }

    /// Pull one job for `worker`.
    pub async fn subscribe_job(&self, worker: &str, topic: &str) -> Result<SubscribeResponse> {
        let topic = self.topic(topic).await?;
        match topic.pop_message()? {
            Some(msg) => {
                info!(topic = topic.name(), id = %msg.id, worker, "job subscribed");
                Ok(SubscribeResponse::new_job(msg.id, msg.job))
            }
            None => Ok(SubscribeResponse::no_job()),
        }
    }

    pub fn report_job(
        &self,
        id: &MessageId,
        topic: &str,
        worker: &str,
        tasks: BTreeMap<String, TaskReport>,
    ) -> Result<Message> {
        self.find_topic(topic)?.report_results(id, worker, tasks)
    }

    pub fn report_job_done(&self, id: &MessageId, topic: &str, worker: &str) -> Result<Message> {
        let msg = self.find_topic(topic)?.finish_message(id)?;
        debug!(topic, %id, worker, state = ?msg.state, "job done reported");
        Ok(msg)
    }

    pub async fn add_worker(&self, topic: &str, worker: Arc<dyn WorkerHandle>) -> Result<()> {
        self.topic(topic).await?.add_worker(worker);
        Ok(())
    }

    pub fn remove_worker(&self, topic: &str, worker: &str) -> Result<bool> {
        Ok(self.find_topic(topic)?.remove_worker(worker))
    }

    pub fn counts(&self, topic: &str) -> Result<TopicCounts> {
        self.find_topic(topic)?.counts()
    }

    /// Stop all topics and flush their stores.
    pub async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        let topics: Vec<Arc<Topic>> = {
            let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            topics.values().filter_map(|c| c.get().cloned()).collect()
        };
        for topic in topics {
            topic.close().await?;
        }
        let reapers: Vec<_> = self
            .reapers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for reaper in reapers {
            let _ = reaper.await;
        }
        info!("broker shut down");
        Ok(())
    }
}

fn validate_topic_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(LoomError::InvalidTopic(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageState, SubscribeStatus, TaskConfig};
    use crate::ports::FixedClock;
    use rstest::rstest;

    fn settings(dir: &std::path::Path) -> BrokerSettings {
        BrokerSettings {
            db_path: dir.to_path_buf(),
            ..BrokerSettings::default()
        }
    }

    fn job() -> Job {
        Job::new(vec![TaskConfig::command("a", "true")])
    }

    #[tokio::test]
    async fn push_subscribe_done() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new(&settings(dir.path())).unwrap();

        let msg = broker.push_message("jobs", job()).await.unwrap();
        assert_eq!(msg.state, MessageState::Pending);

        let resp = broker.subscribe_job("w1", "jobs").await.unwrap();
        assert_eq!(resp.status, SubscribeStatus::NewJob);
        assert_eq!(resp.job_id, Some(msg.id));
        assert_eq!(
            broker.get_message("jobs", &msg.id).unwrap().state,
            MessageState::Received
        );

        let none = broker.subscribe_job("w1", "jobs").await.unwrap();
        assert_eq!(none.status, SubscribeStatus::NoJob);

        broker.report_job_done(&msg.id, "jobs", "w1").unwrap();
        assert_eq!(
            broker.get_message("jobs", &msg.id).unwrap().state,
            MessageState::Success
        );
        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn read_message_opens_store_without_broker() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let broker = Broker::new(&settings).unwrap();
        let msg = broker.push_message("jobs", job()).await.unwrap();
        broker.shutdown().await.unwrap();
        drop(broker);

        let read = Broker::read_message(&settings, "jobs", &msg.id).unwrap();
        assert_eq!(read.id, msg.id);
        assert_eq!(read.state, MessageState::Pending);

        assert!(matches!(
            Broker::read_message(&settings, "other", &msg.id),
            Err(LoomError::TopicNotFound(_))
        ));
        assert!(matches!(
            Broker::read_message(&settings, "jobs", &MessageId::from_u64(1)),
            Err(LoomError::MessageNotFound(_))
        ));
        // 読むだけでは他の topic のストアは作られない
        assert!(!dir.path().join("other.sled").exists());
    }

    #[tokio::test]
    async fn unknown_topic_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::new(&settings(dir.path())).unwrap();
        let id = MessageId::from_u64(1);

        assert!(matches!(
            broker.get_message("nope", &id),
            Err(LoomError::TopicNotFound(_))
        ));
        broker.push_message("jobs", job()).await.unwrap();
        assert!(matches!(
            broker.get_message("jobs", &id),
            Err(LoomError::MessageNotFound(_))
        ));
        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restart_restores_pending_messages() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<MessageId> = {
            let broker = Broker::new(&settings(dir.path())).unwrap();
            let mut ids = Vec::new();
            for _ in 0..3 {
                ids.push(broker.push_message("jobs", job()).await.unwrap().id);
            }
            broker.shutdown().await.unwrap();
            ids
        };

        let broker = Broker::new(&settings(dir.path())).unwrap();
        assert_eq!(broker.init().await.unwrap(), vec!["jobs"]);
        let queued: Vec<MessageId> = broker
            .find_topic("jobs")
            .unwrap()
            .queued()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(queued, ids);
        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn clock_error_surfaces_after_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let t = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t));
        let ids = SnowflakeGenerator::new(Arc::clone(&clock), 1).unwrap();
        let broker = Broker::with_parts(
            Arc::new(SledStoreProvider::new(dir.path(), None)),
            Box::new(ids),
            Duration::from_secs(10),
        );

        broker.push_message("jobs", job()).await.unwrap();
        clock.advance(chrono::Duration::seconds(-1));
        let err = broker.push_message("jobs", job()).await.unwrap_err();
        assert!(matches!(err, LoomError::Id(IdError::ClockMovedBackwards { .. })));
        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_topic() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(Broker::new(&settings(dir.path())).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = Arc::clone(&broker);
            handles.push(tokio::spawn(async move { b.topic("shared").await.unwrap() }));
        }
        let mut topics = Vec::new();
        for h in handles {
            topics.push(h.await.unwrap());
        }
        assert!(topics.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(broker.topic_names(), vec!["shared"]);
        broker.shutdown().await.unwrap();
    }

    #[rstest]
    #[case("jobs", true)]
    #[case("build.v2-x_y", true)]
    #[case("", false)]
    #[case(".hidden", false)]
    #[case("a/b", false)]
    #[case("sp ace", false)]
    fn topic_name_rules(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_topic_name(name).is_ok(), ok);
    }
}
