//! sled-backed topic store.
//!
//! 1 トピック = 1 sled データベース（`<db_path>/<topic>.sled`）。
//! バケットは sled の tree、値は JSON エンコードした Message。

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sled::IVec;
use tracing::{debug, warn};

use crate::domain::{Message, MessageId, MessageState};
use crate::ports::{MessageBucket, StoreError, StoreProvider, TopicStore};

pub const MESSAGES_TREE: &str = "messages";
pub const PENDING_TREE: &str = "pendingMessages";
const STORE_EXT: &str = "sled";

/// TTL sweep settings for the `messages` bucket.
#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    pub ttl: Duration,
    /// Entries visited per access.
    pub batch: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(720 * 3600),
            batch: 64,
        }
    }
}

/// Only the fields the sweep needs.
#[derive(Deserialize)]
struct SweepEntry {
    created: DateTime<Utc>,
    state: MessageState,
}

struct Sweeper {
    config: SweepConfig,
    cursor: Mutex<Option<IVec>>,
}

pub struct SledBucket {
    tree: sled::Tree,
    sweeper: Option<Sweeper>,
}

impl SledBucket {
    fn new(tree: sled::Tree, sweep: Option<SweepConfig>) -> Self {
        Self {
            tree,
            sweeper: sweep.map(|config| Sweeper {
                config,
                cursor: Mutex::new(None),
            }),
        }
    }

    /// Incremental expiry: resume from the cursor, visit at most `batch`
    /// entries, wrap around at the end. Best effort; errors are logged.
    fn sweep(&self) {
        let Some(sweeper) = &self.sweeper else {
            return;
        };
        let Ok(ttl) = chrono::Duration::from_std(sweeper.config.ttl) else {
            return;
        };
        let cutoff = Utc::now() - ttl;

        let mut cursor = sweeper.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let iter = match cursor.take() {
            Some(from) => self.tree.range((Bound::Excluded(from), Bound::Unbounded)),
            None => self.tree.iter(),
        };

        let mut visited = 0;
        let mut last = None;
        for item in iter.take(sweeper.config.batch) {
            let (key, value) = match item {
                Ok(kv) => kv,
                Err(e) => {
                    warn!(error = %e, "sweep iteration failed");
                    break;
                }
            };
            visited += 1;
            // PENDING / RECEIVED はまだ生きているので消さない
            if let Ok(entry) = serde_json::from_slice::<SweepEntry>(&value)
                && entry.state.is_terminal()
                && entry.created < cutoff
            {
                match self.tree.remove(&key) {
                    Ok(_) => debug!(key = %String::from_utf8_lossy(&key), "expired message removed"),
                    Err(e) => warn!(error = %e, "expired message removal failed"),
                }
            }
            last = Some(key);
        }

        *cursor = if visited < sweeper.config.batch { None } else { last };
    }
}

impl MessageBucket for SledBucket {
    fn put(&self, msg: &Message) -> Result<(), StoreError> {
        self.sweep();
        let value = serde_json::to_vec(msg)?;
        self.tree.insert(msg.id.as_bytes(), value)?;
        Ok(())
    }

    fn get(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.sweep();
        let value = self
            .tree
            .get(id.as_bytes())?
            .ok_or(StoreError::NotFound(*id))?;
        Ok(serde_json::from_slice(&value)?)
    }

    fn delete(&self, id: &MessageId) -> Result<(), StoreError> {
        self.tree.remove(id.as_bytes())?;
        Ok(())
    }

    fn walk(
        &self,
        f: &mut dyn FnMut(Message) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        for item in self.tree.iter() {
            let (_, value) = item?;
            f(serde_json::from_slice(&value)?)?;
        }
        Ok(())
    }
}

pub struct SledTopicStore {
    db: sled::Db,
    messages: SledBucket,
    pending: SledBucket,
}

impl SledTopicStore {
    pub fn open(path: &Path, sweep: Option<SweepConfig>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db, sweep)
    }

    /// Throwaway store, removed on drop.
    pub fn temporary(sweep: Option<SweepConfig>) -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, sweep)
    }

    fn from_db(db: sled::Db, sweep: Option<SweepConfig>) -> Result<Self, StoreError> {
        let messages = SledBucket::new(db.open_tree(MESSAGES_TREE)?, sweep);
        let pending = SledBucket::new(db.open_tree(PENDING_TREE)?, None);
        Ok(Self {
            db,
            messages,
            pending,
        })
    }
}

impl TopicStore for SledTopicStore {
    fn messages(&self) -> &dyn MessageBucket {
        &self.messages
    }

    fn pending(&self) -> &dyn MessageBucket {
        &self.pending
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Opens `<root>/<topic>.sled` stores.
#[derive(Debug, Clone)]
pub struct SledStoreProvider {
    root: PathBuf,
    sweep: Option<SweepConfig>,
}

impl SledStoreProvider {
    pub fn new(root: impl Into<PathBuf>, sweep: Option<SweepConfig>) -> Self {
        Self {
            root: root.into(),
            sweep,
        }
    }

    fn path_for(&self, topic: &str) -> PathBuf {
        self.root.join(format!("{topic}.{STORE_EXT}"))
    }
}

impl StoreProvider for SledStoreProvider {
    fn open(&self, topic: &str) -> Result<Arc<dyn TopicStore>, StoreError> {
        std::fs::create_dir_all(&self.root)?;
        let store = SledTopicStore::open(&self.path_for(topic), self.sweep)?;
        Ok(Arc::new(store))
    }

    fn existing_topics(&self) -> Result<Vec<String>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut topics = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                topics.push(stem.to_string());
            }
        }
        topics.sort();
        Ok(topics)
    }

    fn root(&self) -> PathBuf {
        self.root.clone()
    }
}
