//! MessageStore port - トピックごとの永続ストア
//!
//! 1 トピック = 1 ストア。中に 2 つのバケットを持つ:
//! - `messages`: 全履歴（TTL で徐々に掃除される）
//! - `pendingMessages`: PENDING / RECEIVED だけのミラー（再送スキャン用）
//!
//! ストアの実装（順序付き KV）は不透明なバイトストアとして扱う。

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::domain::{InvalidMessageId, Message, MessageId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message not found: {0}")]
    NotFound(MessageId),

    #[error("store backend: {0}")]
    Backend(#[from] sled::Error),

    #[error("message codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidKey(#[from] InvalidMessageId),

    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
}

/// One keyed bucket of messages, iterated in id order.
pub trait MessageBucket: Send + Sync {
    fn put(&self, msg: &Message) -> Result<(), StoreError>;

    fn get(&self, id: &MessageId) -> Result<Message, StoreError>;

    /// Deleting a missing id is not an error.
    fn delete(&self, id: &MessageId) -> Result<(), StoreError>;

    /// Ordered full scan. An error from `f` stops the walk.
    fn walk(
        &self,
        f: &mut dyn FnMut(Message) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    /// Convenience: collect the walk.
    fn all(&self) -> Result<Vec<Message>, StoreError> {
        let mut out = Vec::new();
        self.walk(&mut |m| {
            out.push(m);
            Ok(())
        })?;
        Ok(out)
    }
}

/// The bucket pair of one topic.
pub trait TopicStore: Send + Sync {
    fn messages(&self) -> &dyn MessageBucket;

    fn pending(&self) -> &dyn MessageBucket;

    fn flush(&self) -> Result<(), StoreError>;
}

/// Opens stores by topic name; the broker owns one provider.
pub trait StoreProvider: Send + Sync {
    fn open(&self, topic: &str) -> Result<Arc<dyn TopicStore>, StoreError>;

    /// Topics that already have a store on disk.
    fn existing_topics(&self) -> Result<Vec<String>, StoreError>;

    fn root(&self) -> PathBuf;
}
