//! MessageStore: the topic's view of its two buckets.
//!
//! 状態の read-modify-write はここのロックで直列化する
//! （dispatcher / 完了報告 / 再送スキャンが同じメッセージを触るため）。

use std::sync::{Arc, Mutex};

use crate::domain::{Message, MessageId};
use crate::ports::{StoreError, TopicStore};

pub struct MessageStore {
    inner: Arc<dyn TopicStore>,
    lock: Mutex<()>,
}

impl MessageStore {
    pub fn new(inner: Arc<dyn TopicStore>) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }

    pub fn get(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.inner.messages().get(id)
    }

    /// Write to history; mirror into pending unless terminal.
    pub fn persist(&self, msg: &Message) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.persist_locked(msg)
    }

    fn persist_locked(&self, msg: &Message) -> Result<(), StoreError> {
        self.inner.messages().put(msg)?;
        if msg.is_terminal() {
            self.inner.pending().delete(&msg.id)
        } else {
            self.inner.pending().put(msg)
        }
    }

    /// Load, let `f` mutate, persist when `f` returns true.
    ///
    /// Returns the message as stored afterwards and whether it changed.
    pub fn update(
        &self,
        id: &MessageId,
        f: impl FnOnce(&mut Message) -> bool,
    ) -> Result<(Message, bool), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut msg = self.inner.messages().get(id)?;
        let changed = f(&mut msg);
        if changed {
            self.persist_locked(&msg)?;
        }
        Ok((msg, changed))
    }

    /// Snapshot of the pending bucket.
    pub fn pending(&self) -> Result<Vec<Message>, StoreError> {
        self.inner.pending().all()
    }

    pub fn history(&self) -> Result<Vec<Message>, StoreError> {
        self.inner.messages().all()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush()
    }
}
