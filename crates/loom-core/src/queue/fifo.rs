//! In-memory FIFO of messages waiting for dispatch.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::domain::{Message, MessageId};

#[derive(Default)]
struct FifoState {
    items: VecDeque<Message>,
    ids: HashSet<MessageId>,
}

/// FIFO queue with id-level de-duplication.
///
/// - 同じ id はキュー内に 1 つだけ（再送スキャンと requeue が重なっても二重にならない）
/// - `pop_wait` は push されるまで待つ
#[derive(Default)]
pub struct MessageFifo {
    state: Mutex<FifoState>,
    notify: Notify,
}

impl MessageFifo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the id is already queued.
    pub fn push(&self, msg: Message) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.ids.insert(msg.id) {
                return false;
            }
            state.items.push_back(msg);
        }
        self.notify.notify_one();
        true
    }

    /// Put a message back at the head.
    pub fn push_front(&self, msg: Message) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.ids.insert(msg.id) {
                return false;
            }
            state.items.push_front(msg);
        }
        self.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<Message> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let msg = state.items.pop_front()?;
        state.ids.remove(&msg.id);
        Some(msg)
    }

    /// Wait until a message is available.
    pub async fn pop_wait(&self) -> Message {
        loop {
            // notified() を先に作っておかないと push との間で通知を取りこぼす
            let notified = self.notify.notified();
            if let Some(msg) = self.pop() {
                return msg;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ids
            .contains(id)
    }

    /// Snapshot in queue order.
    pub fn list(&self) -> Vec<Message> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.items.iter().cloned().collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.items.clear();
        state.ids.clear();
    }
}
