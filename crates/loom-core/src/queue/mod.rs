//! Broker-side queueing: topics, their FIFO, store view and dispatcher.

pub mod dispatcher;
pub mod fifo;
pub mod retry;
pub mod store;
pub mod topic;

pub use dispatcher::{Dispatcher, DispatcherLink};
pub use fifo::MessageFifo;
pub use retry::{RetryVerdict, evaluate};
pub use store::MessageStore;
pub use topic::Topic;
