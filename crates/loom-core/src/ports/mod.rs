//! Ports - 抽象化レイヤー
//!
//! 外部（ストレージ、時計、ワーカー、転送）とのインターフェースを trait で定義する。
//! 実装は `impls` と `app` 側にある。

pub mod broker_client;
pub mod clock;
pub mod id_generator;
pub mod message_store;
pub mod worker_handle;

pub use self::broker_client::BrokerClient;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdError, IdGenerator, SnowflakeGenerator};
pub use self::message_store::{MessageBucket, StoreError, StoreProvider, TopicStore};
pub use self::worker_handle::{SendError, WorkerHandle};
