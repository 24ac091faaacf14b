//! Impls - ports の実装
//!
//! - **SledStoreProvider / SledTopicStore**: topic ごとの sled ストア
//! - **LocalBrokerClient**: 同一プロセス内のブローカー呼び出し

pub mod local_client;
pub mod sled_store;

pub use self::local_client::LocalBrokerClient;
pub use self::sled_store::{SledStoreProvider, SledTopicStore, SweepConfig};
