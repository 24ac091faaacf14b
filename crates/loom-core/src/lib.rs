//! loom-core
//!
//! Core building blocks for the Loom job broker.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, message, state, task, protocol, duration）
//! - **ports**: 抽象化レイヤー（TopicStore, IdGenerator, Clock, WorkerHandle, BrokerClient）
//! - **queue**: topic ごとの FIFO・ストア・dispatcher・再送判定
//! - **runner**: ワーカー側のジョブ実行（式、テンプレート、タスク、ジョブ）
//! - **app**: Broker / ReaperLoop / WorkerGroup
//! - **impls**: sled ストア、プロセス内クライアント
//! - **config** / **logging** / **observability**: 設定、ログ、集計

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod logging;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod runner;

pub use error::{LoomError, Result};
