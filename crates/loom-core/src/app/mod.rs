//! App - アプリケーション層
//!
//! # 主要コンポーネント
//! - **Broker**: topic の管理と producer / worker の入口
//! - **ReaperLoop**: タイムアウトしたメッセージの再投入
//! - **WorkerGroup**: ジョブの受け取り（push / pull）と実行

pub mod broker;
pub mod reaper_loop;
pub mod worker_loop;

pub use self::broker::Broker;
pub use self::reaper_loop::ReaperLoop;
pub use self::worker_loop::WorkerGroup;
