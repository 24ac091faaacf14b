//! Domain model (ids, job config, messages, task state).
//!
//! - job / duration: producer が投げる Job JSON
//! - message: broker 側のライフサイクル
//! - state / task: worker 側のタスク状態機械とスナップショット

pub mod duration;
pub mod ids;
pub mod job;
pub mod message;
pub mod protocol;
pub mod state;
pub mod task;

pub use duration::{DurationError, format_duration, parse_duration};
pub use ids::{InvalidMessageId, MessageId};
pub use job::{HttpFile, HttpSpec, Job, Retry, TaskConfig, TaskDefault};
pub use message::{Message, MessageState, MessageView, TaskResults};
pub use protocol::{SubscribeResponse, SubscribeStatus};
pub use state::{TaskEvent, TaskState};
pub use task::TaskReport;
