//! Task state machine.
//!
//! State transitions:
//! - INIT -> PROCESS (run)
//! - PROCESS -> DONE (succeed) / ERROR (fail)
//! - INIT | PROCESS -> CANCEL (cancel)
//!
//! 遷移は `transition()` のテーブルだけで決まる。副作用（プロセス起動など）は
//! 呼び出し側が遷移の結果を見て行う。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Init,
    Process,
    Done,
    Error,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Run,
    Succeed,
    Fail,
    Cancel,
}

impl TaskState {
    /// DONE / ERROR / CANCEL には出口が無い。
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Error | TaskState::Cancel)
    }

    /// Next state, or `None` when the event is not allowed here.
    pub fn transition(self, event: TaskEvent) -> Option<TaskState> {
        use TaskEvent as E;
        use TaskState as S;
        match (self, event) {
            (S::Init, E::Run) => Some(S::Process),
            (S::Process, E::Succeed) => Some(S::Done),
            (S::Process, E::Fail) => Some(S::Error),
            (S::Init | S::Process, E::Cancel) => Some(S::Cancel),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Init => "INIT",
            TaskState::Process => "PROCESS",
            TaskState::Done => "DONE",
            TaskState::Error => "ERROR",
            TaskState::Cancel => "CANCEL",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INIT" => Ok(TaskState::Init),
            "PROCESS" => Ok(TaskState::Process),
            "DONE" => Ok(TaskState::Done),
            "ERROR" => Ok(TaskState::Error),
            "CANCEL" => Ok(TaskState::Cancel),
            other => Err(format!("unknown task state {other}")),
        }
    }
}
