//! TaskRunner: drives one task through its state machine.
//!
//! # フロー
//! 1. INIT -run-> PROCESS（開始時刻を記録）
//! 2. アクションを最大 `retry.attempts()` 回試す（間に `retry.delay`）
//! 3. 成功で DONE、最後の失敗で ERROR、ジョブのキャンセルで CANCEL
//!
//! 遷移のたびに `Changed`、終端に入ったら続けて `Done` を送る。

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{MessageId, TaskConfig, TaskEvent, TaskReport, TaskState};

use super::exec::{ExecError, ExecOutcome, run_command, run_http};
use super::template::render;

/// Notification from a runner to its job.
#[derive(Debug, Clone)]
pub enum TaskNotice {
    Changed(TaskReport),
    Done(TaskReport),
}

pub struct TaskRunner {
    job_id: MessageId,
    task: TaskConfig,
    report: TaskReport,
    ctx: Value,
    notices: mpsc::UnboundedSender<TaskNotice>,
    cancel: CancellationToken,
    http: reqwest::Client,
}

impl TaskRunner {
    pub fn new(
        job_id: MessageId,
        task: TaskConfig,
        ctx: Value,
        notices: mpsc::UnboundedSender<TaskNotice>,
        cancel: CancellationToken,
        http: reqwest::Client,
    ) -> Self {
        let report = TaskReport::init(task.name.clone());
        Self {
            job_id,
            task,
            report,
            ctx,
            notices,
            cancel,
            http,
        }
    }

    pub fn state(&self) -> TaskState {
        self.report.state
    }

    /// Apply an event; `false` if the table forbids it.
    fn apply(&mut self, event: TaskEvent) -> bool {
        let from = self.report.state;
        let Some(to) = from.transition(event) else {
            warn!(job = %self.job_id, task = %self.task.name, state = %from, ?event, "transition not allowed");
            return false;
        };

        self.report.state = to;
        match to {
            TaskState::Process => self.report.started = Some(Utc::now()),
            TaskState::Done => self.report.ok = true,
            _ => {}
        }
        if to.is_terminal() {
            self.report.ended = Some(Utc::now());
        }
        debug!(job = %self.job_id, task = %self.task.name, %from, %to, "task state changed");

        // 受け手（JobRunner）が先に終わっていたら通知は捨てる
        let _ = self.notices.send(TaskNotice::Changed(self.report.clone()));
        if to.is_terminal() {
            let _ = self.notices.send(TaskNotice::Done(self.report.clone()));
        }
        true
    }

    /// INIT のまま取り消す（実行はしない）。
    pub fn cancel(mut self) -> TaskReport {
        self.apply(TaskEvent::Cancel);
        self.report
    }

    pub async fn run(mut self) -> TaskReport {
        if !self.apply(TaskEvent::Run) {
            return self.report;
        }

        let retry = self.task.retry.clone().unwrap_or_default();
        let attempts = retry.attempts();
        let delay = retry.delay.unwrap_or_default();

        for attempt in 1..=attempts {
            let outcome = self.execute().await;
            self.report.output = outcome.output;

            match outcome.error {
                None => {
                    self.report.err = None;
                    info!(job = %self.job_id, task = %self.task.name, attempt, "task done");
                    self.apply(TaskEvent::Succeed);
                    return self.report;
                }
                Some(ExecError::Cancelled) => {
                    self.report.err = Some(ExecError::Cancelled.to_string());
                    self.apply(TaskEvent::Cancel);
                    return self.report;
                }
                Some(e) => {
                    info!(job = %self.job_id, task = %self.task.name, attempt, attempts, error = %e, "task attempt failed");
                    self.report.err = Some(e.to_string());
                }
            }

            if attempt < attempts && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
            if self.cancel.is_cancelled() {
                self.apply(TaskEvent::Cancel);
                return self.report;
            }
        }

        self.apply(TaskEvent::Fail);
        self.report
    }

    async fn execute(&self) -> ExecOutcome {
        let timeout = self.task.attempt_timeout();
        if let Some(cmd) = &self.task.cmd {
            let cmd = match render(cmd, &self.ctx) {
                Ok(c) => c,
                Err(e) => {
                    return ExecOutcome {
                        output: String::new(),
                        error: Some(e.into()),
                    };
                }
            };
            return run_command(&cmd, timeout, &self.cancel).await;
        }
        if let Some(http) = &self.task.http {
            return run_http(&self.http, http, &self.ctx, timeout, &self.cancel).await;
        }
        ExecOutcome {
            output: String::new(),
            error: Some(ExecError::NoAction),
        }
    }
}
