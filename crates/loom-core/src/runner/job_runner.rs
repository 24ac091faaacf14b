//! JobRunner: walks a job's task graph.
//!
//! Design:
//! - 各タスクの `when` はちょうど 1 つの親（別タスク名か `JOB`）を指す
//! - `JOB==START` に合うタスクから始め、タスクが終端に入るたびに子を評価する
//! - end task（`JOB` をキーにし、START では動かないタスク）は、
//!   それ以外の全タスクが終端になった時点で `JOB==DONE` / `JOB==ERROR` で評価する
//! - 全タスクが終端になったらジョブ終了（ルートトークンをキャンセル）
//!
//! Invariant: タスクは INIT からしか開始しない。

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{Job, MessageId, TaskConfig, TaskReport, TaskState};
use crate::error::{LoomError, Result};

use super::expr::{JOB_KEY, JOB_START};
use super::filter::{ExprFilter, FilterResult};
use super::task_runner::{TaskNotice, TaskRunner};

/// Final state of a job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub id: MessageId,
    /// DONE, ERROR (some task errored) or CANCEL (job cancelled).
    pub state: TaskState,
    pub tasks: BTreeMap<String, TaskReport>,
}

pub type ProgressSender = mpsc::UnboundedSender<BTreeMap<String, TaskReport>>;

pub struct JobRunner {
    id: MessageId,
    tasks: Vec<TaskConfig>,
    filter: ExprFilter,
    end_tasks: HashSet<String>,
    vars: BTreeMap<String, String>,
    reports: BTreeMap<String, TaskReport>,
    token: CancellationToken,
    http: reqwest::Client,
    progress: Option<ProgressSender>,
    notices_tx: mpsc::UnboundedSender<TaskNotice>,
    notices_rx: mpsc::UnboundedReceiver<TaskNotice>,
    running: JoinSet<TaskReport>,
    running_names: HashMap<tokio::task::Id, String>,
}

impl JobRunner {
    /// Validate the job and prepare placeholders.
    pub fn new(id: MessageId, job: &Job, parent: &CancellationToken) -> Result<Self> {
        let tasks = job.effective_tasks();
        let filter = ExprFilter::new(&tasks).map_err(|e| LoomError::InvalidJob(e.to_string()))?;
        let end_tasks = validate(&tasks, &filter)?;

        let reports = tasks
            .iter()
            .map(|t| (t.name.clone(), TaskReport::init(t.name.clone())))
            .collect();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        Ok(Self {
            id,
            tasks,
            filter,
            end_tasks,
            vars: job.vars(),
            reports,
            token: parent.child_token(),
            http: reqwest::Client::new(),
            progress: None,
            notices_tx,
            notices_rx,
            running: JoinSet::new(),
            running_names: HashMap::new(),
        })
    }

    /// Receive the full task map on every task change.
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Cancelling this token cancels the job.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn end_tasks(&self) -> &HashSet<String> {
        &self.end_tasks
    }

    pub async fn run(mut self) -> Result<JobReport> {
        let start = self
            .filter
            .filter(JOB_KEY, JOB_START, |n| !self.end_tasks.contains(n));
        if start.is_empty() {
            self.token.cancel();
            return Err(LoomError::InvalidJob(format!(
                "job {} has no task matching {JOB_KEY}=={JOB_START}",
                self.id
            )));
        }
        info!(job = %self.id, tasks = self.tasks.len(), "job started");
        self.fire(start);

        let mut job_event_fired = false;
        let mut cancel_seen = false;
        while !self.all_terminal() {
            tokio::select! {
                _ = self.token.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    info!(job = %self.id, "job cancelled");
                    let waiting: Vec<String> = self
                        .reports
                        .values()
                        .filter(|r| r.state == TaskState::Init)
                        .map(|r| r.name.clone())
                        .collect();
                    for name in waiting {
                        self.cancel_task(&name);
                    }
                }
                Some(notice) = self.notices_rx.recv() => match notice {
                    TaskNotice::Changed(report) => self.record(report),
                    TaskNotice::Done(report) => {
                        self.record(report.clone());
                        self.on_task_done(&report, &mut job_event_fired);
                    }
                },
                Some(joined) = self.running.join_next_with_id(), if !self.running.is_empty() => {
                    self.on_runner_exit(joined);
                }
            }
        }

        // 終端になった後に残った通知を反映
        while let Ok(notice) = self.notices_rx.try_recv() {
            if let TaskNotice::Changed(report) | TaskNotice::Done(report) = notice {
                self.reports.insert(report.name.clone(), report);
            }
        }
        self.token.cancel();
        while self.running.join_next().await.is_some() {}

        let state = if cancel_seen {
            TaskState::Cancel
        } else if self.reports.values().any(|r| r.state == TaskState::Error) {
            TaskState::Error
        } else {
            TaskState::Done
        };
        info!(job = %self.id, %state, "job finished");
        Ok(JobReport {
            id: self.id,
            state,
            tasks: self.reports,
        })
    }

    fn record(&mut self, report: TaskReport) {
        // 終端の後に古い Changed が来ても巻き戻さない
        if let Some(current) = self.reports.get(&report.name)
            && current.is_terminal()
            && !report.is_terminal()
        {
            return;
        }
        self.reports.insert(report.name.clone(), report);
        if let Some(tx) = &self.progress {
            let _ = tx.send(self.reports.clone());
        }
    }

    fn on_task_done(&mut self, report: &TaskReport, job_event_fired: &mut bool) {
        if !*job_event_fired && self.non_end_terminal() {
            *job_event_fired = true;
            let errored = self
                .reports
                .values()
                .any(|r| !self.end_tasks.contains(&r.name) && r.state == TaskState::Error);
            let state = if errored { TaskState::Error } else { TaskState::Done };
            debug!(job = %self.id, %state, "all tasks finished; evaluating end tasks");
            let result = self
                .filter
                .filter(JOB_KEY, state.as_str(), |n| self.end_tasks.contains(n));
            self.fire(result);
            return;
        }

        let result = self.filter.filter(&report.name, report.state.as_str(), |n| {
            !self.end_tasks.contains(n)
        });
        if result.is_empty() {
            debug!(job = %self.id, task = %report.name, "no dependent tasks");
        }
        self.fire(result);
    }

    fn on_runner_exit(
        &mut self,
        joined: std::result::Result<(tokio::task::Id, TaskReport), tokio::task::JoinError>,
    ) {
        match joined {
            Ok((id, _)) => {
                self.running_names.remove(&id);
            }
            Err(e) => {
                let Some(name) = self.running_names.remove(&e.id()) else {
                    return;
                };
                error!(job = %self.id, task = %name, error = %e, "task runner aborted");
                let Some(current) = self.reports.get(&name).cloned() else {
                    return;
                };
                if current.is_terminal() {
                    return;
                }
                let mut report = current;
                report.state = TaskState::Error;
                report.err = Some(format!("task runner aborted: {e}"));
                report.ended = Some(chrono::Utc::now());
                let _ = self.notices_tx.send(TaskNotice::Changed(report.clone()));
                let _ = self.notices_tx.send(TaskNotice::Done(report));
            }
        }
    }

    fn fire(&mut self, result: FilterResult) {
        for name in result.matched {
            if self.token.is_cancelled() {
                self.cancel_task(&name);
            } else {
                self.start_task(&name);
            }
        }
        for name in result.not_matched {
            self.cancel_task(&name);
        }
    }

    fn is_init(&self, name: &str) -> bool {
        self.reports
            .get(name)
            .is_some_and(|r| r.state == TaskState::Init)
    }

    fn runner_for(&self, name: &str) -> Option<TaskRunner> {
        let task = self.tasks.iter().find(|t| t.name == name)?.clone();
        Some(TaskRunner::new(
            self.id,
            task,
            self.template_context(),
            self.notices_tx.clone(),
            self.token.child_token(),
            self.http.clone(),
        ))
    }

    fn start_task(&mut self, name: &str) {
        if !self.is_init(name) {
            debug!(job = %self.id, task = name, "task already started");
            return;
        }
        let Some(runner) = self.runner_for(name) else {
            warn!(job = %self.id, task = name, "unknown task");
            return;
        };
        let handle = self.running.spawn(runner.run());
        self.running_names.insert(handle.id(), name.to_string());
        debug!(job = %self.id, task = name, "task spawned");
    }

    fn cancel_task(&mut self, name: &str) {
        if !self.is_init(name) {
            return;
        }
        if let Some(runner) = self.runner_for(name) {
            runner.cancel();
        }
    }

    /// Variables visible to `{{ .X }}`: defaults, task snapshots, `JOB_ID`.
    fn template_context(&self) -> Value {
        let mut ctx = Map::new();
        for (k, v) in &self.vars {
            ctx.insert(k.clone(), Value::String(v.clone()));
        }
        for (name, report) in &self.reports {
            if let Ok(v) = serde_json::to_value(report) {
                ctx.insert(name.clone(), v);
            }
        }
        ctx.insert("JOB_ID".to_string(), Value::String(self.id.to_string()));
        Value::Object(ctx)
    }

    fn all_terminal(&self) -> bool {
        self.reports.values().all(TaskReport::is_terminal)
    }

    fn non_end_terminal(&self) -> bool {
        self.reports
            .values()
            .filter(|r| !self.end_tasks.contains(&r.name))
            .all(TaskReport::is_terminal)
    }
}

/// Structural checks; returns the end-task set.
fn validate(tasks: &[TaskConfig], filter: &ExprFilter) -> Result<HashSet<String>> {
    let invalid = |msg: String| Err(LoomError::InvalidJob(msg));

    if tasks.is_empty() {
        return invalid("job has no tasks".to_string());
    }
    let mut names = HashSet::new();
    for task in tasks {
        if task.name.trim().is_empty() {
            return invalid("task name is empty".to_string());
        }
        if task.name == JOB_KEY {
            return invalid(format!("task name {JOB_KEY} is reserved"));
        }
        if !names.insert(task.name.as_str()) {
            return invalid(format!("duplicate task name {}", task.name));
        }
        if task.cmd.is_some() == task.http.is_some() {
            return invalid(format!("task {} needs exactly one of cmd or http", task.name));
        }
    }

    let mut parent: HashMap<&str, &str> = HashMap::new();
    let mut end_tasks = HashSet::new();
    for (name, expr) in filter.iter() {
        if expr.is_job_key() {
            if expr.eval(JOB_KEY, JOB_START) != Some(true) {
                end_tasks.insert(name.to_string());
            }
            continue;
        }
        if expr.key == name {
            return invalid(format!("task {name} depends on itself"));
        }
        if !names.contains(expr.key.as_str()) {
            return invalid(format!("task {name} depends on unknown task {}", expr.key));
        }
        parent.insert(name, expr.key.as_str());
    }

    for (name, dep) in &parent {
        if end_tasks.contains(*dep) {
            return invalid(format!("task {name} depends on end task {dep}"));
        }
        // 親は 1 つなので、辿って自分に戻るなら循環
        let mut cursor = *dep;
        for _ in 0..tasks.len() {
            if cursor == *name {
                return invalid(format!("task {name} is part of a dependency cycle"));
            }
            match parent.get(cursor) {
                Some(next) => cursor = *next,
                None => break,
            }
        }
    }

    Ok(end_tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskConfig;
    use rstest::rstest;
    use std::time::Duration;

    fn run_job(tasks: Vec<TaskConfig>) -> JobRunner {
        JobRunner::new(
            MessageId::from_u64(7),
            &Job::new(tasks),
            &CancellationToken::new(),
        )
        .unwrap()
    }

    fn state(report: &JobReport, task: &str) -> TaskState {
        report.tasks[task].state
    }

    #[tokio::test]
    async fn error_path_runs_and_success_path_is_cancelled() {
        let report = run_job(vec![
            TaskConfig::command("A", "exit 1"),
            TaskConfig::command("B", "echo b").when("A==DONE"),
            TaskConfig::command("C", "echo c").when("A==ERROR"),
        ])
        .run()
        .await
        .unwrap();

        assert_eq!(state(&report, "A"), TaskState::Error);
        assert_eq!(state(&report, "B"), TaskState::Cancel);
        assert_eq!(state(&report, "C"), TaskState::Done);
        assert_eq!(report.state, TaskState::Error);
    }

    #[tokio::test]
    async fn cancellation_cascades_down_the_chain() {
        let report = run_job(vec![
            TaskConfig::command("A", "true"),
            TaskConfig::command("B", "true").when("A==ERROR"),
            TaskConfig::command("C", "true").when("B"),
            TaskConfig::command("D", "true").when("B!=DONE"),
        ])
        .run()
        .await
        .unwrap();

        assert_eq!(state(&report, "B"), TaskState::Cancel);
        assert_eq!(state(&report, "C"), TaskState::Cancel);
        assert_eq!(state(&report, "D"), TaskState::Done);
    }

    #[tokio::test]
    async fn end_task_runs_after_everything_else() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("a-finished");
        let runner = run_job(vec![
            TaskConfig::command("A", format!("sleep 0.2; touch {}", marker.display())),
            TaskConfig::command("end", format!("test -f {}", marker.display())).when("JOB==DONE"),
        ]);
        assert!(runner.end_tasks().contains("end"));

        let report = runner.run().await.unwrap();
        assert_eq!(state(&report, "A"), TaskState::Done);
        assert_eq!(state(&report, "end"), TaskState::Done);
        assert!(report.tasks["end"].started >= report.tasks["A"].ended);
    }

    #[tokio::test]
    async fn job_waits_for_task_chained_on_the_last_one() {
        let report = run_job(vec![
            TaskConfig::command("A", "sleep 0.1; echo a").when("JOB"),
            TaskConfig::command("end", "echo end").when("A"),
        ])
        .run()
        .await
        .unwrap();

        assert_eq!(report.state, TaskState::Done);
        assert_eq!(state(&report, "A"), TaskState::Done);
        assert_eq!(state(&report, "end"), TaskState::Done);
        assert!(report.tasks["end"].output.contains("end"));
        let a_ended = report.tasks["A"].ended.unwrap();
        assert!(report.tasks["end"].started.unwrap() >= a_ended);
        assert!(report.tasks["end"].ended.is_some());
    }

    #[tokio::test]
    async fn end_tasks_follow_job_outcome() {
        let report = run_job(vec![
            TaskConfig::command("A", "exit 1"),
            TaskConfig::command("on_ok", "true").when("JOB==DONE"),
            TaskConfig::command("on_err", "true").when("JOB==ERROR"),
        ])
        .run()
        .await
        .unwrap();

        assert_eq!(state(&report, "on_ok"), TaskState::Cancel);
        assert_eq!(state(&report, "on_err"), TaskState::Done);
    }

    #[tokio::test]
    async fn template_sees_earlier_task_output() {
        let report = run_job(vec![
            TaskConfig::command("A", "printf hello"),
            TaskConfig::command("B", "echo {{ .A.output }}-{{ .JOB_ID }}").when("A"),
        ])
        .run()
        .await
        .unwrap();

        assert_eq!(
            report.tasks["B"].output.trim(),
            "hello-0000000000000007"
        );
    }

    #[tokio::test]
    async fn progress_receives_full_task_map() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = run_job(vec![
            TaskConfig::command("A", "true"),
            TaskConfig::command("B", "true").when("A"),
        ])
        .with_progress(tx)
        .run()
        .await
        .unwrap();
        assert_eq!(report.state, TaskState::Done);

        let mut last = None;
        while let Ok(snapshot) = rx.try_recv() {
            assert_eq!(snapshot.len(), 2);
            last = Some(snapshot);
        }
        assert!(last.unwrap().values().all(|r| r.state == TaskState::Done));
    }

    #[tokio::test]
    async fn external_cancel_stops_running_and_waiting_tasks() {
        let runner = run_job(vec![
            TaskConfig::command("A", "sleep 10"),
            TaskConfig::command("B", "true").when("A"),
        ]);
        let token = runner.token();
        let handle = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.state, TaskState::Cancel);
        assert_eq!(state(&report, "A"), TaskState::Cancel);
        assert_eq!(state(&report, "B"), TaskState::Cancel);
    }

    #[tokio::test]
    async fn no_start_task_is_a_config_error() {
        let runner = run_job(vec![TaskConfig::command("end", "true").when("JOB==DONE")]);
        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, LoomError::InvalidJob(_)));
    }

    #[rstest]
    #[case(vec![TaskConfig::command("A", "true").when("missing")])]
    #[case(vec![TaskConfig::command("A", "true").when("A")])]
    #[case(vec![
        TaskConfig::command("A", "true").when("B"),
        TaskConfig::command("B", "true").when("A"),
    ])]
    #[case(vec![
        TaskConfig::command("A", "true"),
        TaskConfig::command("A", "true"),
    ])]
    #[case(vec![
        TaskConfig::command("A", "true"),
        TaskConfig::command("end", "true").when("JOB==DONE"),
        TaskConfig::command("after", "true").when("end"),
    ])]
    #[case(vec![TaskConfig { name: "A".into(), ..TaskConfig::default() }])]
    #[case(vec![TaskConfig::command("A", "true").when("A==")])]
    #[case(vec![])]
    fn rejects_invalid_graphs(#[case] tasks: Vec<TaskConfig>) {
        let err = JobRunner::new(
            MessageId::from_u64(1),
            &Job::new(tasks),
            &CancellationToken::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, LoomError::InvalidJob(_)));
    }
}
