//! Job configuration submitted by producers.
//!
//! Job はメッセージに埋め込まれて保存される。独立した ID は持たない。

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::duration::serde_opt;

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Retry policy.
///
/// Job レベルでは「タイムアウト駆動の再配送」、Task レベルでは
/// 「試行回数・試行間隔・1 回あたりの制限時間」として解釈される。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retry {
    /// Max attempts. `0` disables timeout-driven redelivery.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub number: u32,

    #[serde(default, with = "serde_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Sleep between task attempts.
    #[serde(default, with = "serde_opt", skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,

    /// Redelivery counter, only ever incremented.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub num_retry: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_time: Option<DateTime<Utc>>,
}

impl Retry {
    pub fn new(number: u32, timeout: Duration) -> Self {
        Self {
            number,
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.num_retry >= self.number
    }

    /// Attempts a task runner makes (always at least one).
    pub fn attempts(&self) -> u32 {
        self.number.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpFile {
    /// Multipart field name.
    pub filename: String,
    pub path: String,
}

/// HTTP action of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<HttpFile>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            data: BTreeMap::new(),
            files: Vec::new(),
        }
    }
}

/// One node in the job's task graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSpec>,

    /// Dependency predicate; empty means `JOB==START`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub when: String,

    #[serde(default, with = "serde_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<Retry>,
}

impl TaskConfig {
    pub fn command(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: Some(cmd.into()),
            ..Self::default()
        }
    }

    pub fn when(mut self, when: impl Into<String>) -> Self {
        self.when = when.into();
        self
    }

    /// Per-attempt limit: task timeout first, then the retry timeout.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.timeout
            .or_else(|| self.retry.as_ref().and_then(|r| r.timeout))
    }
}

/// Settings inherited by every task that leaves them unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefault {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<Retry>,

    #[serde(default, with = "serde_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Extra template variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub tasks: Vec<TaskConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<Retry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_default: Option<TaskDefault>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_report_url: Option<String>,
}

impl Job {
    pub fn new(tasks: Vec<TaskConfig>) -> Self {
        Self {
            tasks,
            ..Self::default()
        }
    }

    /// Tasks with `task_default` applied.
    pub fn effective_tasks(&self) -> Vec<TaskConfig> {
        let Some(defaults) = &self.task_default else {
            return self.tasks.clone();
        };
        self.tasks
            .iter()
            .cloned()
            .map(|mut task| {
                if task.retry.is_none() {
                    task.retry = defaults.retry.clone();
                }
                if task.timeout.is_none() {
                    task.timeout = defaults.timeout;
                }
                task
            })
            .collect()
    }

    pub fn vars(&self) -> BTreeMap<String, String> {
        self.task_default
            .as_ref()
            .map(|d| d.vars.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_json() {
        let raw = r#"{
            "tasks": [
                {"name": "a", "cmd": "echo hi", "timeout": "5s"},
                {"name": "b", "http": {"url": "http://localhost/x", "method": "POST",
                    "data": {"k": "v"}, "files": [{"filename": "f", "path": "/tmp/f"}]},
                 "when": "a==DONE", "retry": {"number": 3, "delay": "100ms"}}
            ],
            "retry": {"number": 2, "timeout": "1s"},
            "task_default": {"timeout": "30s", "vars": {"ENV": "prod"}},
            "finish_report_url": "http://localhost/done"
        }"#;

        let job: Job = serde_json::from_str(raw).unwrap();
        assert_eq!(job.tasks.len(), 2);
        assert_eq!(job.tasks[0].timeout, Some(Duration::from_secs(5)));
        let http = job.tasks[1].http.as_ref().unwrap();
        assert_eq!(http.method, "POST");
        assert_eq!(http.files[0].filename, "f");
        assert_eq!(job.tasks[1].retry.as_ref().unwrap().attempts(), 3);
        assert_eq!(job.retry, Some(Retry::new(2, Duration::from_secs(1))));
        assert_eq!(job.vars().get("ENV").map(String::as_str), Some("prod"));
    }

    #[test]
    fn task_default_fills_unset_fields_only() {
        let mut job = Job::new(vec![
            TaskConfig::command("a", "true"),
            TaskConfig {
                timeout: Some(Duration::from_secs(1)),
                ..TaskConfig::command("b", "true")
            },
        ]);
        job.task_default = Some(TaskDefault {
            retry: Some(Retry {
                number: 4,
                ..Retry::default()
            }),
            timeout: Some(Duration::from_secs(9)),
            vars: BTreeMap::new(),
        });

        let tasks = job.effective_tasks();
        assert_eq!(tasks[0].timeout, Some(Duration::from_secs(9)));
        assert_eq!(tasks[0].retry.as_ref().unwrap().number, 4);
        assert_eq!(tasks[1].timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn attempt_timeout_falls_back_to_retry_timeout() {
        let task = TaskConfig {
            retry: Some(Retry::new(1, Duration::from_secs(3))),
            ..TaskConfig::command("a", "true")
        };
        assert_eq!(task.attempt_timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn retry_counters_are_omitted_until_used() {
        let json = serde_json::to_value(Retry::new(2, Duration::from_secs(1))).unwrap();
        assert_eq!(json, serde_json::json!({"number": 2, "timeout": "1s"}));
    }
}
