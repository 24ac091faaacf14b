//! Configuration file (`loom.toml`).
//!
//! ```toml
//! [broker]
//! db_path = "data"
//! retry_check_interval = "10s"
//!
//! [worker]
//! name = "worker-1"
//! topic = "build"
//! max_job_size = 4
//! poll_interval = ""   # 空文字で pull を無効化
//! ```
//!
//! どのセクションも省略可能。省略されたフィールドはデフォルト値になる。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::duration::{serde_opt, serde_req};
use crate::error::{LoomError, Result};
use crate::ports::id_generator::MAX_INSTANCE_ID;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    pub broker: BrokerSettings,
    pub worker: WorkerSettings,
}

/// `[broker]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Directory holding one `<topic>.sled` store per topic.
    pub db_path: PathBuf,
    /// Snowflake instance bits; must fit in 10 bits.
    pub instance_id: u16,
    #[serde(with = "serde_req")]
    pub retry_check_interval: Duration,
    /// Age after which terminal messages are swept from history.
    #[serde(with = "serde_req")]
    pub message_ttl: Duration,
    pub sweep_batch: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data"),
            instance_id: 1,
            retry_check_interval: Duration::from_secs(10),
            message_ttl: Duration::from_secs(720 * 3600),
            sweep_batch: 64,
        }
    }
}

/// `[worker]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub name: String,
    pub topic: String,
    pub max_job_size: usize,
    /// Pull interval; `None` disables the poll loop.
    #[serde(with = "serde_opt")]
    pub poll_interval: Option<Duration>,
    /// Pause between failed `report_job_done` attempts.
    #[serde(with = "serde_req")]
    pub report_backoff: Duration,
    /// Register with the topic dispatcher for push delivery.
    pub push: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            topic: "default".to_string(),
            max_job_size: 1,
            poll_interval: Some(Duration::from_secs(1)),
            report_backoff: Duration::from_secs(1),
            push: true,
        }
    }
}

impl LoomConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LoomError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let b = &self.broker;
        if b.instance_id > MAX_INSTANCE_ID {
            return Err(invalid(format!(
                "broker.instance_id {} exceeds {MAX_INSTANCE_ID}",
                b.instance_id
            )));
        }
        if b.retry_check_interval.is_zero() {
            return Err(invalid("broker.retry_check_interval must be > 0"));
        }
        if b.sweep_batch == 0 {
            return Err(invalid("broker.sweep_batch must be > 0"));
        }

        let w = &self.worker;
        if w.name.trim().is_empty() {
            return Err(invalid("worker.name must not be empty"));
        }
        if w.topic.trim().is_empty() {
            return Err(invalid("worker.topic must not be empty"));
        }
        if w.max_job_size == 0 {
            return Err(invalid("worker.max_job_size must be > 0"));
        }
        if w.poll_interval.is_some_and(|d| d.is_zero()) {
            return Err(invalid("worker.poll_interval must be > 0 (or empty to disable)"));
        }
        if !w.push && w.poll_interval.is_none() {
            return Err(invalid("worker needs push or poll_interval to receive jobs"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> LoomError {
    LoomError::Config(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = LoomConfig::from_toml_str("").unwrap();
        assert_eq!(config, LoomConfig::default());
        assert_eq!(config.broker.message_ttl, Duration::from_secs(720 * 3600));
        assert_eq!(config.worker.poll_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = LoomConfig::from_toml_str(
            r#"
            [broker]
            db_path = "/var/lib/loom"
            retry_check_interval = "1m30s"

            [worker]
            name = "w-7"
            max_job_size = 4
            poll_interval = ""
            "#,
        )
        .unwrap();
        assert_eq!(config.broker.db_path, PathBuf::from("/var/lib/loom"));
        assert_eq!(config.broker.retry_check_interval, Duration::from_secs(90));
        assert_eq!(config.broker.sweep_batch, 64);
        assert_eq!(config.worker.name, "w-7");
        assert_eq!(config.worker.topic, "default");
        assert_eq!(config.worker.max_job_size, 4);
        assert_eq!(config.worker.poll_interval, None);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loom.toml");
        std::fs::write(&path, "[worker]\ntopic = \"build\"\n").unwrap();
        assert_eq!(LoomConfig::load(&path).unwrap().worker.topic, "build");
        assert!(matches!(
            LoomConfig::load(dir.path().join("missing.toml")),
            Err(LoomError::Config(_))
        ));
    }

    #[rstest]
    #[case("[broker]\ninstance_id = 1024")]
    #[case("[broker]\nretry_check_interval = \"0s\"")]
    #[case("[broker]\nsweep_batch = 0")]
    #[case("[worker]\nname = \" \"")]
    #[case("[worker]\nmax_job_size = 0")]
    #[case("[worker]\npoll_interval = \"0s\"")]
    #[case("[worker]\npush = false\npoll_interval = \"\"")]
    fn invalid_values_are_rejected(#[case] toml: &str) {
        assert!(matches!(
            LoomConfig::from_toml_str(toml),
            Err(LoomError::Config(_))
        ));
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let err = LoomConfig::from_toml_str("[broker]\nmessage_ttl = \"soon\"").unwrap_err();
        assert!(matches!(err, LoomError::Toml(_)));
    }
}
