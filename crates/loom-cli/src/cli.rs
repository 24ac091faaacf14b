//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Parser)]
#[command(name = "loom", version, about = "Job broker with an embedded worker.", long_about = None)]
pub struct CliArgs {
    /// Config file (TOML). Defaults apply when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level. If omitted, `LOOM_LOG` or `info` is used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Push a job, run it on an in-process worker and print the final message.
    Run {
        /// Topic to push to (overrides `worker.topic`).
        #[arg(long)]
        topic: Option<String>,

        /// Job definition (JSON).
        #[arg(long, value_name = "PATH")]
        job: PathBuf,
    },

    /// Print a stored message.
    Get {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        id: String,
    },
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_with_global_flags() {
        let args = CliArgs::try_parse_from([
            "loom", "run", "--job", "job.json", "--topic", "build", "--log-level", "debug",
        ])
        .unwrap();
        assert_eq!(args.log_level.map(LogLevel::as_str), Some("debug"));
        match args.command {
            Command::Run { topic, job } => {
                assert_eq!(topic.as_deref(), Some("build"));
                assert_eq!(job, PathBuf::from("job.json"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn get_requires_topic_and_id() {
        assert!(CliArgs::try_parse_from(["loom", "get", "--topic", "build"]).is_err());
        let args = CliArgs::try_parse_from([
            "loom", "--config", "loom.toml", "get", "--topic", "build", "--id", "00ab",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("loom.toml")));
    }
}
