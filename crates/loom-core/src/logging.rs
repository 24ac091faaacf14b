//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for the log filter:
//! 1. explicit level from the CLI (`--log-level`)
//! 2. `LOOM_LOG` environment variable (full `EnvFilter` syntax, e.g. `loom_core=debug`)
//! 3. `info`

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::error::{LoomError, Result};

pub const LOG_ENV: &str = "LOOM_LOG";

/// Install the global subscriber (stderr). Fails if called twice.
pub fn init_logging(cli_level: Option<&str>) -> Result<()> {
    let filter = resolve_filter(cli_level, std::env::var(LOG_ENV).ok().as_deref())?;
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|e| LoomError::Config(format!("logging: {e}")))
}

fn resolve_filter(cli_level: Option<&str>, env: Option<&str>) -> Result<EnvFilter> {
    let directive = match (cli_level, env) {
        (Some(level), _) => level.trim(),
        (None, Some(env)) if !env.trim().is_empty() => env.trim(),
        _ => "info",
    };
    EnvFilter::try_new(directive)
        .map_err(|e| LoomError::Config(format!("invalid log filter {directive:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some("debug"), Some("trace"), "debug")]
    #[case(None, Some("loom_core=trace"), "loom_core=trace")]
    #[case(None, Some("  "), "info")]
    #[case(None, None, "info")]
    fn cli_beats_env_beats_default(
        #[case] cli: Option<&str>,
        #[case] env: Option<&str>,
        #[case] expected: &str,
    ) {
        let filter = resolve_filter(cli, env).unwrap();
        assert_eq!(filter.to_string(), expected);
    }

    #[test]
    fn garbage_filter_is_rejected() {
        assert!(resolve_filter(Some("loom_core=loud"), None).is_err());
    }
}
