//! Tracing subscriber setup.
//!
//! Everything in the crate logs through `tracing`; binaries and tests that
//! want the output call [`init_tracing`] once at startup.

use crate::config::{LogFormat, LoggingConfig};
use crate::core::PipelineRun;
use crate::errors::ConfigError;
use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted when the config names no level.
pub const LOG_ENV_VAR: &str = "STEPLINE_LOG";

/// Level used when neither the config nor the environment names one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Builds the event filter for `config`.
///
/// Priority: the configured level, then `STEPLINE_LOG`, then `info`.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    if let Some(level) = config.level.as_deref() {
        return EnvFilter::try_new(level).map_err(|e| ConfigError::InvalidSetting {
            key: "logging.level".to_string(),
            reason: e.to_string(),
        });
    }
    Ok(EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)))
}

/// Installs a global fmt subscriber writing to stderr.
///
/// Returns an error instead of panicking if a global subscriber is already
/// installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config)?)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
    installed.map_err(|e| ConfigError::InvalidSetting {
        key: "logging".to_string(),
        reason: e.to_string(),
    })
}

/// Span wrapping the execution of one run.
#[must_use]
pub fn run_span(run: &PipelineRun) -> Span {
    tracing::info_span!(
        "run",
        pipeline = %run.pipeline_name,
        run_id = %run.id,
        mode = %run.mode,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionMode;

    #[test]
    fn test_explicit_level_wins() {
        let config = LoggingConfig {
            level: Some("stepline=debug,warn".to_string()),
            format: LogFormat::Pretty,
        };
        let filter = env_filter(&config).unwrap();
        assert!(filter.to_string().contains("stepline=debug"));
    }

    #[test]
    fn test_bad_level_is_config_error() {
        let config = LoggingConfig {
            level: Some("stepline=loud".to_string()),
            format: LogFormat::Json,
        };
        let err = env_filter(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { ref key, .. } if key == "logging.level"));
    }

    #[test]
    fn test_second_install_is_an_error() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }

    #[test]
    fn test_run_span_metadata() {
        let run = PipelineRun::new("r1", "deploy", ExecutionMode::Parallel, 2);
        let span = run_span(&run);
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "run");
        }
    }
}
