//! Structured logging via `tracing`.
//!
//! Events use a small set of correlation fields so a single retrain or batch
//! run can be followed end to end: `experiment`, `model_name`, `version`, `k`,
//! `run_id`, `window`, `dur_ms`.

use std::sync::OnceLock;

use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::common::config::{LogCfg, LogFormat};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Error type for logging initialisation.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log filter '{0}'")]
    InvalidLevel(String),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the global subscriber. Logs go to stderr so stdout stays free for
/// JSON command output. `RUST_LOG` takes precedence over `cfg.level`.
pub fn init_logging(cfg: &LogCfg) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.level)
            .map_err(|_| LogError::InvalidLevel(cfg.level.clone()))?,
    };

    match cfg.format {
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_ansi(true),
            );
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true),
            );
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    let _ = LOGGING_INITIALIZED.set(());
    tracing::debug!(log_level = %cfg.level, log_format = ?cfg.format, "logging initialized");
    Ok(())
}
