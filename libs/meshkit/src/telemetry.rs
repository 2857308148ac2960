//! Logging bootstrap.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a single
//! fmt layer, text or JSON. `RUST_LOG`, when set, wins over the configured level.
//! Records emitted through the `log` facade are bridged into `tracing`.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directives, e.g. `info` or `meshkit=debug,info`.
    pub level: String,
    pub format: LogFormat,
    /// Include the event target in text output.
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> anyhow::Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        Ok(EnvFilter::try_new(&self.level)?)
    }
}

/// Install the global subscriber.
///
/// # Errors
/// Returns an error if the level directives are invalid or a global subscriber
/// is already installed.
pub fn init_logging(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let filter = cfg.filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    match cfg.format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(cfg.with_target))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?,
    }

    tracing::debug!(level = %cfg.level, format = ?cfg.format, "logging initialized");
    Ok(())
}
