use anyhow::anyhow;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt,
    prelude::*,
};

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";
const CRATE_TARGET: &str = env!("CARGO_CRATE_NAME");
/// Transport and storage dependencies never log above this, whatever the chosen level.
const DEPENDENCY_CEILING: LevelFilter = LevelFilter::WARN;

/// Logging choices after CLI override, config file and defaults are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn resolve(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let raw_level = cli_level_override
            .or_else(|| logging.and_then(|logging| logging.level.as_deref()))
            .unwrap_or(DEFAULT_LOG_LEVEL);
        Ok(Self {
            level: parse_level(raw_level)?,
            format: logging
                .and_then(|logging| logging.format)
                .unwrap_or(LogFormat::Json),
        })
    }

    /// Our own events at `level`; hyper, rustls and object_store capped at warn.
    pub fn targets(&self) -> Targets {
        Targets::new()
            .with_default(self.level.min(DEPENDENCY_CEILING))
            .with_target(CRATE_TARGET, self.level)
    }
}

/// Installs the global subscriber. Events go to stderr so command output on stdout stays
/// machine-readable.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let settings = LogSettings::resolve(config, cli_level_override)?;

    let layer = match settings.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(settings.targets()))
        .try_init()
        .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

fn parse_level(raw_level: &str) -> anyhow::Result<LevelFilter> {
    raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!(
                "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
            )
        })
}
