use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

pub const CONFIG_ENV_VAR: &str = "REQLOG_CONFIG";
pub const PROJECT_CONFIG_FILE: &str = "reqlog.toml";
const DEFAULT_STORAGE_PATH: &str = "request_logs";
const DEFAULT_MAX_LOGS: usize = 100;
const UNBOUNDED_MAX_LOGS: &str = "unbounded";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    pub index: Option<IndexConfig>,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Loads the first config found by [`discover`], or the defaults when there is none.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let Some(source) = discover(explicit)? else {
            return Ok(Self::default());
        };
        let mut config = Self::from_path(source.path())
            .with_context(|| format!("load config from {source}"))?;
        config.resolve_relative_paths(source.path());
        Ok(config)
    }

    /// Relative storage and index paths are taken relative to the config file.
    fn resolve_relative_paths(&mut self, config_path: &Path) {
        let Some(base) = config_path.parent() else {
            return;
        };
        if self.storage.path.is_relative() {
            self.storage.path = base.join(&self.storage.path);
        }
        if let Some(index) = self.index.as_mut() {
            if index.path.is_relative() {
                index.path = base.join(&index.path);
            }
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.storage.backend == BackendKind::ObjectStore
            && self
                .storage
                .bucket
                .as_deref()
                .is_none_or(|bucket| bucket.trim().is_empty())
        {
            anyhow::bail!("`storage.bucket` is required when `storage.backend = \"object_store\"`");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    File,
    ObjectStore,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Record directory for the file backend.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// Record cap; `"unbounded"` in TOML disables retention.
    #[serde(default = "default_max_logs", deserialize_with = "deserialize_max_logs")]
    pub max_logs: Option<usize>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: default_storage_path(),
            max_logs: default_max_logs(),
            bucket: None,
            prefix: None,
            region: None,
            endpoint: None,
            allow_http: false,
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_PATH)
}

fn default_max_logs() -> Option<usize> {
    Some(DEFAULT_MAX_LOGS)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMaxLogs {
    Count(usize),
    Keyword(String),
}

fn deserialize_max_logs<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match RawMaxLogs::deserialize(deserializer)? {
        RawMaxLogs::Count(count) => Ok(Some(count)),
        RawMaxLogs::Keyword(keyword) if keyword == UNBOUNDED_MAX_LOGS => Ok(None),
        RawMaxLogs::Keyword(other) => Err(serde::de::Error::custom(format!(
            "expected a record count or \"{UNBOUNDED_MAX_LOGS}\", got \"{other}\""
        ))),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Where a config file was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Flag(PathBuf),
    Env(PathBuf),
    Project(PathBuf),
    Home(PathBuf),
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            Self::Flag(path) | Self::Env(path) | Self::Project(path) | Self::Home(path) => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(path) => write!(f, "--config {}", path.display()),
            Self::Env(path) => write!(f, "{CONFIG_ENV_VAR} {}", path.display()),
            Self::Project(_) => write!(f, "project ./{PROJECT_CONFIG_FILE}"),
            Self::Home(path) => write!(f, "home {}", path.display()),
        }
    }
}

/// Finds the config file to use: `--config`, then `$REQLOG_CONFIG`, then `./reqlog.toml`,
/// then `~/.reqlog/config.toml`.
///
/// Explicitly named files must exist; the implicit locations are skipped when absent.
pub fn discover(explicit: Option<&Path>) -> anyhow::Result<Option<ConfigSource>> {
    if let Some(path) = explicit {
        anyhow::ensure!(path.is_file(), "config {} does not exist", path.display());
        return Ok(Some(ConfigSource::Flag(path.to_owned())));
    }

    if let Some(raw) = std::env::var_os(CONFIG_ENV_VAR).filter(|raw| !raw.is_empty()) {
        let path = PathBuf::from(raw);
        anyhow::ensure!(
            path.is_file(),
            "config {} named by {CONFIG_ENV_VAR} does not exist",
            path.display()
        );
        return Ok(Some(ConfigSource::Env(path)));
    }

    let project = PathBuf::from(PROJECT_CONFIG_FILE);
    if project.is_file() {
        return Ok(Some(ConfigSource::Project(project)));
    }

    if let Some(home) = std::env::var_os("HOME").filter(|home| !home.is_empty()) {
        let home_config = PathBuf::from(home).join(".reqlog").join("config.toml");
        if home_config.is_file() {
            return Ok(Some(ConfigSource::Home(home_config)));
        }
    }

    Ok(None)
}
