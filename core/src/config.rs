use crate::events::ReconnectPolicy;
use crate::sync::SyncOptions;
use crate::transport::TransportOptions;
use directories::BaseDirs;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const BASE_URL_ENV: &str = "SUBTRACK_API_BASE_URL";
const DEFAULT_BASE_URL: &str = "http://localhost:3000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api: ApiSettings,
    pub sync: SyncSettings,
    pub events: EventSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub max_poll_backoff: Duration,
    pub events_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSettings {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Read { path, .. } => {
                format!("Could not read {}. Check the file permissions.", path.display())
            }
            Self::Invalid(detail) => format!("Configuration invalid: {detail}. Update subtrack.yaml."),
        }
    }
}

impl Settings {
    /// Loads `subtrack.yaml` from the first candidate location, falling back
    /// to defaults when none exists. `SUBTRACK_API_BASE_URL` (also read from
    /// `.env`) overrides the base URL.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let file = match locate_config_file() {
            Some(path) => {
                debug!(path = %path.display(), "loading settings");
                read_config(&path)?
            }
            None => SubtrackConfig::default(),
        };
        resolve(file, env::var(BASE_URL_ENV).ok())
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        resolve(read_config(path)?, None)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: SubtrackConfig = serde_yaml::from_str(contents)
            .map_err(|err| ConfigError::Invalid(format!("invalid subtrack.yaml: {err}")))?;
        resolve(config, None)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            timeout: self.api.timeout,
            max_retries: self.api.max_retries,
            retry_base: self.api.retry_base,
            retry_max: self.api.retry_max,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            poll_interval: self.sync.poll_interval,
            max_poll_backoff: self.sync.max_poll_backoff,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: self.events.reconnect_initial,
            max: self.events.reconnect_max,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let api = ApiSection::default();
        let sync = SyncSection::default();
        let events = EventsSection::default();
        Self {
            api: ApiSettings {
                base_url: DEFAULT_BASE_URL.to_string(),
                timeout: Duration::from_millis(api.timeout_ms),
                max_retries: api.max_retries,
                retry_base: Duration::from_millis(api.retry_base_ms),
                retry_max: Duration::from_millis(api.retry_max_ms),
            },
            sync: SyncSettings {
                poll_interval: Duration::from_millis(sync.poll_interval_ms),
                max_poll_backoff: Duration::from_millis(sync.max_poll_backoff_ms),
                events_enabled: sync.events_enabled,
            },
            events: EventSettings {
                reconnect_initial: Duration::from_millis(events.reconnect_initial_ms),
                reconnect_max: Duration::from_millis(events.reconnect_max_ms),
            },
        }
    }
}

fn read_config(path: &Path) -> Result<SubtrackConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid {}: {err}", path.display())))
}

fn resolve(config: SubtrackConfig, base_url_override: Option<String>) -> Result<Settings, ConfigError> {
    let api = config.api.unwrap_or_default();
    let sync = config.sync.unwrap_or_default();
    let events = config.events.unwrap_or_default();

    let base_url = base_url_override
        .or(api.base_url)
        .map(|url| url.trim().to_string())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    if base_url.is_empty() {
        return Err(ConfigError::Invalid("api.base_url is empty".to_string()));
    }
    let parsed = Url::parse(&base_url)
        .map_err(|err| ConfigError::Invalid(format!("api.base_url `{base_url}`: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "api.base_url must be http or https, got `{}`",
            parsed.scheme()
        )));
    }

    let settings = Settings {
        api: ApiSettings {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: millis("api.timeout_ms", api.timeout_ms)?,
            max_retries: api.max_retries,
            retry_base: millis("api.retry_base_ms", api.retry_base_ms)?,
            retry_max: millis("api.retry_max_ms", api.retry_max_ms)?,
        },
        sync: SyncSettings {
            poll_interval: millis("sync.poll_interval_ms", sync.poll_interval_ms)?,
            max_poll_backoff: millis("sync.max_poll_backoff_ms", sync.max_poll_backoff_ms)?,
            events_enabled: sync.events_enabled,
        },
        events: EventSettings {
            reconnect_initial: millis("events.reconnect_initial_ms", events.reconnect_initial_ms)?,
            reconnect_max: millis("events.reconnect_max_ms", events.reconnect_max_ms)?,
        },
    };

    if settings.api.retry_max < settings.api.retry_base {
        return Err(ConfigError::Invalid(
            "api.retry_max_ms must not be below api.retry_base_ms".to_string(),
        ));
    }
    if settings.events.reconnect_max < settings.events.reconnect_initial {
        return Err(ConfigError::Invalid(
            "events.reconnect_max_ms must not be below events.reconnect_initial_ms".to_string(),
        ));
    }
    Ok(settings)
}

fn millis(key: &str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
    }
    Ok(Duration::from_millis(value))
}

fn locate_config_file() -> Option<PathBuf> {
    subtrack_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn subtrack_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("subtrack");
        paths.push(config_dir.join("subtrack.yaml"));
        paths.push(config_dir.join("subtrack.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".subtrack").join("subtrack.yaml"));
        paths.push(home_dir.join(".subtrack").join("subtrack.yml"));
    } else {
        paths.push(PathBuf::from("subtrack.yaml"));
        paths.push(PathBuf::from("subtrack.yml"));
    }
    paths
}

#[derive(Debug, Default, Deserialize)]
struct SubtrackConfig {
    api: Option<ApiSection>,
    sync: Option<SyncSection>,
    events: Option<EventsSection>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ApiSection {
    base_url: Option<String>,
    timeout_ms: u64,
    max_retries: u32,
    retry_base_ms: u64,
    retry_max_ms: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 10_000,
            max_retries: 2,
            retry_base_ms: 250,
            retry_max_ms: 4_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SyncSection {
    poll_interval_ms: u64,
    max_poll_backoff_ms: u64,
    events_enabled: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 4_000,
            max_poll_backoff_ms: 60_000,
            events_enabled: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EventsSection {
    reconnect_initial_ms: u64,
    reconnect_max_ms: u64,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}
