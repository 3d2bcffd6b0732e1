//! Client settings.
//!
//! Network endpoints, the user and the log directory may come from the
//! command line or the environment. Everything else is read from
//! `[network]`, `[chat]` and `[storage]` in `~/.config/dmchat/config.toml`
//! and falls back to the protocol defaults. The default file may be
//! absent; a file named with `--config` may not.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dmchat_proto::message::{ConversationId, DEFAULT_RETRY_TIMES};

use crate::pipeline::{DEFAULT_ACK_TIMEOUT, RetryConfig};
use crate::session::SessionConfig;

/// Errors from loading client settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    ReadFile {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for this schema.
    #[error("invalid settings file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    chat: ChatFileConfig,
    storage: StorageFileConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    ws_host: Option<String>,
    api_url: Option<String>,
    user: Option<String>,
    connect_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    ack_timeout_ms: Option<u64>,
    retry_times: Option<i32>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    log_dir: Option<PathBuf>,
    log_retry_secs: Option<u64>,
}

/// Settings the client runs with.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// WebSocket host of the delivery channel.
    pub ws_host: String,
    /// Base URL of the HTTP API.
    pub api_url: String,
    /// Username sent with API requests.
    pub user: Option<String>,
    /// Conversation to open on start.
    pub conversation: Option<ConversationId>,
    /// Timeout for connecting the delivery channel and the API.
    pub connect_timeout: Duration,
    /// Bound of the session's command and event queues.
    pub channel_capacity: usize,

    // -- Chat --
    /// How long to wait for each acknowledgment.
    pub ack_timeout: Duration,
    /// Retries granted after the first attempt fails.
    pub retry_times: i32,

    // -- Storage --
    /// Directory of the local message log.
    pub log_dir: PathBuf,
    /// How often failed log appends are retried.
    pub log_retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_host: "ws://127.0.0.1:9000".to_string(),
            api_url: "http://127.0.0.1:9000".to_string(),
            user: None,
            conversation: None,
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            retry_times: DEFAULT_RETRY_TIMES,
            log_dir: default_log_dir(),
            log_retry_interval: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Builds the settings from `cli` and the settings file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// `--config` names a file that does not exist.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = match cli.config.as_deref() {
            Some(path) => read_settings(path)?,
            None => match default_path() {
                Some(path) => read_optional(&path)?.unwrap_or_default(),
                None => ConfigFile::default(),
            },
        };
        Ok(Self::resolve(cli, &file))
    }

    /// Command line first, then the file, then the default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            ws_host: cli
                .ws_host
                .clone()
                .or_else(|| file.network.ws_host.clone())
                .unwrap_or(defaults.ws_host),
            api_url: cli
                .api_url
                .clone()
                .or_else(|| file.network.api_url.clone())
                .unwrap_or(defaults.api_url),
            user: cli.user.clone().or_else(|| file.network.user.clone()),
            conversation: cli.conversation.clone().map(ConversationId::new),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            ack_timeout: file
                .chat
                .ack_timeout_ms
                .map_or(defaults.ack_timeout, Duration::from_millis),
            retry_times: file.chat.retry_times.unwrap_or(defaults.retry_times),
            log_dir: cli
                .log_dir
                .clone()
                .or_else(|| file.storage.log_dir.clone())
                .unwrap_or(defaults.log_dir),
            log_retry_interval: file
                .storage
                .log_retry_secs
                .map_or(defaults.log_retry_interval, Duration::from_secs),
        }
    }

    /// Session settings derived from this configuration.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            retry: RetryConfig {
                retry_times: self.retry_times,
                ack_timeout: self.ack_timeout,
            },
            channel_capacity: self.channel_capacity,
            log_retry_interval: self.log_retry_interval,
        }
    }
}

/// Command line of `dmchat`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Direct-message chat client")]
pub struct CliArgs {
    /// WebSocket host of the delivery channel (e.g. `ws://127.0.0.1:9000`).
    #[arg(long, env = "DMCHAT_WS_HOST")]
    pub ws_host: Option<String>,

    /// Base URL of the HTTP API.
    #[arg(long, env = "DMCHAT_API_URL")]
    pub api_url: Option<String>,

    /// Username to act as.
    #[arg(long, env = "DMCHAT_USER")]
    pub user: Option<String>,

    /// Conversation to open on start.
    #[arg(long)]
    pub conversation: Option<String>,

    /// Settings file to use instead of the default location.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory of the local message log.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "DMCHAT_LOG")]
    pub log_level: String,

    /// Diagnostics file (default: `$TMPDIR/dmchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("dmchat")
        .join("messages")
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("dmchat").join("config.toml"))
}

fn read_settings(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

/// A missing file is `None`; any other failure is an error.
fn read_optional(path: &Path) -> Result<Option<ConfigFile>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(toml::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        }),
    }
}
