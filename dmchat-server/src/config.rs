//! Server settings.
//!
//! Each value is taken from the first source that sets it: command line,
//! environment (through clap's `env`), `~/.config/dmchat-server/config.toml`,
//! then the built-in default. Conversations can only be seeded from the file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::store::DEFAULT_PAGE_SIZE;

const DEFAULT_BIND: &str = "0.0.0.0:9000";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors from loading server settings.
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

    /// A page must hold at least one message.
    #[error("page size must be at least 1")]
    ZeroPageSize,

    /// Two seeded conversations share an id.
    #[error("conversation {0} is listed twice")]
    DuplicateConversation(String),
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SettingsFile {
    server: ServerSection,
    conversations: Vec<SeedConversation>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerSection {
    bind_addr: Option<String>,
    page_size: Option<usize>,
}

/// A `[[conversations]]` entry created with its title when the server starts.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct SeedConversation {
    /// Conversation id.
    pub id: String,
    /// Title returned by the conversation info endpoint.
    pub title: String,
}

/// Command line of `dmchat-server`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "dmchat reference server")]
pub struct ServerCliArgs {
    /// Listen address.
    #[arg(short, long, env = "DMCHAT_SERVER_ADDR")]
    pub bind: Option<String>,

    /// Settings file to use instead of the default location.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Messages per history page.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "DMCHAT_SERVER_LOG")]
    pub log_level: String,
}

/// Settings the server runs with.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address, e.g. `0.0.0.0:9000`.
    pub bind_addr: String,
    /// Messages per history page.
    pub page_size: usize,
    /// Conversations created on start.
    pub conversations: Vec<SeedConversation>,
    /// Tracing filter.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            conversations: Vec::new(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl ServerConfig {
    /// Builds the settings from `cli` and the settings file.
    ///
    /// A file named with `--config` must exist. The default file is
    /// optional.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// the merged values are invalid.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = match cli.config.as_deref() {
            Some(path) => read_settings(path)?,
            None => default_path()
                .map(|path| read_optional(&path))
                .transpose()?
                .flatten()
                .unwrap_or_default(),
        };
        let config = Self::merge(cli, file);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: &ServerCliArgs, file: SettingsFile) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            page_size: cli
                .page_size
                .or(file.server.page_size)
                .unwrap_or(defaults.page_size),
            conversations: file.conversations,
            log_level: cli.log_level.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        let mut ids = HashSet::new();
        for seed in &self.conversations {
            if !ids.insert(seed.id.as_str()) {
                return Err(ConfigError::DuplicateConversation(seed.id.clone()));
            }
        }
        Ok(())
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("dmchat-server").join("config.toml"))
}

fn read_settings(path: &Path) -> Result<SettingsFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

/// Like [`read_settings`] but a missing file yields `None`.
fn read_optional(path: &Path) -> Result<Option<SettingsFile>, ConfigError> {
    match read_settings(path) {
        Ok(file) => Ok(Some(file)),
        Err(ConfigError::ReadFile { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
