use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::controller::DEFAULT_ERROR_MESSAGE;
use crate::lifecycle::{LifecyclePolicy, DEFAULT_MAX_IDLE_MINUTES, DEFAULT_MAX_MESSAGES};
use crate::transport::http::{HttpConfig, DEFAULT_ENDPOINT};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level configuration, loaded from `~/.chat-box/config.toml` by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing.
    /// A file that exists but cannot be read or parsed is an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("No config file at {}. Using defaults.", path.display());
                Ok(Self::default())
            }
            result => result,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    pub fn http(&self) -> HttpConfig {
        HttpConfig {
            base_url: self.server.base_url.clone(),
            endpoint: self.server.endpoint.clone(),
            api_key: self.server.api_key.clone(),
        }
    }

    pub fn lifecycle(&self) -> LifecyclePolicy {
        LifecyclePolicy::new(self.chat.max_messages, self.chat.max_idle_minutes)
    }

    /// Data directory with a leading `~` expanded to the home directory.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Directory holding the SQLite database.
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: "~/.chat-box".to_string(),
        }
    }
}

/// Chat backend connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3002".to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Send the previous reply's continuation token with each new prompt.
    pub use_context: bool,
    /// Pause between showing the placeholder and opening the stream.
    pub placeholder_delay_ms: u64,
    pub max_messages: usize,
    pub max_idle_minutes: i64,
    /// Shown on a failed turn when the backend gives no reason.
    pub error_message: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            use_context: true,
            placeholder_delay_ms: 100,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_idle_minutes: DEFAULT_MAX_IDLE_MINUTES,
            error_message: DEFAULT_ERROR_MESSAGE.to_string(),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
