//! Command-line arguments for the `chat-box` binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

use crate::config::AppConfig;

/// chat-box: a terminal client for a streaming chat backend.
#[derive(Parser, Debug, Default)]
#[command(name = "chat-box", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Base URL of the chat backend.
    #[arg(short = 'u', long = "base-url")]
    pub base_url: Option<String>,

    /// Directory holding the conversation database.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Keep conversations in memory only.
    #[arg(long = "in-memory")]
    pub in_memory: bool,
}

impl CliArgs {
    /// Priority: --config flag > CHAT_BOX_CONFIG env var > ~/.chat-box/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("CHAT_BOX_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Overlay command-line values onto the loaded configuration.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(ref url) = self.base_url {
            config.server.base_url = url.clone();
        }
        if let Some(ref dir) = self.data_dir {
            config.general.data_dir = dir.to_string_lossy().to_string();
        }
        if let Some(ref level) = self.log_level {
            config.general.log_level = level.clone();
        }
    }
}

fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".chat-box").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".chat-box").join("config.toml");
    }
    PathBuf::from("config.toml")
}
