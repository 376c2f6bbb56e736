//! chat-box: a conversational client over a streaming chat backend.
//!
//! `run()` is the composition root for the `chat-box` binary:
//! 1. Parse CLI args and load configuration from TOML
//! 2. Initialize tracing (stderr)
//! 3. Open storage (SQLite in the data dir, or in memory)
//! 4. Wire store -> transport -> controller -> session
//! 5. Drive the terminal front end until `/quit` or end of input

pub mod cli;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod session;
pub mod store;
pub mod terminal;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

pub use controller::{RequestOutcome, StreamingRequestController};
pub use error::ChatError;
pub use session::ChatSession;
pub use store::ConversationStore;

use cli::CliArgs;
use config::AppConfig;
use db::{Database, KeyValueStore, MemoryStorage};
use transport::HttpTransport;

pub fn run() -> Result<(), ChatError> {
    let args = CliArgs::parse();
    let config_path = args.resolve_config_path();
    let config_found = config_path.exists();
    let mut config = AppConfig::load_or_default(&config_path)?;
    args.apply(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting chat-box v{}", env!("CARGO_PKG_VERSION"));
    if config_found {
        tracing::info!(path = %config_path.display(), "Configuration loaded");
    } else {
        tracing::info!(path = %config_path.display(), "No config file, using defaults");
    }

    let storage: Arc<dyn KeyValueStore> = if args.in_memory {
        tracing::info!("Keeping conversations in memory");
        Arc::new(MemoryStorage::new())
    } else {
        let data_dir = config.data_dir();
        tracing::info!(path = %data_dir.display(), "Opening database");
        Arc::new(Database::new(&data_dir)?)
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let session = build_session(&config, storage);
        terminal::run_terminal(Arc::new(session)).await
    })
}

/// Wire a session over `storage` using the backend described by `config`.
pub fn build_session(config: &AppConfig, storage: Arc<dyn KeyValueStore>) -> ChatSession {
    let store = Arc::new(ConversationStore::load(storage));
    let transport = Arc::new(HttpTransport::new(config.http()));
    let controller = Arc::new(
        StreamingRequestController::new(store, transport)
            .with_fallback_error(config.chat.error_message.clone()),
    );
    tracing::info!(
        base_url = %config.server.base_url,
        endpoint = %config.server.endpoint,
        "Chat backend configured"
    );
    ChatSession::new(controller, config.lifecycle())
        .with_placeholder_delay(Duration::from_millis(config.chat.placeholder_delay_ms))
        .with_use_context(config.chat.use_context)
}
