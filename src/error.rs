//! Top-level error type for the chat client.

use crate::config::ConfigError;
use crate::db::models::ConversationId;
use crate::db::StorageError;
use crate::transport::TransportError;

/// Errors surfaced to the UI layer.
///
/// Transport failures that happen mid-stream are recorded on the message
/// instead of being returned; `Transport` only appears when the failure
/// cannot be attached to any message.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("a response is still being generated")]
    Busy,
    #[error("conversation is closed, start a new one")]
    ConversationClosed,
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),
    #[error("no message at index {index} in conversation {uuid}")]
    MessageNotFound { uuid: ConversationId, index: usize },
    #[error("message at index {0} was written by the user and cannot be regenerated")]
    NotAnAssistantMessage(usize),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
