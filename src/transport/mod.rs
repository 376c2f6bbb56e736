pub mod http;
#[cfg(test)]
pub(crate) mod scripted;

use crate::db::models::ConversationOptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use http::HttpTransport;

/// Request body sent to the chat backend.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatProcessRequest {
    pub prompt: String,
    pub options: ConversationOptions,
}

/// One line of the response stream: the full reply generated so far.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamSnapshot {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Streaming transport for the chat backend.
///
/// `on_progress` receives the whole buffer received so far on each call,
/// never a delta. Cancellation through `cancel` must end the call with
/// [`TransportError::Cancelled`].
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(
        &self,
        body: &ChatProcessRequest,
        cancel: CancellationToken,
        on_progress: &mut (dyn for<'b> FnMut(&'b str) + Send),
    ) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }

    /// Text shown inline in the conversation for a failed turn, if the
    /// error carries any.
    pub fn user_message(&self) -> Option<String> {
        match self {
            TransportError::Api { message, .. } if message.trim().is_empty() => None,
            TransportError::Api { message, .. } => Some(message.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamParseError {
    #[error("no complete line in buffer")]
    Empty,
    #[error("Parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse the most recent line of a cumulative response buffer.
///
/// The backend separates snapshots with `\n` and may or may not end the
/// buffer with one. A partially received line fails to parse and is left for
/// the next progress call.
pub fn parse_snapshot(buffer: &str) -> Result<StreamSnapshot, StreamParseError> {
    let trimmed = buffer.trim_end();
    let line = match trimmed.rfind('\n') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    };
    let line = line.trim();
    if line.is_empty() {
        return Err(StreamParseError::Empty);
    }
    Ok(serde_json::from_str(line)?)
}
