use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Title given to a conversation until its first user message names it.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Conversation identifier: the creation time in milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub u64);

impl ConversationId {
    pub fn now() -> Self {
        ConversationId(Utc::now().timestamp_millis().max(0) as u64)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ConversationId)
    }
}

/// Stable identifier of a message, independent of its position in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        MessageId(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Continuation token handed back by the backend.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
}

impl ConversationOptions {
    pub fn is_empty(&self) -> bool {
        self.conversation_id.is_none() && self.parent_message_id.is_none()
    }
}

/// The `{ prompt, options }` pair that regenerates a message.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub prompt: String,
    #[serde(default)]
    pub options: ConversationOptions,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: MessageId,
    pub date_time: DateTime<Local>,
    pub text: String,
    pub inversion: bool,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub loading: bool,
    #[serde(default)]
    pub conversation_options: Option<ConversationOptions>,
    #[serde(default)]
    pub request_options: RequestOptions,
}

impl Message {
    /// A finalized entry authored by the user.
    pub fn user(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            id: MessageId::new(),
            date_time: Local::now(),
            text: prompt.clone(),
            inversion: true,
            error: false,
            loading: false,
            conversation_options: None,
            request_options: RequestOptions {
                prompt,
                options: ConversationOptions::default(),
            },
        }
    }

    /// An empty assistant entry waiting for stream data.
    pub fn placeholder(prompt: impl Into<String>, options: ConversationOptions) -> Self {
        Self {
            id: MessageId::new(),
            date_time: Local::now(),
            text: String::new(),
            inversion: false,
            error: false,
            loading: true,
            conversation_options: None,
            request_options: RequestOptions {
                prompt: prompt.into(),
                options,
            },
        }
    }
}

/// Shallow patch merged over an existing [`Message`]; `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub date_time: Option<DateTime<Local>>,
    pub text: Option<String>,
    pub inversion: Option<bool>,
    pub error: Option<bool>,
    pub loading: Option<bool>,
    pub conversation_options: Option<Option<ConversationOptions>>,
    pub request_options: Option<RequestOptions>,
}

impl MessagePatch {
    pub fn apply(self, message: &mut Message) {
        if let Some(date_time) = self.date_time {
            message.date_time = date_time;
        }
        if let Some(text) = self.text {
            message.text = text;
        }
        if let Some(inversion) = self.inversion {
            message.inversion = inversion;
        }
        if let Some(error) = self.error {
            message.error = error;
        }
        if let Some(loading) = self.loading {
            message.loading = loading;
        }
        if let Some(conversation_options) = self.conversation_options {
            message.conversation_options = conversation_options;
        }
        if let Some(request_options) = self.request_options {
            message.request_options = request_options;
        }
    }
}

/// Sidebar metadata for one conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub uuid: ConversationId,
    pub title: String,
}

/// The message list of one conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatEntry {
    pub uuid: ConversationId,
    pub data: Vec<Message>,
}
