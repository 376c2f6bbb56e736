//! Rules for retiring a conversation that has grown too long or gone stale.

use crate::db::models::Message;
use chrono::{DateTime, Duration, Local};

pub const DEFAULT_MAX_MESSAGES: usize = 40;
pub const DEFAULT_MAX_IDLE_MINUTES: i64 = 180;

#[derive(Debug, Clone, Copy)]
pub struct LifecyclePolicy {
    pub max_messages: usize,
    pub max_idle: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            max_idle: Duration::minutes(DEFAULT_MAX_IDLE_MINUTES),
        }
    }
}

impl LifecyclePolicy {
    pub fn new(max_messages: usize, max_idle_minutes: i64) -> Self {
        Self {
            max_messages,
            max_idle: Duration::minutes(max_idle_minutes),
        }
    }

    /// A closed conversation accepts no further submissions; the user is
    /// offered a new one instead. An empty conversation is never closed.
    pub fn is_closed(&self, messages: &[Message], now: DateTime<Local>) -> bool {
        if messages.len() > self.max_messages {
            return true;
        }
        match messages.last() {
            Some(last) => now.signed_duration_since(last.date_time) > self.max_idle,
            None => false,
        }
    }
}

/// [`LifecyclePolicy::is_closed`] with the default limits, evaluated now.
pub fn is_closed(messages: &[Message]) -> bool {
    LifecyclePolicy::default().is_closed(messages, Local::now())
}
