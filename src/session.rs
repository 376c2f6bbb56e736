//! The operations a chat front end drives: submitting, regenerating,
//! deleting, stopping, and moving between conversations.

use crate::controller::{RequestOutcome, StreamingRequestController};
use crate::db::models::{
    ConversationId, ConversationOptions, HistoryEntry, Message, DEFAULT_TITLE,
};
use crate::error::ChatError;
use crate::lifecycle::LifecyclePolicy;
use crate::store::ConversationStore;
use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type UpdateHook = Arc<dyn Fn() + Send + Sync>;

pub struct ChatSession {
    store: Arc<ConversationStore>,
    controller: Arc<StreamingRequestController>,
    policy: LifecyclePolicy,
    active: Mutex<ConversationId>,
    use_context: AtomicBool,
    placeholder_delay: Duration,
    on_update: UpdateHook,
}

impl ChatSession {
    /// Open the most recent conversation, or start one if the store is empty.
    pub fn new(controller: Arc<StreamingRequestController>, policy: LifecyclePolicy) -> Self {
        let store = controller.store().clone();
        let active = match store.history().first() {
            Some(entry) => entry.uuid,
            None => {
                let uuid = store.next_conversation_id();
                store.create_conversation(uuid, DEFAULT_TITLE);
                uuid
            }
        };
        Self {
            store,
            controller,
            policy,
            active: Mutex::new(active),
            use_context: AtomicBool::new(true),
            placeholder_delay: Duration::from_millis(100),
            on_update: Arc::new(|| {}),
        }
    }

    pub fn with_placeholder_delay(mut self, delay: Duration) -> Self {
        self.placeholder_delay = delay;
        self
    }

    pub fn with_use_context(self, use_context: bool) -> Self {
        self.use_context.store(use_context, Ordering::SeqCst);
        self
    }

    /// Called after every change a submission makes, e.g. to scroll to the bottom.
    pub fn with_update_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_update = Arc::new(hook);
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn active_conversation(&self) -> ConversationId {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.store.messages(self.active_conversation())
    }

    pub fn title(&self) -> Option<String> {
        self.store.title(self.active_conversation())
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.store.history()
    }

    pub fn responding(&self) -> bool {
        self.controller.is_responding()
    }

    pub fn use_context(&self) -> bool {
        self.use_context.load(Ordering::SeqCst)
    }

    pub fn set_use_context(&self, use_context: bool) {
        self.use_context.store(use_context, Ordering::SeqCst);
    }

    /// Whether the active conversation has hit its length or idle limit.
    pub fn is_closed(&self) -> bool {
        self.policy.is_closed(&self.messages(), Local::now())
    }

    fn notify(&self) {
        (self.on_update)();
    }

    /// Append the user's text and its placeholder, then stream the reply.
    ///
    /// The request is reserved with the controller before the placeholder
    /// delay, so it counts as responding for the whole call and a stop or
    /// conversation switch during the delay means no request is sent.
    pub async fn submit_user_text(&self, text: &str) -> Result<RequestOutcome, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.is_closed() {
            return Err(ChatError::ConversationClosed);
        }

        let uuid = self.active_conversation();
        let context = self.continuation_context(uuid);
        let reservation = self.controller.reserve(uuid, |store| {
            if !store.contains(uuid) {
                store.create_conversation(uuid, DEFAULT_TITLE);
            }
            if store.title(uuid).as_deref() == Some(DEFAULT_TITLE) {
                store.set_title(uuid, text);
            }
            store.add_message(uuid, Message::user(text));
            store.add_message(uuid, Message::placeholder(text, context))
        })?;
        self.notify();

        tokio::time::sleep(self.placeholder_delay).await;

        // Switched away before the reservation was registered.
        let active = self.active_conversation();
        if active != uuid {
            self.controller.conversation_changed(active);
        }

        let hook = self.on_update.clone();
        self.controller
            .submit_reserved(reservation, move || hook())
            .await
    }

    /// Continuation token of the last successful reply, if context is enabled.
    fn continuation_context(&self, uuid: ConversationId) -> ConversationOptions {
        if !self.use_context() {
            return ConversationOptions::default();
        }
        self.store
            .messages(uuid)
            .iter()
            .rev()
            .find(|m| !m.inversion && !m.error)
            .and_then(|m| m.conversation_options.clone())
            .unwrap_or_default()
    }

    /// Re-run the request that produced the assistant message at `index`.
    pub async fn regenerate(&self, index: usize) -> Result<RequestOutcome, ChatError> {
        if self.controller.is_responding() {
            return Err(ChatError::Busy);
        }
        let hook = self.on_update.clone();
        self.controller
            .submit(self.active_conversation(), Some(index), move || hook())
            .await
    }

    /// Delete one message. Deleting the message being streamed stops the stream.
    pub fn delete_message(&self, index: usize) -> Option<Message> {
        let uuid = self.active_conversation();
        let target = self.store.message_at(uuid, index)?;
        if self.controller.active_target() == Some((uuid, target.id)) {
            self.controller.stop_responding();
        }
        self.store.delete_message(uuid, index)
    }

    /// Empty the active conversation, stopping any stream writing into it.
    pub fn clear_conversation(&self) {
        let uuid = self.active_conversation();
        if matches!(self.controller.active_target(), Some((active, _)) if active == uuid) {
            self.controller.stop_responding();
        }
        self.store.clear_conversation(uuid);
    }

    pub fn stop_responding(&self) -> bool {
        self.controller.stop_responding()
    }

    /// Create a fresh conversation and make it active. The previous one is
    /// left untouched.
    pub fn start_new_conversation(&self) -> ConversationId {
        let uuid = self.store.next_conversation_id();
        self.store.create_conversation(uuid, DEFAULT_TITLE);
        self.activate(uuid);
        uuid
    }

    pub fn switch_conversation(&self, uuid: ConversationId) -> Result<(), ChatError> {
        if !self.store.contains(uuid) {
            return Err(ChatError::ConversationNotFound(uuid));
        }
        self.activate(uuid);
        Ok(())
    }

    fn activate(&self, uuid: ConversationId) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = uuid;
        self.controller.conversation_changed(uuid);
        tracing::info!(uuid = %uuid, "active conversation changed");
    }

    /// Remove a conversation. If it was active, the newest remaining one
    /// becomes active, or a new one is started.
    pub fn delete_conversation(&self, uuid: ConversationId) -> Result<(), ChatError> {
        if !self.store.contains(uuid) {
            return Err(ChatError::ConversationNotFound(uuid));
        }
        if matches!(self.controller.active_target(), Some((active, _)) if active == uuid) {
            self.controller.stop_responding();
        }
        self.store.delete_conversation(uuid);

        if self.active_conversation() == uuid {
            match self.store.history().first() {
                Some(entry) => self.activate(entry.uuid),
                None => {
                    self.start_new_conversation();
                }
            }
        }
        Ok(())
    }
}
