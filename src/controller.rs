//! Lifecycle of the single outstanding generation request.
//!
//! Every request gets a generation number. Stream callbacks and completion
//! handlers check it under the `active` lock before touching the store, so a
//! request that was stopped, superseded, or left behind by a conversation
//! switch can never write again once the abort call has returned.
//!
//! Lock order is `active` then store.

use crate::db::models::{
    ConversationId, ConversationOptions, Message, MessageId, MessagePatch, RequestOptions,
};
use crate::error::ChatError;
use crate::store::ConversationStore;
use crate::transport::{parse_snapshot, ChatProcessRequest, ChatTransport, TransportError};
use chrono::Local;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_ERROR_MESSAGE: &str = "Something went wrong, please try again later.";

/// How a call to [`StreamingRequestController::submit`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The stream finished and the message holds the final snapshot.
    Completed,
    /// The transport failed; the failure is recorded on the message.
    Failed,
    /// The request was stopped, superseded, or abandoned by a conversation switch.
    Stopped,
}

struct ActiveRequest {
    generation: u64,
    uuid: ConversationId,
    message_id: MessageId,
    cancel: CancellationToken,
}

/// A request registered by [`StreamingRequestController::reserve`] whose
/// stream has not been opened yet.
#[must_use = "a reservation keeps the controller busy until it is submitted or stopped"]
#[derive(Debug)]
pub struct Reservation {
    generation: u64,
    uuid: ConversationId,
    message_id: MessageId,
    cancel: CancellationToken,
}

impl Reservation {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

pub struct StreamingRequestController {
    store: Arc<ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    active: Mutex<Option<ActiveRequest>>,
    next_generation: AtomicU64,
    responding: watch::Sender<bool>,
    fallback_error: String,
}

impl StreamingRequestController {
    pub fn new(store: Arc<ConversationStore>, transport: Arc<dyn ChatTransport>) -> Self {
        let (responding, _) = watch::channel(false);
        Self {
            store,
            transport,
            active: Mutex::new(None),
            next_generation: AtomicU64::new(0),
            responding,
            fallback_error: DEFAULT_ERROR_MESSAGE.to_string(),
        }
    }

    /// Text recorded on a failed turn when the transport error carries none.
    pub fn with_fallback_error(mut self, message: impl Into<String>) -> Self {
        self.fallback_error = message.into();
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn is_responding(&self) -> bool {
        *self.responding.borrow()
    }

    pub fn subscribe_responding(&self) -> watch::Receiver<bool> {
        self.responding.subscribe()
    }

    /// Conversation and message the outstanding request is writing to.
    pub fn active_target(&self) -> Option<(ConversationId, MessageId)> {
        self.lock_active().as_ref().map(|a| (a.uuid, a.message_id))
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRequest>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stream a response into the assistant message at `index_hint`, or the
    /// last message of the conversation when no hint is given.
    ///
    /// A message that already has text is reset in place and regenerated.
    /// An outstanding request is superseded.
    /// `on_update` runs after every change this request makes to the store.
    pub async fn submit<F>(
        &self,
        uuid: ConversationId,
        index_hint: Option<usize>,
        on_update: F,
    ) -> Result<RequestOutcome, ChatError>
    where
        F: Fn() + Send + Sync,
    {
        let messages = self.store.messages(uuid);
        let index = match index_hint {
            Some(index) => index,
            None => messages
                .len()
                .checked_sub(1)
                .ok_or(ChatError::MessageNotFound { uuid, index: 0 })?,
        };
        let target = messages
            .get(index)
            .ok_or(ChatError::MessageNotFound { uuid, index })?;
        if target.inversion {
            return Err(ChatError::NotAnAssistantMessage(index));
        }

        let message_id = target.id;
        let request_options = target.request_options.clone();
        let (generation, cancel) = self.begin(uuid, target);
        on_update();

        Ok(self
            .stream(generation, cancel, uuid, message_id, request_options, on_update)
            .await)
    }

    /// Register a request for the assistant message that `append` adds,
    /// without opening its stream yet.
    ///
    /// Fails with [`ChatError::Busy`] while another request is outstanding,
    /// in which case `append` is not run. Until the reservation is passed to
    /// [`submit_reserved`](Self::submit_reserved) it counts as responding and
    /// can be stopped like a running request.
    pub fn reserve(
        &self,
        uuid: ConversationId,
        append: impl FnOnce(&ConversationStore) -> MessageId,
    ) -> Result<Reservation, ChatError> {
        let mut active = self.lock_active();
        if active.is_some() {
            return Err(ChatError::Busy);
        }
        let message_id = append(self.store.as_ref());

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        *active = Some(ActiveRequest {
            generation,
            uuid,
            message_id,
            cancel: cancel.clone(),
        });
        self.responding.send_replace(true);
        tracing::debug!(uuid = %uuid, message_id = %message_id, generation, "request reserved");
        Ok(Reservation {
            generation,
            uuid,
            message_id,
            cancel,
        })
    }

    /// Open the stream for a reserved request. A reservation that was
    /// stopped or abandoned in the meantime issues no request.
    pub async fn submit_reserved<F>(
        &self,
        reservation: Reservation,
        on_update: F,
    ) -> Result<RequestOutcome, ChatError>
    where
        F: Fn() + Send + Sync,
    {
        let Reservation {
            generation,
            uuid,
            message_id,
            cancel,
        } = reservation;

        let target = self.if_current(generation, || {
            let target = self.store.message(uuid, message_id)?;
            if !target.inversion {
                if let Some(patch) = reset_patch(&target) {
                    self.store.update_message(uuid, message_id, patch);
                }
            }
            Some(target)
        });
        let target = match target {
            Some(Some(target)) => target,
            Some(None) => {
                tracing::warn!(uuid = %uuid, message_id = %message_id, "reserved message no longer exists");
                self.release(generation);
                return Ok(RequestOutcome::Stopped);
            }
            None => {
                tracing::info!(uuid = %uuid, generation, "request stopped before its stream opened");
                return Ok(RequestOutcome::Stopped);
            }
        };
        if target.inversion {
            self.release(generation);
            return Err(ChatError::NotAnAssistantMessage(
                self.store.index_of(uuid, message_id).unwrap_or_default(),
            ));
        }
        on_update();

        Ok(self
            .stream(
                generation,
                cancel,
                uuid,
                message_id,
                target.request_options,
                on_update,
            )
            .await)
    }

    async fn stream<F>(
        &self,
        generation: u64,
        cancel: CancellationToken,
        uuid: ConversationId,
        message_id: MessageId,
        request_options: RequestOptions,
        on_update: F,
    ) -> RequestOutcome
    where
        F: Fn() + Send + Sync,
    {
        let body = ChatProcessRequest {
            prompt: request_options.prompt.clone(),
            options: request_options.options.clone(),
        };
        tracing::info!(uuid = %uuid, message_id = %message_id, generation, "opening response stream");

        let mut on_progress = |buffer: &str| {
            let snapshot = match parse_snapshot(buffer) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::debug!(generation, error = %e, "skipping unparseable stream line");
                    return;
                }
            };
            let patch = MessagePatch {
                date_time: Some(Local::now()),
                text: Some(snapshot.text.unwrap_or_default()),
                inversion: Some(false),
                error: Some(false),
                loading: Some(false),
                conversation_options: Some(Some(ConversationOptions {
                    conversation_id: snapshot.conversation_id,
                    parent_message_id: snapshot.id,
                })),
                request_options: Some(request_options.clone()),
            };
            let applied = self.if_current(generation, || {
                self.store.update_message_deferred(uuid, message_id, patch)
            });
            match applied {
                Some(true) => on_update(),
                Some(false) => tracing::debug!(generation, "target message no longer exists"),
                None => tracing::debug!(generation, "dropping progress from a stale request"),
            }
        };

        let result = self
            .transport
            .open_stream(&body, cancel, &mut on_progress)
            .await;

        let outcome = self.finish(generation, uuid, message_id, &request_options, result);
        if outcome.is_some() {
            on_update();
        }
        outcome.unwrap_or(RequestOutcome::Stopped)
    }

    /// Abort the outstanding request, if any. This is a deliberate user
    /// action and never marks the message as failed.
    pub fn stop_responding(&self) -> bool {
        let mut active = self.lock_active();
        match active.take() {
            Some(request) => {
                self.abort(request, "stopped by user");
                true
            }
            None => false,
        }
    }

    /// Abort the outstanding request if it belongs to a conversation other
    /// than `uuid`. No request is started for the new conversation.
    pub fn conversation_changed(&self, uuid: ConversationId) -> bool {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.uuid != uuid) {
            if let Some(request) = active.take() {
                self.abort(request, "conversation switched");
                return true;
            }
        }
        false
    }

    fn begin(&self, uuid: ConversationId, target: &Message) -> (u64, CancellationToken) {
        let mut active = self.lock_active();
        if let Some(previous) = active.take() {
            self.abort(previous, "superseded by a newer request");
        }

        if let Some(patch) = reset_patch(target) {
            self.store.update_message(uuid, target.id, patch);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        *active = Some(ActiveRequest {
            generation,
            uuid,
            message_id: target.id,
            cancel: cancel.clone(),
        });
        self.responding.send_replace(true);
        (generation, cancel)
    }

    /// Must be called with the `active` lock held and `request` already taken out of it.
    fn abort(&self, request: ActiveRequest, reason: &str) {
        request.cancel.cancel();
        let still_loading = self
            .store
            .message(request.uuid, request.message_id)
            .is_some_and(|m| m.loading);
        if still_loading {
            self.store.update_message(
                request.uuid,
                request.message_id,
                MessagePatch {
                    loading: Some(false),
                    ..Default::default()
                },
            );
        }
        self.store.flush();
        self.responding.send_replace(false);
        tracing::info!(
            uuid = %request.uuid,
            message_id = %request.message_id,
            generation = request.generation,
            reason,
            "response stream aborted"
        );
    }

    /// Run `f` under the `active` lock if `generation` is still the current request.
    fn if_current<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let active = self.lock_active();
        match active.as_ref() {
            Some(request) if request.generation == generation => Some(f()),
            _ => None,
        }
    }

    /// Record the end of a request. Returns `None` when the request is no
    /// longer current and nothing was written.
    fn finish(
        &self,
        generation: u64,
        uuid: ConversationId,
        message_id: MessageId,
        request_options: &RequestOptions,
        result: Result<(), TransportError>,
    ) -> Option<RequestOutcome> {
        let mut active = self.lock_active();
        if !matches!(active.as_ref(), Some(r) if r.generation == generation) {
            tracing::debug!(generation, "request ended after it was aborted");
            return None;
        }
        *active = None;

        let outcome = match result {
            Ok(()) => {
                self.finalize_loading(uuid, message_id);
                tracing::info!(uuid = %uuid, generation, "response stream completed");
                RequestOutcome::Completed
            }
            Err(e) if e.is_cancelled() => {
                self.finalize_loading(uuid, message_id);
                RequestOutcome::Stopped
            }
            Err(e) => {
                tracing::warn!(uuid = %uuid, generation, error = %e, "response stream failed");
                self.record_failure(uuid, message_id, request_options, &e);
                RequestOutcome::Failed
            }
        };
        self.store.flush();
        self.responding.send_replace(false);
        Some(outcome)
    }

    /// Drop a request that never opened its stream.
    fn release(&self, generation: u64) {
        let mut active = self.lock_active();
        if matches!(active.as_ref(), Some(r) if r.generation == generation) {
            *active = None;
            self.responding.send_replace(false);
        }
    }

    fn finalize_loading(&self, uuid: ConversationId, message_id: MessageId) {
        if self.store.message(uuid, message_id).is_some_and(|m| m.loading) {
            self.store.update_message(
                uuid,
                message_id,
                MessagePatch {
                    loading: Some(false),
                    ..Default::default()
                },
            );
        }
    }

    fn record_failure(
        &self,
        uuid: ConversationId,
        message_id: MessageId,
        request_options: &RequestOptions,
        error: &TransportError,
    ) {
        let reason = error
            .user_message()
            .unwrap_or_else(|| self.fallback_error.clone());

        let Some(current) = self.store.message(uuid, message_id) else {
            tracing::warn!(uuid = %uuid, message_id = %message_id, "failed message was deleted");
            return;
        };

        // Streamed content is kept; the failure is appended as a note.
        let patch = if !current.text.is_empty() {
            MessagePatch {
                text: Some(format!("{}\n[{}]", current.text, reason)),
                error: Some(false),
                loading: Some(false),
                ..Default::default()
            }
        } else {
            MessagePatch {
                date_time: Some(Local::now()),
                text: Some(reason),
                inversion: Some(false),
                error: Some(true),
                loading: Some(false),
                conversation_options: Some(None),
                request_options: Some(request_options.clone()),
            }
        };
        self.store.update_message(uuid, message_id, patch);
    }
}

/// Patch that turns `target` back into a pending reply, if it is not one already.
fn reset_patch(target: &Message) -> Option<MessagePatch> {
    if !target.text.is_empty() {
        Some(MessagePatch {
            date_time: Some(Local::now()),
            text: Some(String::new()),
            loading: Some(true),
            error: Some(false),
            ..Default::default()
        })
    } else if !target.loading || target.error {
        Some(MessagePatch {
            loading: Some(true),
            error: Some(false),
            ..Default::default()
        })
    } else {
        None
    }
}
