//! In-process transport that replays a fixed script per request.

use super::{ChatProcessRequest, ChatTransport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub(crate) enum Step {
    /// Append a line to the buffer and report the whole buffer.
    Line(String),
    /// Report exactly this buffer.
    Raw(String),
    /// Signal `reached`, then wait for `release` without looking at the token.
    Gate {
        reached: Arc<Notify>,
        release: Arc<Notify>,
    },
    /// Wait until the request is cancelled.
    WaitForCancel,
    Fail(TransportError),
}

pub(crate) fn line(text: &str) -> Step {
    Step::Line(format!(
        r#"{{"text":{},"conversationId":"conv-1","id":"msg-{}"}}"#,
        serde_json::Value::String(text.to_string()),
        text.len()
    ))
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    pub(crate) requests: Mutex<Vec<ChatProcessRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<ChatProcessRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open_stream(
        &self,
        body: &ChatProcessRequest,
        cancel: CancellationToken,
        on_progress: &mut (dyn for<'b> FnMut(&'b str) + Send),
    ) -> Result<(), TransportError> {
        self.requests.lock().unwrap().push(body.clone());
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let mut buffer = String::new();

        for step in script {
            match step {
                Step::Line(line) => {
                    if !buffer.is_empty() {
                        buffer.push('\n');
                    }
                    buffer.push_str(&line);
                    on_progress(&buffer);
                }
                Step::Raw(raw) => {
                    buffer = raw;
                    on_progress(&buffer);
                }
                Step::Gate { reached, release } => {
                    reached.notify_one();
                    release.notified().await;
                }
                Step::WaitForCancel => {
                    cancel.cancelled().await;
                    return Err(TransportError::Cancelled);
                }
                Step::Fail(err) => return Err(err),
            }
        }

        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        Ok(())
    }
}
