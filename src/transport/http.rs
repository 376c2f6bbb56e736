use super::{ChatProcessRequest, ChatTransport, TransportError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_ENDPOINT: &str = "/chat-process";

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub endpoint: String,
    pub api_key: Option<String>,
}

/// Error body returned by the backend on failure.
#[derive(Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

/// Streams newline-delimited JSON snapshots from the chat backend over HTTP.
pub struct HttpTransport {
    client: Client,
    config: HttpConfig,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.endpoint
        )
    }
}

fn api_error(status: u16, body: String) -> TransportError {
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or(body);
    TransportError::Api { status, message }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open_stream(
        &self,
        body: &ChatProcessRequest,
        cancel: CancellationToken,
        on_progress: &mut (dyn for<'b> FnMut(&'b str) + Send),
    ) -> Result<(), TransportError> {
        let mut req = self
            .client
            .post(self.url())
            .header("Content-Type", "application/json")
            .json(body);

        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            resp = req.send() => resp?,
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(status, "chat backend returned an error status");
            return Err(api_error(status, text));
        }

        let mut stream = resp.bytes_stream();
        let mut raw: Vec<u8> = Vec::new();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            raw.extend_from_slice(&chunk);
            // Decode the whole buffer so a multi-byte character split across
            // chunks is repaired once its tail arrives.
            let buffer = String::from_utf8_lossy(&raw);
            on_progress(&buffer);
        }

        Ok(())
    }
}
