//! `HttpTransport` against a mock chat backend.

use std::time::Duration;

use chat_box_lib::db::models::ConversationOptions;
use chat_box_lib::transport::http::{HttpConfig, DEFAULT_ENDPOINT};
use chat_box_lib::transport::{
    parse_snapshot, ChatProcessRequest, ChatTransport, HttpTransport, TransportError,
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Helpers
// =============================================================================

fn transport_for(server: &MockServer, api_key: Option<&str>) -> HttpTransport {
    HttpTransport::new(HttpConfig {
        base_url: server.uri(),
        endpoint: DEFAULT_ENDPOINT.to_string(),
        api_key: api_key.map(str::to_string),
    })
}

fn request(prompt: &str) -> ChatProcessRequest {
    ChatProcessRequest {
        prompt: prompt.to_string(),
        options: ConversationOptions::default(),
    }
}

const STREAM_BODY: &str = concat!(
    r#"{"text":"Hel","conversationId":"c1","id":"m1"}"#,
    "\n",
    r#"{"text":"Hello","conversationId":"c1","id":"m1"}"#,
    "\n",
    r#"{"text":"Hello there","conversationId":"c1","id":"m1"}"#,
);

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_stream_delivers_cumulative_buffer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat-process"))
        .and(body_json(serde_json::json!({ "prompt": "hi", "options": {} })))
        .respond_with(ResponseTemplate::new(200).set_body_string(STREAM_BODY))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport_for(&server, None);
    let mut seen: Vec<String> = Vec::new();
    let mut on_progress = |buffer: &str| seen.push(buffer.to_string());
    transport
        .open_stream(&request("hi"), CancellationToken::new(), &mut on_progress)
        .await
        .unwrap();

    assert!(!seen.is_empty());
    let last = seen.last().unwrap();
    assert_eq!(last, STREAM_BODY);
    for pair in seen.windows(2) {
        assert!(pair[1].starts_with(&pair[0]), "buffer must only grow");
    }

    let snapshot = parse_snapshot(last).unwrap();
    assert_eq!(snapshot.text.as_deref(), Some("Hello there"));
    assert_eq!(snapshot.conversation_id.as_deref(), Some("c1"));
    assert_eq!(snapshot.id.as_deref(), Some("m1"));
}

#[tokio::test]
async fn test_api_key_sent_as_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat-process"))
        .and(header("Authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_string(STREAM_BODY))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport_for(&server, Some("sk-test"));
    let mut on_progress = |_: &str| {};
    transport
        .open_stream(&request("hi"), CancellationToken::new(), &mut on_progress)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_error_status_maps_to_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat-process"))
        .respond_with(ResponseTemplate::new(500).set_body_string(
            r#"{"status":"Fail","message":"upstream timeout","data":null}"#,
        ))
        .mount(&server)
        .await;

    let transport = transport_for(&server, None);
    let mut calls = 0;
    let mut on_progress = |_: &str| calls += 1;
    let err = transport
        .open_stream(&request("hi"), CancellationToken::new(), &mut on_progress)
        .await
        .unwrap_err();

    match err {
        TransportError::Api { status, ref message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "upstream timeout");
        }
        ref other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.user_message().as_deref(), Some("upstream timeout"));
    assert_eq!(calls, 0);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat-process"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(STREAM_BODY)
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let transport = transport_for(&server, None);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let mut on_progress = |_: &str| {};
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        transport.open_stream(&request("hi"), cancel, &mut on_progress),
    )
    .await
    .expect("cancellation should end the request promptly")
    .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_unreachable_backend_is_http_error() {
    let transport = HttpTransport::new(HttpConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        endpoint: DEFAULT_ENDPOINT.to_string(),
        api_key: None,
    });
    let mut on_progress = |_: &str| {};
    let err = transport
        .open_stream(&request("hi"), CancellationToken::new(), &mut on_progress)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Http(_)));
    assert!(!err.is_cancelled());
}
