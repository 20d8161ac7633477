//! # Turn-Result Dispatch
//!
//! Notifies the external application of each completed conversation turn via
//! an HTTP POST to the call's webhook URL. Dispatch is fire-and-forget by
//! construction: every delivery runs in its own spawned task, so a slow or
//! dead webhook can never block or fail the audio path.
//!
//! ## Delivery contract:
//! - JSON body `{uuid, userQuery, agentResponse, matchedIntent, currentPage}`
//! - content-type application/json
//! - a response body of literally `"Ok"` means success; anything else is
//!   logged as a warning with the body content
//! - failures are never retried and never surface to the caller

use crate::conversation::TurnResult;
use crate::error::CallError;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Response body the webhook receiver answers with on success.
const EXPECTED_BODY: &str = "Ok";

/// Seam between the bridge and webhook delivery, so tests can observe
/// dispatch decisions without a network.
pub trait TurnDispatcher: Send + Sync {
    /// Deliver one turn result to `webhook_url`. Must not block; the bridge
    /// calls this at most once per turn result.
    fn dispatch(&self, call_id: &str, webhook_url: &str, turn: &TurnResult);
}

/// The normalized webhook payload.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TurnPayload {
    uuid: String,
    user_query: String,
    agent_response: String,
    matched_intent: String,
    current_page: String,
}

impl TurnPayload {
    /// Absent intent/page serialize as empty strings, which is what the
    /// receiving application expects.
    pub fn new(call_id: &str, turn: &TurnResult) -> Self {
        Self {
            uuid: call_id.to_string(),
            user_query: turn.transcript.clone(),
            agent_response: turn.reply_text.clone(),
            matched_intent: turn.matched_intent.clone().unwrap_or_default(),
            current_page: turn.current_page.clone().unwrap_or_default(),
        }
    }
}

/// Production dispatcher backed by a shared `reqwest` client.
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl TurnDispatcher for WebhookDispatcher {
    fn dispatch(&self, call_id: &str, webhook_url: &str, turn: &TurnResult) {
        let payload = TurnPayload::new(call_id, turn);
        let client = self.client.clone();
        let url = webhook_url.to_string();
        let call_id = call_id.to_string();

        tokio::spawn(async move {
            let outcome = async {
                let response = client
                    .post(&url)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| CallError::Dispatch(format!("webhook unreachable: {}", e)))?;

                let body = response
                    .text()
                    .await
                    .map_err(|e| CallError::Dispatch(format!("webhook body unreadable: {}", e)))?;

                if body != EXPECTED_BODY {
                    return Err(CallError::Dispatch(format!("webhook answered '{}'", body)));
                }
                Ok(())
            }
            .await;

            match outcome {
                Ok(()) => debug!(call_id = %call_id, url = %url, "Turn result dispatched"),
                // Non-fatal, no retry: turn dispatch is decoupled from playback.
                Err(e) => warn!(call_id = %call_id, url = %url, error = %e, "Turn dispatch failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn greeting_turn() -> TurnResult {
        TurnResult {
            response_id: "r1".to_string(),
            transcript: "hi".to_string(),
            reply_text: "hello".to_string(),
            matched_intent: Some("Greeting".to_string()),
            current_page: Some("Start".to_string()),
            audio: Bytes::new(),
        }
    }

    /// The payload serializes to exactly the body the webhook contract names.
    #[test]
    fn test_payload_body_shape() {
        let payload = TurnPayload::new("call-1", &greeting_turn());
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(
            json,
            r#"{"uuid":"call-1","userQuery":"hi","agentResponse":"hello","matchedIntent":"Greeting","currentPage":"Start"}"#
        );
    }

    #[test]
    fn test_absent_intent_and_page_become_empty_strings() {
        let turn = TurnResult {
            matched_intent: None,
            current_page: None,
            ..greeting_turn()
        };
        let json = serde_json::to_string(&TurnPayload::new("call-1", &turn)).unwrap();
        assert!(json.contains(r#""matchedIntent":"""#));
        assert!(json.contains(r#""currentPage":"""#));
    }

    /// End-to-end delivery against a one-shot HTTP listener: the dispatcher
    /// posts JSON with the right content type and payload.
    #[tokio::test]
    async fn test_dispatch_posts_to_webhook() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(headers_end) = text.find("\r\n\r\n") {
                    let content_length = text
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= headers_end + 4 + content_length {
                        break;
                    }
                }
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nOk")
                .await
                .unwrap();
            String::from_utf8(request).unwrap()
        });

        let dispatcher = WebhookDispatcher::new(Duration::from_secs(5)).unwrap();
        dispatcher.dispatch(
            "call-1",
            &format!("http://{}/analytics", addr),
            &greeting_turn(),
        );

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /analytics"));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(request.contains(
            r#"{"uuid":"call-1","userQuery":"hi","agentResponse":"hello","matchedIntent":"Greeting","currentPage":"Start"}"#
        ));
    }
}
