//! # Remote Conversation Session
//!
//! Production [`ConversationSession`] that proxies a call to the
//! conversational-AI backend over a WebSocket connection.
//!
//! ## Wire format (backend side):
//! - **Outbound**: caller audio chunks as binary frames, forwarded verbatim.
//! - **Inbound**: one JSON text frame per turn with the turn metadata. When
//!   `audio_follows` is true the next binary frame carries that turn's
//!   synthesized WAV bytes; the two are paired here before the turn is
//!   emitted to the bridge.
//! - The backend closing the connection (or any protocol error) ends the
//!   turn stream, which the bridge treats as the session's terminal state.
//!
//! The session runs a writer task (audio out) and a reader task (turns in);
//! `close` cancels both and sends a Close frame. Both directions are
//! buffered channels so neither the socket actor nor the bridge ever blocks
//! on backend I/O.

use crate::conversation::{ActiveSession, ConversationSession, SessionFactory, TurnResult};
use crate::error::CallError;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Turn metadata as the backend sends it.
#[derive(Debug, Deserialize)]
struct TurnMessage {
    #[serde(default)]
    response_id: String,
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    reply_text: String,
    #[serde(default)]
    matched_intent: Option<String>,
    #[serde(default)]
    current_page: Option<String>,
    /// The next binary frame carries this turn's synthesized audio.
    #[serde(default)]
    audio_follows: bool,
}

fn turn_from_parts(msg: TurnMessage, audio: Bytes) -> TurnResult {
    TurnResult {
        response_id: msg.response_id,
        transcript: msg.transcript,
        reply_text: msg.reply_text,
        matched_intent: msg.matched_intent,
        current_page: msg.current_page,
        audio,
    }
}

/// Opens [`RemoteSession`]s against the configured backend URL.
pub struct RemoteSessionFactory {
    base_url: String,
}

impl RemoteSessionFactory {
    pub fn new(base_url: String) -> Self {
        Self { base_url }
    }

    fn session_url(&self, call_id: &str) -> String {
        format!(
            "{}/conversations/{}",
            self.base_url.trim_end_matches('/'),
            call_id
        )
    }
}

impl SessionFactory for RemoteSessionFactory {
    fn open(&self, call_id: &str) -> BoxFuture<'static, Result<ActiveSession, CallError>> {
        let url = self.session_url(call_id);
        let call_id = call_id.to_string();

        Box::pin(async move {
            let (stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| CallError::Session(format!("backend connect failed: {}", e)))?;
            debug!(call_id = %call_id, url = %url, "Backend session established");

            let (mut ws_write, mut ws_read) = stream.split();
            let (audio_tx, mut audio_rx) = mpsc::unbounded_channel::<Bytes>();
            let (turn_tx, turn_rx) = mpsc::channel::<TurnResult>(16);
            let closed = CancellationToken::new();

            // Writer: caller audio out, Close frame on teardown.
            let writer_token = closed.clone();
            let writer_call_id = call_id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = writer_token.cancelled() => {
                            let _ = ws_write.send(Message::Close(None)).await;
                            break;
                        }
                        chunk = audio_rx.recv() => match chunk {
                            Some(chunk) => {
                                if ws_write.send(Message::Binary(chunk.to_vec())).await.is_err() {
                                    debug!(call_id = %writer_call_id, "Backend write side closed");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            });

            // Reader: pair turn metadata with its audio frame and emit.
            let reader_token = closed.clone();
            let reader_call_id = call_id.clone();
            tokio::spawn(async move {
                let mut pending: Option<TurnMessage> = None;

                loop {
                    let msg = tokio::select! {
                        _ = reader_token.cancelled() => break,
                        msg = ws_read.next() => msg,
                    };

                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<TurnMessage>(&text) {
                                Ok(turn) if turn.audio_follows => pending = Some(turn),
                                Ok(turn) => {
                                    let turn = turn_from_parts(turn, Bytes::new());
                                    if turn_tx.send(turn).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(call_id = %reader_call_id, error = %e, "Unparseable turn message from backend");
                                }
                            }
                        }
                        Some(Ok(Message::Binary(data))) => match pending.take() {
                            Some(turn) => {
                                let turn = turn_from_parts(turn, Bytes::from(data));
                                if turn_tx.send(turn).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                warn!(call_id = %reader_call_id, "Audio frame without preceding turn metadata");
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(call_id = %reader_call_id, "Backend session stream ended");
                            break;
                        }
                        Some(Ok(_)) => {} // ping/pong handled by the library
                        Some(Err(e)) => {
                            warn!(call_id = %reader_call_id, error = %e, "Backend session stream error");
                            break;
                        }
                    }
                }
                // Dropping turn_tx closes the turn channel: terminal state.
            });

            let session = Arc::new(RemoteSession {
                call_id,
                audio_tx,
                closed,
            });

            Ok(ActiveSession {
                session,
                turns: turn_rx,
            })
        })
    }
}

/// A live backend session. See the module docs for the wire format.
pub struct RemoteSession {
    call_id: String,
    audio_tx: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
}

impl ConversationSession for RemoteSession {
    fn send_audio(&self, chunk: Bytes) {
        // Fire-and-forget: a failed send means the writer task is already
        // gone and the terminal-state path is in flight.
        let _ = self.audio_tx.send(chunk);
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(call_id = %self.call_id, "Closing backend session");
            self.closed.cancel();
        }
    }
}
