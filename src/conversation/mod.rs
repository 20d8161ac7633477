//! # Conversation Session Boundary
//!
//! The conversational-AI backend is an opaque collaborator. This module pins
//! down the only things the bridge is allowed to know about it:
//!
//! - caller audio goes in, fire-and-forget ([`ConversationSession::send_audio`]);
//! - turn results come out, in conversation order, over a channel that
//!   closes when the session reaches its terminal state;
//! - a session must be fully initialized before any audio is forwarded
//!   ([`SessionFactory::open`] resolves only after the backend handshake);
//! - [`ConversationSession::close`] is idempotent and called exactly once
//!   per call, at socket close.
//!
//! Sessions are polymorphic so tests can drive turn events deterministically
//! without a backend; the production implementation lives in [`remote`].

pub mod remote;

use crate::error::CallError;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The result of one conversational turn, produced by a session and consumed
/// exactly once by the bridge.
#[derive(Debug, Clone, Default)]
pub struct TurnResult {
    /// Backend response identifier. Empty string means "playback-only event,
    /// no turn result yet": the turn is never dispatched to the webhook.
    pub response_id: String,

    /// What the caller said, as transcribed by the backend
    pub transcript: String,

    /// The synthesized reply, as text
    pub reply_text: String,

    /// Display name of the matched intent, if any
    pub matched_intent: Option<String>,

    /// Display name of the current dialogue page, if any
    pub current_page: Option<String>,

    /// Raw synthesized audio (WAV bytes). Empty means there is nothing to
    /// play for this turn.
    pub audio: Bytes,
}

impl TurnResult {
    /// Whether this turn carries audio worth starting a playback job for.
    pub fn has_audio(&self) -> bool {
        !self.audio.is_empty()
    }

    /// Whether this turn carries a dispatchable result.
    pub fn has_result(&self) -> bool {
        !self.response_id.is_empty()
    }
}

/// A live session against the AI backend.
///
/// Both operations are non-blocking; the session buffers internally.
pub trait ConversationSession: Send + Sync {
    /// Forward one chunk of inbound caller audio. Fire-and-forget: the
    /// bridge never observes an outcome.
    fn send_audio(&self, chunk: Bytes);

    /// Terminate the session. Idempotent; later calls are no-ops.
    fn close(&self);
}

/// What a successfully initialized session hands back to the bridge.
pub struct ActiveSession {
    pub session: Arc<dyn ConversationSession>,

    /// Turn events in the order the conversation produces them. The channel
    /// closing is the session's terminal-state signal.
    pub turns: mpsc::Receiver<TurnResult>,
}

/// Opens sessions for new calls.
pub trait SessionFactory: Send + Sync {
    /// Establish the backend session for `call_id`. Resolves only once the
    /// handshake is complete; callers must not forward audio before then.
    fn open(&self, call_id: &str) -> BoxFuture<'static, Result<ActiveSession, CallError>>;
}
