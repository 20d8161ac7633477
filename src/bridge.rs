//! # Call Bridge
//!
//! Per-call orchestrator between the telephony socket, the conversation
//! session, the playback scheduler, and the turn-result dispatcher. The
//! socket actor owns one `CallBridge` and feeds it events; the bridge holds
//! the call's state machine and decides what each event means.
//!
//! ## Call lifecycle:
//! - **Connecting**: socket accepted, backend session init pending. Inbound
//!   audio is dropped; nothing may reach the session before init completes.
//! - **Active**: session established. Inbound frames are forwarded; each
//!   turn result may start a playback job (superseding the previous one) and
//!   may be dispatched to the webhook; the two are independent.
//! - **Closing → Closed**: socket close or session failure. Teardown cancels
//!   the call's playback job and closes the session exactly once. The two
//!   trigger paths can race, so the transition is idempotent.

use crate::audio::splitter::FrameSplitter;
use crate::audio::{FrameSink, PlaybackScheduler};
use crate::conversation::{ConversationSession, TurnResult};
use crate::dispatch::TurnDispatcher;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where a call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Socket accepted, session init pending
    Connecting,
    /// Session established, audio and turns flowing
    Active,
    /// Teardown in progress
    Closing,
    /// Terminal; no further operations accepted
    Closed,
}

/// What `handle_turn` did with one turn result. Returned so the transport
/// layer can update metrics without re-deriving the decisions.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    /// A playback job was started (frame count of that job)
    pub playback_frames: Option<usize>,
    /// The turn was handed to the webhook dispatcher
    pub dispatched: bool,
}

/// Orchestrates one call. Not thread-safe by itself; the owning actor
/// serializes all calls into it, which is also what guarantees turn events
/// are processed in the order the session emits them.
pub struct CallBridge {
    call_id: String,
    webhook_url: Option<String>,
    splitter: FrameSplitter,
    scheduler: Arc<PlaybackScheduler>,
    dispatcher: Arc<dyn TurnDispatcher>,
    sink: Arc<dyn FrameSink>,
    session: Option<Arc<dyn ConversationSession>>,
    state: CallState,
}

impl CallBridge {
    pub fn new(
        call_id: String,
        webhook_url: Option<String>,
        splitter: FrameSplitter,
        scheduler: Arc<PlaybackScheduler>,
        dispatcher: Arc<dyn TurnDispatcher>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            call_id,
            webhook_url,
            splitter,
            scheduler,
            dispatcher,
            sink,
            session: None,
            state: CallState::Connecting,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Session init finished: Connecting → Active.
    ///
    /// If the socket already closed while init was in flight, the session is
    /// closed immediately instead and `false` is returned.
    pub fn session_ready(&mut self, session: Arc<dyn ConversationSession>) -> bool {
        match self.state {
            CallState::Connecting => {
                info!(call_id = %self.call_id, "Call active");
                self.session = Some(session);
                self.state = CallState::Active;
                true
            }
            _ => {
                debug!(call_id = %self.call_id, state = ?self.state, "Session ready after call ended, closing it");
                session.close();
                false
            }
        }
    }

    /// Session init failed. Fatal to the call: goes straight to teardown.
    pub fn session_failed(&mut self, reason: &str) {
        error!(call_id = %self.call_id, reason = %reason, "Session initialization failed");
        self.begin_close();
    }

    /// Forward one chunk of caller audio to the session. Dropped outside the
    /// Active state; audio must never reach a half-initialized session.
    pub fn forward_audio(&self, chunk: bytes::Bytes) {
        if self.state != CallState::Active {
            debug!(call_id = %self.call_id, state = ?self.state, "Dropping inbound audio outside Active state");
            return;
        }
        if let Some(session) = &self.session {
            session.send_audio(chunk);
        }
    }

    /// Route one turn result: playback and dispatch, independently.
    ///
    /// - Non-empty audio starts a playback job, superseding any job still
    ///   running for this call. A malformed buffer kills only this turn's
    ///   playback, never the call.
    /// - A non-empty response id triggers exactly one webhook dispatch.
    pub fn handle_turn(&self, turn: TurnResult) -> TurnOutcome {
        if self.state != CallState::Active {
            debug!(call_id = %self.call_id, state = ?self.state, "Ignoring turn result outside Active state");
            return TurnOutcome::default();
        }

        let mut outcome = TurnOutcome::default();

        if turn.has_audio() {
            match self.splitter.split(&turn.audio) {
                Ok(frames) => {
                    let frames: Vec<bytes::Bytes> = frames.collect();
                    outcome.playback_frames = Some(frames.len());
                    self.scheduler
                        .start(&self.call_id, frames, Arc::clone(&self.sink));
                }
                Err(e) => {
                    error!(call_id = %self.call_id, error = %e, "Skipping playback for malformed turn audio");
                }
            }
        }

        if turn.has_result() {
            match &self.webhook_url {
                Some(url) => {
                    self.dispatcher.dispatch(&self.call_id, url, &turn);
                    outcome.dispatched = true;
                }
                None => {
                    warn!(call_id = %self.call_id, response_id = %turn.response_id, "No webhook URL for this call, dropping turn result");
                }
            }
        }

        outcome
    }

    /// Tear the call down: cancel playback, close the session, land in
    /// Closed. Idempotent; the socket-close and session-error paths may both
    /// get here and only the first one does any work.
    ///
    /// Returns whether this invocation performed the teardown.
    pub fn begin_close(&mut self) -> bool {
        match self.state {
            CallState::Closing | CallState::Closed => return false,
            _ => {}
        }

        self.state = CallState::Closing;
        info!(call_id = %self.call_id, "Call closing");

        self.scheduler.cancel(&self.call_id);
        if let Some(session) = self.session.take() {
            session.close();
        }

        self.state = CallState::Closed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct NullSink {
        delivered: AtomicUsize,
    }

    impl NullSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: AtomicUsize::new(0),
            })
        }
    }

    impl FrameSink for NullSink {
        fn is_open(&self) -> bool {
            true
        }
        fn deliver(&self, _frame: Bytes) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingDispatcher {
        dispatched: Mutex<Vec<(String, String, String)>>,
    }

    impl TurnDispatcher for CountingDispatcher {
        fn dispatch(&self, call_id: &str, webhook_url: &str, turn: &TurnResult) {
            self.dispatched.lock().unwrap().push((
                call_id.to_string(),
                webhook_url.to_string(),
                turn.response_id.clone(),
            ));
        }
    }

    #[derive(Default)]
    struct StubSession {
        closes: AtomicUsize,
        chunks: Mutex<Vec<Bytes>>,
    }

    impl ConversationSession for StubSession {
        fn send_audio(&self, chunk: Bytes) {
            self.chunks.lock().unwrap().push(chunk);
        }
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        bridge: CallBridge,
        sink: Arc<NullSink>,
        dispatcher: Arc<CountingDispatcher>,
        scheduler: Arc<PlaybackScheduler>,
        session: Arc<StubSession>,
    }

    fn fixture() -> Fixture {
        let sink = NullSink::new();
        let dispatcher = Arc::new(CountingDispatcher::default());
        let scheduler = Arc::new(PlaybackScheduler::new(Duration::from_millis(20)));
        let bridge = CallBridge::new(
            "call-1".to_string(),
            Some("https://app.example/analytics".to_string()),
            FrameSplitter::new(640, 44),
            Arc::clone(&scheduler),
            dispatcher.clone() as Arc<dyn TurnDispatcher>,
            sink.clone() as Arc<dyn FrameSink>,
        );
        Fixture {
            bridge,
            sink,
            dispatcher,
            scheduler,
            session: Arc::new(StubSession::default()),
        }
    }

    fn activate(f: &mut Fixture) {
        assert!(f.bridge.session_ready(f.session.clone()));
        assert_eq!(f.bridge.state(), CallState::Active);
    }

    fn turn(response_id: &str, audio_len: usize) -> TurnResult {
        TurnResult {
            response_id: response_id.to_string(),
            transcript: "hi".to_string(),
            reply_text: "hello".to_string(),
            matched_intent: Some("Greeting".to_string()),
            current_page: Some("Start".to_string()),
            audio: Bytes::from(vec![0u8; audio_len]),
        }
    }

    /// One 684-byte buffer (44 header + 640 payload) yields a one-frame
    /// playback job and exactly one dispatch.
    #[tokio::test(start_paused = true)]
    async fn test_turn_with_audio_and_result() {
        let mut f = fixture();
        activate(&mut f);

        let outcome = f.bridge.handle_turn(turn("r1", 684));
        assert_eq!(outcome.playback_frames, Some(1));
        assert!(outcome.dispatched);
        assert_eq!(f.scheduler.active_jobs(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.sink.delivered.load(Ordering::SeqCst), 1);

        let dispatched = f.dispatcher.dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].0, "call-1");
        assert_eq!(dispatched[0].2, "r1");
    }

    /// Empty audio never starts a playback job.
    #[tokio::test(start_paused = true)]
    async fn test_turn_without_audio_skips_playback() {
        let mut f = fixture();
        activate(&mut f);

        let outcome = f.bridge.handle_turn(turn("r1", 0));
        assert_eq!(outcome.playback_frames, None);
        assert!(outcome.dispatched);
        assert_eq!(f.scheduler.active_jobs(), 0);
    }

    /// An empty response id never triggers a webhook dispatch.
    #[tokio::test(start_paused = true)]
    async fn test_playback_only_turn_is_not_dispatched() {
        let mut f = fixture();
        activate(&mut f);

        let outcome = f.bridge.handle_turn(turn("", 1324));
        assert_eq!(outcome.playback_frames, Some(2));
        assert!(!outcome.dispatched);
        assert!(f.dispatcher.dispatched.lock().unwrap().is_empty());
    }

    /// A buffer too short for its header kills this turn's playback only;
    /// the dispatch side still runs and the call stays Active.
    #[tokio::test(start_paused = true)]
    async fn test_malformed_audio_is_isolated_to_the_turn() {
        let mut f = fixture();
        activate(&mut f);

        let outcome = f.bridge.handle_turn(turn("r1", 10));
        assert_eq!(outcome.playback_frames, None);
        assert!(outcome.dispatched);
        assert_eq!(f.bridge.state(), CallState::Active);
        assert_eq!(f.scheduler.active_jobs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_forwarded_only_while_active() {
        let mut f = fixture();

        // Connecting: dropped
        f.bridge.forward_audio(Bytes::from_static(b"early"));
        activate(&mut f);
        f.bridge.forward_audio(Bytes::from_static(b"chunk"));
        f.bridge.begin_close();
        f.bridge.forward_audio(Bytes::from_static(b"late"));

        let chunks = f.session.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], b"chunk");
    }

    /// Socket-close and session-error teardown can race; only the first
    /// performs work and the session is closed exactly once.
    #[tokio::test(start_paused = true)]
    async fn test_begin_close_is_idempotent() {
        let mut f = fixture();
        activate(&mut f);

        assert!(f.bridge.begin_close());
        assert!(!f.bridge.begin_close());
        assert_eq!(f.bridge.state(), CallState::Closed);
        assert_eq!(f.session.closes.load(Ordering::SeqCst), 1);
    }

    /// Closing a call cancels its in-flight playback job.
    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_running_playback() {
        let mut f = fixture();
        activate(&mut f);

        f.bridge.handle_turn(turn("", 44 + 640 * 10));
        tokio::time::sleep(Duration::from_millis(25)).await;
        f.bridge.begin_close();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Frames at 0 ms and 20 ms got out before the close; the rest died
        // with the job.
        assert_eq!(f.sink.delivered.load(Ordering::SeqCst), 2);
        assert_eq!(f.scheduler.active_jobs(), 0);
    }

    /// A session that comes up after the caller already hung up is closed
    /// immediately and the call never activates.
    #[tokio::test(start_paused = true)]
    async fn test_late_session_ready_after_close() {
        let mut f = fixture();
        f.bridge.begin_close();

        assert!(!f.bridge.session_ready(f.session.clone()));
        assert_eq!(f.bridge.state(), CallState::Closed);
        assert_eq!(f.session.closes.load(Ordering::SeqCst), 1);
    }

    /// Session failure during Connecting tears the call down.
    #[tokio::test(start_paused = true)]
    async fn test_session_failure_closes_call() {
        let mut f = fixture();
        f.bridge.session_failed("backend unreachable");
        assert_eq!(f.bridge.state(), CallState::Closed);
    }

    /// Turns with results but no webhook URL are logged and dropped.
    #[tokio::test(start_paused = true)]
    async fn test_missing_webhook_url_drops_dispatch() {
        let sink = NullSink::new();
        let dispatcher = Arc::new(CountingDispatcher::default());
        let scheduler = Arc::new(PlaybackScheduler::new(Duration::from_millis(20)));
        let mut bridge = CallBridge::new(
            "call-1".to_string(),
            None,
            FrameSplitter::new(640, 44),
            scheduler,
            dispatcher.clone() as Arc<dyn TurnDispatcher>,
            sink as Arc<dyn FrameSink>,
        );
        assert!(bridge.session_ready(Arc::new(StubSession::default())));

        let outcome = bridge.handle_turn(turn("r1", 0));
        assert!(!outcome.dispatched);
        assert!(dispatcher.dispatched.lock().unwrap().is_empty());
    }
}
