//! # Call Socket Handler
//!
//! The telephony platform dials in here: one WebSocket connection per phone
//! call, carrying caller audio inbound and paced synthesized audio outbound.
//!
//! ## Call Protocol:
//! 1. **Connection**: the platform connects to `/socket` with query
//!    parameters identifying the call (`original_uuid`, `webhook_url`,
//!    `analyze_sentiment`)
//! 2. **Session init**: a backend conversation session is opened
//!    asynchronously; inbound audio is dropped until it is ready
//! 3. **Audio streaming**: binary frames from the platform are forwarded to
//!    the session; turn results from the session drive playback and webhook
//!    dispatch
//! 4. **Teardown**: a close from either side (or a session failure) tears
//!    the call down exactly once
//!
//! ## Message Format:
//! - **Platform → Server**: binary caller audio, occasional JSON text
//!   control frames (logged, never acted on)
//! - **Server → Platform**: binary audio frames, one per frame interval,
//!   emitted by the playback scheduler

use crate::audio::{FrameSink, FrameSplitter, PlaybackScheduler};
use crate::bridge::CallBridge;
use crate::config::AppConfig;
use crate::conversation::{ActiveSession, SessionFactory, TurnResult};
use crate::dispatch::TurnDispatcher;
use crate::error::AppError;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the server pings the platform.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any pong before the connection is considered dead.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Call identity extracted from the connect request's query string.
#[derive(Debug, Clone)]
pub struct CallParams {
    /// The platform's call id, used to key playback jobs and the backend
    /// session. Generated locally when the platform omits it.
    pub call_id: String,

    /// Where turn results are POSTed. Absent means turns are logged and
    /// dropped instead of dispatched.
    pub webhook_url: Option<String>,

    /// Platform flag forwarded for parity; sentiment analysis happens in the
    /// backend, not here.
    pub analyze_sentiment: bool,
}

impl CallParams {
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        let call_id = match query.get("original_uuid") {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let generated = Uuid::new_v4().to_string();
                warn!(call_id = %generated, "Connect request without original_uuid, generated one");
                generated
            }
        };

        Self {
            call_id,
            webhook_url: query.get("webhook_url").filter(|u| !u.is_empty()).cloned(),
            analyze_sentiment: query
                .get("analyze_sentiment")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

/// Everything the call path needs besides per-request data. Built once in
/// main and shared across all call sockets.
pub struct CallRuntime {
    pub scheduler: Arc<PlaybackScheduler>,
    pub dispatcher: Arc<dyn TurnDispatcher>,
    pub factory: Arc<dyn SessionFactory>,
}

/// One scheduled audio frame, sent by the playback scheduler through the
/// actor mailbox so delivery happens on the connection's own context.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SendFrame(pub Bytes);

/// Backend session init completed.
#[derive(Message)]
#[rtype(result = "()")]
struct SessionReady(ActiveSession);

/// Backend session init failed.
#[derive(Message)]
#[rtype(result = "()")]
struct SessionFailed(String);

/// Frame sink over the socket actor's address. The scheduler's delivery
/// tasks run outside the actor, so frames cross back in as mailbox messages.
struct ActorFrameSink {
    addr: Addr<CallSocket>,
}

impl FrameSink for ActorFrameSink {
    fn is_open(&self) -> bool {
        self.addr.connected()
    }

    fn deliver(&self, frame: Bytes) {
        self.addr.do_send(SendFrame(frame));
    }
}

/// WebSocket actor for one bridged call.
///
/// ## Actor Model:
/// Each connection is an independent actor; the mailbox serializes platform
/// messages, scheduler frames, and session events, which is what lets the
/// bridge stay free of locks.
pub struct CallSocket {
    params: CallParams,
    app_state: web::Data<AppState>,
    scheduler: Arc<PlaybackScheduler>,
    dispatcher: Arc<dyn TurnDispatcher>,
    factory: Arc<dyn SessionFactory>,
    config: AppConfig,

    /// Built in `started` once the actor address exists.
    bridge: Option<CallBridge>,

    last_heartbeat: Instant,
}

impl CallSocket {
    pub fn new(
        params: CallParams,
        app_state: web::Data<AppState>,
        runtime: &CallRuntime,
        config: AppConfig,
    ) -> Self {
        Self {
            params,
            app_state,
            scheduler: Arc::clone(&runtime.scheduler),
            dispatcher: Arc::clone(&runtime.dispatcher),
            factory: Arc::clone(&runtime.factory),
            config,
            bridge: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Log a control frame from the platform. These carry call events
    /// (ringing, DTMF, transfer notices) that this bridge observes but never
    /// acts on.
    fn handle_control_frame(&self, text: &str) {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(control) => {
                info!(call_id = %self.params.call_id, control = %control, "Platform control frame");
            }
            Err(e) => {
                warn!(call_id = %self.params.call_id, error = %e, "Malformed control frame from platform");
            }
        }
    }

    fn close_call(&mut self) {
        if let Some(bridge) = &mut self.bridge {
            bridge.begin_close();
        }
    }
}

impl Actor for CallSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Connection established: build the bridge, start the heartbeat, and
    /// kick off backend session init.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            call_id = %self.params.call_id,
            webhook = self.params.webhook_url.is_some(),
            analyze_sentiment = self.params.analyze_sentiment,
            "Call socket started"
        );

        let sink: Arc<dyn FrameSink> = Arc::new(ActorFrameSink {
            addr: ctx.address(),
        });

        self.bridge = Some(CallBridge::new(
            self.params.call_id.clone(),
            self.params.webhook_url.clone(),
            FrameSplitter::new(self.config.audio.frame_size, self.config.audio.header_len),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.dispatcher),
            sink,
        ));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(call_id = %act.params.call_id, "Call socket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        // Session init runs off-actor; the result comes back through the
        // mailbox so it serializes with everything else.
        let open = self.factory.open(&self.params.call_id);
        let addr = ctx.address();
        actix::spawn(async move {
            match open.await {
                Ok(active) => addr.do_send(SessionReady(active)),
                Err(e) => addr.do_send(SessionFailed(e.to_string())),
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(call_id = %self.params.call_id, "Call socket stopped");
        self.close_call();
        self.app_state.end_call();
    }
}

impl Handler<SessionReady> for CallSocket {
    type Result = ();

    fn handle(&mut self, msg: SessionReady, ctx: &mut Self::Context) {
        let ActiveSession { session, turns } = msg.0;
        if let Some(bridge) = &mut self.bridge {
            if bridge.session_ready(session) {
                // Turn results become a stream into this actor; the stream
                // ending is the session's terminal-state signal.
                ctx.add_stream(ReceiverStream::new(turns));
            }
        }
    }
}

impl Handler<SessionFailed> for CallSocket {
    type Result = ();

    fn handle(&mut self, msg: SessionFailed, ctx: &mut Self::Context) {
        if let Some(bridge) = &mut self.bridge {
            bridge.session_failed(&msg.0);
        }
        self.app_state.record_call_error();
        ctx.stop();
    }
}

impl Handler<SendFrame> for CallSocket {
    type Result = ();

    fn handle(&mut self, msg: SendFrame, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
        self.app_state.record_frames_delivered(1);
    }
}

/// Turn results from the backend session.
impl StreamHandler<TurnResult> for CallSocket {
    fn handle(&mut self, turn: TurnResult, _ctx: &mut Self::Context) {
        if let Some(bridge) = &self.bridge {
            let outcome = bridge.handle_turn(turn);
            if outcome.dispatched {
                self.app_state.record_turn_dispatched();
            }
            if let Some(frames) = outcome.playback_frames {
                debug!(call_id = %self.params.call_id, frames, "Playback job queued");
            }
        }
    }

    /// The session reached its terminal state.
    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(call_id = %self.params.call_id, "Backend turn stream ended");
        self.close_call();
        ctx.stop();
    }
}

/// Messages from the telephony platform.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                if let Some(bridge) = &self.bridge {
                    bridge.forward_audio(data);
                }
            }
            Ok(ws::Message::Text(text)) => {
                self.handle_control_frame(&text);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(call_id = %self.params.call_id, reason = ?reason, "Platform closed the call");
                self.close_call();
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(call_id = %self.params.call_id, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!(call_id = %self.params.call_id, error = %e, "Call socket protocol error");
                self.close_call();
                ctx.stop();
            }
        }
    }
}

/// Call socket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Rejects the connection with 503 when the concurrent-call limit is
/// reached, otherwise upgrades and hands the connection to a `CallSocket`
/// actor.
pub async fn call_socket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
    runtime: web::Data<CallRuntime>,
) -> ActixResult<HttpResponse> {
    let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .unwrap_or_else(|_| web::Query(HashMap::new()));
    let params = CallParams::from_query(&query);
    let config = app_state.get_config();

    if !app_state.try_begin_call(config.performance.max_concurrent_calls) {
        warn!(
            call_id = %params.call_id,
            limit = config.performance.max_concurrent_calls,
            "Concurrent-call limit reached, rejecting call"
        );
        return Err(AppError::TooManyCalls(format!(
            "call limit of {} reached",
            config.performance.max_concurrent_calls
        ))
        .into());
    }

    info!(
        call_id = %params.call_id,
        peer = ?req.connection_info().peer_addr(),
        "New call connection"
    );

    let socket = CallSocket::new(params, app_state.clone(), runtime.get_ref(), config);
    let response = ws::start(socket, &req, stream);
    if response.is_err() {
        // The actor never started, so its stopped() hook will not run.
        app_state.end_call();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_call_params_from_full_query() {
        let params = CallParams::from_query(&query(&[
            ("original_uuid", "call-42"),
            ("webhook_url", "https://app.example/turns"),
            ("analyze_sentiment", "true"),
        ]));

        assert_eq!(params.call_id, "call-42");
        assert_eq!(
            params.webhook_url.as_deref(),
            Some("https://app.example/turns")
        );
        assert!(params.analyze_sentiment);
    }

    /// A missing call id gets a locally generated UUID rather than failing
    /// the connection.
    #[test]
    fn test_missing_uuid_is_generated() {
        let params = CallParams::from_query(&query(&[]));
        assert!(Uuid::parse_str(&params.call_id).is_ok());
        assert!(params.webhook_url.is_none());
        assert!(!params.analyze_sentiment);
    }

    /// Empty-string query values are treated the same as absent ones.
    #[test]
    fn test_empty_values_treated_as_absent() {
        let params = CallParams::from_query(&query(&[
            ("original_uuid", ""),
            ("webhook_url", ""),
        ]));
        assert!(Uuid::parse_str(&params.call_id).is_ok());
        assert!(params.webhook_url.is_none());
    }

    #[test]
    fn test_sentiment_flag_parsing() {
        for (value, expected) in [("true", true), ("1", true), ("false", false), ("no", false)] {
            let params = CallParams::from_query(&query(&[
                ("original_uuid", "c"),
                ("analyze_sentiment", value),
            ]));
            assert_eq!(params.analyze_sentiment, expected, "value {}", value);
        }
    }
}
