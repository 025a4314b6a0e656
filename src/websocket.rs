//! # WebSocket Audio Streaming Handler
//!
//! Thin transport around the session orchestrator. Clients connect to
//! `/ws/audio`, stream binary PCM frames and receive JSON predictions.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: The server assigns a session id and replies with
//!    `{"type":"session_status","status":"connected",...}`
//! 2. **Audio Streaming**: Every binary message is one chunk of little-endian
//!    16-bit mono PCM at the configured sample rate
//! 3. **Predictions**: `{"type":"prediction","event":"gender_model","session_id":..,"label":..,"probability":..}`
//!    once per completed window
//! 4. **Heartbeat**: The server sends a WebSocket ping every 30 s and drops
//!    connections that have sent nothing (audio, pong or ping) for 60 s;
//!    clients may also send `{"type":"ping","timestamp":n}` and receive a `pong`
//! 5. **Close**: Disconnect closes the session; buffered audio is discarded
//!
//! ## Message Format:
//! - **Client → Server**: Binary PCM audio data, JSON ping/pong text frames
//! - **Server → Client**: JSON status, prediction, error and pong messages

use crate::audio::session::{ChunkOutcome, EventSink, PredictionPayload, SessionOrchestrator};
use crate::classifier::engine::EngineHandle;
use crate::error::AppError;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages the server sends to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStatus {
        session_id: String,
        status: String,
        message: Option<String>,
    },

    Prediction {
        event: String,
        session_id: String,
        label: String,
        probability: f32,
    },

    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },

    Pong {
        timestamp: u64,
    },
}

/// Messages the server accepts as text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

/// A prediction on its way from the session's inference worker to the socket.
#[derive(Debug)]
struct OutboundPrediction {
    session_id: String,
    event_name: String,
    payload: PredictionPayload,
}

/// Bridges the worker (any thread) to the actor (its own arbiter).
struct ActorSink {
    tx: mpsc::UnboundedSender<OutboundPrediction>,
}

impl EventSink for ActorSink {
    fn emit(&self, session_id: &str, event_name: &str, payload: PredictionPayload) {
        let prediction = OutboundPrediction {
            session_id: session_id.to_string(),
            event_name: event_name.to_string(),
            payload,
        };
        if self.tx.send(prediction).is_err() {
            debug!("Session {} disconnected before its prediction was delivered", session_id);
        }
    }
}

/// WebSocket actor for one audio session.
///
/// ## Actor Model:
/// Each connection is an independent actor. Chunk arrival is the only thing
/// that advances the session; the orchestrator lives inside the actor, so its
/// buffer is never shared.
pub struct AudioWebSocket {
    session_id: String,
    state: web::Data<AppState>,
    /// Taken when the session opens in `started`
    engine: Option<EngineHandle>,
    session: Option<SessionOrchestrator>,
    last_heartbeat: Instant,
}

impl AudioWebSocket {
    /// The caller must already hold a session slot from `AppState::try_open_session`.
    pub fn new(state: web::Data<AppState>, engine: EngineHandle) -> Self {
        Self {
            session_id: Uuid::new_v4().simple().to_string(),
            state,
            engine: Some(engine),
            session: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Any client frame, audio included, counts as a sign of life.
    fn record_activity(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    fn heartbeat_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_heartbeat) > CLIENT_TIMEOUT
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to serialize outbound message: {}", e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!("Session {}: {} ({})", self.session_id, message, code);
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
                session_id: Some(self.session_id.clone()),
            },
        );
    }

    /// Feed one binary frame to the session.
    fn accept_audio(&mut self, data: &[u8]) -> ChunkOutcome {
        self.record_activity();
        match self.session.as_mut() {
            Some(session) => session.on_chunk(data),
            None => ChunkOutcome::Ignored,
        }
    }

    fn handle_audio_data(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        match self.accept_audio(data) {
            ChunkOutcome::Invalid => {
                self.send_error(ctx, "invalid_chunk", "Audio frames must be 16-bit little-endian PCM");
            }
            ChunkOutcome::Rejected => {
                self.send_error(ctx, "buffer_overflow", "Session buffer is full, chunk dropped");
            }
            ChunkOutcome::WindowQueued { sequence } => {
                debug!("Session {}: window {} queued", self.session_id, sequence);
            }
            ChunkOutcome::WindowDropped { sequence } => {
                debug!("Session {}: window {} dropped", self.session_id, sequence);
            }
            ChunkOutcome::Buffered | ChunkOutcome::Waiting | ChunkOutcome::Ignored => {}
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Ping { timestamp }) => {
                self.record_activity();
                self.send(ctx, &ServerMessage::Pong { timestamp });
            }
            Ok(ClientMessage::Pong { timestamp }) => {
                self.record_activity();
                debug!("Session {}: pong for ping {}", self.session_id, timestamp);
            }
            Err(err) => {
                self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
            }
        }
    }
}

impl Actor for AudioWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Open the session, wire its predictions back into this actor and start the heartbeat.
    fn started(&mut self, ctx: &mut Self::Context) {
        let Some(engine) = self.engine.take() else {
            ctx.stop();
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        ctx.add_stream(UnboundedReceiverStream::new(rx));

        self.session = Some(SessionOrchestrator::open(
            self.session_id.clone(),
            self.state.session_deps(),
            engine,
            Arc::new(ActorSink { tx }),
        ));

        self.send(
            ctx,
            &ServerMessage::SessionStatus {
                session_id: self.session_id.clone(),
                status: "connected".to_string(),
                message: Some(format!(
                    "Send 16-bit mono PCM at {} Hz",
                    self.state.config.audio.sample_rate
                )),
            },
        );

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if act.heartbeat_expired(Instant::now()) {
                warn!("Session {}: heartbeat timeout, closing connection", act.session_id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(mut session) = self.session.take() {
            // Queued windows keep running on the worker; nothing waits for them here
            drop(session.close());
        }
        self.state.release_session();
        info!("WebSocket session {} stopped", self.session_id);
    }
}

/// Handle incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AudioWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => self.handle_audio_data(&data, ctx),
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Ping(data)) => {
                self.record_activity();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => self.record_activity(),
            Ok(ws::Message::Close(reason)) => {
                info!("Session {}: client closed connection: {:?}", self.session_id, reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Session {}: unexpected continuation frame", self.session_id);
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("Session {}: WebSocket protocol error: {}", self.session_id, err);
                ctx.stop();
            }
        }
    }
}

/// Deliver predictions produced by the session's inference worker.
impl StreamHandler<OutboundPrediction> for AudioWebSocket {
    fn handle(&mut self, prediction: OutboundPrediction, ctx: &mut Self::Context) {
        self.send(
            ctx,
            &ServerMessage::Prediction {
                event: prediction.event_name,
                session_id: prediction.session_id,
                label: prediction.payload.label,
                probability: prediction.payload.probability,
            },
        );
    }

    /// The worker finishing must not end the connection.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!("Session {}: prediction stream finished", self.session_id);
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Refuses the upgrade with 503 when the concurrent session limit is reached
/// and with 500 when no inference engine can be issued; otherwise hands the
/// connection to a new `AudioWebSocket` actor.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    if !state.try_open_session() {
        let limit = state.config.performance.max_concurrent_sessions;
        warn!("Refusing WebSocket connection: {} sessions already active", limit);
        return Err(AppError::ServiceUnavailable(format!(
            "Maximum of {} concurrent sessions reached",
            limit
        ))
        .into());
    }

    let engine = match state.engines.handle_for_session() {
        Ok(engine) => engine,
        Err(e) => {
            error!("No inference engine available for a new session: {}", e);
            state.release_session();
            return Err(AppError::from(e).into());
        }
    };

    let response = ws::start(AudioWebSocket::new(state.clone(), engine), &req, stream);
    if response.is_err() {
        // Handshake failed before the actor started, so `stopped` will never run
        state.release_session();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;

    #[test]
    fn test_prediction_message_format() {
        let message = ServerMessage::Prediction {
            event: "gender_model".to_string(),
            session_id: "abc123".to_string(),
            label: "female".to_string(),
            probability: 0.25,
        };

        let json: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "prediction",
                "event": "gender_model",
                "session_id": "abc123",
                "label": "female",
                "probability": 0.25
            })
        );
    }

    #[test]
    fn test_session_status_format() {
        let message = ServerMessage::SessionStatus {
            session_id: "abc123".to_string(),
            status: "connected".to_string(),
            message: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "session_status");
        assert_eq!(json["status"], "connected");
    }

    #[test]
    fn test_client_ping_parsing() {
        let message: ClientMessage = serde_json::from_str(r#"{"type":"ping","timestamp":42}"#).unwrap();
        assert!(matches!(message, ClientMessage::Ping { timestamp: 42 }));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"start_session"}"#).is_err());
    }

    #[test]
    fn test_audio_frames_keep_the_connection_alive() {
        let state = web::Data::new(test_state(1));
        let engine = state.engines.handle_for_session().unwrap();
        let mut socket = AudioWebSocket::new(state, engine);

        let connected = socket.last_heartbeat;
        let deadline = connected + CLIENT_TIMEOUT + Duration::from_millis(1);
        assert!(socket.heartbeat_expired(deadline));

        // A PCM-only client never sends pings
        std::thread::sleep(Duration::from_millis(5));
        let outcome = socket.accept_audio(&[0u8; 3200]);
        assert_eq!(outcome, ChunkOutcome::Ignored);
        assert!(socket.last_heartbeat > connected);
        assert!(!socket.heartbeat_expired(deadline));
    }

    #[test]
    fn test_heartbeat_expires_after_client_timeout() {
        let state = web::Data::new(test_state(1));
        let engine = state.engines.handle_for_session().unwrap();
        let socket = AudioWebSocket::new(state, engine);

        let now = socket.last_heartbeat;
        assert!(!socket.heartbeat_expired(now + CLIENT_TIMEOUT));
        assert!(socket.heartbeat_expired(now + CLIENT_TIMEOUT + Duration::from_millis(1)));
    }

    #[test]
    fn test_actor_sink_forwards_predictions() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ActorSink { tx };
        sink.emit(
            "abc",
            "gender_model",
            PredictionPayload {
                label: "male".to_string(),
                probability: 0.9,
                sequence: 0,
            },
        );

        let prediction = rx.try_recv().unwrap();
        assert_eq!(prediction.session_id, "abc");
        assert_eq!(prediction.event_name, "gender_model");
        assert_eq!(prediction.payload.label, "male");
    }
}
