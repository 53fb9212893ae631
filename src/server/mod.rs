//! HTTP/WS surface over the orchestrator state facade.
//!
//! The surface is deliberately thin: handlers validate ingress payloads,
//! call exactly one facade operation, and serialise its result. Live events
//! reach subscribers through the `/stream` WebSocket, which greets every new
//! connection with a full status snapshot before the feed starts.

mod error;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Config;
use crate::events::{AsrPayload, OrchestratorEvent};
use crate::memory::Role;
use crate::persona::PersonaUpdate;
use crate::state::Orchestrator;

pub use error::ApiError;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    api_key: Option<String>,
}

/// Start the surface and serve until the stop signal fires.
pub async fn serve(
    orchestrator: Arc<Orchestrator>,
    config: &Config,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let state = AppState {
        orchestrator,
        api_key: config.api_key.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/stream", get(stream_events))
        .route("/events/asr", post(receive_asr_event))
        .route("/control/panic", post(trigger_panic))
        .route("/control/mute", post(set_mute))
        .route("/control/preset", post(apply_preset))
        .route("/persona", post(update_persona))
        .route("/toggle/:module", post(toggle_module))
        .route("/obs/scene", post(set_obs_scene))
        .route("/vts/expr", post(set_vts_expression))
        .route("/tts", post(request_tts))
        .route("/chat/respond", post(respond_via_chat))
        .route("/ingest/chat", post(ingest_chat))
        .with_state(state);

    tracing::info!("Starting orchestrator surface on {}", config.bind_addr);
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        })
        .await
        .context("Server error")?;

    tracing::info!("Orchestrator surface shut down gracefully");
    Ok(())
}

/// Mutating routes require the configured API key, via `X-API-Key` or a
/// bearer token. No key configured means open access (local deployments).
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    if headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        == Some(expected.as_str())
    {
        return Ok(());
    }
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    {
        if let Some((scheme, token)) = auth.split_once(' ') {
            if scheme.eq_ignore_ascii_case("bearer") && token == expected {
                return Ok(());
            }
        }
    }
    Err(ApiError::Unauthorized)
}

// ─────────────────────────────────────────────────────────────────────────────
// Read-only routes
// ─────────────────────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.health_snapshot()).into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.snapshot()).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.orchestrator.metrics_text(),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// ASR ingress
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
enum AsrKind {
    #[serde(rename = "asr_partial")]
    Partial,
    #[serde(rename = "asr_final")]
    Final,
}

#[derive(Debug, Deserialize)]
struct AsrIngress {
    #[serde(rename = "type")]
    kind: AsrKind,
    #[serde(flatten)]
    payload: AsrPayload,
}

async fn receive_asr_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(ingress): Json<AsrIngress>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    ingress.payload.validate().map_err(ApiError::BadRequest)?;

    let event = match ingress.kind {
        AsrKind::Partial => OrchestratorEvent::AsrPartial {
            payload: ingress.payload.clone(),
        },
        AsrKind::Final => OrchestratorEvent::AsrFinal {
            payload: ingress.payload.clone(),
        },
    };
    state.orchestrator.dispatcher().publish(event).await;
    state.orchestrator.note_asr_observation(&ingress.payload);

    // The pipeline runs detached so ingress can acknowledge immediately.
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        match ingress.kind {
            AsrKind::Partial => orchestrator.handle_asr_partial(ingress.payload).await,
            AsrKind::Final => orchestrator.handle_asr_final(ingress.payload).await,
        }
    });

    Ok(Json(json!({ "status": "accepted" })))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket feed
// ─────────────────────────────────────────────────────────────────────────────

async fn stream_events(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let broker = state.orchestrator.broker().clone();
    let (token, mut events) = broker.subscribe();

    let greeting = OrchestratorEvent::Status {
        payload: state.orchestrator.snapshot(),
    };
    if send_event(&mut socket, &greeting).await.is_err() {
        broker.unsubscribe(token);
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Pings are answered by axum; client chatter is ignored.
                Some(Ok(_)) => {}
            },
        }
    }
    broker.unsubscribe(token);
}

async fn send_event(socket: &mut WebSocket, event: &OrchestratorEvent) -> Result<()> {
    let text = serde_json::to_string(event).context("event serialisation failed")?;
    socket
        .send(Message::Text(text))
        .await
        .context("websocket send failed")
}

// ─────────────────────────────────────────────────────────────────────────────
// Control routes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PanicCommand {
    reason: Option<String>,
}

async fn trigger_panic(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(command): Json<PanicCommand>,
) -> Result<Json<OrchestratorEvent>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.orchestrator.trigger_panic(command.reason).await))
}

#[derive(Debug, Deserialize)]
struct MuteCommand {
    muted: bool,
}

async fn set_mute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(command): Json<MuteCommand>,
) -> Result<Json<OrchestratorEvent>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.orchestrator.set_mute(command.muted).await))
}

#[derive(Debug, Deserialize)]
struct PresetCommand {
    preset: String,
}

async fn apply_preset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(command): Json<PresetCommand>,
) -> Result<Json<OrchestratorEvent>, ApiError> {
    authorize(&state, &headers)?;
    let event = state.orchestrator.apply_preset(&command.preset).await?;
    Ok(Json(event))
}

async fn update_persona(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<PersonaUpdate>,
) -> Result<Json<OrchestratorEvent>, ApiError> {
    authorize(&state, &headers)?;
    update.validate().map_err(ApiError::BadRequest)?;
    let event = state.orchestrator.update_persona(update).await?;
    Ok(Json(event))
}

#[derive(Debug, Deserialize)]
struct ToggleCommand {
    enabled: bool,
}

async fn toggle_module(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(module): Path<String>,
    Json(command): Json<ToggleCommand>,
) -> Result<Json<OrchestratorEvent>, ApiError> {
    authorize(&state, &headers)?;
    let event = state
        .orchestrator
        .toggle_module(&module, command.enabled)
        .await?;
    Ok(Json(event))
}

// ─────────────────────────────────────────────────────────────────────────────
// Integration routes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SceneCommand {
    scene: String,
}

async fn set_obs_scene(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(command): Json<SceneCommand>,
) -> Result<Json<OrchestratorEvent>, ApiError> {
    authorize(&state, &headers)?;
    if command.scene.trim().is_empty() {
        return Err(ApiError::BadRequest("scene must not be empty".into()));
    }
    Ok(Json(state.orchestrator.update_scene(command.scene).await))
}

#[derive(Debug, Deserialize)]
struct ExpressionCommand {
    expression: String,
    intensity: Option<f64>,
}

async fn set_vts_expression(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(command): Json<ExpressionCommand>,
) -> Result<Json<OrchestratorEvent>, ApiError> {
    authorize(&state, &headers)?;
    if command.expression.trim().is_empty() {
        return Err(ApiError::BadRequest("expression must not be empty".into()));
    }
    let intensity = command.intensity.unwrap_or(0.6);
    if !(0.0..=1.0).contains(&intensity) {
        return Err(ApiError::BadRequest("intensity must be within [0, 1]".into()));
    }
    Ok(Json(
        state
            .orchestrator
            .update_expression(command.expression, intensity)
            .await,
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// TTS & chat routes
// ─────────────────────────────────────────────────────────────────────────────

async fn request_tts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<crate::clients::tts::TtsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    if request.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".into()));
    }
    let outcome = state.orchestrator.record_tts(request).await;
    Ok(Json(json!({
        "type": "tts_request",
        "data": outcome.data,
        "summary_generated": outcome.summary_generated,
    })))
}

#[derive(Debug, Deserialize)]
struct ManualChatRequest {
    text: String,
    #[serde(default = "default_play_tts")]
    play_tts: bool,
}

fn default_play_tts() -> bool {
    true
}

async fn respond_via_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ManualChatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    if request.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".into()));
    }
    match state
        .orchestrator
        .process_manual_prompt(&request.text, request.play_tts)
        .await
    {
        Some(payload) => Ok(Json(json!({ "status": "ok", "payload": payload }))),
        None => Err(ApiError::NoResponse),
    }
}

#[derive(Debug, Deserialize)]
struct ChatIngestCommand {
    #[serde(default = "default_ingest_role")]
    role: Role,
    text: String,
}

fn default_ingest_role() -> Role {
    Role::User
}

async fn ingest_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(command): Json<ChatIngestCommand>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    if command.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".into()));
    }
    let summary = state
        .orchestrator
        .record_turn(command.role, &command.text)
        .await;
    Ok(Json(json!({
        "status": "accepted",
        "summary_generated": summary.is_some(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asr_ingress_deserializes_both_kinds() {
        let raw = json!({
            "type": "asr_final",
            "segment": 1,
            "text": "tell me a joke",
            "started_at": 0.0,
            "ended_at": 1.0,
            "duration_ms": 1000.0,
        });
        let ingress: AsrIngress = serde_json::from_value(raw).unwrap();
        assert_eq!(ingress.kind, AsrKind::Final);
        assert_eq!(ingress.payload.segment, 1);
        assert_eq!(ingress.payload.duration_ms, Some(1000.0));

        let raw = json!({
            "type": "asr_partial",
            "segment": 2,
            "text": "tell me",
            "started_at": 0.0,
            "ended_at": 0.4,
        });
        let ingress: AsrIngress = serde_json::from_value(raw).unwrap();
        assert_eq!(ingress.kind, AsrKind::Partial);
    }

    #[test]
    fn unknown_asr_kind_is_rejected() {
        let raw = json!({
            "type": "asr_garbage",
            "segment": 1,
            "text": "x",
            "started_at": 0.0,
            "ended_at": 1.0,
        });
        assert!(serde_json::from_value::<AsrIngress>(raw).is_err());
    }

    #[test]
    fn manual_chat_defaults_to_playing_tts() {
        let request: ManualChatRequest =
            serde_json::from_value(json!({ "text": "hi" })).unwrap();
        assert!(request.play_tts);
    }

    #[test]
    fn chat_ingest_defaults_to_the_user_role() {
        let command: ChatIngestCommand =
            serde_json::from_value(json!({ "text": "from chat" })).unwrap();
        assert_eq!(command.role, Role::User);

        let command: ChatIngestCommand =
            serde_json::from_value(json!({ "role": "assistant", "text": "x" })).unwrap();
        assert_eq!(command.role, Role::Assistant);

        assert!(
            serde_json::from_value::<ChatIngestCommand>(json!({ "role": "narrator", "text": "x" }))
                .is_err()
        );
    }
}
