//! Policy worker client: streaming reply requests over SSE.
//!
//! The worker answers `/respond` with `text/event-stream`. Each frame is a
//! named event (`start`, `token`, `retry`, `final`) followed by one `data:`
//! JSON line and terminated by an empty line; a frame with no event name
//! defaults to `message` and is ignored. Tokens are forwarded to the
//! streaming reply session as they arrive so chunked synthesis can begin
//! before the reply is complete.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::broker::EventDispatcher;
use crate::events::OrchestratorEvent;
use crate::pipeline::session::{StreamEvent, StreamingReplySession};

/// Request body posted to the policy worker, assembled by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyRequest {
    pub text: String,
    pub is_final: bool,
    pub persona_style: String,
    pub chaos_level: f64,
    pub energy: f64,
    pub family_friendly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_summary: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_turns: Vec<TurnMessage>,
}

/// Conversation history entry in `{role, content}` form.
#[derive(Debug, Clone, Serialize)]
pub struct TurnMessage {
    pub role: String,
    pub content: String,
}

/// Worker status markers attached to the final payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// Terminal payload of one policy stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFinal {
    pub content: String,
    pub meta: PolicyMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl PolicyFinal {
    /// Normalised worker status, when one was reported.
    pub fn status(&self) -> Option<String> {
        self.meta
            .status
            .as_ref()
            .map(|status| status.to_ascii_lowercase())
    }
}

/// Tagged result of one policy invocation.
#[derive(Debug, Clone)]
pub enum PolicyOutcome {
    Final(PolicyFinal),
    /// No final payload could be obtained; treated as "no response".
    Unavailable,
}

/// Seam for the decision engine; tests substitute scripted implementations
/// that drive the session directly.
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    async fn invoke(
        &self,
        request: PolicyRequest,
        session: &mut StreamingReplySession,
    ) -> PolicyOutcome;
}

/// HTTP/SSE client for the real policy worker.
pub struct PolicyClient {
    http: reqwest::Client,
    base_url: String,
    dispatcher: EventDispatcher,
}

impl PolicyClient {
    pub fn new(base_url: &str, timeout: Duration, dispatcher: EventDispatcher) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build policy HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            dispatcher,
        })
    }

    async fn dispatch_frame(
        &self,
        event: &str,
        data: serde_json::Value,
        session: &mut StreamingReplySession,
        final_payload: &mut Option<PolicyFinal>,
    ) {
        match event {
            "start" => {
                let request_id = data
                    .get("request_id")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                session.handle_event(StreamEvent::Start { request_id }).await;
            }
            "token" => {
                self.dispatcher
                    .publish(OrchestratorEvent::PolicyToken {
                        payload: data.clone(),
                    })
                    .await;
                if let Some(token) = data.get("token").and_then(|v| v.as_str()) {
                    session
                        .handle_event(StreamEvent::Token {
                            token: token.to_string(),
                        })
                        .await;
                }
            }
            "retry" => {
                tracing::debug!("Policy stream retried; discarding buffered tokens");
                session.handle_event(StreamEvent::Retry).await;
            }
            "final" => match serde_json::from_value::<PolicyFinal>(data) {
                Ok(payload) => *final_payload = Some(payload),
                Err(error) => {
                    tracing::debug!("Discarding malformed final payload: {error}");
                }
            },
            _ => {}
        }
    }
}

#[async_trait]
impl PolicyBackend for PolicyClient {
    async fn invoke(
        &self,
        request: PolicyRequest,
        session: &mut StreamingReplySession,
    ) -> PolicyOutcome {
        let response = match self
            .http
            .post(format!("{}/respond", self.base_url))
            .header("accept", "text/event-stream")
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!("Policy worker request failed: {error}");
                return PolicyOutcome::Unavailable;
            }
        };
        let response = match response.error_for_status() {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!("Policy worker returned an error status: {error}");
                return PolicyOutcome::Unavailable;
            }
        };

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::default();
        let mut pending = String::new();
        let mut final_payload: Option<PolicyFinal> = None;

        'read: while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    tracing::warn!("Policy stream aborted mid-response: {error}");
                    break 'read;
                }
            };
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                if let Some((event, data)) = parser.feed_line(line.trim_end_matches(['\n', '\r'])) {
                    self.dispatch_frame(&event, data, session, &mut final_payload)
                        .await;
                }
            }
        }
        // A last frame may arrive without a trailing newline.
        if let Some((event, data)) = parser.feed_line(pending.trim_end_matches('\r')) {
            self.dispatch_frame(&event, data, session, &mut final_payload)
                .await;
        }

        match final_payload {
            Some(payload) => {
                session.handle_event(StreamEvent::Final).await;
                PolicyOutcome::Final(payload)
            }
            None => PolicyOutcome::Unavailable,
        }
    }
}

/// Incremental SSE frame parser.
///
/// Tracks the current event name across lines; yields `(event, json)` when a
/// `data:` line completes a named frame.
#[derive(Debug, Default)]
struct SseParser {
    current_event: Option<String>,
}

impl SseParser {
    fn feed_line(&mut self, line: &str) -> Option<(String, serde_json::Value)> {
        if line.is_empty() {
            self.current_event = None;
            return None;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.current_event = Some(name.trim().to_string());
            return None;
        }
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if data.is_empty() {
                return None;
            }
            // Frames without an event name default to "message"; nobody
            // subscribes to those.
            let event = self.current_event.clone()?;
            return match serde_json::from_str(data) {
                Ok(value) => Some((event, value)),
                Err(_) => {
                    tracing::debug!("Discarding non-JSON SSE data line");
                    None
                }
            };
        }
        None
    }
}
