//! TTS worker client: single-shot synthesis requests.
//!
//! The worker exposes one `/speak` endpoint taking `{text, voice?,
//! request_id?}` and answering with the synthesised audio metadata, or with
//! `{"status": "busy"}` when it refuses under resource pressure. Latency is
//! measured end-to-end by the caller, not here.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Synthesis result returned by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsAudio {
    /// Filesystem path to the generated audio.
    pub audio_path: String,
    /// Voice actually used by the synthesiser.
    pub voice: String,
    /// Latency the worker observed internally.
    pub latency_ms: f64,
    /// Viseme timings accompanying the audio.
    #[serde(default)]
    pub visemes: Vec<serde_json::Value>,
    #[serde(default)]
    pub cached: bool,
}

/// Ingress command for manual TTS requests.
#[derive(Debug, Clone, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    pub voice: Option<String>,
    pub request_id: Option<String>,
}

/// Tagged result of one synthesis attempt.
#[derive(Debug, Clone)]
pub enum TtsOutcome {
    Synthesized(TtsAudio),
    /// Worker refused under resource pressure; retry later.
    Busy,
    /// Hard failure (network, non-2xx, malformed body).
    Failed,
}

/// Seam for the decision engine and streaming session; tests substitute
/// scripted implementations.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
        request_id: Option<&str>,
    ) -> TtsOutcome;
}

/// HTTP client for the real TTS worker.
pub struct TtsClient {
    http: reqwest::Client,
    base_url: String,
}

impl TtsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build TTS HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TtsBackend for TtsClient {
    async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
        request_id: Option<&str>,
    ) -> TtsOutcome {
        let mut body = json!({ "text": text });
        if let Some(voice) = voice {
            body["voice"] = json!(voice);
        }
        if let Some(request_id) = request_id {
            body["request_id"] = json!(request_id);
        }

        let response = match self
            .http
            .post(format!("{}/speak", self.base_url))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!("TTS worker request failed: {error}");
                return TtsOutcome::Failed;
            }
        };
        let response = match response.error_for_status() {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!("TTS worker returned an error status: {error}");
                return TtsOutcome::Failed;
            }
        };
        let value: serde_json::Value = match response.json().await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!("TTS worker response was not JSON: {error}");
                return TtsOutcome::Failed;
            }
        };

        if value.get("status").and_then(|s| s.as_str()) == Some("busy") {
            return TtsOutcome::Busy;
        }
        match serde_json::from_value::<TtsAudio>(value) {
            Ok(audio) => TtsOutcome::Synthesized(audio),
            Err(error) => {
                tracing::warn!("TTS worker response had an unexpected shape: {error}");
                TtsOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_deserializes_with_optional_fields_defaulted() {
        let audio: TtsAudio = serde_json::from_value(json!({
            "audio_path": "/tmp/out.wav",
            "voice": "aria",
            "latency_ms": 182.4,
        }))
        .unwrap();
        assert!(audio.visemes.is_empty());
        assert!(!audio.cached);
    }
}
