// Events that flow from the orchestrator to WebSocket subscribers and the
// telemetry sink.
//
// Every observable lifecycle stage of the voice pipeline is expressed as a
// variant here. Using an enum keeps the wire shapes type-checked and lets
// async tasks communicate without stringly-typed payload maps. Events are
// values: once published they are never mutated.

use serde::{Deserialize, Serialize};

use crate::clients::policy::PolicyFinal;
use crate::clients::tts::TtsAudio;
use crate::memory::MemorySummary;
use crate::persona::PersonaState;
use crate::registry::Health;
use crate::state::StatusSnapshot;

/// Main event type broadcast through the broker.
///
/// Serialized as JSON like `{"type": "tts_chunk", ...}` so overlay pages and
/// dashboards can switch on `type` directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OrchestratorEvent {
    /// Streaming transcription update while speech is still ongoing.
    #[serde(rename = "asr_partial")]
    AsrPartial { payload: AsrPayload },

    /// Final transcript for a completed speech segment.
    #[serde(rename = "asr_final")]
    AsrFinal { payload: AsrPayload },

    /// Incremental token from the policy worker's reply stream.
    /// The payload is forwarded verbatim from the worker.
    #[serde(rename = "policy.token")]
    PolicyToken { payload: serde_json::Value },

    /// Complete policy reply for one request.
    #[serde(rename = "policy_final")]
    PolicyFinal { payload: PolicyFinal },

    /// One synthesised slice of a streaming reply.
    #[serde(rename = "tts_chunk")]
    TtsChunk { payload: TtsChunkPayload },

    /// Whole-reply synthesis result (fallback or manual request).
    #[serde(rename = "tts_generated")]
    TtsGenerated { payload: TtsAudio },

    /// Record of the text most recently handed to the TTS worker.
    #[serde(rename = "tts_request")]
    TtsRequest { data: TtsRequestRecord },

    /// A worker module was enabled or disabled.
    #[serde(rename = "module.toggle")]
    ModuleToggle {
        module: String,
        enabled: bool,
        state: Health,
    },

    /// Operator hit the panic button.
    #[serde(rename = "control.panic")]
    ControlPanic {
        ts: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Global TTS mute flag changed.
    #[serde(rename = "control.mute")]
    ControlMute { muted: bool, ts: f64 },

    /// A persona preset was applied.
    #[serde(rename = "control_preset")]
    ControlPreset {
        preset: String,
        active_preset: String,
        ts: f64,
    },

    /// Persona fields changed (preset apply or manual update).
    #[serde(rename = "persona_update")]
    PersonaUpdate {
        ts: f64,
        persona: PersonaState,
        preset: String,
        active_preset: String,
    },

    /// A conversation summary was produced or restored.
    #[serde(rename = "memory_summary")]
    MemorySummary { summary: MemorySummary },

    /// OBS scene switched.
    #[serde(rename = "obs_scene")]
    ObsScene { scene: String, ts: f64 },

    /// VTube Studio expression command recorded.
    #[serde(rename = "vts_expression")]
    VtsExpression { data: ExpressionState },

    /// Latency measurement for a voice-pipeline stage.
    #[serde(rename = "pipeline.metric")]
    PipelineMetric { payload: PipelineMetric },

    /// Full orchestrator snapshot, broadcast periodically and on subscribe.
    #[serde(rename = "status")]
    Status { payload: StatusSnapshot },
}

impl OrchestratorEvent {
    /// Wire name of the event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AsrPartial { .. } => "asr_partial",
            Self::AsrFinal { .. } => "asr_final",
            Self::PolicyToken { .. } => "policy.token",
            Self::PolicyFinal { .. } => "policy_final",
            Self::TtsChunk { .. } => "tts_chunk",
            Self::TtsGenerated { .. } => "tts_generated",
            Self::TtsRequest { .. } => "tts_request",
            Self::ModuleToggle { .. } => "module.toggle",
            Self::ControlPanic { .. } => "control.panic",
            Self::ControlMute { .. } => "control.mute",
            Self::ControlPreset { .. } => "control_preset",
            Self::PersonaUpdate { .. } => "persona_update",
            Self::MemorySummary { .. } => "memory_summary",
            Self::ObsScene { .. } => "obs_scene",
            Self::VtsExpression { .. } => "vts_expression",
            Self::PipelineMetric { .. } => "pipeline.metric",
            Self::Status { .. } => "status",
        }
    }
}

/// Fields shared by partial and final ASR events.
///
/// `duration_ms` is only populated by the final event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrPayload {
    /// Sequential segment index assigned by the recogniser.
    pub segment: u64,
    /// Transcribed utterance.
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Unix timestamp when speech started.
    pub started_at: f64,
    /// Unix timestamp when speech ended.
    pub ended_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl AsrPayload {
    /// Validate ingress invariants; returns a human-readable reason on
    /// failure so the surface can answer with a 4xx.
    pub fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err("text must not be empty".into());
        }
        if self.ended_at < self.started_at {
            return Err("ended_at must be greater than or equal to started_at".into());
        }
        if let Some(c) = self.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err("confidence must be within [0, 1]".into());
            }
        }
        Ok(())
    }
}

/// One synthesised chunk of a streaming reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsChunkPayload {
    pub index: u64,
    pub request_id: String,
    pub audio_path: String,
    pub voice: String,
    pub latency_ms: f64,
    pub text_length: usize,
    pub mode: String,
}

/// Record of the last TTS request handed to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsRequestRecord {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub ts: f64,
}

/// Last VTube Studio expression applied to the avatar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionState {
    pub expression: String,
    pub intensity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
}

impl Default for ExpressionState {
    fn default() -> Self {
        Self {
            expression: "smile".into(),
            intensity: 0.5,
            ts: None,
        }
    }
}

/// Named stage of the voice pipeline, for latency metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    PolicyFirstToken,
    TtsFirstChunk,
    PolicyTotal,
}

/// Latency measurement emitted at pipeline stage boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMetric {
    pub stage: PipelineStage,
    /// Milliseconds, rounded to two decimals.
    pub latency_ms: f64,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asr(text: &str, started_at: f64, ended_at: f64) -> AsrPayload {
        AsrPayload {
            segment: 1,
            text: text.into(),
            confidence: None,
            language: None,
            started_at,
            ended_at,
            latency_ms: None,
            duration_ms: None,
        }
    }

    #[test]
    fn event_serializes_with_wire_type_tag() {
        let event = OrchestratorEvent::ObsScene {
            scene: "Starting Soon".into(),
            ts: 12.5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "obs_scene");
        assert_eq!(json["scene"], "Starting Soon");
    }

    #[test]
    fn pipeline_metric_stage_uses_snake_case() {
        let event = OrchestratorEvent::PipelineMetric {
            payload: PipelineMetric {
                stage: PipelineStage::PolicyFirstToken,
                latency_ms: 8.21,
                mode: "streaming".into(),
                request_id: None,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "pipeline.metric");
        assert_eq!(json["payload"]["stage"], "policy_first_token");
        assert!(json["payload"].get("request_id").is_none());
    }

    #[test]
    fn asr_validation_rejects_inverted_timestamps() {
        assert!(asr("hello", 2.0, 1.0).validate().is_err());
        assert!(asr("hello", 1.0, 2.0).validate().is_ok());
    }

    #[test]
    fn asr_validation_rejects_blank_text() {
        assert!(asr("   ", 0.0, 1.0).validate().is_err());
    }

    #[test]
    fn asr_validation_bounds_confidence() {
        let mut payload = asr("hi", 0.0, 1.0);
        payload.confidence = Some(1.4);
        assert!(payload.validate().is_err());
        payload.confidence = Some(0.9);
        assert!(payload.validate().is_ok());
    }
}
