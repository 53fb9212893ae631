//! Decision engine and streaming reply pipeline.
//!
//! The submodules here own the real-time path from a final transcript to
//! synthesised speech. [`EngineContext`] is the narrow slice of orchestrator
//! state the pipeline is allowed to touch; the engine never holds the state
//! facade itself, which keeps the facade→engine→facade reference cycle out
//! of the type graph.

pub mod engine;
pub mod session;

use std::sync::{Arc, Mutex};

use crate::broker::EventDispatcher;
use crate::events::{OrchestratorEvent, TtsRequestRecord};
use crate::memory::{MemoryController, MemorySummary, Role};
use crate::metrics::PipelineMetrics;
use crate::persona::{PersonaState, PresetCatalog};
use crate::registry::Health;
use crate::state::ControlState;
use crate::util::unix_now;

/// Result of recording a TTS request through the facade.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TtsRecordOutcome {
    pub data: TtsRequestRecord,
    pub summary_generated: bool,
}

/// Persona values the engine folds into a policy request.
#[derive(Debug, Clone)]
pub struct PersonaView {
    pub persona: PersonaState,
    pub active_preset: String,
}

/// Capabilities handed to the decision engine and streaming sessions.
///
/// Everything here is cheaply cloneable; the control lock is only ever held
/// across synchronous sections.
#[derive(Clone)]
pub struct EngineContext {
    pub(crate) control: Arc<Mutex<ControlState>>,
    pub(crate) memory: Arc<MemoryController>,
    pub(crate) presets: Arc<PresetCatalog>,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) metrics: Arc<PipelineMetrics>,
}

impl EngineContext {
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn tts_muted(&self) -> bool {
        self.control.lock().expect("state lock poisoned").tts_muted
    }

    /// Attribute an observed collaborator latency (and optionally health) to
    /// a module. Unknown modules are ignored.
    pub fn mark_module_latency(&self, module: &str, latency_ms: f64, health: Option<Health>) {
        let mut control = self.control.lock().expect("state lock poisoned");
        if let Some(state) = control.modules.get_mut(module) {
            state.update_latency(latency_ms, health);
        }
    }

    /// Append a turn to conversational memory, broadcasting the summary when
    /// this turn crossed the summary interval. Storage failures degrade to a
    /// missing summary rather than unwinding the pipeline.
    pub async fn record_turn(&self, role: Role, text: &str) -> Option<MemorySummary> {
        let summary = match self.memory.add_turn(role, text) {
            Ok(summary) => summary,
            Err(error) => {
                tracing::error!("Failed to record {role} turn: {error:#}");
                return None;
            }
        };
        if let Some(summary) = &summary {
            self.dispatcher
                .publish(OrchestratorEvent::MemorySummary {
                    summary: summary.clone(),
                })
                .await;
        }
        summary
    }

    /// Remember the text handed to the TTS worker and record the assistant
    /// turn it corresponds to.
    pub async fn record_tts(&self, text: &str, voice: Option<String>) -> TtsRecordOutcome {
        let record = TtsRequestRecord {
            text: text.to_string(),
            voice,
            ts: unix_now(),
        };
        {
            let mut control = self.control.lock().expect("state lock poisoned");
            control.last_tts = Some(record.clone());
        }
        self.dispatcher
            .publish(OrchestratorEvent::TtsRequest {
                data: record.clone(),
            })
            .await;
        let summary = self.record_turn(Role::Assistant, text).await;
        TtsRecordOutcome {
            data: record,
            summary_generated: summary.is_some(),
        }
    }

    /// Current persona and active preset name, for request assembly.
    pub fn persona_view(&self) -> PersonaView {
        let control = self.control.lock().expect("state lock poisoned");
        PersonaView {
            persona: control.persona.clone(),
            active_preset: control.active_preset.clone(),
        }
    }

    pub fn preset_prompt(&self, name: &str) -> Option<String> {
        self.presets.prompt_for(name).map(String::from)
    }
}
