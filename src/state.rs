//! Orchestrator state facade.
//!
//! Owns the broker, module table, persona, memory, and the decision engine,
//! and exposes the operations the HTTP/WS surface calls into. Every
//! state-mutating operation follows the same discipline: take the state
//! lock, mutate and compute the outbound payload, release the lock, then
//! publish. The lock is never held across an await point.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::broker::{EventBroker, EventDispatcher};
use crate::clients::policy::{PolicyBackend, PolicyFinal};
use crate::clients::tts::{TtsBackend, TtsRequest};
use crate::events::{AsrPayload, ExpressionState, OrchestratorEvent, TtsRequestRecord};
use crate::memory::{MemoryController, MemorySnapshot, MemorySummary, Role};
use crate::metrics::PipelineMetrics;
use crate::persona::{PersonaPreset, PersonaState, PersonaUpdate, PresetCatalog};
use crate::pipeline::engine::DecisionEngine;
use crate::pipeline::{EngineContext, TtsRecordOutcome};
use crate::registry::{Health, ModuleRegistry, ModuleSnapshot};
use crate::util::unix_now;

/// Interval between jittered status broadcasts.
const STATUS_TICK: Duration = Duration::from_secs(5);

/// Mutable orchestrator state guarded by the facade lock.
pub struct ControlState {
    pub modules: ModuleRegistry,
    pub persona: PersonaState,
    pub active_preset: String,
    pub scene: String,
    pub last_expression: ExpressionState,
    pub last_tts: Option<TtsRequestRecord>,
    pub tts_muted: bool,
    pub panic_at: Option<f64>,
    pub panic_reason: Option<String>,
    pub restore_context: bool,
}

impl ControlState {
    pub fn new(roster: &[String], presets: &PresetCatalog) -> Self {
        Self {
            modules: ModuleRegistry::new(roster),
            persona: PersonaState::from_preset(presets.default_preset()),
            active_preset: presets.default_name().to_string(),
            scene: "Starting Soon".into(),
            last_expression: ExpressionState::default(),
            last_tts: None,
            tts_muted: false,
            panic_at: None,
            panic_reason: None,
            restore_context: false,
        }
    }
}

/// Full status payload consumed by dashboards and the WS greeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: String,
    pub persona: PersonaState,
    pub persona_presets: PresetInfo,
    pub modules: BTreeMap<String, ModuleSnapshot>,
    pub scene: String,
    pub last_expression: ExpressionState,
    pub last_tts: Option<TtsRequestRecord>,
    pub memory: MemorySnapshot,
    pub restore_context: bool,
    pub control: ControlFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetInfo {
    pub active: String,
    pub available: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFlags {
    pub tts_muted: bool,
    pub panic_at: Option<f64>,
    pub panic_reason: Option<String>,
    pub active_preset: String,
}

/// Lightweight module-health view for `/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: Health,
    pub uptime_seconds: f64,
    pub modules: BTreeMap<String, Health>,
    pub tts_muted: bool,
    pub panic_reason: Option<String>,
    pub panic_active: bool,
}

/// Errors surfaced to callers of the facade.
#[derive(Debug)]
pub enum StateError {
    UnknownModule(String),
    UnknownPreset { name: String, available: Vec<String> },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::UnknownModule(name) => write!(f, "Unknown module: {name}"),
            StateError::UnknownPreset { name, available } => {
                let available = if available.is_empty() {
                    "<none>".to_string()
                } else {
                    available.join(", ")
                };
                write!(f, "Unknown preset: {name}. Available: {available}")
            }
        }
    }
}

impl std::error::Error for StateError {}

pub struct Orchestrator {
    ctx: EngineContext,
    engine: DecisionEngine,
    presets: Arc<PresetCatalog>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<EventBroker>,
        memory: MemoryController,
        presets: PresetCatalog,
        roster: &[String],
        policy: Arc<dyn PolicyBackend>,
        tts: Arc<dyn TtsBackend>,
        metrics: Arc<PipelineMetrics>,
    ) -> Arc<Self> {
        let presets = Arc::new(presets);
        let control = Arc::new(Mutex::new(ControlState::new(roster, &presets)));
        let ctx = EngineContext {
            control,
            memory: Arc::new(memory),
            presets: presets.clone(),
            dispatcher: EventDispatcher::new(broker),
            metrics,
        };
        let engine = DecisionEngine::new(ctx.clone(), policy, tts);
        Arc::new(Self {
            ctx,
            engine,
            presets,
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.ctx.dispatcher
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        self.ctx.dispatcher.broker()
    }

    pub fn metrics_text(&self) -> String {
        self.ctx.metrics.render_prometheus()
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    // ── Snapshots ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> StatusSnapshot {
        let control = self.ctx.control.lock().expect("state lock poisoned");
        StatusSnapshot {
            status: "ok".into(),
            persona: control.persona.clone(),
            persona_presets: PresetInfo {
                active: control.active_preset.clone(),
                available: self.presets.available().to_vec(),
            },
            modules: control.modules.snapshot(),
            scene: control.scene.clone(),
            last_expression: control.last_expression.clone(),
            last_tts: control.last_tts.clone(),
            memory: self.ctx.memory.snapshot(),
            restore_context: control.restore_context,
            control: ControlFlags {
                tts_muted: control.tts_muted,
                panic_at: control.panic_at,
                panic_reason: control.panic_reason.clone(),
                active_preset: control.active_preset.clone(),
            },
        }
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let control = self.ctx.control.lock().expect("state lock poisoned");
        HealthSnapshot {
            status: control.modules.overall_health(),
            uptime_seconds: crate::util::round2(self.uptime_seconds()),
            modules: control.modules.health_map(),
            tts_muted: control.tts_muted,
            panic_reason: control.panic_reason.clone(),
            panic_active: control.panic_reason.is_some(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Initialise memory persistence and, when restoring, broadcast the
    /// recovered summary.
    pub async fn startup(&self, restore: bool, restore_window_seconds: f64) -> Result<()> {
        {
            let mut control = self.ctx.control.lock().expect("state lock poisoned");
            control.restore_context = restore;
        }
        if let Some(summary) = self.ctx.memory.prepare(restore, restore_window_seconds)? {
            self.ctx
                .dispatcher
                .publish(OrchestratorEvent::MemorySummary { summary })
                .await;
        }
        Ok(())
    }

    /// Kick off the periodic jitter-and-broadcast status task.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let orchestrator = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of an interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = {
                    let mut control = orchestrator
                        .ctx
                        .control
                        .lock()
                        .expect("state lock poisoned");
                    control.modules.jitter_all();
                    drop(control);
                    orchestrator.snapshot()
                };
                orchestrator.ctx.dispatcher.publish_status(snapshot).await;
            }
        });
        self.tasks.lock().expect("task lock poisoned").push(handle);
    }

    /// Cancel background tasks cooperatively.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> =
            self.tasks.lock().expect("task lock poisoned").drain(..).collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    // ── Control operations ───────────────────────────────────────────────

    pub async fn toggle_module(
        &self,
        module: &str,
        enabled: bool,
    ) -> Result<OrchestratorEvent, StateError> {
        let event = {
            let mut control = self.ctx.control.lock().expect("state lock poisoned");
            let Some(state) = control.modules.get_mut(module) else {
                return Err(StateError::UnknownModule(module.to_string()));
            };
            state.set_enabled(enabled);
            let health = state.health;
            if module == "tts_worker" {
                control.tts_muted = !enabled;
            }
            OrchestratorEvent::ModuleToggle {
                module: module.to_string(),
                enabled,
                state: health,
            }
        };
        self.ctx.dispatcher.publish(event.clone()).await;
        Ok(event)
    }

    pub async fn set_mute(&self, muted: bool) -> OrchestratorEvent {
        let event = {
            let mut control = self.ctx.control.lock().expect("state lock poisoned");
            control.tts_muted = muted;
            OrchestratorEvent::ControlMute {
                muted,
                ts: unix_now(),
            }
        };
        self.ctx.dispatcher.publish(event.clone()).await;
        // Muting implies disabling the TTS worker and vice-versa; the twin
        // action is sequenced after the mute publish to avoid re-entrancy.
        if let Err(error) = self.toggle_module("tts_worker", !muted).await {
            tracing::debug!("Mute toggle skipped: {error}");
        }
        event
    }

    pub async fn trigger_panic(&self, reason: Option<String>) -> OrchestratorEvent {
        let event = {
            let mut control = self.ctx.control.lock().expect("state lock poisoned");
            control.panic_at = Some(unix_now());
            control.panic_reason = reason.filter(|r| !r.trim().is_empty());
            OrchestratorEvent::ControlPanic {
                ts: control.panic_at.unwrap_or_default(),
                reason: control.panic_reason.clone(),
            }
        };
        self.ctx.dispatcher.publish(event.clone()).await;
        event
    }

    pub async fn update_scene(&self, scene: String) -> OrchestratorEvent {
        let event = {
            let mut control = self.ctx.control.lock().expect("state lock poisoned");
            control.scene = scene.clone();
            OrchestratorEvent::ObsScene {
                scene,
                ts: unix_now(),
            }
        };
        self.ctx.dispatcher.publish(event.clone()).await;
        event
    }

    pub async fn update_expression(
        &self,
        expression: String,
        intensity: f64,
    ) -> OrchestratorEvent {
        let event = {
            let mut control = self.ctx.control.lock().expect("state lock poisoned");
            control.last_expression = ExpressionState {
                expression,
                intensity,
                ts: Some(unix_now()),
            };
            OrchestratorEvent::VtsExpression {
                data: control.last_expression.clone(),
            }
        };
        self.ctx.dispatcher.publish(event.clone()).await;
        event
    }

    // ── Persona ──────────────────────────────────────────────────────────

    pub async fn update_persona(
        &self,
        update: PersonaUpdate,
    ) -> Result<OrchestratorEvent, StateError> {
        if let Some(preset) = update.preset.clone() {
            return self.apply_preset(&preset).await;
        }
        Ok(self.apply_persona_update(update, None).await)
    }

    pub async fn apply_preset(&self, name: &str) -> Result<OrchestratorEvent, StateError> {
        let preset: PersonaPreset = match self.presets.get(name) {
            Some(preset) => preset.clone(),
            None => {
                return Err(StateError::UnknownPreset {
                    name: name.to_string(),
                    available: self.presets.available().to_vec(),
                })
            }
        };
        self.apply_persona_update(PersonaUpdate::from_preset(&preset), Some(name))
            .await;
        let event = OrchestratorEvent::ControlPreset {
            preset: name.to_string(),
            active_preset: name.to_string(),
            ts: unix_now(),
        };
        self.ctx.dispatcher.publish(event.clone()).await;
        Ok(event)
    }

    async fn apply_persona_update(
        &self,
        update: PersonaUpdate,
        preset_name: Option<&str>,
    ) -> OrchestratorEvent {
        let (event, active_preset) = {
            let mut control = self.ctx.control.lock().expect("state lock poisoned");
            control.persona.apply(&update);
            if let Some(name) = preset_name {
                control.active_preset = name.to_string();
            } else if update.touches_persona() {
                control.active_preset = "custom".into();
            }
            let active = control.active_preset.clone();
            (
                OrchestratorEvent::PersonaUpdate {
                    ts: control.persona.last_updated,
                    persona: control.persona.clone(),
                    preset: active.clone(),
                    active_preset: active.clone(),
                },
                active,
            )
        };
        self.ctx.dispatcher.publish(event.clone()).await;
        self.ctx
            .record_turn(
                Role::System,
                &format!("Persona updated to {active_preset} preset."),
            )
            .await;
        if let Some(message) = update.system_message.as_deref() {
            if !message.trim().is_empty() {
                self.ctx.record_turn(Role::System, message).await;
            }
        }
        event
    }

    // ── Memory & TTS records ─────────────────────────────────────────────

    pub async fn record_turn(&self, role: Role, text: &str) -> Option<MemorySummary> {
        self.ctx.record_turn(role, text).await
    }

    pub async fn record_tts(&self, request: TtsRequest) -> TtsRecordOutcome {
        self.ctx.record_tts(&request.text, request.voice).await
    }

    // ── Pipeline entry points ────────────────────────────────────────────

    /// Attribute the recogniser's own reported latency to its module row.
    pub fn note_asr_observation(&self, payload: &AsrPayload) {
        let metric = payload.latency_ms.or(payload.duration_ms);
        let mut control = self.ctx.control.lock().expect("state lock poisoned");
        if let Some(module) = control.modules.get_mut("asr_worker") {
            match metric {
                Some(latency_ms) => module.update_latency(latency_ms, None),
                None => module.last_updated = unix_now(),
            }
        }
    }

    pub async fn handle_asr_partial(&self, payload: AsrPayload) {
        self.engine
            .handle_asr_partial(payload.segment, &payload.text)
            .await;
    }

    pub async fn handle_asr_final(&self, payload: AsrPayload) {
        self.engine
            .handle_asr_final(payload.segment, &payload.text)
            .await;
    }

    pub async fn process_manual_prompt(
        &self,
        text: &str,
        synthesize: bool,
    ) -> Option<PolicyFinal> {
        self.engine.process_manual_prompt(text, synthesize).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::policy::{PolicyOutcome, PolicyRequest};
    use crate::clients::tts::TtsOutcome;
    use crate::memory::MemoryStore;
    use crate::persona::default_presets;
    use crate::pipeline::session::StreamingReplySession;
    use crate::registry::default_roster;
    use async_trait::async_trait;

    struct NullPolicy;

    #[async_trait]
    impl PolicyBackend for NullPolicy {
        async fn invoke(
            &self,
            _request: PolicyRequest,
            _session: &mut StreamingReplySession,
        ) -> PolicyOutcome {
            PolicyOutcome::Unavailable
        }
    }

    struct NullTts;

    #[async_trait]
    impl TtsBackend for NullTts {
        async fn synthesize(
            &self,
            _text: &str,
            _voice: Option<&str>,
            _request_id: Option<&str>,
        ) -> TtsOutcome {
            TtsOutcome::Failed
        }
    }

    fn orchestrator() -> (Arc<Orchestrator>, Arc<EventBroker>) {
        let broker = Arc::new(EventBroker::new(None));
        let memory = MemoryController::new(
            MemoryStore::open_in_memory().expect("in-memory store"),
            40,
            6,
        );
        let orchestrator = Orchestrator::new(
            broker.clone(),
            memory,
            PresetCatalog::new(default_presets(), "default"),
            &default_roster(),
            Arc::new(NullPolicy),
            Arc::new(NullTts),
            Arc::new(PipelineMetrics::new()),
        );
        (orchestrator, broker)
    }

    fn drain(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<OrchestratorEvent>,
    ) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn preset_round_trips_into_the_snapshot() {
        let (orchestrator, _broker) = orchestrator();
        orchestrator.apply_preset("hype").await.unwrap();

        let snapshot = orchestrator.snapshot();
        assert_eq!(snapshot.persona_presets.active, "hype");
        assert_eq!(snapshot.control.active_preset, "hype");
        assert_eq!(snapshot.persona.style, "chaotic");
        assert_eq!(snapshot.persona.chaos_level, 0.75);
        assert_eq!(snapshot.persona.energy, 0.85);
        assert!(snapshot.persona.family_mode);

        // Preset application appends the announcement system turn.
        assert_eq!(snapshot.memory.buffer_length, 1);
    }

    #[tokio::test]
    async fn unknown_preset_is_rejected_with_the_available_list() {
        let (orchestrator, _broker) = orchestrator();
        match orchestrator.apply_preset("nope").await {
            Err(StateError::UnknownPreset { name, available }) => {
                assert_eq!(name, "nope");
                assert!(available.contains(&"cozy".to_string()));
            }
            other => panic!("expected UnknownPreset, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mute_disables_the_tts_worker_and_back() {
        let (orchestrator, broker) = orchestrator();
        let (_token, mut rx) = broker.subscribe();

        orchestrator.set_mute(true).await;
        {
            let snapshot = orchestrator.snapshot();
            assert!(snapshot.control.tts_muted);
            let tts = &snapshot.modules["tts_worker"];
            assert!(!tts.enabled);
            assert_eq!(tts.state, Health::Offline);
        }

        orchestrator.set_mute(false).await;
        let snapshot = orchestrator.snapshot();
        assert!(!snapshot.control.tts_muted);
        assert!(snapshot.modules["tts_worker"].enabled);

        let events = drain(&mut rx);
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["control.mute", "module.toggle", "control.mute", "module.toggle"]
        );
    }

    #[tokio::test]
    async fn toggling_tts_worker_off_implies_mute() {
        let (orchestrator, _broker) = orchestrator();
        orchestrator.toggle_module("tts_worker", false).await.unwrap();
        assert!(orchestrator.snapshot().control.tts_muted);

        orchestrator.toggle_module("tts_worker", true).await.unwrap();
        assert!(!orchestrator.snapshot().control.tts_muted);
    }

    #[tokio::test]
    async fn unknown_module_toggle_is_an_error() {
        let (orchestrator, _broker) = orchestrator();
        assert!(matches!(
            orchestrator.toggle_module("flux_capacitor", true).await,
            Err(StateError::UnknownModule(_))
        ));
    }

    #[tokio::test]
    async fn manual_persona_update_marks_custom() {
        let (orchestrator, _broker) = orchestrator();
        orchestrator
            .update_persona(PersonaUpdate {
                energy: Some(0.95),
                ..Default::default()
            })
            .await
            .unwrap();

        let snapshot = orchestrator.snapshot();
        assert_eq!(snapshot.persona_presets.active, "custom");
        assert_eq!(snapshot.persona.energy, 0.95);
    }

    #[tokio::test]
    async fn persona_update_with_preset_field_delegates() {
        let (orchestrator, _broker) = orchestrator();
        orchestrator
            .update_persona(PersonaUpdate {
                preset: Some("cozy".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(orchestrator.snapshot().persona.style, "calm");
        assert_eq!(orchestrator.snapshot().persona_presets.active, "cozy");
    }

    #[tokio::test]
    async fn panic_records_reason_and_health_surface_shows_it() {
        let (orchestrator, _broker) = orchestrator();
        orchestrator
            .trigger_panic(Some("chat went sideways".into()))
            .await;

        let health = orchestrator.health_snapshot();
        assert!(health.panic_active);
        assert_eq!(health.panic_reason.as_deref(), Some("chat went sideways"));
        assert_eq!(health.status, Health::Online);
    }

    #[tokio::test]
    async fn scene_and_expression_updates_are_reflected_and_published() {
        let (orchestrator, broker) = orchestrator();
        let (_token, mut rx) = broker.subscribe();

        orchestrator.update_scene("Just Chatting".into()).await;
        orchestrator.update_expression("wink".into(), 0.8).await;

        let snapshot = orchestrator.snapshot();
        assert_eq!(snapshot.scene, "Just Chatting");
        assert_eq!(snapshot.last_expression.expression, "wink");

        let kinds: Vec<&str> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["obs_scene", "vts_expression"]);
    }

    #[tokio::test]
    async fn record_tts_remembers_the_request_and_logs_the_turn() {
        let (orchestrator, broker) = orchestrator();
        let (_token, mut rx) = broker.subscribe();

        let outcome = orchestrator
            .record_tts(TtsRequest {
                text: "hello chat".into(),
                voice: Some("aria".into()),
                request_id: None,
            })
            .await;
        assert!(!outcome.summary_generated);

        let snapshot = orchestrator.snapshot();
        assert_eq!(snapshot.last_tts.as_ref().unwrap().text, "hello chat");
        assert_eq!(snapshot.memory.buffer_length, 1);

        let kinds: Vec<&str> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["tts_request"]);
    }

    #[tokio::test]
    async fn memory_summary_cadence_is_observed_through_record_turn() {
        let (orchestrator, broker) = orchestrator();
        let (_token, mut rx) = broker.subscribe();

        for i in 0..12 {
            orchestrator
                .record_turn(Role::User, &format!("turn {i}"))
                .await;
        }
        let summaries = drain(&mut rx)
            .iter()
            .filter(|event| event.kind() == "memory_summary")
            .count();
        assert_eq!(summaries, 2);
    }

    #[tokio::test]
    async fn startup_with_restore_broadcasts_the_recovered_summary() {
        let broker = Arc::new(EventBroker::new(None));
        let store = MemoryStore::open_in_memory().expect("in-memory store");
        store
            .save_summary(MemorySummary {
                id: None,
                summary_text: "where we left off".into(),
                mood_state: "cheerful".into(),
                metadata: serde_json::json!({}),
                ts: unix_now(),
            })
            .unwrap();
        let orchestrator = Orchestrator::new(
            broker.clone(),
            MemoryController::new(store, 40, 6),
            PresetCatalog::new(default_presets(), "default"),
            &default_roster(),
            Arc::new(NullPolicy),
            Arc::new(NullTts),
            Arc::new(PipelineMetrics::new()),
        );
        let (_token, mut rx) = broker.subscribe();

        orchestrator.startup(true, 3600.0).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            OrchestratorEvent::MemorySummary { summary } => {
                assert_eq!(summary.summary_text, "where we left off");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(orchestrator.snapshot().restore_context);
    }
}
