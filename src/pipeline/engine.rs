//! Decision engine: the ASR → policy → TTS decision tree.
//!
//! Sequencing lives here so the state facade can focus on persona/module
//! tracking and the broker on fan-out. The engine deduplicates ASR segments,
//! assembles policy requests from persona and memory context, drives one
//! streaming reply session per invocation, and attributes collaborator
//! health from the outcomes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use regex::Regex;

use super::session::StreamingReplySession;
use super::EngineContext;
use crate::clients::policy::{PolicyBackend, PolicyFinal, PolicyOutcome, PolicyRequest, TurnMessage};
use crate::clients::tts::{TtsBackend, TtsOutcome};
use crate::events::OrchestratorEvent;
use crate::memory::Role;
use crate::registry::Health;
use crate::util::{unescape_html, unix_now};

/// Completed-segment table is pruned once it grows past this many entries.
const COMPLETED_SEGMENT_CAP: usize = 64;

/// Completed segments older than this are eligible for pruning.
const COMPLETED_SEGMENT_TTL_SECONDS: f64 = 300.0;

/// How many trailing memory turns ride along on a policy request.
const RECENT_TURN_WINDOW: usize = 6;

/// Dedup registry for ASR segment ids.
///
/// A segment id lives in `active` while its pipeline runs and moves to
/// `completed` afterwards; an id present in either set is a duplicate.
#[derive(Debug, Default)]
struct SegmentRegistry {
    active: HashSet<u64>,
    completed: HashMap<u64, f64>,
}

impl SegmentRegistry {
    /// Claim a segment for processing. Returns false for duplicates.
    fn register(&mut self, segment: u64) -> bool {
        if self.active.contains(&segment) || self.completed.contains_key(&segment) {
            return false;
        }
        self.active.insert(segment);
        true
    }

    fn complete(&mut self, segment: u64, now: f64) {
        self.active.remove(&segment);
        self.completed.insert(segment, now);
        self.prune(now);
    }

    fn prune(&mut self, now: f64) {
        if self.completed.len() <= COMPLETED_SEGMENT_CAP {
            return;
        }
        let cutoff = now - COMPLETED_SEGMENT_TTL_SECONDS;
        self.completed.retain(|_, ts| *ts >= cutoff);
    }
}

pub struct DecisionEngine {
    ctx: EngineContext,
    policy: Arc<dyn PolicyBackend>,
    tts: Arc<dyn TtsBackend>,
    segments: Mutex<SegmentRegistry>,
}

impl DecisionEngine {
    pub fn new(
        ctx: EngineContext,
        policy: Arc<dyn PolicyBackend>,
        tts: Arc<dyn TtsBackend>,
    ) -> Self {
        Self {
            ctx,
            policy,
            tts,
            segments: Mutex::new(SegmentRegistry::default()),
        }
    }

    /// Process a streaming transcription chunk.
    pub async fn handle_asr_partial(&self, segment: u64, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.register_segment(segment) {
            return;
        }
        self.run_policy_pipeline(text, !self.ctx.tts_muted(), false)
            .await;
        self.complete_segment(segment);
    }

    /// Process a final transcript and trigger the policy pipeline.
    ///
    /// The user turn is recorded before the dedup check; only the policy
    /// invocation is guarded per segment.
    pub async fn handle_asr_final(&self, segment: u64, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.ctx.record_turn(Role::User, text).await;
        if !self.register_segment(segment) {
            return;
        }
        self.run_policy_pipeline(text, !self.ctx.tts_muted(), true)
            .await;
        self.complete_segment(segment);
    }

    /// Entry point for manually injected user text (`/chat/respond`).
    pub async fn process_manual_prompt(
        &self,
        text: &str,
        synthesize: bool,
    ) -> Option<PolicyFinal> {
        let clean = text.trim();
        if clean.is_empty() {
            return None;
        }
        self.ctx.record_turn(Role::User, clean).await;
        self.run_policy_pipeline(clean, synthesize, true).await
    }

    async fn run_policy_pipeline(
        &self,
        text: &str,
        synthesize: bool,
        is_final: bool,
    ) -> Option<PolicyFinal> {
        let request = self.build_policy_request(text, is_final);
        let should_stream = synthesize && !self.ctx.tts_muted();
        let mut session =
            StreamingReplySession::new(self.ctx.clone(), self.tts.clone(), should_stream);
        session.start();

        let started = Instant::now();
        let outcome = self.policy.invoke(request, &mut session).await;
        session.close().await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.ctx.metrics.observe_latency("policy", latency_ms / 1000.0);

        let payload = match outcome {
            PolicyOutcome::Final(payload) => payload,
            PolicyOutcome::Unavailable => {
                self.ctx
                    .mark_module_latency("policy_worker", latency_ms, Some(Health::Offline));
                tracing::warn!("Policy worker returned no final payload for request");
                self.ctx.metrics.record_failure("policy");
                return None;
            }
        };

        match payload.status().as_deref() {
            Some("busy") => {
                self.ctx
                    .mark_module_latency("policy_worker", latency_ms, Some(Health::Degraded));
                tracing::warn!("Policy worker busy; deferring response");
                return None;
            }
            Some("error") => {
                self.ctx
                    .mark_module_latency("policy_worker", latency_ms, Some(Health::Offline));
                self.ctx.metrics.record_failure("policy");
            }
            _ => {
                self.ctx
                    .mark_module_latency("policy_worker", latency_ms, Some(Health::Online));
            }
        }

        self.ctx
            .dispatcher()
            .publish(OrchestratorEvent::PolicyFinal {
                payload: payload.clone(),
            })
            .await;

        let mut speech = extract_speech(&payload.content);
        if speech.is_empty() {
            speech = payload.content.trim().to_string();
        }
        if speech.is_empty() {
            return Some(payload);
        }

        if !should_stream {
            self.ctx.record_turn(Role::Assistant, &speech).await;
            return Some(payload);
        }

        let mut voice_hint = session.voice_hint().or_else(|| payload.meta.voice.clone());

        if session.requires_fallback() {
            // Streaming produced zero chunks; synthesise the whole reply once.
            let tts_started = Instant::now();
            let outcome = self
                .tts
                .synthesize(&speech, voice_hint.as_deref(), payload.request_id.as_deref())
                .await;
            let tts_latency_ms = tts_started.elapsed().as_secs_f64() * 1000.0;
            self.ctx
                .metrics
                .observe_latency("tts", tts_latency_ms / 1000.0);
            match outcome {
                TtsOutcome::Busy => {
                    self.ctx
                        .mark_module_latency("tts_worker", tts_latency_ms, Some(Health::Degraded));
                    tracing::warn!("TTS worker busy; skipping synthesis for now");
                    return Some(payload);
                }
                TtsOutcome::Synthesized(audio) => {
                    self.ctx
                        .mark_module_latency("tts_worker", tts_latency_ms, Some(Health::Online));
                    if !audio.voice.is_empty() {
                        voice_hint = Some(audio.voice.clone());
                    }
                    self.ctx
                        .dispatcher()
                        .publish(OrchestratorEvent::TtsGenerated { payload: audio })
                        .await;
                }
                TtsOutcome::Failed => {
                    self.ctx
                        .mark_module_latency("tts_worker", tts_latency_ms, Some(Health::Offline));
                    self.ctx.metrics.record_failure("tts");
                }
            }
        }

        self.ctx.record_tts(&speech, voice_hint).await;
        Some(payload)
    }

    fn build_policy_request(&self, text: &str, is_final: bool) -> PolicyRequest {
        let view = self.ctx.persona_view();
        let recent_turns = self
            .ctx
            .memory
            .recent_turns(RECENT_TURN_WINDOW)
            .into_iter()
            .map(|turn| TurnMessage {
                role: turn.role.to_string(),
                content: turn.text,
            })
            .collect();
        PolicyRequest {
            text: text.to_string(),
            is_final,
            persona_style: view.persona.style.clone(),
            chaos_level: view.persona.chaos_level,
            energy: view.persona.energy,
            family_friendly: view.persona.family_mode,
            persona_prompt: self.ctx.preset_prompt(&view.active_preset),
            memory_summary: self
                .ctx
                .memory
                .current_summary()
                .map(|summary| summary.summary_text),
            recent_turns,
        }
    }

    fn register_segment(&self, segment: u64) -> bool {
        self.segments
            .lock()
            .expect("segment lock poisoned")
            .register(segment)
    }

    fn complete_segment(&self, segment: u64) {
        self.segments
            .lock()
            .expect("segment lock poisoned")
            .complete(segment, unix_now());
    }
}

fn speech_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?is)<speech>(.*?)</speech>").expect("static pattern"))
}

/// Pull the spoken part out of a policy reply.
///
/// Returns the HTML-unescaped, trimmed capture of `<speech>…</speech>`, or
/// an empty string when the tag is absent.
pub(crate) fn extract_speech(content: &str) -> String {
    match speech_pattern().captures(content) {
        Some(captures) => {
            let raw = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            unescape_html(raw).trim().to_string()
        }
        None => String::new(),
    }
}
