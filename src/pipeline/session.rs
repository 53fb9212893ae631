//! Streaming reply session: token stream in, ordered TTS chunks out.
//!
//! A session lives for exactly one policy invocation. Incoming tokens are
//! buffered until a sentence boundary (or a hard length cap) produces a
//! synthesisable chunk; chunks flow through a bounded queue to a single
//! consumer task that calls the TTS worker strictly in order, so there is
//! never more than one synthesis in flight per session.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::EngineContext;
use crate::broker::EventDispatcher;
use crate::clients::tts::{TtsBackend, TtsOutcome};
use crate::events::{OrchestratorEvent, PipelineStage, TtsChunkPayload};
use crate::registry::Health;
use crate::util::round2;

/// Minimum stripped length before a sentence boundary triggers a flush.
pub const MIN_CHUNK_CHARS: usize = 60;

/// Hard cap; a flush is forced once the buffer reaches this many chars.
pub const MAX_CHUNK_CHARS: usize = 220;

/// Sentence terminators, Latin and CJK. A trailing `...` ends with `.` and
/// needs no separate case.
const SENTENCE_ENDINGS: [char; 7] = ['.', '!', '?', '…', '。', '！', '？'];

/// Depth of the chunk queue between the token loop and the TTS consumer.
const CHUNK_QUEUE_DEPTH: usize = 32;

/// Events fed into a session by the policy stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start { request_id: Option<String> },
    Token { token: String },
    /// Mid-stream retry wiped the previously accumulated tokens.
    Retry,
    /// Stream is complete; flush whatever is buffered.
    Final,
}

struct QueuedChunk {
    index: u64,
    text: String,
    request_id: String,
    base_request_id: Option<String>,
}

pub struct StreamingReplySession {
    ctx: EngineContext,
    dispatcher: EventDispatcher,
    tts: Arc<dyn TtsBackend>,
    synthesize: bool,
    queue: Option<mpsc::Sender<QueuedChunk>>,
    consumer: Option<JoinHandle<Option<String>>>,
    buffer: String,
    chunk_index: u64,
    chunk_count: u64,
    request_id: Option<String>,
    first_token_at: Option<Instant>,
    started_at: Instant,
    last_voice: Option<String>,
    closed: bool,
}

impl StreamingReplySession {
    pub fn new(ctx: EngineContext, tts: Arc<dyn TtsBackend>, synthesize: bool) -> Self {
        let dispatcher = ctx.dispatcher().clone();
        Self {
            ctx,
            dispatcher,
            tts,
            synthesize,
            queue: None,
            consumer: None,
            buffer: String::new(),
            chunk_index: 0,
            chunk_count: 0,
            request_id: None,
            first_token_at: None,
            started_at: Instant::now(),
            last_voice: None,
            closed: false,
        }
    }

    /// `streaming` or `text-only`, for metric payloads.
    pub fn mode(&self) -> &'static str {
        if self.synthesize {
            "streaming"
        } else {
            "text-only"
        }
    }

    /// Spawn the TTS consumer. A text-only session has no consumer and
    /// silently drops would-be chunks.
    pub fn start(&mut self) {
        if !self.synthesize {
            return;
        }
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        self.queue = Some(tx);
        self.consumer = Some(tokio::spawn(consume_queue(
            rx,
            self.tts.clone(),
            self.ctx.clone(),
            self.dispatcher.clone(),
            self.started_at,
        )));
    }

    pub async fn handle_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Start { request_id } => {
                if request_id.is_some() {
                    self.request_id = request_id;
                }
            }
            StreamEvent::Token { token } => self.handle_token(token).await,
            StreamEvent::Retry => self.buffer.clear(),
            StreamEvent::Final => self.flush_if_ready(true).await,
        }
    }

    /// True when streaming was requested but produced zero chunks; the
    /// engine then falls back to a single whole-text synthesis.
    pub fn requires_fallback(&self) -> bool {
        self.synthesize && self.chunk_count == 0
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Voice reported by the last successful chunk, available after close.
    pub fn voice_hint(&self) -> Option<String> {
        self.last_voice.clone()
    }

    /// Signal the consumer to drain, await it, and emit the end-to-end
    /// metric. Idempotent; in-flight synthesis is not interrupted.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Dropping the sender lets the consumer drain the queue and exit.
        self.queue = None;
        if let Some(consumer) = self.consumer.take() {
            match consumer.await {
                Ok(voice) => {
                    if voice.is_some() {
                        self.last_voice = voice;
                    }
                }
                Err(error) => tracing::warn!("TTS consumer task failed: {error}"),
            }
        }
        let total_ms = self.started_at.elapsed().as_secs_f64() * 1000.0;
        self.dispatcher
            .publish_pipeline_metric(
                PipelineStage::PolicyTotal,
                total_ms,
                self.request_id.clone(),
                self.mode(),
            )
            .await;
    }

    async fn handle_token(&mut self, token: String) {
        if token.is_empty() {
            return;
        }
        self.buffer.push_str(&token);
        if self.first_token_at.is_none() {
            let now = Instant::now();
            self.first_token_at = Some(now);
            let latency_ms = (now - self.started_at).as_secs_f64() * 1000.0;
            self.dispatcher
                .publish_pipeline_metric(
                    PipelineStage::PolicyFirstToken,
                    latency_ms,
                    self.request_id.clone(),
                    self.mode(),
                )
                .await;
        }
        self.flush_if_ready(false).await;
    }

    async fn flush_if_ready(&mut self, force: bool) {
        if self.buffer.is_empty() {
            return;
        }
        if force || self.should_flush() {
            let text = self.buffer.trim().to_string();
            self.buffer.clear();
            if !text.is_empty() {
                self.queue_chunk(text).await;
            }
        }
    }

    fn should_flush(&self) -> bool {
        if self.buffer.chars().count() >= MAX_CHUNK_CHARS {
            return true;
        }
        let stripped = self.buffer.trim_end();
        if stripped.chars().count() < MIN_CHUNK_CHARS {
            return false;
        }
        stripped
            .chars()
            .next_back()
            .is_some_and(|ch| SENTENCE_ENDINGS.contains(&ch))
    }

    async fn queue_chunk(&mut self, text: String) {
        if !self.synthesize {
            return;
        }
        let Some(queue) = &self.queue else {
            return;
        };
        let base = self.request_id.as_deref().unwrap_or("stream");
        let chunk = QueuedChunk {
            index: self.chunk_index,
            request_id: format!("{base}-chunk-{}", self.chunk_index),
            base_request_id: self.request_id.clone(),
            text,
        };
        if queue.send(chunk).await.is_err() {
            tracing::warn!("Chunk queue closed before the stream finished");
            return;
        }
        self.chunk_count += 1;
        self.chunk_index += 1;
    }
}

/// Single consumer: pulls chunks in index order and synthesises them one at
/// a time. Returns the voice of the last successful chunk.
async fn consume_queue(
    mut rx: mpsc::Receiver<QueuedChunk>,
    tts: Arc<dyn TtsBackend>,
    ctx: EngineContext,
    dispatcher: EventDispatcher,
    policy_started: Instant,
) -> Option<String> {
    let mut last_voice: Option<String> = None;
    let mut first_chunk_reported = false;

    while let Some(chunk) = rx.recv().await {
        let start = Instant::now();
        let outcome = tts
            .synthesize(&chunk.text, None, Some(&chunk.request_id))
            .await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            TtsOutcome::Synthesized(audio) => {
                ctx.mark_module_latency("tts_worker", latency_ms, Some(Health::Online));
                if !audio.voice.is_empty() {
                    last_voice = Some(audio.voice.clone());
                }
                dispatcher
                    .publish(OrchestratorEvent::TtsChunk {
                        payload: TtsChunkPayload {
                            index: chunk.index,
                            request_id: chunk.request_id,
                            audio_path: audio.audio_path,
                            voice: audio.voice,
                            latency_ms: round2(latency_ms),
                            text_length: chunk.text.chars().count(),
                            mode: "streaming".into(),
                        },
                    })
                    .await;
                if !first_chunk_reported {
                    first_chunk_reported = true;
                    let since_start = policy_started.elapsed().as_secs_f64() * 1000.0;
                    dispatcher
                        .publish_pipeline_metric(
                            PipelineStage::TtsFirstChunk,
                            since_start,
                            chunk.base_request_id,
                            "streaming",
                        )
                        .await;
                }
            }
            TtsOutcome::Busy => {
                tracing::warn!("TTS worker busy; dropping chunk {}", chunk.index);
                ctx.mark_module_latency("tts_worker", latency_ms, Some(Health::Degraded));
            }
            TtsOutcome::Failed => {
                tracing::warn!("TTS chunk {} generation failed", chunk.index);
                ctx.mark_module_latency("tts_worker", latency_ms, Some(Health::Offline));
            }
        }
    }
    last_voice
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testutil;

    /// Scripted TTS backend that records every request it sees.
    struct RecordingTts {
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingTts {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl TtsBackend for RecordingTts {
        async fn synthesize(
            &self,
            text: &str,
            _voice: Option<&str>,
            _request_id: Option<&str>,
        ) -> TtsOutcome {
            self.calls.lock().unwrap().push(text.to_string());
            TtsOutcome::Synthesized(crate::clients::tts::TtsAudio {
                audio_path: "/tmp/chunk.wav".into(),
                voice: "aria".into(),
                latency_ms: 5.0,
                visemes: Vec::new(),
                cached: false,
            })
        }
    }

    async fn feed(session: &mut StreamingReplySession, tokens: &[&str]) {
        session
            .handle_event(StreamEvent::Start {
                request_id: Some("req-1".into()),
            })
            .await;
        for token in tokens {
            session
                .handle_event(StreamEvent::Token {
                    token: token.to_string(),
                })
                .await;
        }
        session.handle_event(StreamEvent::Final).await;
    }

    fn drain_events(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<OrchestratorEvent>,
    ) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn sentences_flush_in_order_with_increasing_indices() {
        let (ctx, broker) = testutil::context();
        let (_token, mut rx) = broker.subscribe();
        let tts = RecordingTts::new();
        let mut session = StreamingReplySession::new(ctx, tts.clone(), true);
        session.start();

        let long_sentence =
            "This opening sentence easily clears the sixty character minimum for a flush. ";
        feed(
            &mut session,
            &[long_sentence, long_sentence, "And a short tail."],
        )
        .await;
        session.close().await;

        let calls = tts.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);

        let events = drain_events(&mut rx);
        let indices: Vec<u64> = events
            .iter()
            .filter_map(|event| match event {
                OrchestratorEvent::TtsChunk { payload } => Some(payload.index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let chunk_ids: Vec<String> = events
            .iter()
            .filter_map(|event| match event {
                OrchestratorEvent::TtsChunk { payload } => Some(payload.request_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(chunk_ids[0], "req-1-chunk-0");
        assert_eq!(chunk_ids[2], "req-1-chunk-2");
    }

    #[tokio::test]
    async fn short_text_is_flushed_only_on_final() {
        let (ctx, broker) = testutil::context();
        let _keepalive = broker.clone();
        let tts = RecordingTts::new();
        let mut session = StreamingReplySession::new(ctx, tts.clone(), true);
        session.start();

        feed(&mut session, &["Sure", " thing!", " Short and sweet."]).await;
        session.close().await;

        // Below MIN_CHUNK_CHARS until the final flush, so exactly one chunk.
        assert_eq!(tts.calls.lock().unwrap().len(), 1);
        assert_eq!(session.chunk_count(), 1);
        assert!(!session.requires_fallback());
    }

    #[tokio::test]
    async fn max_chars_forces_a_flush_without_a_terminator() {
        let (ctx, _broker) = testutil::context();
        let tts = RecordingTts::new();
        let mut session = StreamingReplySession::new(ctx, tts.clone(), true);
        session.start();

        // Fifty 5-char tokens with no terminator anywhere: the 44th token
        // reaches 220 buffered chars and forces a flush; the remaining six
        // only leave on the final flush.
        let tokens: Vec<&str> = std::iter::repeat("word ").take(50).collect();
        feed(&mut session, &tokens).await;
        session.close().await;

        let calls = tts.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2, "expected a forced flush plus residue");
        assert!(calls[0].chars().count() >= 200);
        assert!(calls[0].chars().count() <= MAX_CHUNK_CHARS);
        assert!(!calls[0].ends_with('.'));
    }

    #[tokio::test]
    async fn retry_discards_buffer_but_keeps_the_counter() {
        let (ctx, _broker) = testutil::context();
        let tts = RecordingTts::new();
        let mut session = StreamingReplySession::new(ctx, tts.clone(), true);
        session.start();

        let sentence =
            "A first sentence that is comfortably longer than the minimum chunk size, yes. ";
        session
            .handle_event(StreamEvent::Token {
                token: sentence.to_string(),
            })
            .await;
        session.handle_event(StreamEvent::Retry).await;
        session
            .handle_event(StreamEvent::Token {
                token: "Recovered tail.".to_string(),
            })
            .await;
        session.handle_event(StreamEvent::Final).await;
        session.close().await;

        let calls = tts.calls.lock().unwrap().clone();
        // One chunk before the retry, one after: indices must keep growing.
        assert_eq!(calls, vec![sentence.trim(), "Recovered tail."]);
        assert_eq!(session.chunk_count(), 2);
    }

    #[tokio::test]
    async fn text_only_session_never_synthesises() {
        let (ctx, broker) = testutil::context();
        let (_token, mut rx) = broker.subscribe();
        let tts = RecordingTts::new();
        let mut session = StreamingReplySession::new(ctx, tts.clone(), false);
        session.start();

        feed(&mut session, &["A fully formed sentence that would flush."]).await;
        session.close().await;

        assert!(tts.calls.lock().unwrap().is_empty());
        assert_eq!(session.chunk_count(), 0);
        assert!(!session.requires_fallback());
        assert_eq!(session.mode(), "text-only");

        // Close still reports the end-to-end metric in text-only mode.
        let metrics: Vec<_> = drain_events(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                OrchestratorEvent::PipelineMetric { payload } => Some(payload),
                _ => None,
            })
            .collect();
        assert!(metrics
            .iter()
            .any(|m| m.stage == PipelineStage::PolicyTotal && m.mode == "text-only"));
    }

    #[tokio::test]
    async fn stage_metrics_cover_first_token_first_chunk_and_total() {
        let (ctx, broker) = testutil::context();
        let (_token, mut rx) = broker.subscribe();
        let tts = RecordingTts::new();
        let mut session = StreamingReplySession::new(ctx, tts.clone(), true);
        session.start();

        feed(
            &mut session,
            &["A reply sentence long enough to flush before the stream finishes, good."],
        )
        .await;
        session.close().await;

        let stages: Vec<PipelineStage> = drain_events(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                OrchestratorEvent::PipelineMetric { payload } => Some(payload.stage),
                _ => None,
            })
            .collect();
        assert_eq!(
            stages,
            vec![
                PipelineStage::PolicyFirstToken,
                PipelineStage::TtsFirstChunk,
                PipelineStage::PolicyTotal,
            ]
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (ctx, broker) = testutil::context();
        let (_token, mut rx) = broker.subscribe();
        let tts = RecordingTts::new();
        let mut session = StreamingReplySession::new(ctx, tts, true);
        session.start();
        session.close().await;
        session.close().await;

        let totals = drain_events(&mut rx)
            .into_iter()
            .filter(|event| {
                matches!(
                    event,
                    OrchestratorEvent::PipelineMetric { payload }
                        if payload.stage == PipelineStage::PolicyTotal
                )
            })
            .count();
        assert_eq!(totals, 1);
    }
}
