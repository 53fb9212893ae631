//! Heuristic conversation summarizer.
//!
//! Stands in until an LLM summarizer is plugged in behind the same
//! signature: it condenses the tail of the buffer into a short text and
//! estimates mood/energy knobs from punctuation intensity.

use serde_json::json;

use super::MemoryTurn;
use crate::memory::store::MemorySummary;
use crate::util::{truncate_chars, unix_now};

/// Number of trailing turns folded into the summary text.
const SUMMARY_TAIL_TURNS: usize = 6;

/// Maximum characters kept in the summary text.
const SUMMARY_MAX_CHARS: usize = 400;

#[derive(Debug, Default)]
pub struct Summarizer;

impl Summarizer {
    pub fn summarize(&self, turns: &[MemoryTurn]) -> MemorySummary {
        let tail_start = turns.len().saturating_sub(SUMMARY_TAIL_TURNS);
        let joined = turns[tail_start..]
            .iter()
            .map(|turn| turn.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let exclamations: usize = turns
            .iter()
            .map(|turn| turn.text.matches('!').count())
            .sum();
        let chaos_ratio = exclamations as f64 / turns.len().max(1) as f64;
        let mood_state = if chaos_ratio > 0.6 {
            "chaotic"
        } else {
            "cheerful"
        };
        let energy = (0.3 + chaos_ratio).min(1.0);

        let summary_text = if joined.is_empty() {
            "Awaiting first turns.".to_string()
        } else {
            truncate_chars(&joined, SUMMARY_MAX_CHARS).to_string()
        };

        MemorySummary {
            id: None,
            summary_text,
            mood_state: mood_state.into(),
            metadata: json!({
                "chaos": (chaos_ratio * 100.0).round() / 100.0,
                "energy": (energy * 100.0).round() / 100.0,
            }),
            ts: unix_now(),
        }
    }
}
