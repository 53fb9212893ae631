//! Conversational memory: a bounded ring of turns with periodic
//! summarisation and optional restore-on-start.
//!
//! Every recorded turn lands in a fixed-capacity ring. Every N-th turn the
//! summarizer runs over the whole buffer and the result is persisted to the
//! summary store; the newest summary inside a restore window can be loaded
//! back at startup so the character keeps some context across restarts.

pub mod store;
pub mod summarizer;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use store::{MemorySummary, MemoryStore};
use summarizer::Summarizer;

use crate::util::unix_now;

/// Speaker role for one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        f.write_str(name)
    }
}

/// One recorded conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTurn {
    pub role: Role,
    pub text: String,
    pub ts: f64,
}

impl MemoryTurn {
    pub fn new(role: Role, text: &str) -> Self {
        Self {
            role,
            text: text.to_string(),
            ts: unix_now(),
        }
    }
}

/// Status-surface view of the memory subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub buffer_length: usize,
    pub summary_interval: usize,
    pub restore_enabled: bool,
    pub current_summary: Option<MemorySummary>,
}

struct MemoryInner {
    buffer: VecDeque<MemoryTurn>,
    turns_since_summary: usize,
    current_summary: Option<MemorySummary>,
    restore_enabled: bool,
}

pub struct MemoryController {
    inner: Mutex<MemoryInner>,
    store: MemoryStore,
    summarizer: Summarizer,
    capacity: usize,
    summary_interval: usize,
}

impl MemoryController {
    pub fn new(store: MemoryStore, capacity: usize, summary_interval: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                buffer: VecDeque::with_capacity(capacity),
                turns_since_summary: 0,
                current_summary: None,
                restore_enabled: false,
            }),
            store,
            summarizer: Summarizer,
            capacity,
            summary_interval: summary_interval.max(1),
        }
    }

    /// Initialise restore state and, when requested, load the newest summary
    /// within `max_age_seconds`.
    pub fn prepare(&self, restore: bool, max_age_seconds: f64) -> Result<Option<MemorySummary>> {
        let mut inner = self.inner.lock().expect("memory lock poisoned");
        inner.restore_enabled = restore;
        if !restore {
            return Ok(None);
        }
        let summary = self.store.load_latest(max_age_seconds)?;
        inner.current_summary = summary.clone();
        Ok(summary)
    }

    /// Append a turn. Returns the freshly persisted summary when this call
    /// crossed the summary interval.
    pub fn add_turn(&self, role: Role, text: &str) -> Result<Option<MemorySummary>> {
        let mut inner = self.inner.lock().expect("memory lock poisoned");
        if inner.buffer.len() >= self.capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(MemoryTurn::new(role, text));
        inner.turns_since_summary += 1;
        if inner.turns_since_summary < self.summary_interval {
            return Ok(None);
        }
        inner.turns_since_summary = 0;

        let turns: Vec<MemoryTurn> = inner.buffer.iter().cloned().collect();
        let summary = self.summarizer.summarize(&turns);
        let saved = self.store.save_summary(summary)?;
        inner.current_summary = Some(saved.clone());
        Ok(Some(saved))
    }

    /// The trailing `count` turns, oldest first.
    pub fn recent_turns(&self, count: usize) -> Vec<MemoryTurn> {
        let inner = self.inner.lock().expect("memory lock poisoned");
        let skip = inner.buffer.len().saturating_sub(count);
        inner.buffer.iter().skip(skip).cloned().collect()
    }

    pub fn current_summary(&self) -> Option<MemorySummary> {
        self.inner
            .lock()
            .expect("memory lock poisoned")
            .current_summary
            .clone()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.lock().expect("memory lock poisoned");
        MemorySnapshot {
            buffer_length: inner.buffer.len(),
            summary_interval: self.summary_interval,
            restore_enabled: inner.restore_enabled,
            current_summary: inner.current_summary.clone(),
        }
    }
}
