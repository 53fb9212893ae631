//! Persona state and named presets.
//!
//! A persona is the tunable voice of the character: a style tag plus chaos
//! and energy knobs and a family-friendly flag. Presets bundle persona
//! defaults with an optional system prompt and can be applied atomically at
//! runtime; any manual field tweak outside a preset flips the active preset
//! name to `custom`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::util::unix_now;

/// Live persona values, included in every status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaState {
    pub style: String,
    pub chaos_level: f64,
    pub energy: f64,
    pub family_mode: bool,
    pub last_updated: f64,
}

impl PersonaState {
    pub fn from_preset(preset: &PersonaPreset) -> Self {
        Self {
            style: preset.style.clone(),
            chaos_level: preset.chaos_level,
            energy: preset.energy,
            family_mode: preset.family_mode,
            last_updated: unix_now(),
        }
    }

    /// Apply the populated fields of an update command.
    pub fn apply(&mut self, update: &PersonaUpdate) {
        if let Some(style) = &update.style {
            self.style = style.clone();
        }
        if let Some(chaos) = update.chaos_level {
            self.chaos_level = chaos;
        }
        if let Some(energy) = update.energy {
            self.energy = energy;
        }
        if let Some(family_mode) = update.family_mode {
            self.family_mode = family_mode;
        }
        self.last_updated = unix_now();
    }
}

/// Named persona configuration applied atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaPreset {
    pub style: String,
    pub chaos_level: f64,
    pub energy: f64,
    pub family_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for PersonaPreset {
    fn default() -> Self {
        Self {
            style: "kawaii".into(),
            chaos_level: 0.2,
            energy: 0.5,
            family_mode: true,
            system_prompt: None,
        }
    }
}

/// Ingress command for persona changes.
///
/// When `preset` is set the named preset is applied instead; otherwise any
/// populated scalar field marks the persona as `custom`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersonaUpdate {
    pub style: Option<String>,
    pub chaos_level: Option<f64>,
    pub energy: Option<f64>,
    pub family_mode: Option<bool>,
    pub preset: Option<String>,
    /// Optional system turn appended to memory alongside the update.
    pub system_message: Option<String>,
}

impl PersonaUpdate {
    pub fn from_preset(preset: &PersonaPreset) -> Self {
        Self {
            style: Some(preset.style.clone()),
            chaos_level: Some(preset.chaos_level),
            energy: Some(preset.energy),
            family_mode: Some(preset.family_mode),
            preset: None,
            system_message: None,
        }
    }

    /// True when any scalar persona field was supplied.
    pub fn touches_persona(&self) -> bool {
        self.style.is_some()
            || self.chaos_level.is_some()
            || self.energy.is_some()
            || self.family_mode.is_some()
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [("chaos_level", self.chaos_level), ("energy", self.energy)] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    return Err(format!("{name} must be within [0, 1]"));
                }
            }
        }
        Ok(())
    }
}

/// Immutable preset table built at startup.
#[derive(Debug)]
pub struct PresetCatalog {
    presets: HashMap<String, PersonaPreset>,
    available: Vec<String>,
    default: String,
}

impl PresetCatalog {
    /// Build the catalog, falling back to a lone `default` preset when the
    /// configured default is missing from an empty table.
    pub fn new(mut presets: HashMap<String, PersonaPreset>, default_preset: &str) -> Self {
        let mut default = default_preset.to_string();
        if !presets.contains_key(&default) {
            let mut available: Vec<String> = presets.keys().cloned().collect();
            available.sort();
            match available.first() {
                Some(first) => default = first.clone(),
                None => {
                    presets.insert("default".into(), PersonaPreset::default());
                    default = "default".into();
                }
            }
        }
        let mut available: Vec<String> = presets.keys().cloned().collect();
        available.sort();
        Self {
            presets,
            available,
            default,
        }
    }

    pub fn get(&self, name: &str) -> Option<&PersonaPreset> {
        self.presets.get(name)
    }

    pub fn available(&self) -> &[String] {
        &self.available
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn default_preset(&self) -> &PersonaPreset {
        &self.presets[&self.default]
    }

    /// System prompt attached to a preset, when one is configured.
    pub fn prompt_for(&self, name: &str) -> Option<&str> {
        self.presets
            .get(name)
            .and_then(|preset| preset.system_prompt.as_deref())
            .filter(|prompt| !prompt.is_empty())
    }
}

/// Built-in presets; configuration may extend or override them.
pub fn default_presets() -> HashMap<String, PersonaPreset> {
    let mut presets = HashMap::new();
    presets.insert("default".into(), PersonaPreset::default());
    presets.insert(
        "cozy".into(),
        PersonaPreset {
            style: "calm".into(),
            chaos_level: 0.15,
            energy: 0.35,
            family_mode: true,
            system_prompt: None,
        },
    );
    presets.insert(
        "hype".into(),
        PersonaPreset {
            style: "chaotic".into(),
            chaos_level: 0.75,
            energy: 0.85,
            family_mode: true,
            system_prompt: None,
        },
    );
    presets
}
