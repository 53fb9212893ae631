//! Configuration for the orchestrator and the process supervisor.
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (`$SUZU_CONFIG` or `~/.config/suzu/config.toml`)
//! 3. Built-in defaults (lowest priority)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::persona::{default_presets, PersonaPreset};
use crate::registry::default_roster;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Address the HTTP/WS surface binds to
    pub bind_addr: SocketAddr,

    /// Optional API key required on mutating routes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the policy (LLM) worker
    pub policy_url: String,

    /// Base URL of the TTS worker
    pub tts_url: String,

    /// Per-request timeout for policy streams
    pub policy_timeout_seconds: f64,

    /// Per-request timeout for TTS synthesis
    pub tts_timeout_seconds: f64,

    /// Optional telemetry ingest URL; events are forwarded best-effort
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_api_key: Option<String>,

    /// Default log level when RUST_LOG is unset
    pub log_level: String,

    /// Worker module roster tracked by the registry
    pub modules: Vec<String>,

    pub memory: MemoryConfig,
    pub persona: PersonaConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryConfig {
    /// SQLite file for conversation summaries
    pub db_path: PathBuf,
    /// Ring buffer capacity in turns
    pub buffer_size: usize,
    /// A summary is produced every this many recorded turns
    pub summary_interval: usize,
    /// Reload the newest summary at startup
    pub restore_context: bool,
    /// Maximum age of a summary eligible for restore
    pub restore_window_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonaConfig {
    pub default_preset: String,
    /// Effective preset table: built-ins merged with file-provided presets
    pub presets: HashMap<String, PersonaPreset>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SupervisorConfig {
    pub services: Vec<ServiceConfig>,
}

/// One managed child process, as configured.
///
/// The `require_*` fields compile into spawn predicates: the service is
/// skipped when a predicate declines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// argv; first element is the binary
    pub command: Vec<String>,
    #[serde(default = "default_true")]
    pub restart: bool,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_seconds: f64,
    /// Health probe URL; omit to disable probing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
    #[serde(default = "default_health_interval")]
    pub health_interval_seconds: f64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_seconds: f64,
    #[serde(default = "default_health_retries")]
    pub health_retries: u32,
    /// `host:port` that must be free before spawning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_port: Option<String>,
    /// Binary that must be on PATH
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_binary: Option<String>,
    /// URL that must accept a TCP connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_endpoint: Option<String>,
    /// Environment variables that must be set and non-empty
    #[serde(default)]
    pub require_env: Vec<String>,
    /// Extra environment for the child; kept last so the rendered TOML
    /// stays valid (tables follow plain values)
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}
fn default_restart_delay() -> f64 {
    5.0
}
fn default_health_interval() -> f64 {
    20.0
}
fn default_health_timeout() -> f64 {
    5.0
}
fn default_health_retries() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".parse().expect("static default addr"),
            api_key: None,
            policy_url: "http://127.0.0.1:8081".into(),
            tts_url: "http://127.0.0.1:8082".into(),
            policy_timeout_seconds: 30.0,
            tts_timeout_seconds: 60.0,
            telemetry_url: None,
            telemetry_api_key: None,
            log_level: "info".into(),
            modules: default_roster(),
            memory: MemoryConfig {
                db_path: PathBuf::from("data/memory.sqlite3"),
                buffer_size: 40,
                summary_interval: 6,
                restore_context: false,
                restore_window_seconds: 7200.0,
            },
            persona: PersonaConfig {
                default_preset: "default".into(),
                presets: default_presets(),
            },
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Resolve the config file path: `$SUZU_CONFIG` wins, otherwise the
    /// platform config directory.
    pub fn config_path() -> PathBuf {
        if let Some(path) = env_var("SUZU_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("suzu")
            .join("config.toml")
    }

    /// Load configuration from defaults, config file, and environment.
    pub fn load() -> Self {
        let mut config = Self::default();
        config.merge_file();
        config.merge_env();
        config
    }

    fn merge_file(&mut self) {
        let path = Self::config_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let file: FileConfig = match toml::from_str(&raw) {
            Ok(file) => file,
            Err(error) => {
                eprintln!("warning: ignoring malformed config {}: {error}", path.display());
                return;
            }
        };

        if let Some(bind) = file.bind {
            match bind.parse() {
                Ok(addr) => self.bind_addr = addr,
                Err(error) => eprintln!("warning: invalid bind address {bind}: {error}"),
            }
        }
        merge(&mut self.api_key, file.api_key.map(Some));
        merge(&mut self.policy_url, file.policy_url);
        merge(&mut self.tts_url, file.tts_url);
        merge(&mut self.policy_timeout_seconds, file.policy_timeout_seconds);
        merge(&mut self.tts_timeout_seconds, file.tts_timeout_seconds);
        merge(&mut self.telemetry_url, file.telemetry_url.map(Some));
        merge(&mut self.telemetry_api_key, file.telemetry_api_key.map(Some));
        merge(&mut self.log_level, file.log_level);
        merge(&mut self.modules, file.modules);

        if let Some(memory) = file.memory {
            merge(&mut self.memory.db_path, memory.db_path);
            merge(&mut self.memory.buffer_size, memory.buffer_size);
            merge(&mut self.memory.summary_interval, memory.summary_interval);
            merge(&mut self.memory.restore_context, memory.restore_context);
            merge(
                &mut self.memory.restore_window_seconds,
                memory.restore_window_seconds,
            );
        }
        if let Some(persona) = file.persona {
            merge(&mut self.persona.default_preset, persona.default_preset);
            if let Some(presets) = persona.presets {
                self.persona.presets.extend(presets);
            }
            if let Some(presets_file) = persona.presets_file {
                self.merge_preset_file(&presets_file);
            }
        }
        if let Some(supervisor) = file.supervisor {
            merge(&mut self.supervisor.services, supervisor.services);
        }
    }

    /// Merge presets from a standalone TOML file, skipping malformed
    /// entries so one bad preset does not take the table down.
    fn merge_preset_file(&mut self, path: &PathBuf) {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) => {
                eprintln!(
                    "warning: failed to read persona presets file {}: {error}",
                    path.display()
                );
                return;
            }
        };
        let table: HashMap<String, toml::Value> = match toml::from_str(&raw) {
            Ok(table) => table,
            Err(error) => {
                eprintln!(
                    "warning: malformed persona presets file {}: {error}",
                    path.display()
                );
                return;
            }
        };
        for (name, value) in table {
            match value.try_into::<PersonaPreset>() {
                Ok(preset) => {
                    self.persona.presets.insert(name, preset);
                }
                Err(error) => {
                    eprintln!("warning: invalid preset {name} in {}: {error}", path.display());
                }
            }
        }
    }

    fn merge_env(&mut self) {
        if let Some(bind) = env_var("SUZU_BIND") {
            match bind.parse() {
                Ok(addr) => self.bind_addr = addr,
                Err(error) => eprintln!("warning: invalid SUZU_BIND {bind}: {error}"),
            }
        }
        if let Some(value) = env_var("SUZU_API_KEY") {
            self.api_key = Some(value);
        }
        if let Some(value) = env_var("POLICY_URL") {
            self.policy_url = value;
        }
        if let Some(value) = env_var("TTS_URL") {
            self.tts_url = value;
        }
        if let Some(value) = env_var("TELEMETRY_URL") {
            self.telemetry_url = Some(value);
        }
        if let Some(value) = env_var("TELEMETRY_API_KEY") {
            self.telemetry_api_key = Some(value);
        }
        if let Some(value) = env_var("SUZU_LOG") {
            self.log_level = value;
        }
        if let Some(value) = env_var("MEMORY_DB_PATH") {
            self.memory.db_path = PathBuf::from(value);
        }
        if let Some(value) = env_var("MEMORY_RESTORE") {
            self.memory.restore_context = parse_bool(&value);
        }
    }

    /// Effective configuration rendered as TOML, for `config --show`.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_else(|error| format!("# render error: {error}"))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "y"
    )
}

fn merge<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File mirror structs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind: Option<String>,
    api_key: Option<String>,
    policy_url: Option<String>,
    tts_url: Option<String>,
    policy_timeout_seconds: Option<f64>,
    tts_timeout_seconds: Option<f64>,
    telemetry_url: Option<String>,
    telemetry_api_key: Option<String>,
    log_level: Option<String>,
    modules: Option<Vec<String>>,
    memory: Option<FileMemory>,
    persona: Option<FilePersona>,
    supervisor: Option<FileSupervisor>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMemory {
    db_path: Option<PathBuf>,
    buffer_size: Option<usize>,
    summary_interval: Option<usize>,
    restore_context: Option<bool>,
    restore_window_seconds: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePersona {
    default_preset: Option<String>,
    presets: Option<HashMap<String, PersonaPreset>>,
    presets_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSupervisor {
    services: Option<Vec<ServiceConfig>>,
}
