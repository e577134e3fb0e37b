//! Shared types used across the psim crates: configuration, session state, turn I/O.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;

/// Literal reply returned when a turn fails anywhere in the pipeline.
pub const SAFE_FALLBACK_REPLY: &str = "safe-fallback";

/// Therapist intent as classified by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    OpenQuestion,
    Clarify,
    RiskCheck,
    Rapport,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::OpenQuestion => "open_question",
            Intent::Clarify => "clarify",
            Intent::RiskCheck => "risk_check",
            Intent::Rapport => "rapport",
        }
    }

    /// Parses a stored intent marker; unknown markers yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open_question" => Some(Intent::OpenQuestion),
            "clarify" => Some(Intent::Clarify),
            "risk_check" => Some(Intent::RiskCheck),
            "rapport" => Some(Intent::Rapport),
            _ => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the safety gate: `none` or `acute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskStatus {
    #[default]
    None,
    Acute,
}

impl RiskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskStatus::None => "none",
            RiskStatus::Acute => "acute",
        }
    }
}

impl fmt::Display for RiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compact per-turn session state passed through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default = "default_affect")]
    pub affect: String,
    /// Trust in [0.0, 1.0]; gates gated fragments and trajectory steps.
    #[serde(default = "default_trust")]
    pub trust: f64,
    /// Fatigue in [0.0, 1.0].
    #[serde(default = "default_fatigue")]
    pub fatigue: f64,
    #[serde(default = "default_access_level")]
    pub access_level: i64,
    #[serde(default)]
    pub risk_status: RiskStatus,
    #[serde(default)]
    pub last_turn_summary: String,
}

fn default_affect() -> String {
    "neutral".to_string()
}

fn default_trust() -> f64 {
    0.3
}

fn default_fatigue() -> f64 {
    0.1
}

fn default_access_level() -> i64 {
    1
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            affect: default_affect(),
            trust: default_trust(),
            fatigue: default_fatigue(),
            access_level: default_access_level(),
            risk_status: RiskStatus::None,
            last_turn_summary: String::new(),
        }
    }
}

impl SessionState {
    pub fn with_trust(mut self, trust: f64) -> Self {
        self.trust = trust.clamp(0.0, 1.0);
        self
    }

    /// Applies reasoner deltas. Deltas are clamped before use and the resulting
    /// trust/fatigue stay within [0, 1].
    pub fn apply(&mut self, updates: &StateUpdates) {
        let clamped = updates.clamped();
        self.trust = (self.trust + clamped.trust_delta).clamp(0.0, 1.0);
        self.fatigue = (self.fatigue + clamped.fatigue_delta).clamp(0.0, 1.0);
    }
}

/// Trust/fatigue deltas proposed by a reasoner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StateUpdates {
    #[serde(default)]
    pub trust_delta: f64,
    #[serde(default)]
    pub fatigue_delta: f64,
}

impl StateUpdates {
    pub const TRUST_DELTA_RANGE: (f64, f64) = (-0.2, 0.2);
    pub const FATIGUE_DELTA_RANGE: (f64, f64) = (0.0, 0.2);

    /// Deltas clamped to their allowed ranges; non-finite values become 0.0.
    pub fn clamped(&self) -> Self {
        let clamp = |v: f64, (lo, hi): (f64, f64)| if v.is_finite() { v.clamp(lo, hi) } else { 0.0 };
        Self {
            trust_delta: clamp(self.trust_delta, Self::TRUST_DELTA_RANGE),
            fatigue_delta: clamp(self.fatigue_delta, Self::FATIGUE_DELTA_RANGE),
        }
    }
}

/// Delivery style for the patient reply. Unknown keys are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleDirectives {
    #[serde(default = "default_tempo")]
    pub tempo: String,
    #[serde(default = "default_length")]
    pub length: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub(crate) fn default_tempo() -> String {
    "medium".to_string()
}

pub(crate) fn default_length() -> String {
    "short".to_string()
}

impl Default for StyleDirectives {
    fn default() -> Self {
        Self {
            tempo: default_tempo(),
            length: default_length(),
            extra: Map::new(),
        }
    }
}

impl StyleDirectives {
    pub fn new(tempo: impl Into<String>, length: impl Into<String>) -> Self {
        Self {
            tempo: tempo.into(),
            length: length.into(),
            extra: Map::new(),
        }
    }
}

/// One therapist turn submitted by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub therapist_utterance: String,
    #[serde(default)]
    pub session_state: SessionState,
    pub case_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

/// Patient reply plus telemetry returned for every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResponse {
    pub patient_reply: String,
    pub state_updates: Map<String, Value>,
    pub used_fragments: Vec<String>,
    pub risk_status: RiskStatus,
    pub eval_markers: Map<String, Value>,
}

impl TurnResponse {
    /// Terminal failure shape: structurally valid, carries no state change.
    pub fn safe_fallback() -> Self {
        Self {
            patient_reply: SAFE_FALLBACK_REPLY.to_string(),
            state_updates: Map::new(),
            used_fragments: Vec::new(),
            risk_status: RiskStatus::None,
            eval_markers: Map::new(),
        }
    }

    pub fn is_safe_fallback(&self) -> bool {
        self.patient_reply == SAFE_FALLBACK_REPLY
    }

    /// Reads the applied deltas back out of `state_updates`.
    pub fn deltas(&self) -> StateUpdates {
        let read = |key: &str| self.state_updates.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        StateUpdates {
            trust_delta: read("trust_delta"),
            fatigue_delta: read("fatigue_delta"),
        }
    }
}

/// Chat-completion endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub reasoning_model: String,
    pub base_model: String,
    /// Per-request timeout; a slow model falls back instead of blocking the turn.
    pub timeout_secs: f64,
    pub max_attempts: u32,
}

/// Embedding provider settings (`mode` is `hashing` or `http`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    pub mode: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub dimensions: usize,
    pub batch_size: usize,
}

/// Global application configuration. Load from TOML or env.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub app_name: String,
    /// Base directory for the sled store.
    pub storage_path: String,
    /// Start in vector retrieval mode instead of metadata filtering.
    pub rag_use_vector: bool,
    pub rag_top_k: usize,
    /// Probability of appending one off-topic public fragment in metadata mode.
    pub noise_probability: f64,
    pub use_llm_reason: bool,
    pub use_llm_gen: bool,
    /// Directory holding `reasoning.prompt.txt` and `generation.prompt.txt`.
    pub prompts_dir: String,
    pub llm: LlmSettings,
    pub embedding: EmbeddingSettings,
}

impl CoreConfig {
    /// Load config from file and environment. Precedence: env `PSIM__*` > `PSIM_CONFIG` path
    /// (or `config/psim.toml`) > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path = std::env::var("PSIM_CONFIG").unwrap_or_else(|_| "config/psim.toml".to_string());
        let builder = Self::defaults()?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("PSIM").separator("__"))
            .build()?;

        built.try_deserialize()
    }

    /// Built-in defaults only (no file, no environment).
    pub fn default_values() -> Result<Self, config::ConfigError> {
        Self::defaults()?.build()?.try_deserialize()
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("app_name", "Patient Simulator")?
            .set_default("storage_path", "./data")?
            .set_default("rag_use_vector", false)?
            .set_default("rag_top_k", 3_i64)?
            .set_default("noise_probability", 0.2)?
            .set_default("use_llm_reason", false)?
            .set_default("use_llm_gen", false)?
            .set_default("prompts_dir", "prompts")?
            .set_default("llm.base_url", "https://api.deepseek.com/v1")?
            .set_default("llm.reasoning_model", "deepseek-chat")?
            .set_default("llm.base_model", "deepseek-chat")?
            .set_default("llm.timeout_secs", 6.0)?
            .set_default("llm.max_attempts", 3_i64)?
            .set_default("embedding.mode", "hashing")?
            .set_default("embedding.dimensions", 256_i64)?
            .set_default("embedding.batch_size", 128_i64)
    }
}
