//! Engine configuration.
//!
//! Everything the orchestration core consumes from its collaborators: backend
//! preference, model locations, prompt shape, sequence limits, inference
//! defaults, timeouts and accelerator retry policy. All fields default, so an
//! empty TOML document is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::prompting::{PromptFamily, PromptTemplates, StreamFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    Cpu,
    #[default]
    #[serde(alias = "mtk", alias = "npu")]
    Accelerator,
}

/// When the accelerator attempt counter goes back to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryReset {
    /// Every `initialize()` starts with a fresh attempt budget.
    #[default]
    Initialize,
    /// Only releasing a live accelerator handle refills the budget.
    Release,
}

/// Per-request sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.2,
            top_k: 5,
            top_p: 0.9,
            repetition_penalty: 1.2,
            frequency_penalty: 1.2,
        }
    }
}

pub const MAX_TOKENS_RANGE: (usize, usize) = (128, 4096);

impl InferenceParams {
    pub fn validate(&self) -> Result<()> {
        let (min_tokens, max_tokens) = MAX_TOKENS_RANGE;
        if !(min_tokens..=max_tokens).contains(&self.max_tokens) {
            return Err(EngineError::InvalidParams(format!(
                "max_tokens must be in [{}, {}]",
                min_tokens, max_tokens
            )));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(EngineError::InvalidParams(
                "temperature must be in [0.0, 1.0]".to_string(),
            ));
        }
        if self.top_k == 0 {
            return Err(EngineError::InvalidParams("top_k must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(EngineError::InvalidParams(
                "top_p must be in [0.0, 1.0]".to_string(),
            ));
        }
        if !(1.0..=2.0).contains(&self.repetition_penalty) {
            return Err(EngineError::InvalidParams(
                "repetition_penalty must be in [1.0, 2.0]".to_string(),
            ));
        }
        if !(1.0..=2.0).contains(&self.frequency_penalty) {
            return Err(EngineError::InvalidParams(
                "frequency_penalty must be in [1.0, 2.0]".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies `key=value` pairs separated by `,` or `;` on top of `self`.
    pub fn apply_overrides(&self, payload: &str) -> Result<Self> {
        if payload.trim().is_empty() {
            return Err(EngineError::InvalidParams(
                "override payload is empty. Use key=value pairs.".to_string(),
            ));
        }

        let mut params = *self;

        for pair in payload.split([',', ';']) {
            let item = pair.trim();
            if item.is_empty() {
                continue;
            }

            let mut it = item.splitn(2, '=');
            let key = it.next().unwrap_or("").trim().to_lowercase();
            let value = it
                .next()
                .ok_or_else(|| {
                    EngineError::InvalidParams(format!("Invalid item '{}'. Expected key=value", item))
                })?
                .trim();

            match key.as_str() {
                "max_tokens" | "max_token" => params.max_tokens = parse_value(&key, value)?,
                "temperature" | "temp" => params.temperature = parse_value(&key, value)?,
                "top_k" | "topk" => params.top_k = parse_value(&key, value)?,
                "top_p" | "topp" => params.top_p = parse_value(&key, value)?,
                "repetition_penalty" | "repeat_penalty" => {
                    params.repetition_penalty = parse_value(&key, value)?
                }
                "frequency_penalty" => params.frequency_penalty = parse_value(&key, value)?,
                _ => {
                    return Err(EngineError::InvalidParams(format!(
                        "Unknown parameter '{}'.",
                        key
                    )))
                }
            }
        }

        params.validate()?;
        Ok(params)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| EngineError::InvalidParams(format!("Invalid {} '{}'.", key, value)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub family: PromptFamily,
    pub system_prompt: String,
    /// History window, in turns.
    pub history_lookback: usize,
    pub templates: Option<PromptTemplates>,
    pub stop_tokens: Option<Vec<String>>,
    pub assistant_markers: Option<Vec<String>>,
    pub require_assistant_marker: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            family: PromptFamily::Llama,
            system_prompt: "You are a language model with knowledge of Taiwan. Please answer the following questions in Traditional Chinese or English.".to_string(),
            history_lookback: 500,
            templates: None,
            stop_tokens: None,
            assistant_markers: None,
            require_assistant_marker: false,
        }
    }
}

impl PromptConfig {
    pub fn templates(&self) -> PromptTemplates {
        self.templates
            .clone()
            .unwrap_or_else(|| PromptTemplates::defaults_for(self.family))
    }

    pub fn stream_filter(&self) -> StreamFilter {
        let mut filter = StreamFilter::for_family(self.family);
        if let Some(stops) = &self.stop_tokens {
            filter.stop_tokens = stops.clone();
        }
        if let Some(markers) = &self.assistant_markers {
            filter.assistant_markers = markers.clone();
        }
        filter.require_assistant_marker = self.require_assistant_marker;
        filter
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceLimits {
    pub max_seq_len: usize,
    pub min_output_len: usize,
}

impl Default for SequenceLimits {
    fn default() -> Self {
        Self {
            max_seq_len: 4096,
            min_output_len: 1024,
        }
    }
}

impl SequenceLimits {
    pub fn max_input_tokens(&self) -> usize {
        self.max_seq_len.saturating_sub(self.min_output_len)
    }

    /// Sequence length handed to the CPU backend for `prompt`.
    pub fn budget_for(&self, prompt: &str) -> usize {
        self.max_seq_len
            .min(prompt.chars().count() + self.min_output_len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub init_ms: u64,
    pub load_ms: u64,
    pub cleanup_ms: u64,
    pub backend_init_delay_ms: u64,
    pub stop_grace_ms: u64,
    pub native_settle_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            init_ms: 300_000,
            load_ms: 300_000,
            cleanup_ms: 5_000,
            backend_init_delay_ms: 200,
            stop_grace_ms: 100,
            native_settle_ms: 100,
        }
    }
}

impl Timeouts {
    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }

    pub fn load(&self) -> Duration {
        Duration::from_millis(self.load_ms)
    }

    pub fn cleanup(&self) -> Duration {
        Duration::from_millis(self.cleanup_ms)
    }

    pub fn backend_init_delay(&self) -> Duration {
        Duration::from_millis(self.backend_init_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn native_settle(&self) -> Duration {
        Duration::from_millis(self.native_settle_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorPolicy {
    pub max_attempts: u32,
    pub retry_reset: RetryReset,
    pub cpu_fallback: bool,
    pub swap_token_size: usize,
}

impl Default for AcceleratorPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_reset: RetryReset::Initialize,
            cpu_fallback: true,
            swap_token_size: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub cpuinfo_path: PathBuf,
    pub accelerator_chipsets: Vec<String>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            cpuinfo_path: PathBuf::from("/proc/cpuinfo"),
            accelerator_chipsets: vec!["mt6991".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub preferred_backend: BackendPreference,
    pub model_path: Option<PathBuf>,
    pub tokenizer_path: Option<PathBuf>,
    pub accelerator_config_path: Option<PathBuf>,
    pub preload_shared_weights: bool,
    pub prompt: PromptConfig,
    pub sequence: SequenceLimits,
    pub inference: InferenceParams,
    pub timeouts: Timeouts,
    pub accelerator: AcceleratorPolicy,
    pub hardware: HardwareConfig,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sequence.min_output_len >= self.sequence.max_seq_len {
            return Err(EngineError::Config(format!(
                "sequence.min_output_len ({}) must be below sequence.max_seq_len ({})",
                self.sequence.min_output_len, self.sequence.max_seq_len
            )));
        }
        if self.accelerator.max_attempts == 0 {
            return Err(EngineError::Config(
                "accelerator.max_attempts must be > 0".to_string(),
            ));
        }
        self.inference
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))
    }
}
