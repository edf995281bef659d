//! CPU backend on top of candle's quantized GGUF models.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;
use tokenizers::Tokenizer;

use super::stream_decoder::{PieceDecoder, StreamDecoder};
use super::{resolve_tokenizer_path, CpuBackend, CpuModule, TokenFlow, TokenSink};
use crate::config::InferenceParams;
use crate::error::NativeError;
use crate::prompting::{default_stop_tokens, PromptFamily};

pub const LOAD_OK: i32 = 0;
pub const LOAD_MODEL_FAILED: i32 = 1;
pub const LOAD_TOKENIZER_MISSING: i32 = 2;
pub const LOAD_TOKENIZER_FAILED: i32 = 3;

const REPEAT_LAST_N: usize = 64;
const SAMPLING_SEED: u64 = 299792458;

pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    pub fn load_from_gguf(path: &Path, family: PromptFamily, device: &Device) -> Result<Self> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| E::msg(format!("Failed to open model file {}: {}", path.display(), e)))?;
        let content = gguf_file::Content::read(&mut file)?;

        match family {
            PromptFamily::Llama => {
                let model = quantized_llama::ModelWeights::from_gguf(content, &mut file, device)?;
                Ok(Self::Llama(model))
            }
            PromptFamily::Qwen => {
                match quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device) {
                    Ok(model) => Ok(Self::Qwen2(model)),
                    Err(e) => {
                        let msg = format!("{}", e);
                        if msg.contains("cannot find tensor info for output_norm.weight") {
                            Err(E::msg(
                                "Qwen load failed: missing 'output_norm.weight'. The GGUF is likely an incomplete split shard. Use a full single-file GGUF.",
                            ))
                        } else {
                            Err(E::msg(msg))
                        }
                    }
                }
            }
            PromptFamily::Mistral | PromptFamily::Unknown => Err(E::msg(format!(
                "no CPU runtime for model family {:?}",
                family
            ))),
        }
    }

    pub fn forward(&mut self, input_tensor: &Tensor, position: usize) -> Result<Tensor> {
        match self {
            Self::Llama(model) => Ok(model.forward(input_tensor, position)?),
            Self::Qwen2(model) => Ok(model.forward(input_tensor, position)?),
        }
    }
}

/// Sampling knobs of one CPU request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSampling {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
    pub seed: u64,
}

impl CpuSampling {
    pub fn from_params(params: &InferenceParams) -> Self {
        Self {
            temperature: params.temperature,
            top_k: params.top_k,
            top_p: params.top_p,
            repetition_penalty: params.repetition_penalty,
            frequency_penalty: params.frequency_penalty,
            seed: SAMPLING_SEED,
        }
    }

    fn sampling(&self) -> Sampling {
        if self.temperature <= 0.0 {
            Sampling::ArgMax
        } else {
            Sampling::TopKThenTopP {
                k: self.top_k,
                p: self.top_p as f64,
                temperature: self.temperature as f64,
            }
        }
    }
}

/// Scales the logit of every already generated token by
/// `1 + (penalty - 1) * count`: positive logits are divided, negative ones
/// multiplied. A penalty of `1.0` leaves the logits untouched.
pub fn apply_frequency_penalty(
    logits: &Tensor,
    penalty: f32,
    generated: &[u32],
) -> candle_core::Result<Tensor> {
    if penalty == 1.0 || generated.is_empty() {
        return Ok(logits.clone());
    }

    let mut counts: HashMap<u32, u32> = HashMap::new();
    for &token in generated {
        *counts.entry(token).or_default() += 1;
    }

    let device = logits.device();
    let mut values = logits.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    for (token, count) in counts {
        let Some(value) = values.get_mut(token as usize) else {
            continue;
        };
        let scale = 1.0 + (penalty - 1.0) * count as f32;
        if *value >= 0.0 {
            *value /= scale;
        } else {
            *value *= scale;
        }
    }
    Tensor::from_vec(values, logits.dims(), device)
}

pub struct CandleCpuBackend {
    family: PromptFamily,
}

impl CandleCpuBackend {
    pub fn new(family: PromptFamily) -> Self {
        Self { family }
    }
}

impl CpuBackend for CandleCpuBackend {
    fn construct(
        &self,
        model_path: &Path,
        tokenizer_path: Option<&Path>,
        temperature: f32,
    ) -> Result<Box<dyn CpuModule>, NativeError> {
        if matches!(self.family, PromptFamily::Mistral | PromptFamily::Unknown) {
            return Err(NativeError::call(
                "construct",
                format!("no CPU runtime for model family {:?}", self.family),
            ));
        }
        tracing::debug!(path = %model_path.display(), temperature, "CPU module constructed");
        Ok(Box::new(CandleCpuModule {
            model_path: model_path.to_path_buf(),
            tokenizer_path: tokenizer_path.map(Path::to_path_buf),
            family: self.family,
            device: Device::Cpu,
            loaded: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }))
    }
}

struct LoadedModel {
    weights: RuntimeModel,
    tokenizer: Tokenizer,
    stop_ids: Vec<u32>,
}

pub struct CandleCpuModule {
    model_path: PathBuf,
    tokenizer_path: Option<PathBuf>,
    family: PromptFamily,
    device: Device,
    loaded: Mutex<Option<LoadedModel>>,
    stop_requested: AtomicBool,
}

impl CandleCpuModule {
    fn lock_loaded(&self) -> MutexGuard<'_, Option<LoadedModel>> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_load(&self) -> std::result::Result<LoadedModel, (i32, String)> {
        tracing::info!(path = %self.model_path.display(), family = ?self.family, "loading CPU model");
        let weights = RuntimeModel::load_from_gguf(&self.model_path, self.family, &self.device)
            .map_err(|e| (LOAD_MODEL_FAILED, e.to_string()))?;

        let tokenizer_path = resolve_tokenizer_path(&self.model_path, self.tokenizer_path.as_deref())
            .ok_or_else(|| {
                (
                    LOAD_TOKENIZER_MISSING,
                    "tokenizer not found for selected model".to_string(),
                )
            })?;
        tracing::debug!(path = %tokenizer_path.display(), "using tokenizer");
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| (LOAD_TOKENIZER_FAILED, e.to_string()))?;

        let stop_ids: Vec<u32> = default_stop_tokens(self.family)
            .iter()
            .filter_map(|marker| tokenizer.token_to_id(marker))
            .collect();
        if stop_ids.is_empty() {
            tracing::warn!(family = ?self.family, "tokenizer defines none of the family stop tokens");
        }

        Ok(LoadedModel {
            weights,
            tokenizer,
            stop_ids,
        })
    }
}

fn candle_err(call: &'static str) -> impl Fn(candle_core::Error) -> NativeError {
    move |e| NativeError::call(call, e.to_string())
}

impl CpuModule for CandleCpuModule {
    fn load(&self) -> i32 {
        match self.try_load() {
            Ok(model) => {
                *self.lock_loaded() = Some(model);
                tracing::info!("CPU model and tokenizer ready");
                LOAD_OK
            }
            Err((code, message)) => {
                tracing::error!(code, error = %message, "CPU model load failed");
                code
            }
        }
    }

    fn generate(
        &self,
        prompt: &str,
        max_seq_len: usize,
        params: &InferenceParams,
        sink: &mut TokenSink<'_>,
        echo: bool,
    ) -> Result<(), NativeError> {
        self.stop_requested.store(false, Ordering::Release);
        let sampling = CpuSampling::from_params(params);

        let mut guard = self.lock_loaded();
        let loaded = guard
            .as_mut()
            .ok_or_else(|| NativeError::call("generate", "model is not loaded"))?;

        let mut tokens = loaded
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| NativeError::call("generate", e.to_string()))?
            .get_ids()
            .to_vec();
        if tokens.len() >= max_seq_len {
            return Err(NativeError::call(
                "generate",
                format!("prompt has {} tokens, sequence limit is {}", tokens.len(), max_seq_len),
            ));
        }

        if echo && sink(prompt) == TokenFlow::Stop {
            return Ok(());
        }

        let mut logits_processor = LogitsProcessor::from_sampling(sampling.seed, sampling.sampling());
        let mut decoder = StreamDecoder::new(&loaded.tokenizer);
        let prompt_len = tokens.len();
        let mut index_pos = 0;
        let mut input_len = tokens.len();

        while tokens.len() < max_seq_len {
            if self.stop_requested.load(Ordering::Acquire) {
                tracing::debug!("CPU generation stopped on request");
                break;
            }

            let start = tokens.len() - input_len;
            let input = Tensor::new(&tokens[start..], &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(candle_err("generate"))?;
            let logits = loaded
                .weights
                .forward(&input, index_pos)
                .map_err(|e| NativeError::call("generate", e.to_string()))?;
            let mut logits = logits
                .squeeze(0)
                .and_then(|l| l.to_dtype(DType::F32))
                .map_err(candle_err("generate"))?;

            if sampling.repetition_penalty != 1.0 {
                let context_start = tokens.len().saturating_sub(REPEAT_LAST_N);
                logits = candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    sampling.repetition_penalty,
                    &tokens[context_start..],
                )
                .map_err(candle_err("generate"))?;
            }
            logits = apply_frequency_penalty(&logits, sampling.frequency_penalty, &tokens[prompt_len..])
                .map_err(candle_err("generate"))?;

            let next_token = logits_processor
                .sample(&logits)
                .map_err(candle_err("generate"))?;
            index_pos += input_len;
            input_len = 1;
            tokens.push(next_token);

            if loaded.stop_ids.contains(&next_token) {
                decoder.discard_pending();
                let marker = loaded.tokenizer.decode_ids(&[next_token])?;
                sink(&marker);
                return Ok(());
            }
            if let Some(text) = decoder.next_token(next_token)? {
                if sink(&text) == TokenFlow::Stop {
                    return Ok(());
                }
            }
        }

        if let Some(rest) = decoder.flush()? {
            sink(&rest);
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    fn reset_native(&self) {
        if self.lock_loaded().take().is_some() {
            tracing::debug!("CPU model weights dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(family: PromptFamily) -> CandleCpuBackend {
        CandleCpuBackend::new(family)
    }

    #[test]
    fn unsupported_family_is_rejected_at_construct() {
        let result = backend(PromptFamily::Mistral).construct(Path::new("m.gguf"), None, 0.2);
        assert!(matches!(result, Err(NativeError::Call { call: "construct", .. })));
    }

    #[test]
    fn missing_model_file_yields_nonzero_load_code() {
        let dir = std::env::temp_dir().join(format!("edge_llm_candle_{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("dir");
        let module = backend(PromptFamily::Llama)
            .construct(&dir.join("absent.gguf"), None, 0.2)
            .expect("construct");
        assert_eq!(module.load(), LOAD_MODEL_FAILED);
    }

    #[test]
    fn generate_before_load_is_an_error() {
        let module = backend(PromptFamily::Qwen)
            .construct(Path::new("absent.gguf"), None, 0.2)
            .expect("construct");
        let mut sink = |_: &str| TokenFlow::Continue;
        let result = module.generate("hi", 128, &InferenceParams::default(), &mut sink, false);
        assert!(matches!(result, Err(NativeError::Call { call: "generate", .. })));

        module.stop();
        module.reset_native();
    }

    #[test]
    fn sampling_follows_request_params() {
        let mut params = InferenceParams::default();
        params.temperature = 0.0;
        assert!(matches!(CpuSampling::from_params(&params).sampling(), Sampling::ArgMax));

        params.temperature = 0.7;
        params.top_k = 3;
        let sampling = CpuSampling::from_params(&params);
        assert_eq!(sampling.frequency_penalty, params.frequency_penalty);
        match sampling.sampling() {
            Sampling::TopKThenTopP { k, temperature, .. } => {
                assert_eq!(k, 3);
                assert!((temperature - 0.7).abs() < 1e-6);
            }
            _ => panic!("expected top-k/top-p sampling"),
        }
    }

    #[test]
    fn frequency_penalty_scales_with_occurrences() {
        let logits = Tensor::new(&[2.0f32, -2.0, 4.0, 1.0], &Device::Cpu).expect("logits");
        let penalized = apply_frequency_penalty(&logits, 1.5, &[0, 1, 2, 2])
            .expect("penalty")
            .to_vec1::<f32>()
            .expect("values");
        assert!((penalized[0] - 2.0 / 1.5).abs() < 1e-6);
        assert!((penalized[1] - -2.0 * 1.5).abs() < 1e-6);
        assert!((penalized[2] - 4.0 / 2.0).abs() < 1e-6);
        assert_eq!(penalized[3], 1.0);

        let untouched = apply_frequency_penalty(&logits, 1.0, &[0, 0])
            .expect("penalty")
            .to_vec1::<f32>()
            .expect("values");
        assert_eq!(untouched, vec![2.0, -2.0, 4.0, 1.0]);
    }
}
