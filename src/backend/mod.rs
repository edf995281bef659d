//! Native call surfaces and the single-owner handle around them.
//!
//! Both backends are opaque: the engine only sees the traits below. The CPU
//! backend hands out one module per `construct`; the accelerator runtime is a
//! process-wide singleton driven through init/reset/release calls.

pub mod candle;
pub mod capability;
#[cfg(test)]
pub(crate) mod mock;
mod stream_decoder;
mod tokenizer;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::InferenceParams;
use crate::error::NativeError;

pub use self::capability::{CapabilityProbe, CpuInfoProbe, StaticCapability};
pub use self::tokenizer::resolve_tokenizer_path;

/// Answer from a token sink: keep streaming or stop at the next boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFlow {
    Continue,
    Stop,
}

pub type TokenSink<'a> = dyn FnMut(&str) -> TokenFlow + 'a;

pub trait CpuBackend: Send + Sync {
    fn construct(
        &self,
        model_path: &Path,
        tokenizer_path: Option<&Path>,
        temperature: f32,
    ) -> Result<Box<dyn CpuModule>, NativeError>;
}

/// One constructed CPU model. `load` returns `0` on success.
pub trait CpuModule: Send + Sync {
    fn load(&self) -> i32;

    /// Streams decoded text for `prompt`. `params` carries the sampling
    /// knobs of this request; `max_tokens` is not used, `max_seq_len` bounds
    /// prompt plus output.
    fn generate(
        &self,
        prompt: &str,
        max_seq_len: usize,
        params: &InferenceParams,
        sink: &mut TokenSink<'_>,
        echo: bool,
    ) -> Result<(), NativeError>;

    /// Asks a running `generate` to return. Safe to call from any thread.
    fn stop(&self);

    fn reset_native(&self);
}

pub trait AcceleratorRuntime: Send + Sync {
    fn init_llm(&self, config_path: &Path, preload_shared_weights: bool) -> Result<bool, NativeError>;

    fn streaming_inference(
        &self,
        prompt: &str,
        max_tokens: usize,
        parse_prompt_tokens: bool,
        sink: &mut TokenSink<'_>,
    ) -> Result<String, NativeError>;

    fn reset_llm(&self) -> Result<bool, NativeError>;

    fn release_llm(&self) -> Result<(), NativeError>;

    fn swap_model(&self, token_size: usize) -> Result<bool, NativeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    None,
    Cpu,
    Accelerator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SupportedBackends {
    pub cpu: bool,
    pub accelerator: bool,
}

pub struct CpuHandle {
    module: Arc<dyn CpuModule>,
}

impl CpuHandle {
    pub fn new(module: Arc<dyn CpuModule>) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &Arc<dyn CpuModule> {
        &self.module
    }

    /// Stop, settle, reset. The module is dropped afterwards.
    pub fn release(self, settle: Duration) {
        self.module.stop();
        std::thread::sleep(settle);
        self.module.reset_native();
    }
}

pub struct AcceleratorHandle {
    runtime: Arc<dyn AcceleratorRuntime>,
}

impl AcceleratorHandle {
    pub fn new(runtime: Arc<dyn AcceleratorRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn AcceleratorRuntime> {
        &self.runtime
    }

    /// Reset then release. Both calls are attempted; the first error wins.
    pub fn release(self, settle: Duration) -> Result<(), NativeError> {
        let reset = self.runtime.reset_llm().map(|_| ());
        std::thread::sleep(settle);
        let released = self.runtime.release_llm();
        reset.and(released)
    }
}

/// The engine's single native handle.
#[derive(Default)]
pub enum NativeHandle {
    #[default]
    None,
    Cpu(CpuHandle),
    Accelerator(AcceleratorHandle),
}

impl NativeHandle {
    pub fn kind(&self) -> BackendKind {
        match self {
            NativeHandle::None => BackendKind::None,
            NativeHandle::Cpu(_) => BackendKind::Cpu,
            NativeHandle::Accelerator(_) => BackendKind::Accelerator,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, NativeHandle::None)
    }

    /// Detaches the handle, leaving `None` behind.
    pub fn take(&mut self) -> NativeHandle {
        std::mem::take(self)
    }
}
