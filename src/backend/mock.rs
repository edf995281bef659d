//! Scripted native surfaces for tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::{AcceleratorRuntime, CpuBackend, CpuModule, TokenFlow, TokenSink};
use crate::config::InferenceParams;
use crate::error::NativeError;

const GATE_LIMIT: Duration = Duration::from_secs(10);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Blocks a stream after a number of tokens until a stop call opens it.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn close(&self) {
        *lock(&self.open) = false;
    }

    fn open(&self) {
        *lock(&self.open) = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let guard = lock(&self.open);
        let _ = self
            .cv
            .wait_timeout_while(guard, GATE_LIMIT, |open| !*open)
            .unwrap_or_else(|e| e.into_inner());
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuCounters {
    pub constructed: usize,
    pub live: usize,
    pub max_live: usize,
    pub loads: usize,
    pub generates: usize,
    pub stops: usize,
    pub resets: usize,
    pub prompts: Vec<String>,
    pub max_seq_lens: Vec<usize>,
    pub params: Vec<InferenceParams>,
}

#[derive(Debug, Clone)]
struct CpuScript {
    tokens: Vec<String>,
    load_code: i32,
    load_delay: Duration,
    gate_after: Option<usize>,
    generate_error: Option<String>,
    panic_in_generate: bool,
}

impl Default for CpuScript {
    fn default() -> Self {
        Self {
            tokens: vec!["Hel".to_string(), "lo".to_string()],
            load_code: 0,
            load_delay: Duration::ZERO,
            gate_after: None,
            generate_error: None,
            panic_in_generate: false,
        }
    }
}

#[derive(Default)]
pub struct MockCpu {
    script: Mutex<CpuScript>,
    counters: Arc<Mutex<CpuCounters>>,
    gate: Arc<Gate>,
}

impl MockCpu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counters(&self) -> CpuCounters {
        lock(&self.counters).clone()
    }

    pub fn set_tokens(&self, tokens: &[&str]) {
        lock(&self.script).tokens = tokens.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_load_code(&self, code: i32) {
        lock(&self.script).load_code = code;
    }

    pub fn set_load_delay(&self, delay: Duration) {
        lock(&self.script).load_delay = delay;
    }

    /// After `n` tokens the stream blocks until `stop()` is called.
    pub fn gate_after(&self, n: usize) {
        lock(&self.script).gate_after = Some(n);
    }

    pub fn fail_generate(&self, message: &str) {
        lock(&self.script).generate_error = Some(message.to_string());
    }

    pub fn panic_in_generate(&self) {
        lock(&self.script).panic_in_generate = true;
    }
}

impl CpuBackend for MockCpu {
    fn construct(
        &self,
        _model_path: &Path,
        _tokenizer_path: Option<&Path>,
        _temperature: f32,
    ) -> Result<Box<dyn CpuModule>, NativeError> {
        let mut counters = lock(&self.counters);
        counters.constructed += 1;
        counters.live += 1;
        counters.max_live = counters.max_live.max(counters.live);
        Ok(Box::new(MockCpuModule {
            script: lock(&self.script).clone(),
            counters: Arc::clone(&self.counters),
            gate: Arc::clone(&self.gate),
            stopped: AtomicBool::new(false),
        }))
    }
}

struct MockCpuModule {
    script: CpuScript,
    counters: Arc<Mutex<CpuCounters>>,
    gate: Arc<Gate>,
    stopped: AtomicBool,
}

impl CpuModule for MockCpuModule {
    fn load(&self) -> i32 {
        std::thread::sleep(self.script.load_delay);
        lock(&self.counters).loads += 1;
        self.script.load_code
    }

    fn generate(
        &self,
        prompt: &str,
        max_seq_len: usize,
        params: &InferenceParams,
        sink: &mut TokenSink<'_>,
        _echo: bool,
    ) -> Result<(), NativeError> {
        {
            let mut counters = lock(&self.counters);
            counters.generates += 1;
            counters.prompts.push(prompt.to_string());
            counters.max_seq_lens.push(max_seq_len);
            counters.params.push(*params);
        }
        if self.script.panic_in_generate {
            panic!("scripted native panic");
        }
        if let Some(message) = &self.script.generate_error {
            return Err(NativeError::call("generate", message.clone()));
        }

        self.stopped.store(false, Ordering::Release);
        self.gate.close();
        for (i, token) in self.script.tokens.iter().enumerate() {
            if self.script.gate_after == Some(i) {
                self.gate.wait();
            }
            if self.stopped.load(Ordering::Acquire) {
                return Ok(());
            }
            if sink(token) == TokenFlow::Stop {
                return Ok(());
            }
        }
        if self.script.gate_after == Some(self.script.tokens.len()) {
            self.gate.wait();
        }
        Ok(())
    }

    fn stop(&self) {
        lock(&self.counters).stops += 1;
        self.stopped.store(true, Ordering::Release);
        self.gate.open();
    }

    fn reset_native(&self) {
        lock(&self.counters).resets += 1;
    }
}

impl Drop for MockCpuModule {
    fn drop(&mut self) {
        lock(&self.counters).live -= 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceleratorCounters {
    pub init_attempts: usize,
    pub live: usize,
    pub max_live: usize,
    pub streams: usize,
    pub resets: usize,
    pub releases: usize,
    pub swaps: Vec<usize>,
    pub calls: Vec<&'static str>,
}

#[derive(Debug, Clone)]
struct AcceleratorScript {
    init_failures: u32,
    tokens: Vec<String>,
    gate_after: Option<usize>,
    stream_error: Option<String>,
}

impl Default for AcceleratorScript {
    fn default() -> Self {
        Self {
            init_failures: 0,
            tokens: vec!["Hi".to_string()],
            gate_after: None,
            stream_error: None,
        }
    }
}

#[derive(Default)]
pub struct MockAccelerator {
    script: Mutex<AcceleratorScript>,
    counters: Mutex<AcceleratorCounters>,
    gate: Gate,
    stopped: AtomicBool,
}

impl MockAccelerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counters(&self) -> AcceleratorCounters {
        lock(&self.counters).clone()
    }

    /// The next `n` init attempts report failure. `u32::MAX` never succeeds.
    pub fn fail_inits(&self, n: u32) {
        lock(&self.script).init_failures = n;
    }

    pub fn set_tokens(&self, tokens: &[&str]) {
        lock(&self.script).tokens = tokens.iter().map(|t| t.to_string()).collect();
    }

    pub fn gate_after(&self, n: usize) {
        lock(&self.script).gate_after = Some(n);
    }

    pub fn fail_stream(&self, message: &str) {
        lock(&self.script).stream_error = Some(message.to_string());
    }

    fn record(&self, call: &'static str) -> MutexGuard<'_, AcceleratorCounters> {
        let mut counters = lock(&self.counters);
        counters.calls.push(call);
        counters
    }
}

impl AcceleratorRuntime for MockAccelerator {
    fn init_llm(&self, _config_path: &Path, _preload: bool) -> Result<bool, NativeError> {
        let mut counters = self.record("init_llm");
        counters.init_attempts += 1;

        let mut script = lock(&self.script);
        if script.init_failures > 0 {
            if script.init_failures != u32::MAX {
                script.init_failures -= 1;
            }
            return Ok(false);
        }
        counters.live = 1;
        counters.max_live = counters.max_live.max(counters.live);
        Ok(true)
    }

    fn streaming_inference(
        &self,
        _prompt: &str,
        _max_tokens: usize,
        _parse_prompt_tokens: bool,
        sink: &mut TokenSink<'_>,
    ) -> Result<String, NativeError> {
        self.record("streaming_inference").streams += 1;
        let script = lock(&self.script).clone();
        if let Some(message) = script.stream_error {
            return Err(NativeError::call("streaming_inference", message));
        }

        self.stopped.store(false, Ordering::Release);
        self.gate.close();
        let mut full = String::new();
        for (i, token) in script.tokens.iter().enumerate() {
            if script.gate_after == Some(i) {
                self.gate.wait();
            }
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            full.push_str(token);
            if sink(token) == TokenFlow::Stop {
                break;
            }
        }
        Ok(full)
    }

    fn reset_llm(&self) -> Result<bool, NativeError> {
        self.record("reset_llm").resets += 1;
        self.stopped.store(true, Ordering::Release);
        self.gate.open();
        Ok(true)
    }

    fn release_llm(&self) -> Result<(), NativeError> {
        let mut counters = self.record("release_llm");
        counters.releases += 1;
        counters.live = 0;
        Ok(())
    }

    fn swap_model(&self, token_size: usize) -> Result<bool, NativeError> {
        self.record("swap_model").swaps.push(token_size);
        Ok(true)
    }
}
