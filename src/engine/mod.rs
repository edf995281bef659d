//! The inference engine: backend selection, handle lifecycle and streaming
//! generation against a single native handle.
//!
//! Every native call that touches the handle runs on one serial worker thread
//! while holding the `core` lock. The `status` lock is separate and never held
//! across a native call, so state queries and `stop_generation()` stay
//! responsive while the worker is blocked inside a generation. Lock order is
//! always `core` then `status`.

mod generation;
mod lifecycle;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;

use serde::Serialize;

use crate::assembler::PromptAssembler;
use crate::backend::candle::CandleCpuBackend;
use crate::backend::{
    AcceleratorRuntime, BackendKind, CapabilityProbe, CpuBackend, CpuInfoProbe, CpuModule,
    NativeHandle,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::prompting::StreamFilter;
use crate::stats::{EngineStats, StatsSnapshot};

pub use self::generation::{GenerationOutcome, GenerationResult, TokenConsumer, STOPPED_BY_USER};
use self::generation::GenerationSession;
use self::worker::NativeWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    Generating,
    ReleasingResources,
    Failed,
}

/// The native surfaces an engine drives.
pub struct NativeBackends {
    pub cpu: Arc<dyn CpuBackend>,
    pub accelerator: Option<Arc<dyn AcceleratorRuntime>>,
    pub capability: Box<dyn CapabilityProbe>,
}

impl NativeBackends {
    /// Candle CPU backend and the cpuinfo probe. No accelerator runtime is
    /// linked until [`with_accelerator`](Self::with_accelerator) is called.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            cpu: Arc::new(CandleCpuBackend::new(config.prompt.family)),
            accelerator: None,
            capability: Box::new(CpuInfoProbe::from_config(&config.hardware)),
        }
    }

    pub fn with_accelerator(mut self, runtime: Arc<dyn AcceleratorRuntime>) -> Self {
        self.accelerator = Some(runtime);
        self
    }
}

/// What `stop_generation()` needs to reach the native side without the
/// `core` lock. The CPU reference is weak so it never extends a handle's life.
#[derive(Clone, Default)]
pub(crate) enum ActiveBackend {
    #[default]
    None,
    Cpu(Weak<dyn CpuModule>),
    Accelerator(Arc<dyn AcceleratorRuntime>),
}

impl ActiveBackend {
    pub(crate) fn kind(&self) -> BackendKind {
        match self {
            ActiveBackend::None => BackendKind::None,
            ActiveBackend::Cpu(_) => BackendKind::Cpu,
            ActiveBackend::Accelerator(_) => BackendKind::Accelerator,
        }
    }
}

pub(crate) struct Core {
    pub(crate) handle: NativeHandle,
    pub(crate) accelerator_attempts: u32,
    /// Loader thread of a CPU load that timed out. Its module is alive until
    /// the thread ends.
    pub(crate) stale_loader: Option<JoinHandle<()>>,
}

pub(crate) struct Status {
    pub(crate) state: EngineState,
    pub(crate) active: ActiveBackend,
    pub(crate) session: Option<Arc<GenerationSession>>,
}

pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) filter: StreamFilter,
    pub(crate) backends: NativeBackends,
    pub(crate) core: Mutex<Core>,
    pub(crate) status: Mutex<Status>,
    pub(crate) cleanup: Arc<AtomicBool>,
    pub(crate) stats: EngineStats,
    next_session: AtomicU64,
}

impl Shared {
    pub(crate) fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn state(&self) -> EngineState {
        self.lock_status().state
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        let mut status = self.lock_status();
        if status.state != state {
            tracing::debug!(from = ?status.state, to = ?state, "engine state change");
            status.state = state;
        }
    }

    fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Marks a release in progress. Dropping it clears the flag.
pub(crate) struct CleanupGuard(Arc<AtomicBool>);

impl CleanupGuard {
    pub(crate) fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct LlmEngine {
    shared: Arc<Shared>,
    assembler: PromptAssembler,
    worker: NativeWorker,
}

impl LlmEngine {
    pub fn new(config: EngineConfig, backends: NativeBackends) -> Result<Self> {
        config.validate()?;
        let worker = NativeWorker::spawn("llm-native")
            .map_err(|e| EngineError::Worker(format!("cannot spawn native worker: {}", e)))?;
        let assembler = PromptAssembler::new(
            config.prompt.templates(),
            config.prompt.system_prompt.clone(),
            config.prompt.history_lookback,
        );
        let filter = config.prompt.stream_filter();

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                filter,
                backends,
                core: Mutex::new(Core {
                    handle: NativeHandle::None,
                    accelerator_attempts: 0,
                    stale_loader: None,
                }),
                status: Mutex::new(Status {
                    state: EngineState::Uninitialized,
                    active: ActiveBackend::None,
                    session: None,
                }),
                cleanup: Arc::new(AtomicBool::new(false)),
                stats: EngineStats::default(),
                next_session: AtomicU64::new(0),
            }),
            assembler,
            worker,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn assembler(&self) -> &PromptAssembler {
        &self.assembler
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// True once a backend is up, including while it is generating.
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Generating)
    }

    pub fn current_backend(&self) -> BackendKind {
        self.shared.lock_status().active.kind()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Releases the handle and joins the native worker.
    pub fn shutdown(self) {
        tracing::info!("engine shutdown requested");
    }
}

impl Drop for LlmEngine {
    fn drop(&mut self) {
        self.release_resources();
        self.worker.shutdown();
    }
}
