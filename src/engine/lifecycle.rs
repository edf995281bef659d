use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backend::{
    AcceleratorHandle, AcceleratorRuntime, BackendKind, CpuHandle, CpuModule, NativeHandle,
};
use crate::completion::Completion;
use crate::config::{BackendPreference, RetryReset};

use super::worker::Job;
use super::{ActiveBackend, CleanupGuard, Core, EngineState, LlmEngine, Shared};

const STALE_LOADER_POLL: Duration = Duration::from_millis(10);

impl LlmEngine {
    /// Brings the engine to `Ready` on the preferred backend, falling back to
    /// the CPU when allowed. Resolves `false` if the init timeout elapses
    /// first, whatever the worker is still doing.
    ///
    /// A live generation is cancelled here, before the job is queued, so the
    /// worker is free to run the release that precedes the new handle.
    pub fn initialize(&self, preference: BackendPreference) -> Completion<bool> {
        let (resolver, completion) =
            Completion::with_deadline(self.shared.config.timeouts.init(), false);

        if self.shared.stop_generation() {
            tracing::info!("generation cancelled by re-initialization");
        }

        let shared = Arc::clone(&self.shared);
        let job_resolver = resolver.clone();
        let job: Job = Box::new(move || {
            let ok = catch_unwind(AssertUnwindSafe(|| shared.initialize_blocking(preference)))
                .unwrap_or_else(|_| {
                    tracing::error!("backend initialization panicked");
                    shared.mark_failed();
                    false
                });
            shared.stats.record_init(ok);
            if ok && job_resolver.is_expired() {
                tracing::warn!("backend became ready after the init timeout already reported failure");
            }
            job_resolver.resolve(ok);
        });

        if self.worker.submit(job).is_err() {
            tracing::error!("native worker is not running, initialization aborted");
            resolver.resolve(false);
        }
        completion
    }

    /// Stops any generation, then tears down the native handle on the worker.
    /// Returns `false` if another release is already running or the teardown
    /// does not finish within the cleanup timeout.
    pub fn release_resources(&self) -> bool {
        let Some(guard) = CleanupGuard::acquire(&self.shared.cleanup) else {
            tracing::warn!("release rejected: cleanup already in progress");
            self.shared.stats.inc_release_rejected();
            return false;
        };

        self.shared.stop_generation();

        let (resolver, completion) = Completion::pending();
        let shared = Arc::clone(&self.shared);
        let job: Job = Box::new(move || {
            let _guard = guard;
            let mut core = shared.lock_core();
            shared.release_locked(&mut core);
            resolver.resolve(true);
        });
        if let Err(job) = self.worker.submit(job) {
            tracing::debug!("native worker gone, releasing inline");
            job();
        }

        let timeout = self.shared.config.timeouts.cleanup();
        completion.wait_timeout(timeout).unwrap_or_else(|| {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "release still running after cleanup timeout");
            false
        })
    }
}

impl Shared {
    pub(crate) fn initialize_blocking(&self, preference: BackendPreference) -> bool {
        let mut core = self.lock_core();
        self.release_locked(&mut core);
        self.set_state(EngineState::Initializing);

        let supported = self.backends.capability.supported_backends();
        tracing::info!(?preference, cpu = supported.cpu, accelerator = supported.accelerator, "initializing backend");

        if preference == BackendPreference::Accelerator {
            match &self.backends.accelerator {
                Some(runtime) if supported.accelerator => {
                    if self.try_accelerator(&mut core, runtime) {
                        return self.mark_ready(BackendKind::Accelerator);
                    }
                }
                Some(_) => tracing::warn!("accelerator not supported on this hardware"),
                None => tracing::warn!("accelerator preferred but no runtime is linked"),
            }

            if !self.config.accelerator.cpu_fallback {
                tracing::error!("accelerator unavailable and CPU fallback is disabled");
                return self.mark_failed();
            }
            tracing::info!("falling back to CPU backend");
            thread::sleep(self.config.timeouts.backend_init_delay());
        }

        if !supported.cpu {
            tracing::error!("CPU backend reported unsupported");
            return self.mark_failed();
        }
        if self.try_cpu(&mut core) {
            return self.mark_ready(BackendKind::Cpu);
        }
        self.mark_failed()
    }

    fn mark_ready(&self, kind: BackendKind) -> bool {
        self.set_state(EngineState::Ready);
        tracing::info!(backend = ?kind, "engine ready");
        true
    }

    pub(crate) fn mark_failed(&self) -> bool {
        let mut status = self.lock_status();
        status.state = EngineState::Failed;
        status.active = ActiveBackend::None;
        tracing::error!("no backend could be initialized");
        false
    }

    fn try_accelerator(&self, core: &mut Core, runtime: &Arc<dyn AcceleratorRuntime>) -> bool {
        let Some(config_path) = self.config.accelerator_config_path.as_deref() else {
            tracing::warn!("accelerator preferred but accelerator_config_path is not set");
            return false;
        };

        let policy = &self.config.accelerator;
        if policy.retry_reset == RetryReset::Initialize {
            core.accelerator_attempts = 0;
        }
        if core.accelerator_attempts >= policy.max_attempts {
            tracing::warn!(attempts = core.accelerator_attempts, "accelerator attempt budget exhausted");
            return false;
        }

        while core.accelerator_attempts < policy.max_attempts {
            core.accelerator_attempts += 1;
            let attempt = core.accelerator_attempts;
            self.stats.inc_accelerator_attempt();
            thread::sleep(self.config.timeouts.backend_init_delay() * attempt);

            if let Err(e) = runtime.reset_llm() {
                tracing::debug!(error = %e, "pre-init accelerator reset failed");
            }
            match runtime.init_llm(config_path, self.config.preload_shared_weights) {
                Ok(true) => {
                    tracing::info!(attempt, "accelerator initialized");
                    core.handle = NativeHandle::Accelerator(AcceleratorHandle::new(Arc::clone(runtime)));
                    self.lock_status().active = ActiveBackend::Accelerator(Arc::clone(runtime));
                    return true;
                }
                Ok(false) => {
                    tracing::warn!(attempt, max = policy.max_attempts, "accelerator init returned false")
                }
                Err(e) => {
                    tracing::warn!(attempt, max = policy.max_attempts, error = %e, "accelerator init failed")
                }
            }
            self.cleanup_after_error(runtime);
        }
        false
    }

    /// Reset and release on a side thread, bounded by the cleanup timeout.
    fn cleanup_after_error(&self, runtime: &Arc<dyn AcceleratorRuntime>) {
        let runtime = Arc::clone(runtime);
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("accelerator-cleanup".to_string())
            .spawn(move || {
                let reset = runtime.reset_llm();
                let released = runtime.release_llm();
                let _ = tx.send((reset, released));
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "cannot spawn accelerator cleanup");
            return;
        }

        match rx.recv_timeout(self.config.timeouts.cleanup()) {
            Ok((reset, released)) => {
                if let Err(e) = reset {
                    tracing::warn!(error = %e, "accelerator reset after failed init");
                }
                if let Err(e) = released {
                    tracing::warn!(error = %e, "accelerator release after failed init");
                }
            }
            Err(RecvTimeoutError::Timeout) => tracing::warn!("accelerator cleanup timed out"),
            Err(RecvTimeoutError::Disconnected) => tracing::warn!("accelerator cleanup panicked"),
        }
    }

    /// Waits, up to the cleanup timeout, for a loader left behind by a timed
    /// out load. `false` means its module may still be alive.
    fn settle_stale_loader(&self, core: &mut Core) -> bool {
        let Some(loader) = core.stale_loader.take() else {
            return true;
        };

        let deadline = Instant::now() + self.config.timeouts.cleanup();
        while !loader.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("timed out CPU load is still running");
                core.stale_loader = Some(loader);
                return false;
            }
            thread::sleep(STALE_LOADER_POLL);
        }
        if loader.join().is_err() {
            tracing::warn!("timed out CPU loader panicked");
        }
        tracing::debug!("timed out CPU load has been discarded");
        true
    }

    fn try_cpu(&self, core: &mut Core) -> bool {
        let Some(model_path) = self.config.model_path.as_deref() else {
            tracing::error!("CPU backend needs model_path");
            return false;
        };
        if !self.settle_stale_loader(core) {
            tracing::error!("previous CPU module is still loading, not constructing another");
            return false;
        }

        let module = match self.backends.cpu.construct(
            model_path,
            self.config.tokenizer_path.as_deref(),
            self.config.inference.temperature,
        ) {
            Ok(module) => Arc::<dyn CpuModule>::from(module),
            Err(e) => {
                tracing::error!(error = %e, "CPU module construction failed");
                return false;
            }
        };

        let (tx, rx) = mpsc::channel::<(i32, Arc<dyn CpuModule>)>();
        let spawned = thread::Builder::new()
            .name("cpu-model-load".to_string())
            .spawn(move || {
                let code = module.load();
                if let Err(mpsc::SendError((code, module))) = tx.send((code, module)) {
                    tracing::warn!(code, "CPU load finished after timeout, discarding module");
                    module.reset_native();
                }
            });
        let loader: JoinHandle<()> = match spawned {
            Ok(loader) => loader,
            Err(e) => {
                tracing::error!(error = %e, "cannot spawn CPU loader");
                return false;
            }
        };

        let timeout = self.config.timeouts.load();
        match rx.recv_timeout(timeout) {
            Ok((0, module)) => {
                tracing::info!(path = %model_path.display(), "CPU model loaded");
                self.lock_status().active = ActiveBackend::Cpu(Arc::downgrade(&module));
                core.handle = NativeHandle::Cpu(CpuHandle::new(module));
                true
            }
            Ok((code, module)) => {
                tracing::error!(code, "CPU model load returned an error code");
                module.reset_native();
                false
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(timeout_ms = timeout.as_millis() as u64, "CPU model load timed out");
                core.stale_loader = Some(loader);
                false
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::error!("CPU model loader panicked");
                false
            }
        }
    }

    /// Stop, detach, tear down. Native failures are logged only; the handle
    /// is detached before any native call so the engine state stays coherent.
    pub(crate) fn release_locked(&self, core: &mut Core) {
        self.stop_generation();
        self.settle_stale_loader(core);

        let handle = core.handle.take();
        if !handle.is_live() {
            self.set_state(EngineState::Uninitialized);
            return;
        }

        {
            let mut status = self.lock_status();
            status.active = ActiveBackend::None;
            status.state = EngineState::ReleasingResources;
        }
        let settle = self.config.timeouts.native_settle();
        let kind = handle.kind();
        tracing::info!(backend = ?kind, "releasing native handle");

        match handle {
            NativeHandle::None => {}
            NativeHandle::Accelerator(accelerator) => {
                match catch_unwind(AssertUnwindSafe(|| accelerator.release(settle))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "accelerator release reported an error"),
                    Err(_) => tracing::error!("accelerator release panicked"),
                }
                if self.config.accelerator.retry_reset == RetryReset::Release {
                    core.accelerator_attempts = 0;
                }
            }
            NativeHandle::Cpu(cpu) => {
                if catch_unwind(AssertUnwindSafe(|| cpu.release(settle))).is_err() {
                    tracing::error!("CPU release panicked");
                }
            }
        }

        self.stats.inc_release();
        self.set_state(EngineState::Uninitialized);
        tracing::info!(backend = ?kind, "native handle released");
    }
}
