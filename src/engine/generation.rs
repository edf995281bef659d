use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Instant;

use crate::backend::{CpuModule, NativeHandle, TokenFlow};
use crate::completion::{Completion, Resolver};
use crate::config::InferenceParams;
use crate::error::{EngineError, NativeError};
use crate::history::ConversationHistory;
use crate::prompting::TokenClass;
use crate::stats::EngineStats;

use super::worker::Job;
use super::{ActiveBackend, EngineState, LlmEngine, Shared};

/// Text a cancelled session resolves with when nothing was streamed yet.
pub const STOPPED_BY_USER: &str = "[Generation stopped by user]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed(String),
    Cancelled(String),
}

impl GenerationOutcome {
    pub fn text(&self) -> &str {
        match self {
            GenerationOutcome::Completed(text) | GenerationOutcome::Cancelled(text) => text,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenerationOutcome::Cancelled(_))
    }
}

pub type GenerationResult = Result<GenerationOutcome, EngineError>;

pub type TokenConsumer = Box<dyn FnMut(&str) + Send>;

/// State of one in-flight streaming request.
pub(crate) struct GenerationSession {
    id: u64,
    cancelled: AtomicBool,
    native_stop_issued: AtomicBool,
    seen_assistant_marker: AtomicBool,
    finished: AtomicBool,
    consumer: Mutex<Option<TokenConsumer>>,
    text: Mutex<String>,
    tokens: AtomicUsize,
    resolver: Resolver<GenerationResult>,
    started: Instant,
}

impl GenerationSession {
    fn new(id: u64, consumer: Option<TokenConsumer>, resolver: Resolver<GenerationResult>) -> Self {
        Self {
            id,
            cancelled: AtomicBool::new(false),
            native_stop_issued: AtomicBool::new(false),
            seen_assistant_marker: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            consumer: Mutex::new(consumer),
            text: Mutex::new(String::new()),
            tokens: AtomicUsize::new(0),
            resolver,
            started: Instant::now(),
        }
    }

    fn lock_text(&self) -> MutexGuard<'_, String> {
        self.text.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn accumulated(&self) -> String {
        self.lock_text().clone()
    }

    /// Raises the cancel flag and drops the consumer. When a delivery is in
    /// flight the consumer is dropped by the next `deliver` instead.
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        match self.consumer.try_lock() {
            Ok(mut consumer) => {
                consumer.take();
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().take();
            }
            Err(TryLockError::WouldBlock) => {}
        }
    }

    /// Forwards a visible token. `false` once the session is cancelled.
    fn deliver(&self, token: &str) -> bool {
        let mut consumer = self.consumer.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_cancelled() {
            consumer.take();
            return false;
        }
        self.lock_text().push_str(token);
        self.tokens.fetch_add(1, Ordering::Relaxed);
        if let Some(on_token) = consumer.as_mut() {
            on_token(token);
        }
        true
    }

    /// Settles the completion; only the first caller wins and is counted.
    fn finish(&self, result: GenerationResult, stats: &EngineStats) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        match &result {
            Ok(GenerationOutcome::Completed(_)) => stats.inc_generation_completed(),
            Ok(GenerationOutcome::Cancelled(_)) => stats.inc_generation_cancelled(),
            Err(_) => stats.inc_generation_failed(),
        }
        self.resolver.resolve(result)
    }
}

impl LlmEngine {
    /// Streams a completion for an already formatted prompt.
    ///
    /// Rejected immediately, without touching the worker, when the engine is
    /// not `Ready`, another session is live, or `params` are out of range.
    pub fn generate_streaming(
        &self,
        prompt: &str,
        params: &InferenceParams,
        on_token: Option<TokenConsumer>,
    ) -> Completion<GenerationResult> {
        if let Err(e) = params.validate() {
            return Completion::ready(Err(e));
        }

        let (resolver, completion) = Completion::pending();
        let session = {
            let mut status = self.shared.lock_status();
            if status.session.is_some() {
                return Completion::ready(Err(EngineError::Busy));
            }
            if status.state != EngineState::Ready {
                return Completion::ready(Err(EngineError::NotReady(status.state)));
            }
            let session = Arc::new(GenerationSession::new(
                self.shared.next_session_id(),
                on_token,
                resolver,
            ));
            status.session = Some(Arc::clone(&session));
            status.state = EngineState::Generating;
            session
        };
        self.shared.stats.inc_generation_started();
        tracing::debug!(session = session.id, prompt_chars = prompt.chars().count(), "generation queued");

        let shared = Arc::clone(&self.shared);
        let job_session = Arc::clone(&session);
        let prompt = prompt.to_string();
        let params = *params;
        let job: Job = Box::new(move || shared.run_generation(&job_session, &prompt, &params));
        if self.worker.submit(job).is_err() {
            self.shared.complete(
                &session,
                Err(EngineError::Worker("native worker is not running".to_string())),
            );
        }
        completion
    }

    /// Formats `user_text` against `history` and streams the answer. A user
    /// turn that cannot fit the input budget is rejected before generation.
    pub fn generate_chat(
        &self,
        user_text: &str,
        history: &ConversationHistory,
        params: &InferenceParams,
        on_token: Option<TokenConsumer>,
    ) -> Completion<GenerationResult> {
        let budget = self.shared.config.sequence.max_input_tokens();
        match self.assembler.assemble(user_text, history.turns(), budget) {
            Ok(prompt) => self.generate_streaming(&prompt, params, on_token),
            Err(e) => {
                tracing::warn!(error = %e, "chat request rejected");
                Completion::ready(Err(e))
            }
        }
    }

    /// Cancels the live session, if any. Returns `false` when there was none.
    pub fn stop_generation(&self) -> bool {
        self.shared.stop_generation()
    }
}

impl Shared {
    pub(crate) fn stop_generation(&self) -> bool {
        let (session, active) = {
            let mut status = self.lock_status();
            let Some(session) = status.session.take() else {
                return false;
            };
            if status.state == EngineState::Generating {
                status.state = EngineState::Ready;
            }
            (session, status.active.clone())
        };

        session.cancel();

        match active {
            ActiveBackend::Cpu(module) => {
                if let Some(module) = module.upgrade() {
                    module.stop();
                    std::thread::sleep(self.config.timeouts.stop_grace());
                    module.stop();
                }
            }
            ActiveBackend::Accelerator(runtime) => {
                if let Err(e) = runtime.reset_llm() {
                    tracing::warn!(error = %e, "accelerator reset on stop failed");
                }
                if let Err(e) = runtime.swap_model(self.config.accelerator.swap_token_size) {
                    tracing::warn!(error = %e, "accelerator swap on stop failed");
                }
            }
            ActiveBackend::None => {}
        }

        let text = session.accumulated();
        let text = if text.is_empty() {
            STOPPED_BY_USER.to_string()
        } else {
            text
        };
        if session.finish(Ok(GenerationOutcome::Cancelled(text)), &self.stats) {
            tracing::info!(session = session.id, "generation stopped by caller");
        }
        true
    }

    /// Frees the session slot (if `session` still owns it) and then resolves.
    fn complete(&self, session: &Arc<GenerationSession>, result: GenerationResult) {
        self.finish_session(session);
        session.finish(result, &self.stats);
    }

    fn finish_session(&self, session: &Arc<GenerationSession>) {
        let mut status = self.lock_status();
        let owns_slot = status
            .session
            .as_ref()
            .map(|live| Arc::ptr_eq(live, session))
            .unwrap_or(false);
        if owns_slot {
            status.session = None;
            if status.state == EngineState::Generating {
                status.state = EngineState::Ready;
            }
        }
    }

    fn token_sink<'a>(
        &'a self,
        session: &'a Arc<GenerationSession>,
        cpu: Option<&'a Arc<dyn CpuModule>>,
    ) -> impl FnMut(&str) -> TokenFlow + 'a {
        move |token: &str| {
            if token.is_empty() {
                return TokenFlow::Continue;
            }
            if session.is_cancelled() {
                return TokenFlow::Stop;
            }

            match self.filter.classify(token) {
                TokenClass::Stop => {
                    if !session.native_stop_issued.swap(true, Ordering::AcqRel) {
                        if let Some(module) = cpu {
                            module.stop();
                        }
                    }
                    tracing::debug!(session = session.id, "stop token reached");
                    self.complete(session, Ok(GenerationOutcome::Completed(session.accumulated())));
                    TokenFlow::Stop
                }
                TokenClass::Marker => TokenFlow::Continue,
                TokenClass::AssistantMarker => {
                    session.seen_assistant_marker.store(true, Ordering::Release);
                    TokenFlow::Continue
                }
                TokenClass::Visible => {
                    if self.filter.require_assistant_marker
                        && !session.seen_assistant_marker.load(Ordering::Acquire)
                    {
                        return TokenFlow::Continue;
                    }
                    if !session.deliver(token) {
                        return TokenFlow::Stop;
                    }
                    self.stats.inc_token();
                    TokenFlow::Continue
                }
            }
        }
    }

    pub(crate) fn run_generation(
        &self,
        session: &Arc<GenerationSession>,
        prompt: &str,
        params: &InferenceParams,
    ) {
        let core = self.lock_core();
        if session.is_cancelled() {
            self.finish_session(session);
            return;
        }

        let outcome: std::thread::Result<Result<(), NativeError>> = match &core.handle {
            NativeHandle::Cpu(cpu) => {
                let module = Arc::clone(cpu.module());
                let max_seq_len = self.config.sequence.budget_for(prompt);
                tracing::debug!(session = session.id, max_seq_len, "CPU generation started");
                let mut sink = self.token_sink(session, Some(&module));
                catch_unwind(AssertUnwindSafe(|| {
                    module.generate(prompt, max_seq_len, params, &mut sink, false)
                }))
            }
            NativeHandle::Accelerator(accelerator) => {
                let runtime = Arc::clone(accelerator.runtime());
                tracing::debug!(session = session.id, max_tokens = params.max_tokens, "accelerator generation started");
                let mut sink = self.token_sink(session, None);
                let result = catch_unwind(AssertUnwindSafe(|| {
                    runtime
                        .streaming_inference(prompt, params.max_tokens, false, &mut sink)
                        .map(|_| ())
                }));

                if let Err(e) = runtime.reset_llm() {
                    tracing::warn!(error = %e, "accelerator reset after generation failed");
                }
                if let Err(e) = runtime.swap_model(self.config.accelerator.swap_token_size) {
                    tracing::warn!(error = %e, "accelerator swap after generation failed");
                }
                result
            }
            NativeHandle::None => Ok(Err(NativeError::call("generate", "no native handle"))),
        };

        let result = match outcome {
            Ok(Ok(())) => Ok(GenerationOutcome::Completed(session.accumulated())),
            Ok(Err(e)) => {
                tracing::error!(session = session.id, error = %e, "generation failed");
                Err(EngineError::Generation(e.to_string()))
            }
            Err(_) => {
                tracing::error!(session = session.id, "native generation panicked");
                Err(EngineError::Generation("native generation panicked".to_string()))
            }
        };
        self.complete(session, result);

        let elapsed = session.started.elapsed().as_secs_f64();
        let tokens = session.tokens.load(Ordering::Relaxed);
        let rate = if elapsed > 0.0 { tokens as f64 / elapsed } else { 0.0 };
        tracing::info!(
            session = session.id,
            tokens,
            elapsed_secs = elapsed,
            tokens_per_sec = rate,
            "generation finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use super::*;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_during_delivery_drops_consumer_on_next_token() {
        let slot: Arc<OnceLock<Arc<GenerationSession>>> = Arc::new(OnceLock::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));
        let inner = Arc::clone(&slot);
        let consumer: TokenConsumer = Box::new(move |_token: &str| {
            let _alive = &flag;
            if let Some(session) = inner.get() {
                session.cancel();
            }
        });

        let (resolver, _completion) = Completion::pending();
        let session = Arc::new(GenerationSession::new(1, Some(consumer), resolver));
        let _ = slot.set(Arc::clone(&session));

        assert!(session.deliver("a"));
        assert!(session.is_cancelled());
        assert!(!dropped.load(Ordering::SeqCst));

        assert!(!session.deliver("b"));
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(session.accumulated(), "a");
    }

    #[test]
    fn cancel_outside_delivery_drops_consumer_at_once() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));
        let consumer: TokenConsumer = Box::new(move |_token: &str| {
            let _alive = &flag;
        });
        let (resolver, _completion) = Completion::pending();
        let session = GenerationSession::new(2, Some(consumer), resolver);

        session.cancel();
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!session.deliver("late"));
        assert_eq!(session.accumulated(), "");
    }
}
