pub mod assembler;
pub mod backend;
pub mod commands;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod prompting;
pub mod stats;

pub use assembler::{estimate_tokens, PromptAssembler};
pub use backend::{BackendKind, SupportedBackends};
pub use completion::Completion;
pub use config::{BackendPreference, EngineConfig, InferenceParams};
pub use engine::{EngineState, GenerationOutcome, GenerationResult, LlmEngine, NativeBackends};
pub use error::{EngineError, NativeError};
pub use history::{ConversationHistory, Role};
