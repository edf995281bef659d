use thiserror::Error;

use crate::engine::EngineState;

/// Failure reported by one of the opaque native call surfaces.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NativeError {
    #[error("native call `{call}` failed: {message}")]
    Call { call: &'static str, message: String },

    #[error("native call `{0}` panicked")]
    Panicked(&'static str),

    #[error("native call `{0}` timed out")]
    TimedOut(&'static str),
}

impl NativeError {
    pub fn call(call: &'static str, message: impl Into<String>) -> Self {
        Self::Call {
            call,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("engine is not ready (state: {0:?})")]
    NotReady(EngineState),

    #[error("a generation session is already live on this engine")]
    Busy,

    #[error("prompt exceeds the input budget: estimated {estimated} tokens, budget {budget}")]
    PromptTooLong { estimated: usize, budget: usize },

    #[error("invalid inference parameters: {0}")]
    InvalidParams(String),

    #[error("prompt template error: {0}")]
    Template(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("native worker unavailable: {0}")]
    Worker(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Native(#[from] NativeError),
}

impl From<minijinja::Error> for EngineError {
    fn from(e: minijinja::Error) -> Self {
        EngineError::Template(e.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
