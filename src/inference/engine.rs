//! Engine contract
//!
//! The session never talks to a concrete backend directly: it holds an
//! [`EngineHandle`] and drives generation through the [`Engine`] trait.
//! Generation is synchronous and blocking from the engine's point of
//! view; incremental output leaves through a [`FragmentSink`] and
//! cancellation arrives through a shared stop flag the engine polls
//! between steps.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use thiserror::Error;

use crate::inference::model::ModelError;
use crate::prompt::MultimodalPrompt;
use crate::types::Message;

/// Errors that can occur during engine operations
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Chat templating failed: {0}")]
    Template(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Unsupported request: {0}")]
    Unsupported(String),

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Generation parameters for inference
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Repetition penalty
    pub repeat_penalty: f32,
    /// Penalty applied to repeated n-grams
    pub ngram_penalty: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
    /// Context window size
    pub max_context_size: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        // Penalties tuned to suppress the degenerate repetition loops
        // small local models fall into at low temperatures.
        Self {
            max_tokens: 2048,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.1,
            ngram_penalty: 1.05,
            seed: 0,
            max_context_size: 4096,
        }
    }
}

/// The prompt handed to the engine for one generation
#[derive(Debug, Clone)]
pub enum PromptInput {
    /// A fully rendered plain-text prompt
    Text(String),
    /// A structured prompt carrying media placeholders
    Multimodal(MultimodalPrompt),
}

/// Everything the engine needs for one generation
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: PromptInput,
    pub params: GenerationParams,
}

/// Receives generated text fragment-by-fragment.
///
/// The engine calls [`push`](FragmentSink::push) once per fragment, on
/// its own thread, and must not assume anything about what the sink
/// does with it beyond returning promptly.
pub trait FragmentSink {
    fn push(&mut self, fragment: &str);
}

/// A stateful inference engine.
///
/// Implementations run generation synchronously on the calling thread
/// (possibly relaying to an internal worker) and must poll `stop`
/// between generation steps; a set flag means the caller asked for
/// cooperative cancellation and the engine should wind down at the
/// next step boundary.
pub trait Engine: Send + Sync {
    /// Render a message sequence to a single prompt using the engine's
    /// chat templating contract.
    fn render_chat(&self, messages: &[Message]) -> Result<String, EngineError>;

    /// Run one generation, pushing each produced fragment into `sink`.
    fn generate(
        &self,
        request: GenerationRequest,
        sink: &mut dyn FragmentSink,
        stop: &Arc<AtomicBool>,
    ) -> Result<(), EngineError>;

    /// Clear engine-side conversational state. Never destroys the
    /// engine itself.
    fn reset(&self);
}

/// Shared ownership of an engine: the session and any in-flight
/// generation task each hold one, so releasing the session cannot
/// invalidate a running generation.
pub type EngineHandle = Arc<dyn Engine>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_params_default() {
        let params = GenerationParams::default();
        assert_eq!(params.max_tokens, 2048);
        assert!((params.temperature - 0.7).abs() < 0.001);
        assert_eq!(params.top_k, 40);
        assert!((params.top_p - 0.95).abs() < 0.001);
        assert!((params.repeat_penalty - 1.1).abs() < 0.001);
        assert!((params.ngram_penalty - 1.05).abs() < 0.001);
    }

    #[test]
    fn test_model_error_conversion() {
        let err: EngineError = ModelError::FileTooSmall.into();
        assert!(matches!(err, EngineError::ModelValidation(_)));
    }
}
