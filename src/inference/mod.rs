//! Inference engine seam
//!
//! Defines the contract the session bridge programs against, plus the
//! bundled llama-cpp backend that implements it.

pub mod engine;
pub mod llama;
pub mod model;
pub mod streaming;

// Re-export main types for convenience
pub use engine::{
    Engine, EngineError, EngineHandle, FragmentSink, GenerationParams, GenerationRequest,
    PromptInput,
};
pub use llama::{LlamaCppEngine, LoadedModelInfo};
pub use model::{
    find_model_file, resolve_config_source, validate_gguf, ConfigSource, GgufMetadata, ModelError,
    GGUF_MAGIC,
};
pub use streaming::StreamToken;
