//! Prompt preprocessing
//!
//! Turns free-form host input into what the engine consumes: extracts
//! inline multimodal references and normalizes chat histories.

pub mod extract;
pub mod history;

// Re-export main types for convenience
pub use extract::{extract, AudioPart, ImagePart, MediaKind, MultimodalPrompt};
pub use history::{normalize_history, DEFAULT_SYSTEM_PROMPT};
