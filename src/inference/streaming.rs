//! Streaming wire types
//!
//! Tokens crossing from the engine worker thread back to the blocking
//! `generate` call.

/// One message on the worker-to-caller token channel.
#[derive(Debug, Clone)]
pub enum StreamToken {
    /// A generated text fragment
    Token(String),
    /// Generation completed
    Done,
    /// An error occurred during generation
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_token_variants() {
        assert!(matches!(
            StreamToken::Token("hello".to_string()),
            StreamToken::Token(_)
        ));
        assert!(matches!(StreamToken::Done, StreamToken::Done));
        assert!(matches!(
            StreamToken::Error("boom".to_string()),
            StreamToken::Error(_)
        ));
    }
}
