//! Chat history normalization
//!
//! Produces the canonical message list handed to the engine's chat
//! template: a conversation always opens with a system turn.

use crate::types::{Message, Role};

/// System prompt injected when the caller supplies none.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Normalize a turn sequence into a canonical message list.
///
/// If the first turn is already a system turn the sequence is returned
/// unchanged; otherwise the default system message is prepended. An
/// empty sequence yields just the default system turn.
pub fn normalize_history(turns: &[Message]) -> Vec<Message> {
    if turns.first().map(|m| m.role) == Some(Role::System) {
        return turns.to_vec();
    }

    let mut normalized = Vec::with_capacity(turns.len() + 1);
    normalized.push(Message::system(DEFAULT_SYSTEM_PROMPT));
    normalized.extend_from_slice(turns);
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_history_gets_system_turn() {
        let normalized = normalize_history(&[]);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].role, Role::System);
        assert_eq!(normalized[0].content, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_existing_system_turn_unchanged() {
        let turns = vec![Message::system("X"), Message::user("Y")];
        let normalized = normalize_history(&turns);
        assert_eq!(normalized, turns);
    }

    #[test]
    fn test_user_first_gets_default_prepended() {
        let turns = vec![Message::user("Y")];
        let normalized = normalize_history(&turns);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].role, Role::System);
        assert_eq!(normalized[0].content, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(normalized[1].content, "Y");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let turns = vec![Message::user("hi"), Message::assistant("hello")];
        let once = normalize_history(&turns);
        let twice = normalize_history(&once);
        assert_eq!(once, twice);
    }
}
