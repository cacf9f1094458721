//! Shared data types
//!
//! Defines chat message structures and roles used across the crate.

pub mod message;

pub use message::{Message, Role};
