//! Model types
//!
//! Defines model metadata reported by the engine.

use serde::{Deserialize, Serialize};

/// Information about a loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Path to the GGUF file
    pub path: String,
    /// Model size in bytes
    pub size_bytes: u64,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Training context length
    pub context_length: u32,
    /// Number of parameters (if known)
    pub parameters: Option<u64>,
}
