//! Offline assistant core
//!
//! On-device LLM chat: device profiling, model asset management, a single
//! native inference session and conversation storage.

pub mod app;
pub mod inference;
pub mod lifecycle;
pub mod storage;
pub mod system;
pub mod types;

pub use app::{AppError, AssistantCore};
