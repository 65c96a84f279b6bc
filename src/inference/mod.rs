//! LLM inference
//!
//! Model validation, the native engine worker, and the session controller
//! that sequences load, generation and release.

pub mod backend;
pub mod context;
pub mod engine;
pub mod llama;
pub mod model;
pub mod session;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{GenerationRequest, InferenceBackend, SamplingParams};
pub use context::ConversationContext;
pub use engine::{EngineError, NativeEngine};
pub use llama::{spawn_llama_engine, LlamaCppBackend};
pub use session::{GenerateError, InferenceSessionController, LoadError, SessionState};
pub use streaming::{
    FinishReason, GenerationError, GenerationEvent, GenerationOutcome, GenerationStream,
};
