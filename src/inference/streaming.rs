//! Streaming output types
//!
//! Raw tokens flow from the worker thread as [`StreamToken`]s; callers see
//! a [`GenerationStream`] of fragments closed by exactly one outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::inference::engine::EngineError;

/// Why a generation stopped on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    EndOfSequence,
    MaxTokens,
    Cancelled,
}

/// Worker-thread output for one generation
#[derive(Debug, Clone)]
pub enum StreamToken {
    Token(String),
    Done(FinishReason),
    Error(EngineError),
}

/// Failure in the middle of a generation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Prompt of {prompt_tokens} tokens does not fit the {window}-token context")]
    ContextOverflow { prompt_tokens: usize, window: u32 },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Engine state corrupted, reload required: {0}")]
    Corrupted(String),

    #[error("Inference worker stopped")]
    WorkerGone,
}

impl GenerationError {
    /// True when the engine must be reloaded before the next generation
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, GenerationError::Corrupted(_) | GenerationError::WorkerGone)
    }
}

impl From<EngineError> for GenerationError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::ContextOverflow {
                prompt_tokens,
                window,
            } => GenerationError::ContextOverflow {
                prompt_tokens,
                window,
            },
            EngineError::Corrupted(msg) => GenerationError::Corrupted(msg),
            EngineError::WorkerError(_) => GenerationError::WorkerGone,
            other => GenerationError::Inference(other.to_string()),
        }
    }
}

/// How a generation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed {
        reason: FinishReason,
        fragments: usize,
    },
    Cancelled {
        fragments: usize,
    },
    Failed(GenerationError),
}

/// Event seen by the consumer of a generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Fragment(String),
    /// Always the last event
    Finished(GenerationOutcome),
}

/// Receiving end of one generation
///
/// Dropping the stream before it finishes requests cancellation.
#[derive(Debug)]
pub struct GenerationStream {
    events: mpsc::UnboundedReceiver<GenerationEvent>,
    stop_signal: Arc<AtomicBool>,
    finished: bool,
}

impl GenerationStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<GenerationEvent>,
        stop_signal: Arc<AtomicBool>,
    ) -> Self {
        Self {
            events,
            stop_signal,
            finished: false,
        }
    }

    /// Next event; `None` once the outcome has been delivered
    pub async fn recv(&mut self) -> Option<GenerationEvent> {
        if self.finished {
            return None;
        }
        let event = match self.events.recv().await {
            Some(event) => event,
            None => GenerationEvent::Finished(GenerationOutcome::Failed(GenerationError::WorkerGone)),
        };
        if matches!(event, GenerationEvent::Finished(_)) {
            self.finished = true;
        }
        Some(event)
    }

    /// Ask the engine to stop at the next step boundary
    pub fn cancel(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Drain the stream into the full reply text and its outcome
    pub async fn collect_text(mut self) -> (String, GenerationOutcome) {
        let mut text = String::new();
        while let Some(event) = self.recv().await {
            match event {
                GenerationEvent::Fragment(fragment) => text.push_str(&fragment),
                GenerationEvent::Finished(outcome) => return (text, outcome),
            }
        }
        (text, GenerationOutcome::Failed(GenerationError::WorkerGone))
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        if !self.finished {
            self.stop_signal.store(true, Ordering::SeqCst);
        }
    }
}
