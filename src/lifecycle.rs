//! Host lifecycle handling
//!
//! Maps platform lifecycle signals onto the session controller. Going to the
//! background only stops the running generation; the model stays resident
//! so returning to the foreground needs no reload. Only termination releases
//! the weights.

use std::fmt;
use std::sync::Arc;

use crate::inference::InferenceSessionController;

/// Lifecycle signal delivered by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Backgrounded,
    /// Transient loss of focus (dialog, notification shade)
    FocusLost,
    FocusGained,
    Resumed,
    Terminating,
}

/// What the coordinator did in response to a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// A running generation was asked to stop
    Cancelled,
    Unloaded,
    None,
}

impl fmt::Display for LifecycleSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleSignal::Backgrounded => "backgrounded",
            LifecycleSignal::FocusLost => "focus lost",
            LifecycleSignal::FocusGained => "focus gained",
            LifecycleSignal::Resumed => "resumed",
            LifecycleSignal::Terminating => "terminating",
        };
        f.write_str(name)
    }
}

pub struct LifecycleCoordinator {
    controller: Arc<InferenceSessionController>,
}

impl LifecycleCoordinator {
    pub fn new(controller: Arc<InferenceSessionController>) -> Self {
        Self { controller }
    }

    pub async fn handle(&self, signal: LifecycleSignal) -> LifecycleAction {
        let action = match signal {
            LifecycleSignal::Backgrounded => {
                if self.controller.cancel() {
                    LifecycleAction::Cancelled
                } else {
                    LifecycleAction::None
                }
            }
            LifecycleSignal::Terminating => match self.controller.unload().await {
                Ok(()) => LifecycleAction::Unloaded,
                Err(e) => {
                    tracing::error!("Release on termination failed: {}", e);
                    LifecycleAction::None
                }
            },
            LifecycleSignal::FocusLost | LifecycleSignal::FocusGained | LifecycleSignal::Resumed => {
                LifecycleAction::None
            }
        };

        tracing::info!("Lifecycle {}: {:?}", signal, action);
        action
    }
}
