//! Configuration types
//!
//! Operating configurations derived from device capability.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Preset operating tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    Mid,
    High,
}

impl Tier {
    pub fn name(&self) -> &'static str {
        match self {
            Tier::Low => "low",
            Tier::Mid => "mid",
            Tier::High => "high",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const LOW_SYSTEM_PROMPT: &str = "You are a helpful assistant running offline on this device. \
Answer briefly, in a few sentences at most.";

const MID_SYSTEM_PROMPT: &str = "You are a helpful assistant running offline on this device. \
Give clear, concise answers and use short lists when they help.";

const HIGH_SYSTEM_PROMPT: &str = "You are a helpful assistant running offline on this device. \
Give thorough, well-structured answers. Use lists, code blocks and math notation when useful.";

/// Engine configuration for one loaded session
///
/// Fixed once an engine is loaded with it; changing any field means
/// unloading and loading again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub tier: Tier,
    /// Context window in tokens
    pub context_size: u32,
    /// Retained user/assistant turn pairs
    pub history_limit: usize,
    /// Generation budget per reply
    pub max_tokens: u32,
    pub threads: u32,
    pub batch_size: u32,
    /// Drop the oldest turns from the prompt instead of failing when it overflows the window
    pub smart_context: bool,
    pub system_prompt: String,
}

impl ModelConfig {
    /// The preset for a tier, with the default thread count of 4
    pub fn preset(tier: Tier) -> Self {
        match tier {
            Tier::Low => Self {
                tier,
                context_size: 2048,
                history_limit: 3,
                max_tokens: 256,
                threads: 4,
                batch_size: 256,
                smart_context: true,
                system_prompt: LOW_SYSTEM_PROMPT.to_string(),
            },
            Tier::Mid => Self {
                tier,
                context_size: 4096,
                history_limit: 6,
                max_tokens: 512,
                threads: 4,
                batch_size: 512,
                smart_context: true,
                system_prompt: MID_SYSTEM_PROMPT.to_string(),
            },
            Tier::High => Self {
                tier,
                context_size: 8192,
                history_limit: 10,
                max_tokens: 1024,
                threads: 4,
                batch_size: 512,
                smart_context: false,
                system_prompt: HIGH_SYSTEM_PROMPT.to_string(),
            },
        }
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::preset(Tier::Low)
    }
}
