//! Shared type definitions
//!
//! This module contains all shared data types used across the application.

pub mod config;
pub mod message;
pub mod model;

pub use config::{ModelConfig, Tier};
pub use message::{Role, Turn};
pub use model::ModelInfo;
