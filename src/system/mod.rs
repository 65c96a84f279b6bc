//! System utilities
//!
//! This module provides device resource probing and capability profiling.

pub mod profiler;
pub mod resources;

pub use profiler::{CapabilityProfiler, CpuArch, DeviceSnapshot};
pub use resources::{DeviceSensors, SystemSensors};
