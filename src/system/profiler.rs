//! Device capability profiling
//!
//! Samples the device and picks the operating tier the engine is loaded with.

use std::sync::Arc;

use crate::system::resources::{DeviceSensors, SystemSensors};
use crate::types::{ModelConfig, Tier};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Below this charge the lowest tier is forced
pub const LOW_BATTERY_PERCENT: u8 = 20;
/// 6.5 GiB
pub const HIGH_TIER_MIN_RAM: u64 = 13 * GIB / 2;
/// 5.2 GiB
pub const MID_TIER_MIN_RAM: u64 = 26 * GIB / 5;

const MIN_PLAUSIBLE_RAM: u64 = 64 * MIB;
const MAX_PLAUSIBLE_RAM: u64 = 4096 * GIB;
const MAX_PLAUSIBLE_CORES: usize = 1024;

const MOBILE_THREADS: u32 = 4;
const MIN_THREADS: u32 = 4;
const MAX_THREADS: u32 = 8;

/// Point-in-time device metrics. `None` means the metric could not be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub ram_bytes: Option<u64>,
    pub battery_percent: Option<u8>,
    pub cpu_cores: Option<usize>,
}

impl DeviceSnapshot {
    pub fn ram_mb(&self) -> Option<u64> {
        self.ram_bytes.map(|b| b / MIB)
    }
}

/// CPU family, for the thread-count rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    /// ARM silicon, where more than 4 threads throttles
    Mobile,
    Other,
}

impl CpuArch {
    pub fn current() -> Self {
        Self::from_arch_name(std::env::consts::ARCH)
    }

    pub fn from_arch_name(arch: &str) -> Self {
        match arch {
            "aarch64" | "arm" => CpuArch::Mobile,
            _ => CpuArch::Other,
        }
    }
}

/// Reads device metrics and maps them to a [`ModelConfig`]
#[derive(Clone)]
pub struct CapabilityProfiler {
    sensors: Arc<dyn DeviceSensors>,
    arch: CpuArch,
}

impl CapabilityProfiler {
    pub fn new(sensors: Arc<dyn DeviceSensors>, arch: CpuArch) -> Self {
        Self { sensors, arch }
    }

    /// Profiler for the running device
    pub fn system() -> Self {
        Self::new(Arc::new(SystemSensors), CpuArch::current())
    }

    /// Read all metrics. Never fails; unreadable metrics are `None`.
    pub fn sample(&self) -> DeviceSnapshot {
        let snapshot = DeviceSnapshot {
            ram_bytes: self.sample_ram(),
            battery_percent: self.sample_battery(),
            cpu_cores: self.sample_cores(),
        };
        tracing::debug!(
            "Device snapshot: ram={:?} MB, battery={:?}%, cores={:?}",
            snapshot.ram_mb(),
            snapshot.battery_percent,
            snapshot.cpu_cores
        );
        snapshot
    }

    /// Pick the configuration for a snapshot
    pub fn select_tier(&self, snapshot: &DeviceSnapshot) -> ModelConfig {
        select_tier(snapshot, self.arch)
    }

    /// Sample the device and select its tier
    pub fn profile(&self) -> ModelConfig {
        let snapshot = self.sample();
        let config = self.select_tier(&snapshot);
        tracing::info!(
            "Selected {} tier: ctx={}, history={}, max_tokens={}, threads={}",
            config.tier,
            config.context_size,
            config.history_limit,
            config.max_tokens,
            config.threads
        );
        config
    }

    fn sample_ram(&self) -> Option<u64> {
        let plausible = |bytes: &u64| (MIN_PLAUSIBLE_RAM..=MAX_PLAUSIBLE_RAM).contains(bytes);

        if let Some(bytes) = self.sensors.platform_total_ram().filter(plausible) {
            return Some(bytes);
        }
        tracing::debug!("Platform RAM query failed, falling back to memory info");

        let fallback = self.sensors.memory_info_total_ram().filter(plausible);
        if fallback.is_none() {
            tracing::debug!("RAM unknown, low tier will be assumed");
        }
        fallback
    }

    fn sample_battery(&self) -> Option<u8> {
        let raw = self.sensors.battery_percent()?;
        match u8::try_from(raw) {
            Ok(percent) if percent <= 100 => Some(percent),
            _ => {
                tracing::debug!("Ignoring out-of-range battery reading: {}", raw);
                None
            }
        }
    }

    fn sample_cores(&self) -> Option<usize> {
        self.sensors
            .cpu_cores()
            .filter(|n| (1..=MAX_PLAUSIBLE_CORES).contains(n))
    }
}

/// Tier policy: low battery forces the lowest tier, otherwise RAM decides.
pub fn select_tier(snapshot: &DeviceSnapshot, arch: CpuArch) -> ModelConfig {
    let tier = match (snapshot.battery_percent, snapshot.ram_bytes) {
        (Some(battery), _) if battery < LOW_BATTERY_PERCENT => Tier::Low,
        (_, Some(ram)) if ram >= HIGH_TIER_MIN_RAM => Tier::High,
        (_, Some(ram)) if ram >= MID_TIER_MIN_RAM => Tier::Mid,
        _ => Tier::Low,
    };

    ModelConfig::preset(tier).with_threads(thread_count(snapshot.cpu_cores, arch))
}

/// Threads to run the engine with
pub fn thread_count(cores: Option<usize>, arch: CpuArch) -> u32 {
    match (arch, cores) {
        (CpuArch::Mobile, _) => MOBILE_THREADS,
        (CpuArch::Other, None) => MIN_THREADS,
        (CpuArch::Other, Some(cores)) => {
            let scaled = (cores as f64 * 0.75).round() as u32;
            scaled.clamp(MIN_THREADS, MAX_THREADS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[derive(Default)]
    struct FakeSensors {
        platform_ram: Option<u64>,
        meminfo_ram: Option<u64>,
        battery: Option<i64>,
        cores: Option<usize>,
    }

    impl DeviceSensors for FakeSensors {
        fn platform_total_ram(&self) -> Option<u64> {
            self.platform_ram
        }
        fn memory_info_total_ram(&self) -> Option<u64> {
            self.meminfo_ram
        }
        fn battery_percent(&self) -> Option<i64> {
            self.battery
        }
        fn cpu_cores(&self) -> Option<usize> {
            self.cores
        }
    }

    fn snapshot(ram_mb: u64, battery: u8) -> DeviceSnapshot {
        DeviceSnapshot {
            ram_bytes: Some(ram_mb * MB),
            battery_percent: Some(battery),
            cpu_cores: Some(8),
        }
    }

    fn profiler(sensors: FakeSensors) -> CapabilityProfiler {
        CapabilityProfiler::new(Arc::new(sensors), CpuArch::Mobile)
    }

    #[test]
    fn test_low_ram_scenario() {
        let config = select_tier(&snapshot(4096, 85), CpuArch::Mobile);
        assert_eq!(config.tier, Tier::Low);
        assert_eq!(config.context_size, 2048);
        assert_eq!(config.max_tokens, 256);
    }

    #[test]
    fn test_battery_overrides_high_ram() {
        let config = select_tier(&snapshot(7000, 15), CpuArch::Mobile);
        assert_eq!(config.tier, Tier::Low);
    }

    #[test]
    fn test_low_battery_always_low_tier() {
        for battery in 0..LOW_BATTERY_PERCENT {
            for ram_mb in [1024, 4096, 6000, 7000, 16384, 65536] {
                let config = select_tier(&snapshot(ram_mb, battery), CpuArch::Other);
                assert_eq!(config.tier, Tier::Low, "battery={battery} ram={ram_mb}");
            }
        }
    }

    #[test]
    fn test_ram_bands() {
        let tier_for = |ram_bytes: u64, battery: u8| {
            let snapshot = DeviceSnapshot {
                ram_bytes: Some(ram_bytes),
                battery_percent: Some(battery),
                cpu_cores: Some(8),
            };
            select_tier(&snapshot, CpuArch::Mobile).tier
        };

        for battery in [20, 50, 100] {
            assert_eq!(tier_for(MID_TIER_MIN_RAM - 1, battery), Tier::Low);
            assert_eq!(tier_for(MID_TIER_MIN_RAM, battery), Tier::Mid);
            assert_eq!(tier_for(6000 * MB, battery), Tier::Mid);
            assert_eq!(tier_for(HIGH_TIER_MIN_RAM - 1, battery), Tier::Mid);
            assert_eq!(tier_for(HIGH_TIER_MIN_RAM, battery), Tier::High);
            assert_eq!(tier_for(7000 * MB, battery), Tier::High);
            assert_eq!(tier_for(2048 * MB, battery), Tier::Low);
        }
    }

    #[test]
    fn test_unknown_metrics_degrade_safely() {
        let unknown = DeviceSnapshot::default();
        let config = select_tier(&unknown, CpuArch::Other);
        assert_eq!(config.tier, Tier::Low);
        assert_eq!(config.threads, 4);

        // Unknown battery does not block a high tier
        let no_battery = DeviceSnapshot {
            ram_bytes: Some(8192 * MB),
            battery_percent: None,
            cpu_cores: None,
        };
        assert_eq!(select_tier(&no_battery, CpuArch::Other).tier, Tier::High);
    }

    #[test]
    fn test_thread_count() {
        assert_eq!(thread_count(Some(8), CpuArch::Mobile), 4);
        assert_eq!(thread_count(Some(2), CpuArch::Mobile), 4);
        assert_eq!(thread_count(Some(2), CpuArch::Other), 4);
        assert_eq!(thread_count(Some(8), CpuArch::Other), 6);
        assert_eq!(thread_count(Some(10), CpuArch::Other), 8);
        assert_eq!(thread_count(Some(32), CpuArch::Other), 8);
        assert_eq!(thread_count(None, CpuArch::Other), 4);
    }

    #[test]
    fn test_arch_names() {
        assert_eq!(CpuArch::from_arch_name("aarch64"), CpuArch::Mobile);
        assert_eq!(CpuArch::from_arch_name("arm"), CpuArch::Mobile);
        assert_eq!(CpuArch::from_arch_name("x86_64"), CpuArch::Other);
    }

    #[test]
    fn test_ram_fallback_chain() {
        let p = profiler(FakeSensors {
            platform_ram: None,
            meminfo_ram: Some(6 * 1024 * MB),
            ..Default::default()
        });
        assert_eq!(p.sample().ram_bytes, Some(6 * 1024 * MB));

        // Implausible platform value is skipped in favour of memory info
        let p = profiler(FakeSensors {
            platform_ram: Some(12),
            meminfo_ram: Some(3 * 1024 * MB),
            ..Default::default()
        });
        assert_eq!(p.sample().ram_bytes, Some(3 * 1024 * MB));

        let p = profiler(FakeSensors::default());
        assert_eq!(p.sample().ram_bytes, None);
        assert_eq!(p.profile().tier, Tier::Low);
    }

    #[test]
    fn test_battery_range_check() {
        for raw in [-1, 101, 255, 1000] {
            let p = profiler(FakeSensors {
                battery: Some(raw),
                ..Default::default()
            });
            assert_eq!(p.sample().battery_percent, None, "raw={raw}");
        }
        let p = profiler(FakeSensors {
            battery: Some(19),
            ..Default::default()
        });
        assert_eq!(p.sample().battery_percent, Some(19));
    }

    #[test]
    fn test_profile_uses_sensors() {
        let p = profiler(FakeSensors {
            platform_ram: Some(8 * 1024 * MB),
            battery: Some(90),
            cores: Some(8),
            ..Default::default()
        });
        let config = p.profile();
        assert_eq!(config.tier, Tier::High);
        assert_eq!(config.threads, 4);
    }
}
