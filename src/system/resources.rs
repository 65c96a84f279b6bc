//! Device resource readings
//!
//! Raw readers for RAM, battery and CPU information. Every reader is best
//! effort and returns `None` when the platform does not answer; range checks
//! and fallbacks are applied by the profiler.

use std::fs;
use std::path::Path;

#[cfg(target_os = "macos")]
use std::process::Command;

/// Source of raw device metrics
pub trait DeviceSensors: Send + Sync {
    /// Total physical memory in bytes as reported by the platform API
    fn platform_total_ram(&self) -> Option<u64>;

    /// Total physical memory in bytes read from the OS memory-info interface
    fn memory_info_total_ram(&self) -> Option<u64>;

    /// Battery charge as reported, not yet range-checked
    fn battery_percent(&self) -> Option<i64>;

    /// Logical CPU count
    fn cpu_cores(&self) -> Option<usize>;
}

/// Readings backed by the running operating system
#[derive(Debug, Clone, Default)]
pub struct SystemSensors;

impl DeviceSensors for SystemSensors {
    fn platform_total_ram(&self) -> Option<u64> {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        // sysinfo reports 0 when it could not read the value
        match sys.total_memory() {
            0 => None,
            bytes => Some(bytes),
        }
    }

    fn memory_info_total_ram(&self) -> Option<u64> {
        #[cfg(target_os = "macos")]
        {
            return get_macos_total_ram();
        }

        #[cfg(not(target_os = "macos"))]
        {
            let text = fs::read_to_string("/proc/meminfo").ok()?;
            parse_meminfo_total(&text)
        }
    }

    fn battery_percent(&self) -> Option<i64> {
        #[cfg(target_os = "macos")]
        {
            return get_macos_battery_percent();
        }

        #[cfg(not(target_os = "macos"))]
        {
            read_power_supply_capacity(Path::new("/sys/class/power_supply"))
        }
    }

    fn cpu_cores(&self) -> Option<usize> {
        std::thread::available_parallelism().ok().map(|n| n.get())
    }
}

/// Extract `MemTotal` from `/proc/meminfo` contents, in bytes
///
/// The kernel reports the value in kB ("MemTotal:  3867648 kB").
pub fn parse_meminfo_total(text: &str) -> Option<u64> {
    let line = text.lines().find(|l| l.starts_with("MemTotal:"))?;
    let mut parts = line.trim_start_matches("MemTotal:").split_whitespace();
    let value = parts.next()?.parse::<u64>().ok()?;
    let multiplier = match parts.next().map(|u| u.to_ascii_lowercase()) {
        Some(unit) if unit == "kb" => 1024,
        Some(unit) if unit == "mb" => 1024 * 1024,
        None => 1,
        Some(_) => return None,
    };
    value.checked_mul(multiplier)
}

/// Read the first battery capacity under a power-supply class directory
pub fn read_power_supply_capacity(class_dir: &Path) -> Option<i64> {
    let entries = fs::read_dir(class_dir).ok()?;

    for entry in entries.flatten() {
        let supply = entry.path();
        let kind = fs::read_to_string(supply.join("type")).unwrap_or_default();
        if kind.trim() != "Battery" {
            continue;
        }
        if let Ok(raw) = fs::read_to_string(supply.join("capacity")) {
            if let Ok(value) = raw.trim().parse::<i64>() {
                return Some(value);
            }
        }
    }

    None
}

// =============================================================================
// macOS
// =============================================================================

/// Get total RAM via sysctl hw.memsize (bytes)
#[cfg(target_os = "macos")]
fn get_macos_total_ram() -> Option<u64> {
    let output = Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let bytes_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
    bytes_str.parse::<u64>().ok()
}

/// Get battery charge via `pmset -g batt` ("... 85%; discharging; ...")
#[cfg(target_os = "macos")]
fn get_macos_battery_percent() -> Option<i64> {
    let output = Command::new("pmset").args(["-g", "batt"]).output().ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().find_map(|line| {
        let end = line.find('%')?;
        let start = line[..end]
            .rfind(|c: char| !c.is_ascii_digit())
            .map(|i| i + 1)
            .unwrap_or(0);
        line[start..end].parse::<i64>().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo_total() {
        let text = "MemTotal:        3867648 kB\nMemFree:          123456 kB\n";
        assert_eq!(parse_meminfo_total(text), Some(3867648 * 1024));
    }

    #[test]
    fn test_parse_meminfo_rejects_garbage() {
        assert_eq!(parse_meminfo_total("MemFree: 12 kB\n"), None);
        assert_eq!(parse_meminfo_total("MemTotal: lots kB\n"), None);
        assert_eq!(parse_meminfo_total("MemTotal: 12 furlongs\n"), None);
    }

    #[test]
    fn test_read_power_supply_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let ac = dir.path().join("AC");
        fs::create_dir(&ac).unwrap();
        fs::write(ac.join("type"), "Mains\n").unwrap();

        assert_eq!(read_power_supply_capacity(dir.path()), None);

        let bat = dir.path().join("BAT0");
        fs::create_dir(&bat).unwrap();
        fs::write(bat.join("type"), "Battery\n").unwrap();
        fs::write(bat.join("capacity"), "42\n").unwrap();

        assert_eq!(read_power_supply_capacity(dir.path()), Some(42));
    }

    #[test]
    fn test_missing_power_supply_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_power_supply_capacity(&dir.path().join("nope")), None);
    }
}
