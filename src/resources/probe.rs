//! Raw device readings feeding the resource monitor.

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sysinfo::{Components, System};

/// One raw sample of the device state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceReading {
    pub battery_percent: f32,
    pub is_charging: bool,
    /// Hottest sensor in degrees Celsius, or a load-derived proxy.
    pub temperature_c: f32,
    pub available_memory_mb: u64,
    /// Activity reported by the platform itself; the monitor also tracks
    /// host-reported interaction.
    pub user_active: bool,
    pub network_unmetered: bool,
}

impl Default for ResourceReading {
    fn default() -> Self {
        Self {
            battery_percent: 100.0,
            is_charging: true,
            temperature_c: 30.0,
            available_memory_mb: 1024,
            user_active: false,
            network_unmetered: true,
        }
    }
}

/// Coarse hardware tier reported with federated contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Low,
    Mid,
    High,
}

impl DeviceClass {
    pub fn from_hardware(total_memory_mb: u64, cpu_count: usize) -> Self {
        if total_memory_mb >= 8 * 1024 && cpu_count >= 8 {
            Self::High
        } else if total_memory_mb >= 4 * 1024 && cpu_count >= 4 {
            Self::Mid
        } else {
            Self::Low
        }
    }
}

/// Source of device readings.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceReading;
    fn device_class(&self) -> DeviceClass;
}

/// Reads the live machine through `sysinfo` and the platform power supply.
pub struct SystemProbe {
    system: Mutex<System>,
    components: Mutex<Components>,
    device_class: DeviceClass,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let device_class = DeviceClass::from_hardware(system.total_memory() / MB, cpu_count);
        Self {
            system: Mutex::new(system),
            components: Mutex::new(Components::new_with_refreshed_list()),
            device_class,
        }
    }

    fn memory_and_load(&self) -> (u64, f32) {
        let Ok(mut system) = self.system.lock() else {
            return (0, 100.0);
        };
        system.refresh_memory();
        system.refresh_cpu_usage();
        (system.available_memory() / MB, system.global_cpu_usage())
    }

    fn hottest_sensor(&self) -> Option<f32> {
        let mut components = self.components.lock().ok()?;
        components.refresh(false);
        components
            .list()
            .iter()
            .filter_map(|component| component.temperature())
            .filter(|temp| temp.is_finite())
            .reduce(f32::max)
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

const MB: u64 = 1024 * 1024;

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceReading {
        let (available_memory_mb, cpu_usage) = self.memory_and_load();
        let temperature_c = self
            .hottest_sensor()
            .unwrap_or_else(|| load_temperature_proxy(cpu_usage));
        let (battery_percent, is_charging) =
            read_power_supply(Path::new(POWER_SUPPLY_ROOT)).unwrap_or((100.0, true));
        ResourceReading {
            battery_percent,
            is_charging,
            temperature_c,
            available_memory_mb,
            user_active: false,
            // Metering is not observable here; hosts with that signal use `StaticProbe`.
            network_unmetered: true,
        }
    }

    fn device_class(&self) -> DeviceClass {
        self.device_class
    }
}

/// Maps CPU usage (0-100%) onto 25-50 degrees for machines without sensors.
fn load_temperature_proxy(cpu_usage: f32) -> f32 {
    25.0 + cpu_usage.clamp(0.0, 100.0) * 0.25
}

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

/// Returns `(percent, charging)` for the first battery found, `None` when
/// the machine has no battery.
fn read_power_supply(root: &Path) -> Option<(f32, bool)> {
    let entries = std::fs::read_dir(root).ok()?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let dir = entry.path();
        let kind = read_trimmed(&dir.join("type"));
        if kind.as_deref() != Some("Battery") {
            continue;
        }
        let Some(capacity) = read_trimmed(&dir.join("capacity")).and_then(|v| v.parse::<f32>().ok())
        else {
            continue;
        };
        let status = read_trimmed(&dir.join("status")).unwrap_or_default();
        let charging = matches!(status.as_str(), "Charging" | "Full");
        return Some((capacity.clamp(0.0, 100.0), charging));
    }
    None
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
}

/// Probe returning whatever reading was last pushed into it.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    reading: Arc<Mutex<ResourceReading>>,
    device_class: DeviceClass,
}

impl StaticProbe {
    pub fn new(reading: ResourceReading) -> Self {
        Self {
            reading: Arc::new(Mutex::new(reading)),
            device_class: DeviceClass::Mid,
        }
    }

    pub fn with_device_class(mut self, device_class: DeviceClass) -> Self {
        self.device_class = device_class;
        self
    }

    pub fn set(&self, reading: ResourceReading) {
        if let Ok(mut guard) = self.reading.lock() {
            *guard = reading;
        }
    }

    pub fn update(&self, apply: impl FnOnce(&mut ResourceReading)) {
        if let Ok(mut guard) = self.reading.lock() {
            apply(&mut guard);
        }
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> ResourceReading {
        self.reading
            .lock()
            .map(|guard| *guard)
            .unwrap_or_else(|err| *err.into_inner())
    }

    fn device_class(&self) -> DeviceClass {
        self.device_class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reads_first_battery_from_power_supply_tree() {
        let root = tempdir().unwrap();
        let ac = root.path().join("AC");
        std::fs::create_dir(&ac).unwrap();
        std::fs::write(ac.join("type"), "Mains\n").unwrap();
        let bat = root.path().join("BAT0");
        std::fs::create_dir(&bat).unwrap();
        std::fs::write(bat.join("type"), "Battery\n").unwrap();
        std::fs::write(bat.join("capacity"), "64\n").unwrap();
        std::fs::write(bat.join("status"), "Discharging\n").unwrap();

        assert_eq!(read_power_supply(root.path()), Some((64.0, false)));
    }

    #[test]
    fn missing_battery_reports_none() {
        let root = tempdir().unwrap();
        assert_eq!(read_power_supply(root.path()), None);
    }

    #[test]
    fn device_class_tiers() {
        assert_eq!(DeviceClass::from_hardware(16 * 1024, 12), DeviceClass::High);
        assert_eq!(DeviceClass::from_hardware(6 * 1024, 4), DeviceClass::Mid);
        assert_eq!(DeviceClass::from_hardware(2 * 1024, 8), DeviceClass::Low);
    }

    #[test]
    fn static_probe_reflects_updates() {
        let probe = StaticProbe::new(ResourceReading::default());
        probe.update(|reading| reading.battery_percent = 12.0);
        assert_eq!(probe.sample().battery_percent, 12.0);
    }
}
