//! Device resource monitoring and the training eligibility gates.
//!
//! Every threshold that decides whether the device can afford a training
//! session lives in [`ResourceThresholds`]. Callers only ever see named gates
//! and the derived [`TrainingMode`].

mod probe;

use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::clock::Clock;
use crate::learn::TrainingMode;

pub use probe::{DeviceClass, ResourceProbe, ResourceReading, StaticProbe, SystemProbe};

/// Point-in-time view of the device, owned by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub battery_percent: f32,
    pub is_charging: bool,
    pub temperature_c: f32,
    pub available_memory_mb: u64,
    pub user_active: bool,
    pub network_unmetered: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub sampled_at: OffsetDateTime,
}

impl ResourceSnapshot {
    pub fn from_reading(reading: ResourceReading, sampled_at: OffsetDateTime) -> Self {
        Self {
            battery_percent: reading.battery_percent,
            is_charging: reading.is_charging,
            temperature_c: reading.temperature_c,
            available_memory_mb: reading.available_memory_mb,
            user_active: reading.user_active,
            network_unmetered: reading.network_unmetered,
            sampled_at,
        }
    }
}

/// Thresholds behind every resource gate and the mode decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceThresholds {
    /// Below this the battery gate fails, charging or not.
    #[serde(default = "default_min_battery_percent")]
    pub min_battery_percent: f32,
    /// When not charging, the battery must be at least this full.
    #[serde(default = "default_unplugged_battery_percent")]
    pub unplugged_battery_percent: f32,
    #[serde(default = "default_max_temperature_c")]
    pub max_temperature_c: f32,
    #[serde(default = "default_min_memory_mb")]
    pub min_memory_mb: u64,
    /// Balanced mode needs strictly more battery than this.
    #[serde(default = "default_balanced_battery_percent")]
    pub balanced_battery_percent: f32,
    #[serde(default = "default_balanced_memory_mb")]
    pub balanced_memory_mb: u64,
    /// Intensive mode needs charging and strictly more battery than this.
    #[serde(default = "default_intensive_battery_percent")]
    pub intensive_battery_percent: f32,
    #[serde(default = "default_intensive_memory_mb")]
    pub intensive_memory_mb: u64,
    /// Host-reported interaction keeps the user "active" this long.
    #[serde(default = "default_idle_after_secs")]
    pub idle_after_secs: u64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            min_battery_percent: default_min_battery_percent(),
            unplugged_battery_percent: default_unplugged_battery_percent(),
            max_temperature_c: default_max_temperature_c(),
            min_memory_mb: default_min_memory_mb(),
            balanced_battery_percent: default_balanced_battery_percent(),
            balanced_memory_mb: default_balanced_memory_mb(),
            intensive_battery_percent: default_intensive_battery_percent(),
            intensive_memory_mb: default_intensive_memory_mb(),
            idle_after_secs: default_idle_after_secs(),
        }
    }
}

fn default_min_battery_percent() -> f32 {
    30.0
}

fn default_unplugged_battery_percent() -> f32 {
    50.0
}

fn default_max_temperature_c() -> f32 {
    40.0
}

fn default_min_memory_mb() -> u64 {
    200
}

fn default_balanced_battery_percent() -> f32 {
    50.0
}

fn default_balanced_memory_mb() -> u64 {
    500
}

fn default_intensive_battery_percent() -> f32 {
    80.0
}

fn default_intensive_memory_mb() -> u64 {
    1000
}

fn default_idle_after_secs() -> u64 {
    300
}

/// The resource gates, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceGate {
    BatterySufficient,
    ChargingOrHighBattery,
    ThermalSafe,
    MemorySufficient,
    UserIdle,
}

impl ResourceGate {
    pub const ORDERED: [ResourceGate; 5] = [
        ResourceGate::BatterySufficient,
        ResourceGate::ChargingOrHighBattery,
        ResourceGate::ThermalSafe,
        ResourceGate::MemorySufficient,
        ResourceGate::UserIdle,
    ];

    /// Reason reported when this gate blocks training.
    pub fn reason(self) -> &'static str {
        match self {
            Self::BatterySufficient => "Battery too low",
            Self::ChargingOrHighBattery => "Not charging and battery not high enough",
            Self::ThermalSafe => "Device too hot",
            Self::MemorySufficient => "Insufficient memory",
            Self::UserIdle => "User is active",
        }
    }
}

impl ResourceThresholds {
    pub fn passes(&self, gate: ResourceGate, snapshot: &ResourceSnapshot) -> bool {
        match gate {
            ResourceGate::BatterySufficient => {
                snapshot.battery_percent >= self.min_battery_percent
            }
            ResourceGate::ChargingOrHighBattery => {
                snapshot.is_charging || snapshot.battery_percent >= self.unplugged_battery_percent
            }
            ResourceGate::ThermalSafe => snapshot.temperature_c <= self.max_temperature_c,
            ResourceGate::MemorySufficient => snapshot.available_memory_mb >= self.min_memory_mb,
            ResourceGate::UserIdle => !snapshot.user_active,
        }
    }

    /// First gate that fails, in [`ResourceGate::ORDERED`] order.
    pub fn first_failing(&self, snapshot: &ResourceSnapshot) -> Option<ResourceGate> {
        ResourceGate::ORDERED
            .into_iter()
            .find(|gate| !self.passes(*gate, snapshot))
    }

    /// Heaviest mode the snapshot can afford, `None` when a gate fails.
    pub fn mode_for(&self, snapshot: &ResourceSnapshot) -> Option<TrainingMode> {
        if self.first_failing(snapshot).is_some() {
            return None;
        }
        let battery = snapshot.battery_percent;
        let memory = snapshot.available_memory_mb;
        if snapshot.is_charging
            && battery > self.intensive_battery_percent
            && memory > self.intensive_memory_mb
        {
            Some(TrainingMode::Intensive)
        } else if battery > self.balanced_battery_percent && memory > self.balanced_memory_mb {
            Some(TrainingMode::Balanced)
        } else {
            Some(TrainingMode::Light)
        }
    }
}

/// Keeps a live [`ResourceSnapshot`] and answers gate questions about it.
///
/// Cloning yields another handle onto the same snapshot, so the refresh loop
/// and the orchestrator observe one state.
#[derive(Clone)]
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    clock: Arc<dyn Clock>,
    thresholds: ResourceThresholds,
    snapshot: Arc<RwLock<ResourceSnapshot>>,
    last_interaction: Arc<Mutex<Option<OffsetDateTime>>>,
}

impl ResourceMonitor {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        clock: Arc<dyn Clock>,
        thresholds: ResourceThresholds,
    ) -> Self {
        let snapshot = ResourceSnapshot::from_reading(probe.sample(), clock.now());
        Self {
            probe,
            clock,
            thresholds,
            snapshot: Arc::new(RwLock::new(snapshot)),
            last_interaction: Arc::new(Mutex::new(None)),
        }
    }

    /// Take a new reading from the probe and publish it.
    pub fn refresh(&self) -> ResourceSnapshot {
        let now = self.clock.now();
        let mut snapshot = ResourceSnapshot::from_reading(self.probe.sample(), now);
        snapshot.user_active |= self.recent_interaction(now);
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = snapshot;
        }
        tracing::trace!(?snapshot, "resource snapshot refreshed");
        snapshot
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.snapshot
            .read()
            .map(|guard| *guard)
            .unwrap_or_else(|err| *err.into_inner())
    }

    /// Note that the user just interacted with the device.
    pub fn record_user_activity(&self) {
        let now = self.clock.now();
        if let Ok(mut guard) = self.last_interaction.lock() {
            *guard = Some(now);
        }
        if let Ok(mut snapshot) = self.snapshot.write() {
            snapshot.user_active = true;
        }
    }

    fn recent_interaction(&self, now: OffsetDateTime) -> bool {
        let idle_after = Duration::seconds(self.thresholds.idle_after_secs as i64);
        self.last_interaction
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .is_some_and(|at| now - at < idle_after)
    }

    pub fn thresholds(&self) -> &ResourceThresholds {
        &self.thresholds
    }

    pub fn device_class(&self) -> DeviceClass {
        self.probe.device_class()
    }

    pub fn optimal_training_mode(&self) -> Option<TrainingMode> {
        self.thresholds.mode_for(&self.snapshot())
    }

    pub fn first_failing_gate(&self) -> Option<ResourceGate> {
        self.thresholds.first_failing(&self.snapshot())
    }

    pub fn battery_sufficient(&self) -> bool {
        self.gate(ResourceGate::BatterySufficient)
    }

    pub fn charging_or_high_battery(&self) -> bool {
        self.gate(ResourceGate::ChargingOrHighBattery)
    }

    pub fn thermal_safe(&self) -> bool {
        self.gate(ResourceGate::ThermalSafe)
    }

    pub fn memory_sufficient(&self) -> bool {
        self.gate(ResourceGate::MemorySufficient)
    }

    pub fn user_idle(&self) -> bool {
        self.gate(ResourceGate::UserIdle)
    }

    fn gate(&self, gate: ResourceGate) -> bool {
        self.thresholds.passes(gate, &self.snapshot())
    }
}
