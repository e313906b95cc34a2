//! Time-of-day training windows.
//!
//! The scheduler only answers "is this hour inside a declared window?".
//! Window conditions are typed here but evaluated by the orchestrator against
//! the resource snapshot, so time policy and resource policy stay separate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceSnapshot;

/// Device condition a window additionally requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WindowCondition {
    Always,
    Charging,
    Idle,
    IdleAndCharging,
    WifiConnected,
}

impl WindowCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Charging => "charging",
            Self::Idle => "idle",
            Self::IdleAndCharging => "idle_and_charging",
            Self::WifiConnected => "wifi_connected",
        }
    }

    pub fn holds(self, snapshot: &ResourceSnapshot) -> bool {
        match self {
            Self::Always => true,
            Self::Charging => snapshot.is_charging,
            Self::Idle => !snapshot.user_active,
            Self::IdleAndCharging => snapshot.is_charging && !snapshot.user_active,
            Self::WifiConnected => snapshot.network_unmetered,
        }
    }
}

impl FromStr for WindowCondition {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "always" | "" => Ok(Self::Always),
            "charging" => Ok(Self::Charging),
            "idle" => Ok(Self::Idle),
            "idle_and_charging" => Ok(Self::IdleAndCharging),
            "wifi_connected" | "wifi" => Ok(Self::WifiConnected),
            other => Err(format!("unknown window condition `{other}`")),
        }
    }
}

impl TryFrom<String> for WindowCondition {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WindowCondition> for String {
    fn from(value: WindowCondition) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for WindowCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recurring daily interval `[start_hour, end_hour)` in local time.
///
/// `start_hour > end_hour` wraps past midnight; `start_hour == end_hour`
/// covers the whole day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingWindow {
    pub start_hour: u8,
    pub end_hour: u8,
    pub condition: WindowCondition,
    pub max_duration_minutes: u32,
}

impl TrainingWindow {
    pub fn new(start_hour: u8, end_hour: u8, condition: WindowCondition, max_duration_minutes: u32) -> Self {
        Self {
            start_hour,
            end_hour,
            condition,
            max_duration_minutes,
        }
    }

    pub fn contains_hour(&self, hour: u8) -> bool {
        let hour = hour % 24;
        let start = self.start_hour % 24;
        let end = self.end_hour % 24;
        match start.cmp(&end) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Less => hour >= start && hour < end,
            std::cmp::Ordering::Greater => hour >= start || hour < end,
        }
    }

    pub fn max_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.max_duration_minutes) * 60)
    }
}

/// Windows shipped by default: overnight while charging.
pub fn default_windows() -> Vec<TrainingWindow> {
    vec![
        TrainingWindow::new(2, 5, WindowCondition::IdleAndCharging, 30),
        TrainingWindow::new(22, 2, WindowCondition::Charging, 15),
    ]
}

/// Set of declared windows, combined with OR.
#[derive(Debug, Clone, Default)]
pub struct TrainingScheduler {
    windows: Vec<TrainingWindow>,
}

impl TrainingScheduler {
    pub fn new(windows: Vec<TrainingWindow>) -> Self {
        Self { windows }
    }

    /// Add windows to the existing set.
    pub fn define_windows(&mut self, windows: impl IntoIterator<Item = TrainingWindow>) {
        self.windows.extend(windows);
    }

    pub fn windows(&self) -> &[TrainingWindow] {
        &self.windows
    }

    /// True when any window covers `hour`. No windows means never.
    pub fn is_window(&self, hour: u8) -> bool {
        self.windows.iter().any(|window| window.contains_hour(hour))
    }

    /// First window covering `hour` whose condition holds for `snapshot`.
    pub fn active_window(&self, hour: u8, snapshot: &ResourceSnapshot) -> Option<&TrainingWindow> {
        self.windows
            .iter()
            .find(|window| window.contains_hour(hour) && window.condition.holds(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn snapshot(charging: bool, active: bool) -> ResourceSnapshot {
        ResourceSnapshot {
            battery_percent: 80.0,
            is_charging: charging,
            temperature_c: 30.0,
            available_memory_mb: 800,
            user_active: active,
            network_unmetered: false,
            sampled_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn plain_window_is_half_open() {
        let window = TrainingWindow::new(2, 5, WindowCondition::Always, 10);
        assert!(!window.contains_hour(1));
        assert!(window.contains_hour(2));
        assert!(window.contains_hour(4));
        assert!(!window.contains_hour(5));
    }

    #[test]
    fn wrapping_window_spans_midnight() {
        let window = TrainingWindow::new(22, 2, WindowCondition::Always, 10);
        assert!(window.contains_hour(23));
        assert!(window.contains_hour(0));
        assert!(window.contains_hour(1));
        assert!(!window.contains_hour(2));
        assert!(!window.contains_hour(12));
    }

    #[test]
    fn windows_are_additive() {
        let mut scheduler = TrainingScheduler::default();
        assert!(!scheduler.is_window(3));
        scheduler.define_windows([TrainingWindow::new(2, 5, WindowCondition::Charging, 30)]);
        scheduler.define_windows([TrainingWindow::new(13, 14, WindowCondition::Idle, 5)]);
        assert!(scheduler.is_window(3));
        assert!(scheduler.is_window(13));
        assert!(!scheduler.is_window(9));
    }

    #[test]
    fn active_window_requires_condition() {
        let scheduler = TrainingScheduler::new(default_windows());
        assert!(scheduler.active_window(3, &snapshot(false, false)).is_none());
        assert!(scheduler.active_window(3, &snapshot(true, true)).is_none());
        let window = scheduler.active_window(3, &snapshot(true, false)).unwrap();
        assert_eq!(window.condition, WindowCondition::IdleAndCharging);
        assert!(scheduler.active_window(23, &snapshot(true, true)).is_some());
    }

    #[test]
    fn conditions_parse_from_strings() {
        assert_eq!("idle_and_charging".parse::<WindowCondition>(), Ok(WindowCondition::IdleAndCharging));
        assert_eq!("WIFI_CONNECTED".parse::<WindowCondition>(), Ok(WindowCondition::WifiConnected));
        assert!("moonlight".parse::<WindowCondition>().is_err());
        let window: TrainingWindow = toml::from_str(
            "start_hour = 1\nend_hour = 4\ncondition = \"charging\"\nmax_duration_minutes = 20\n",
        )
        .unwrap();
        assert_eq!(window.condition, WindowCondition::Charging);
    }
}
