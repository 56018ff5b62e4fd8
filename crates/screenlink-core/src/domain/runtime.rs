//! Runtime mode and heartbeat cadence.
//!
//! A kiosk agent spends most of its life in the foreground, but during
//! maintenance windows the hosting application can push it to the
//! background, and battery-powered units enter power-save overnight. Both
//! conditions stretch the heartbeat cadence so the link stays alive without
//! burning radio time.

use std::time::Duration;

/// Whether the hosting application currently has the agent in view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeMode {
    #[default]
    Foreground,
    Background,
}

/// Device power posture as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    #[default]
    Normal,
    PowerSave,
}

/// Effective heartbeat timing for the current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatCadence {
    /// Spacing between heartbeat sends.
    pub interval: Duration,
    /// How long to wait for the acknowledgment before counting a miss.
    pub timeout: Duration,
}

/// Base cadence plus the widening multipliers.
#[derive(Debug, Clone, Copy)]
pub struct CadenceConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Interval multiplier while backgrounded.
    pub background_multiplier: f64,
    /// Interval multiplier while in power-save; stacks with background.
    pub power_save_multiplier: f64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            background_multiplier: 2.0,
            power_save_multiplier: 1.5,
        }
    }
}

impl CadenceConfig {
    /// Effective cadence for the given mode and power posture.
    ///
    /// Interval and timeout stretch together: the platform schedules a
    /// backgrounded or power-saving process lazily, so a fixed timeout
    /// would count deferred wakeups as misses.
    pub fn cadence(&self, mode: RuntimeMode, power: PowerState) -> HeartbeatCadence {
        let mut factor = 1.0;
        if mode == RuntimeMode::Background {
            factor *= self.background_multiplier;
        }
        if power == PowerState::PowerSave {
            factor *= self.power_save_multiplier;
        }
        HeartbeatCadence {
            interval: Duration::from_secs_f64(self.heartbeat_interval.as_secs_f64() * factor),
            timeout: Duration::from_secs_f64(self.heartbeat_timeout.as_secs_f64() * factor),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
