//! Adaptive quality selection.
//!
//! Maps rolling [`HealthMetrics`] to a discrete [`QualityProfile`] through
//! ordered threshold rules with asymmetric hysteresis: downgrades confirm
//! quickly, upgrades require a sustained window of good metrics. Every
//! constant here is configuration, not behavior — deployments tune them.

use std::time::{Duration, Instant};

use crate::domain::health::HealthMetrics;

// ── Profiles ──────────────────────────────────────────────────────────────────

/// Ordered quality ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityLevel {
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityLevel {
    pub const ALL: [QualityLevel; 4] = [
        QualityLevel::Low,
        QualityLevel::Medium,
        QualityLevel::High,
        QualityLevel::Ultra,
    ];
}

/// Immutable streaming parameters for one rung of the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    pub level: QualityLevel,
    pub label: &'static str,
    /// Target frames per second for the transmitter.
    pub frame_rate: u32,
    /// Target encoder bitrate in bits per second.
    pub bitrate_bps: u64,
    pub resolution_width: u32,
    pub resolution_height: u32,
    /// Encoder compression aggressiveness, 0 (none) – 9 (max).
    pub compression_level: u8,
}

impl QualityProfile {
    /// The fixed profile table. Values are starting points; the encoder
    /// collaborator may clamp them to hardware limits.
    pub fn for_level(level: QualityLevel) -> Self {
        match level {
            QualityLevel::Low => Self {
                level,
                label: "LOW",
                frame_rate: 10,
                bitrate_bps: 500_000,
                resolution_width: 854,
                resolution_height: 480,
                compression_level: 8,
            },
            QualityLevel::Medium => Self {
                level,
                label: "MEDIUM",
                frame_rate: 15,
                bitrate_bps: 1_500_000,
                resolution_width: 1280,
                resolution_height: 720,
                compression_level: 6,
            },
            QualityLevel::High => Self {
                level,
                label: "HIGH",
                frame_rate: 24,
                bitrate_bps: 4_000_000,
                resolution_width: 1920,
                resolution_height: 1080,
                compression_level: 4,
            },
            QualityLevel::Ultra => Self {
                level,
                label: "ULTRA",
                frame_rate: 30,
                bitrate_bps: 8_000_000,
                resolution_width: 1920,
                resolution_height: 1080,
                compression_level: 2,
            },
        }
    }

    /// Minimum spacing between transmitted frames at this profile.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frame_rate.max(1)))
    }
}

// ── Thresholds ────────────────────────────────────────────────────────────────

/// Metric ceilings a level must satisfy to be eligible.
#[derive(Debug, Clone, Copy)]
pub struct LevelThresholds {
    pub max_latency_ms: f64,
    pub max_jitter_ms: f64,
    pub max_drop_rate: f64,
}

/// Tunable quality-selection policy.
///
/// The hysteresis pair (fast downgrade, slow upgrade) prevents oscillation
/// around a threshold boundary; both windows are deployment-tunable
/// defaults, not fixed law.
#[derive(Debug, Clone, Copy)]
pub struct QualityConfig {
    /// Degraded metrics must persist this long before a downgrade applies.
    pub downgrade_confirmation: Duration,
    /// Good metrics must persist this long before an upgrade applies.
    pub upgrade_confirmation: Duration,
    /// Latency beyond this forces the lowest profile outright.
    pub critical_latency_ms: f64,
    /// Measured throughput below this, while frames are moving, forces the
    /// lowest profile. Ignored when nothing has been sent in the window,
    /// because the send rate is self-limited by the active profile.
    pub critical_min_throughput_bps: f64,
    /// Drop rate beyond this forces the lowest profile.
    pub critical_drop_rate: f64,
    pub medium: LevelThresholds,
    pub high: LevelThresholds,
    pub ultra: LevelThresholds,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            downgrade_confirmation: Duration::from_millis(500),
            upgrade_confirmation: Duration::from_millis(3000),
            critical_latency_ms: 500.0,
            critical_min_throughput_bps: 200_000.0,
            critical_drop_rate: 0.25,
            medium: LevelThresholds {
                max_latency_ms: 250.0,
                max_jitter_ms: 120.0,
                max_drop_rate: 0.15,
            },
            high: LevelThresholds {
                max_latency_ms: 120.0,
                max_jitter_ms: 80.0,
                max_drop_rate: 0.05,
            },
            ultra: LevelThresholds {
                max_latency_ms: 60.0,
                max_jitter_ms: 50.0,
                max_drop_rate: 0.01,
            },
        }
    }
}

impl QualityConfig {
    fn thresholds_for(&self, level: QualityLevel) -> Option<&LevelThresholds> {
        match level {
            QualityLevel::Low => None,
            QualityLevel::Medium => Some(&self.medium),
            QualityLevel::High => Some(&self.high),
            QualityLevel::Ultra => Some(&self.ultra),
        }
    }
}

/// Pure selection: the highest level whose thresholds are all satisfied.
///
/// A critical breach of any floor short-circuits straight to `Low`.
pub fn select_level(config: &QualityConfig, metrics: &HealthMetrics) -> QualityLevel {
    let moving = metrics.throughput_bps > 0.0 || metrics.frame_drop_rate > 0.0;
    if metrics.is_stalled
        || metrics.last_latency_ms > config.critical_latency_ms
        || metrics.frame_drop_rate > config.critical_drop_rate
        || (moving && metrics.throughput_bps < config.critical_min_throughput_bps)
    {
        return QualityLevel::Low;
    }

    let mut selected = QualityLevel::Low;
    for level in QualityLevel::ALL {
        let Some(t) = config.thresholds_for(level) else {
            continue; // Low has no entry requirements
        };
        if metrics.last_latency_ms <= t.max_latency_ms
            && metrics.jitter_ms <= t.max_jitter_ms
            && metrics.frame_drop_rate <= t.max_drop_rate
        {
            selected = level;
        }
    }
    selected
}

// ── Controller ────────────────────────────────────────────────────────────────

/// Hysteresis wrapper around [`select_level`].
///
/// Tracks how long the selector has been pointing away from the active
/// profile and only commits the change after the direction-appropriate
/// confirmation window.
#[derive(Debug)]
pub struct QualityController {
    config: QualityConfig,
    current: QualityLevel,
    /// Target the selector is currently arguing for, and since when.
    candidate: Option<(QualityLevel, Instant)>,
}

impl QualityController {
    pub fn new(config: QualityConfig, initial: QualityLevel) -> Self {
        Self {
            config,
            current: initial,
            candidate: None,
        }
    }

    pub fn current_profile(&self) -> QualityProfile {
        QualityProfile::for_level(self.current)
    }

    /// Feeds one metrics snapshot. Returns the new profile when a change
    /// commits, `None` otherwise.
    pub fn observe(&mut self, metrics: &HealthMetrics, now: Instant) -> Option<QualityProfile> {
        let target = select_level(&self.config, metrics);

        if target == self.current {
            self.candidate = None;
            return None;
        }

        let since = match self.candidate {
            // Same target still being argued for: keep its start time.
            Some((level, since)) if level == target => since,
            // New or redirected candidate: the clock restarts.
            _ => {
                self.candidate = Some((target, now));
                now
            }
        };

        let confirmation = if target < self.current {
            self.config.downgrade_confirmation
        } else {
            self.config.upgrade_confirmation
        };

        if now.saturating_duration_since(since) >= confirmation {
            tracing::info!(
                from = QualityProfile::for_level(self.current).label,
                to = QualityProfile::for_level(target).label,
                "quality profile change committed"
            );
            self.current = target;
            self.candidate = None;
            Some(self.current_profile())
        } else {
            None
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
