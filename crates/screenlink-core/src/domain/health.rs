//! Connection health measurement.
//!
//! The monitor ingests ping/pong round trips and frame send/drop events and
//! publishes [`HealthMetrics`] snapshots. It never transitions connection
//! state itself; the connection manager and quality controller read the
//! snapshots and act on them.
//!
//! All methods take the current instant as a parameter, so the rolling
//! windows behave identically under `tokio::time::pause` and in plain unit
//! tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Tunables for health measurement.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// Number of latency samples in the jitter window.
    pub latency_window: usize,
    /// Width of the rolling throughput / drop-rate window.
    pub throughput_window: Duration,
    /// Silence on the pong channel longer than this marks the connection
    /// stalled.
    pub stall_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            latency_window: 10,
            throughput_window: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(15),
        }
    }
}

// ── Published snapshot ────────────────────────────────────────────────────────

/// Read-only metrics snapshot published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    pub last_latency_ms: f64,
    /// Population standard deviation of the latency window.
    pub jitter_ms: f64,
    /// Bits per second over the rolling window.
    pub throughput_bps: f64,
    /// Bits per second averaged over the whole connection lifetime.
    pub average_throughput_bps: f64,
    /// Dropped frames in the rolling window divided by window frame total.
    pub frame_drop_rate: f64,
    pub dropped_frames: u64,
    pub total_frames_sent: u64,
    pub consecutive_healthy_checks: u32,
    pub is_stalled: bool,
    pub last_checked_at: Instant,
}

/// Ordered health classification, derived from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthLevel {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl HealthMetrics {
    /// Classifies the snapshot on the ordered scale.
    ///
    /// Boundaries follow the latency bands used for quality selection; a
    /// stalled connection is always `Critical` regardless of its last
    /// measured latency.
    pub fn level(&self) -> HealthLevel {
        if self.is_stalled || self.frame_drop_rate > 0.25 {
            return HealthLevel::Critical;
        }
        match self.last_latency_ms {
            l if l < 50.0 => HealthLevel::Excellent,
            l if l < 120.0 => HealthLevel::Good,
            l if l < 250.0 => HealthLevel::Fair,
            l if l < 500.0 => HealthLevel::Poor,
            _ => HealthLevel::Critical,
        }
    }
}

// ── Monitor ───────────────────────────────────────────────────────────────────

/// Single-owner health state. Created at connection start, discarded on
/// disconnect.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    started_at: Instant,
    ping_sent_at: Option<Instant>,
    last_pong_at: Option<Instant>,
    latencies_ms: VecDeque<f64>,
    consecutive_healthy_checks: u32,
    is_stalled: bool,
    /// (instant, payload bytes) of recent sends, pruned to the window.
    sent_window: VecDeque<(Instant, usize)>,
    /// Instants of recent drops, pruned to the window.
    drop_window: VecDeque<Instant>,
    total_bytes_sent: u64,
    total_frames_sent: u64,
    dropped_frames: u64,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, now: Instant) -> Self {
        Self {
            config,
            started_at: now,
            ping_sent_at: None,
            last_pong_at: None,
            latencies_ms: VecDeque::with_capacity(config.latency_window),
            consecutive_healthy_checks: 0,
            is_stalled: false,
            sent_window: VecDeque::new(),
            drop_window: VecDeque::new(),
            total_bytes_sent: 0,
            total_frames_sent: 0,
            dropped_frames: 0,
        }
    }

    /// Records the departure of a ping. The matching pong computes latency
    /// against this timestamp; heartbeats are serial, so one outstanding
    /// ping at a time is sufficient.
    pub fn record_ping(&mut self, now: Instant) {
        self.ping_sent_at = Some(now);
    }

    /// Records the matching pong and returns the measured latency, if a
    /// ping was outstanding.
    pub fn record_pong(&mut self, now: Instant) -> Option<Duration> {
        let sent_at = self.ping_sent_at.take()?;
        let latency = now.saturating_duration_since(sent_at);

        self.latencies_ms.push_back(latency.as_secs_f64() * 1000.0);
        while self.latencies_ms.len() > self.config.latency_window {
            self.latencies_ms.pop_front();
        }

        self.last_pong_at = Some(now);
        self.is_stalled = false;
        self.consecutive_healthy_checks = self.consecutive_healthy_checks.saturating_add(1);
        Some(latency)
    }

    /// Replaces the stall horizon. Pongs only arrive on heartbeat
    /// acknowledgments, so the horizon must cover at least one full
    /// heartbeat interval at the current cadence.
    pub fn set_stall_timeout(&mut self, timeout: Duration) {
        self.config.stall_timeout = timeout;
    }

    /// Periodic stall check: compares silence since the last pong (or since
    /// connection start if none arrived yet) against the stall timeout.
    /// Returns the updated stalled flag.
    pub fn check_stall(&mut self, now: Instant) -> bool {
        let reference = self.last_pong_at.unwrap_or(self.started_at);
        if now.saturating_duration_since(reference) > self.config.stall_timeout {
            self.is_stalled = true;
            self.consecutive_healthy_checks = 0;
        }
        self.is_stalled
    }

    /// Records a successfully transmitted frame of `bytes` payload bytes.
    pub fn record_frame_sent(&mut self, bytes: usize, now: Instant) {
        self.sent_window.push_back((now, bytes));
        self.total_bytes_sent += bytes as u64;
        self.total_frames_sent += 1;
        self.prune(now);
    }

    /// Records a frame evicted or discarded before transmission.
    pub fn record_frame_drop(&mut self, now: Instant) {
        self.drop_window.push_back(now);
        self.dropped_frames += 1;
        self.prune(now);
    }

    /// Jitter as the population standard deviation of the latency window.
    pub fn jitter_ms(&self) -> f64 {
        let n = self.latencies_ms.len();
        if n == 0 {
            return 0.0;
        }
        let mean = self.latencies_ms.iter().sum::<f64>() / n as f64;
        let variance = self
            .latencies_ms
            .iter()
            .map(|l| (l - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        variance.sqrt()
    }

    /// Bits per second over the rolling window.
    pub fn throughput_bps(&mut self, now: Instant) -> f64 {
        self.prune(now);
        let bytes: usize = self.sent_window.iter().map(|(_, b)| b).sum();
        (bytes as f64 * 8.0) / self.config.throughput_window.as_secs_f64()
    }

    /// Takes a read-only snapshot of the current metrics.
    pub fn snapshot(&mut self, now: Instant) -> HealthMetrics {
        let throughput_bps = self.throughput_bps(now);
        let window_sent = self.sent_window.len() as u64;
        let window_dropped = self.drop_window.len() as u64;
        let window_total = window_sent + window_dropped;
        let frame_drop_rate = if window_total == 0 {
            0.0
        } else {
            window_dropped as f64 / window_total as f64
        };

        let lifetime = now.saturating_duration_since(self.started_at).as_secs_f64();
        let average_throughput_bps = if lifetime > 0.0 {
            self.total_bytes_sent as f64 * 8.0 / lifetime
        } else {
            0.0
        };

        HealthMetrics {
            last_latency_ms: self.latencies_ms.back().copied().unwrap_or(0.0),
            jitter_ms: self.jitter_ms(),
            throughput_bps,
            average_throughput_bps,
            frame_drop_rate,
            dropped_frames: self.dropped_frames,
            total_frames_sent: self.total_frames_sent,
            consecutive_healthy_checks: self.consecutive_healthy_checks,
            is_stalled: self.is_stalled,
            last_checked_at: now,
        }
    }

    fn prune(&mut self, now: Instant) {
        let cutoff = now
            .checked_sub(self.config.throughput_window)
            .unwrap_or(self.started_at);
        while self
            .sent_window
            .front()
            .is_some_and(|(t, _)| *t < cutoff)
        {
            self.sent_window.pop_front();
        }
        while self.drop_window.front().is_some_and(|t| *t < cutoff) {
            self.drop_window.pop_front();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
