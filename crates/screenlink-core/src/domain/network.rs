//! Network status snapshot and the debounce / stability-window tracker.
//!
//! OS network callbacks are noisy: a single roaming event can fire half a
//! dozen availability flips in under a second. [`StabilityTracker`] absorbs
//! raw observations and decides *when* a status may be published and when
//! the derived `is_stable` signal may turn true. It is pure state driven by
//! caller-supplied instants, so the async observer task around it stays a
//! thin timer loop and every rule here is unit-testable without a runtime.

use std::time::{Duration, Instant};

// ── Status snapshot ───────────────────────────────────────────────────────────

/// Physical transport carrying the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    None,
    Wifi,
    Cellular,
    Ethernet,
    Other,
}

/// A point-in-time view of the device's network, as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatus {
    /// The OS reports a default route exists.
    pub is_available: bool,
    /// The OS has validated actual internet reachability (captive portals
    /// report available-but-unvalidated).
    pub is_validated: bool,
    /// The transport is metered (cellular or a metered hotspot).
    pub is_metered: bool,
    pub transport: TransportKind,
    /// Signal strength 0–100, absent for wired transports.
    pub signal_strength: Option<u8>,
    /// When this snapshot was taken.
    pub observed_at: Instant,
}

impl NetworkStatus {
    /// A disconnected baseline snapshot.
    pub fn offline(now: Instant) -> Self {
        Self {
            is_available: false,
            is_validated: false,
            is_metered: false,
            transport: TransportKind::None,
            signal_strength: None,
            observed_at: now,
        }
    }

    /// Whether this snapshot *could* count toward stability: available and
    /// validated. Stability itself additionally requires the candidate to
    /// hold for the full stability window.
    pub fn is_stable_candidate(&self) -> bool {
        self.is_available && self.is_validated
    }
}

// ── Tracker ───────────────────────────────────────────────────────────────────

/// Tunable windows for the tracker.
#[derive(Debug, Clone, Copy)]
pub struct StabilityConfig {
    /// Quiet period required after the last raw event before a status
    /// change is published.
    pub debounce: Duration,
    /// Continuous time an available+validated status must hold before
    /// `is_stable` turns true.
    pub stability_window: Duration,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(2000),
            stability_window: Duration::from_millis(3000),
        }
    }
}

/// Signals produced by the tracker, in the order they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityEvent {
    /// The debounce window passed without superseding events; this status
    /// is now the published one.
    StatusPublished(NetworkStatus),
    /// The derived stability signal changed.
    StableChanged(bool),
}

/// Debounces raw network observations and derives the stability signal.
///
/// Call [`observe`](Self::observe) for each raw OS event and
/// [`poll`](Self::poll) whenever [`next_deadline`](Self::next_deadline)
/// elapses. Both return the signals to publish; the tracker itself never
/// initiates any connection action.
#[derive(Debug)]
pub struct StabilityTracker {
    config: StabilityConfig,
    /// Raw status awaiting its debounce deadline.
    pending: Option<(NetworkStatus, Instant)>,
    /// Last published status.
    published: Option<NetworkStatus>,
    /// When the current unbroken run of stable-candidate observations began.
    candidate_since: Option<Instant>,
    is_stable: bool,
}

impl StabilityTracker {
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            pending: None,
            published: None,
            candidate_since: None,
            is_stable: false,
        }
    }

    /// Last published status, if any.
    pub fn published(&self) -> Option<&NetworkStatus> {
        self.published.as_ref()
    }

    pub fn is_stable(&self) -> bool {
        self.is_stable
    }

    /// Records a raw OS network event observed at `now`.
    ///
    /// Restarts the debounce timer. Losing the stable-candidate condition
    /// takes effect immediately: the candidate run is broken and, if the
    /// signal was true, a `StableChanged(false)` is emitted right away
    /// rather than after the debounce (instability must reset the window).
    pub fn observe(&mut self, status: NetworkStatus, now: Instant) -> Vec<StabilityEvent> {
        let mut events = Vec::new();

        if status.is_stable_candidate() {
            // Start a candidate run only if none is in progress; an ongoing
            // run must not be restarted by a superseding candidate event.
            self.candidate_since.get_or_insert(now);
        } else {
            self.candidate_since = None;
            if self.is_stable {
                self.is_stable = false;
                events.push(StabilityEvent::StableChanged(false));
            }
        }

        self.pending = Some((status, now + self.config.debounce));
        events
    }

    /// Advances timer-driven state to `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<StabilityEvent> {
        let mut events = Vec::new();

        if let Some((status, deadline)) = self.pending.take() {
            if now >= deadline {
                if self.published.as_ref() != Some(&status) {
                    self.published = Some(status.clone());
                    events.push(StabilityEvent::StatusPublished(status));
                }
            } else {
                self.pending = Some((status, deadline));
            }
        }

        if !self.is_stable {
            if let Some(since) = self.candidate_since {
                if now >= since + self.config.stability_window {
                    self.is_stable = true;
                    events.push(StabilityEvent::StableChanged(true));
                }
            }
        }

        events
    }

    /// The next instant at which [`poll`](Self::poll) may produce an event,
    /// if any timer is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        let debounce = self.pending.as_ref().map(|(_, d)| *d);
        let stability = match (self.is_stable, self.candidate_since) {
            (false, Some(since)) => Some(since + self.config.stability_window),
            _ => None,
        };
        match (debounce, stability) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
