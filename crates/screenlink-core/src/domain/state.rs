//! Connection lifecycle state.
//!
//! Exactly one [`ConnectionState`] value exists per logical connection. Only
//! the connection manager writes it; every other component observes
//! read-only snapshots published through a broadcast view.

use std::time::{Duration, Instant};

/// The connection manager's single source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in progress.
    Disconnected,
    /// A connect attempt (socket + handshake) is in flight.
    Connecting,
    /// Connected and heartbeating.
    Connected {
        /// When the first heartbeat acknowledgment completed the transition.
        since: Instant,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt counter since the last successful connection.
        attempt: u32,
        /// When the scheduled attempt fires.
        next_attempt_at: Instant,
    },
    /// The relay ordered us not to reconnect.
    ServerBlocked {
        /// Block expiry; `None` means indefinite (until a new directive).
        until: Option<Instant>,
    },
    /// Too many consecutive failures; retries suspended for the cooldown.
    CircuitOpen { since: Instant },
    /// A failure was observed and not yet rescheduled.
    Error { message: String, retryable: bool },
}

impl ConnectionState {
    /// Whether an explicit `connect` call is currently permitted.
    ///
    /// `ServerBlocked` with an unexpired (or indefinite) block and
    /// `CircuitOpen` both refuse; everything else allows the attempt.
    pub fn may_connect(&self, now: Instant) -> bool {
        match self {
            ConnectionState::ServerBlocked { until } => match until {
                Some(t) => now >= *t,
                None => false,
            },
            ConnectionState::CircuitOpen { .. } => false,
            ConnectionState::Connecting | ConnectionState::Connected { .. } => false,
            _ => true,
        }
    }

    /// Whether a live wire session exists or is being established.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected { .. }
        )
    }

    /// Coarse status label for the hosting application.
    pub fn status_label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected { .. } => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::ServerBlocked { .. } => "blocked",
            ConnectionState::CircuitOpen { .. } => "circuit-open",
            ConnectionState::Error { .. } => "error",
        }
    }
}

/// Coarse user-visible status plus an optional reason string.
///
/// The hosting application observes this instead of the full state machine;
/// it never sees the internal retry arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub label: &'static str,
    pub reason: Option<String>,
}

impl ConnectionStatus {
    /// Projects the internal state down to the coarse status.
    pub fn from_state(state: &ConnectionState) -> Self {
        let reason = match state {
            ConnectionState::Error { message, .. } => Some(message.clone()),
            ConnectionState::ServerBlocked { until: None } => {
                Some("server suspended reconnection".to_string())
            }
            ConnectionState::ServerBlocked { until: Some(t) } => Some(format!(
                "server delayed reconnection ({}s remaining)",
                t.saturating_duration_since(Instant::now()).as_secs()
            )),
            ConnectionState::CircuitOpen { .. } => {
                Some("too many consecutive failures".to_string())
            }
            _ => None,
        };
        Self {
            label: state.status_label(),
            reason,
        }
    }
}

/// Reason attached to an explicit disconnect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    UserInitiated,
    Shutdown,
    CredentialsInvalid,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::UserInitiated => "user initiated",
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::CredentialsInvalid => "credentials invalid",
        }
    }
}

/// Helper for expiry comparisons that tolerates process suspension: the
/// stored deadline is monotonic, so "has it elapsed" stays correct even if
/// the timer that was supposed to fire at the deadline was deferred.
pub fn deadline_elapsed(deadline: Instant, now: Instant) -> bool {
    now >= deadline
}

/// Remaining time until `deadline`, zero if already elapsed.
pub fn time_until(deadline: Instant, now: Instant) -> Duration {
    deadline.saturating_duration_since(now)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_allows_connect() {
        let now = Instant::now();
        assert!(ConnectionState::Disconnected.may_connect(now));
    }

    #[test]
    fn test_indefinite_server_block_refuses_connect() {
        let now = Instant::now();
        let state = ConnectionState::ServerBlocked { until: None };
        assert!(!state.may_connect(now));
    }

    #[test]
    fn test_timed_server_block_allows_connect_after_expiry() {
        let now = Instant::now();
        let state = ConnectionState::ServerBlocked {
            until: Some(now + Duration::from_secs(60)),
        };

        assert!(!state.may_connect(now), "block still in force");
        assert!(
            state.may_connect(now + Duration::from_secs(61)),
            "block expired"
        );
    }

    #[test]
    fn test_circuit_open_refuses_connect() {
        let now = Instant::now();
        let state = ConnectionState::CircuitOpen { since: now };
        assert!(!state.may_connect(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_active_states_refuse_duplicate_connect() {
        let now = Instant::now();
        assert!(!ConnectionState::Connecting.may_connect(now));
        assert!(!ConnectionState::Connected { since: now }.may_connect(now));
    }

    #[test]
    fn test_status_projection_carries_error_reason() {
        let state = ConnectionState::Error {
            message: "heartbeat timeout".to_string(),
            retryable: true,
        };
        let status = ConnectionStatus::from_state(&state);
        assert_eq!(status.label, "error");
        assert_eq!(status.reason.as_deref(), Some("heartbeat timeout"));
    }

    #[test]
    fn test_status_projection_connected_has_no_reason() {
        let state = ConnectionState::Connected {
            since: Instant::now(),
        };
        let status = ConnectionStatus::from_state(&state);
        assert_eq!(status.label, "connected");
        assert_eq!(status.reason, None);
    }

    #[test]
    fn test_deadline_elapsed_is_monotonic_safe() {
        let base = Instant::now();
        let deadline = base + Duration::from_secs(10);
        assert!(!deadline_elapsed(deadline, base));
        // A wake long after the deadline (e.g. process resume) still reads
        // as elapsed because both sides are monotonic instants.
        assert!(deadline_elapsed(deadline, base + Duration::from_secs(600)));
        assert_eq!(time_until(deadline, base + Duration::from_secs(600)), Duration::ZERO);
    }
}
