//! Reconnect backoff and the failure circuit breaker.
//!
//! One backoff policy serves both reconnect scheduling and any other retry
//! loop in the agent, so every retry in the process degrades on the same
//! curve. Jitter desynchronizes a fleet of agents reconnecting after a
//! shared outage.

use std::time::{Duration, Instant};

use rand::Rng;

// ── Backoff ───────────────────────────────────────────────────────────────────

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Delay for the first retry attempt.
    pub initial: Duration,
    /// Ceiling the exponential curve saturates at.
    pub max: Duration,
    /// Multiplier applied per attempt.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            base: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Deterministic delay for a 1-based attempt number:
    /// `min(max, initial * base^(attempt - 1))`.
    ///
    /// Attempt 0 is treated as attempt 1 so a miscounted caller still gets
    /// the initial delay rather than a zero-length spin.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial.as_secs_f64() * self.base.powi(exponent);
        if scaled.is_finite() && scaled < self.max.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max
        }
    }

    /// Delay with uniform jitter drawn from `[0, delay / 4)`.
    pub fn jittered_delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let spread = delay.as_secs_f64() / 4.0;
        if spread <= 0.0 {
            return delay;
        }
        delay + Duration::from_secs_f64(rng.gen_range(0.0..spread))
    }
}

// ── Circuit breaker ───────────────────────────────────────────────────────────

/// Circuit breaker parameters.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before retries may resume.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Counts consecutive connection failures and suspends retries past the
/// threshold. A single success closes the circuit and zeroes the count.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Records a failed connection attempt. Returns `true` if this failure
    /// tripped the circuit open.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.opened_at.is_none() && self.consecutive_failures >= self.config.failure_threshold {
            self.opened_at = Some(now);
            tracing::warn!(
                failures = self.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit breaker opened"
            );
            return true;
        }
        false
    }

    /// Records a successful connection: closes the circuit and resets the
    /// failure count.
    pub fn record_success(&mut self) {
        if self.opened_at.take().is_some() {
            tracing::info!("circuit breaker closed after successful connection");
        }
        self.consecutive_failures = 0;
    }

    /// Whether retries are currently suspended.
    ///
    /// An expired cooldown reads as closed, but the failure count is only
    /// reset by an actual success, so the next failure after a half-open
    /// probe re-trips immediately.
    pub fn is_open(&self, now: Instant) -> bool {
        match self.opened_at {
            Some(opened) => now < opened + self.config.cooldown,
            None => false,
        }
    }

    /// Allows one probe attempt after the cooldown expires.
    pub fn allow_half_open_probe(&mut self, now: Instant) -> bool {
        match self.opened_at {
            Some(opened) if now >= opened + self.config.cooldown => {
                self.opened_at = None;
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// When the cooldown expires, if the circuit is open.
    pub fn reopen_deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.config.cooldown)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
