//! Network observer task.
//!
//! Bridges raw OS network events into the pure
//! [`StabilityTracker`](screenlink_core::StabilityTracker) and publishes two
//! watch channels: the debounced [`NetworkStatus`] and the derived
//! `is_stable` flag. The observer never initiates connections; the
//! connection manager treats `is_stable` as permission, not command.
//!
//! Raw events arrive on an injection channel. On a kiosk image they come
//! from a platform watcher (netlink on Linux); tests and the mock wiring in
//! `main` inject them directly.

use screenlink_core::{NetworkStatus, StabilityConfig, StabilityEvent, StabilityTracker};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Caller-facing handle to a spawned observer.
pub struct NetworkObserverHandle {
    raw_tx: mpsc::Sender<NetworkStatus>,
    pub status: watch::Receiver<NetworkStatus>,
    pub is_stable: watch::Receiver<bool>,
    join: JoinHandle<()>,
}

impl NetworkObserverHandle {
    /// Injects one raw OS network event.
    pub async fn report(&self, status: NetworkStatus) {
        let _ = self.raw_tx.send(status).await;
    }

    /// A sender for feeding raw events from another task.
    pub fn reporter(&self) -> mpsc::Sender<NetworkStatus> {
        self.raw_tx.clone()
    }

    pub fn shutdown(&self) {
        self.join.abort();
    }
}

/// Spawns the observer task.
pub fn spawn_network_observer(config: StabilityConfig) -> NetworkObserverHandle {
    let now = tokio::time::Instant::now().into_std();
    let (raw_tx, mut raw_rx) = mpsc::channel::<NetworkStatus>(32);
    let (status_tx, status_rx) = watch::channel(NetworkStatus::offline(now));
    let (stable_tx, stable_rx) = watch::channel(false);

    let join = tokio::spawn(async move {
        let mut tracker = StabilityTracker::new(config);

        loop {
            // Timers are re-validated inside the tracker at wake, so a
            // deferred or early wake is harmless.
            let deadline = tracker
                .next_deadline()
                .map(tokio::time::Instant::from_std);

            let events = tokio::select! {
                raw = raw_rx.recv() => {
                    let Some(status) = raw else { break };
                    let now = tokio::time::Instant::now().into_std();
                    tracker.observe(status, now)
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    let now = tokio::time::Instant::now().into_std();
                    tracker.poll(now)
                }
            };

            for event in events {
                match event {
                    StabilityEvent::StatusPublished(status) => {
                        debug!(
                            available = status.is_available,
                            validated = status.is_validated,
                            transport = ?status.transport,
                            "network status published"
                        );
                        let _ = status_tx.send(status);
                    }
                    StabilityEvent::StableChanged(stable) => {
                        info!(stable, "network stability changed");
                        let _ = stable_tx.send(stable);
                    }
                }
            }
        }
    });

    NetworkObserverHandle {
        raw_tx,
        status: status_rx,
        is_stable: stable_rx,
        join,
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
