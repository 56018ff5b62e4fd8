//! Streaming pipeline: bounded frame queue, paced transmitter, and the
//! adaptive quality task.
//!
//! Capture produces frames faster than a degraded link can carry them, so
//! the queue is small and lossy on purpose: when it overflows, the oldest
//! non-keyframe goes first, keeping the decoder's reference frames alive as
//! long as possible. The transmitter paces sends to the active quality
//! profile's frame rate and simply drops frames while disconnected —
//! a kiosk mirror has no use for stale frames delivered late.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use screenlink_core::{
    encode_frame, FrameEnvelope, HealthMetrics, QualityConfig, QualityController, QualityLevel,
    QualityProfile,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::infrastructure::network::connection_manager::{Outbound, SharedOutbound};

// ── Frame queue ───────────────────────────────────────────────────────────────

/// Default queue depth. Roughly 150 ms of video at 30 fps; anything deeper
/// just adds latency that the viewer perceives as lag.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

/// A frame waiting for transmission.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub envelope: FrameEnvelope,
    pub enqueued_at: Instant,
}

/// Bounded FIFO with keyframe-aware eviction.
#[derive(Debug)]
pub struct FrameQueue {
    capacity: usize,
    frames: VecDeque<QueuedFrame>,
    dropped: u64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: VecDeque::with_capacity(capacity),
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames dropped by eviction or discard since creation.
    pub fn dropped_total(&self) -> u64 {
        self.dropped
    }

    /// Enqueues a frame, evicting if the queue is full. The eviction victim
    /// is the oldest non-keyframe; only when every queued frame is a
    /// keyframe does the oldest keyframe go.
    ///
    /// Returns the evicted frame, if any.
    pub fn push(&mut self, envelope: FrameEnvelope, now: Instant) -> Option<QueuedFrame> {
        let evicted = if self.frames.len() >= self.capacity {
            let victim = self
                .frames
                .iter()
                .position(|f| !f.envelope.is_keyframe)
                .unwrap_or(0);
            let frame = self.frames.remove(victim);
            self.dropped += 1;
            frame
        } else {
            None
        };

        self.frames.push_back(QueuedFrame {
            envelope,
            enqueued_at: now,
        });
        evicted
    }

    /// Dequeues the oldest frame.
    pub fn pop(&mut self) -> Option<QueuedFrame> {
        self.frames.pop_front()
    }

    /// Counts a frame discarded outside the queue (e.g. popped while
    /// disconnected).
    pub fn note_drop(&mut self) {
        self.dropped += 1;
    }
}

/// The queue as shared between capture and the transmitter.
pub type SharedFrameQueue = Arc<Mutex<FrameQueue>>;

pub fn shared_frame_queue(capacity: usize) -> SharedFrameQueue {
    Arc::new(Mutex::new(FrameQueue::new(capacity)))
}

// ── Quality task ──────────────────────────────────────────────────────────────

/// Spawns the adaptive quality task: consumes health snapshots, drives the
/// hysteresis controller, publishes the active profile.
///
/// Re-evaluates on every snapshot and on a one-second tick, so confirmation
/// windows commit promptly even when metrics are quiet.
pub fn spawn_quality_task(
    config: QualityConfig,
    initial: QualityLevel,
    mut health_rx: watch::Receiver<HealthMetrics>,
) -> (watch::Receiver<QualityProfile>, JoinHandle<()>) {
    let mut controller = QualityController::new(config, initial);
    let (profile_tx, profile_rx) = watch::channel(controller.current_profile());

    let join = tokio::spawn(async move {
        let mut reevaluate = tokio::time::interval(std::time::Duration::from_secs(1));
        reevaluate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = health_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = reevaluate.tick() => {}
            }

            let metrics = health_rx.borrow().clone();
            let now = tokio::time::Instant::now().into_std();
            if let Some(profile) = controller.observe(&metrics, now) {
                let _ = profile_tx.send(profile);
            }
        }
    });

    (profile_rx, join)
}

// ── Transmitter ───────────────────────────────────────────────────────────────

/// Spawns the frame transmitter: pops queued frames at the active profile's
/// frame rate and hands encoded envelopes to the live session.
pub fn spawn_frame_transmitter(
    queue: SharedFrameQueue,
    outbound: SharedOutbound,
    profile_rx: watch::Receiver<QualityProfile>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Pacing re-reads the profile each cycle, so a quality change
            // takes effect at the next frame boundary.
            let interval = profile_rx.borrow().frame_interval();
            tokio::time::sleep(interval).await;

            let Some(frame) = queue.lock().await.pop() else {
                continue;
            };

            let sender = outbound.lock().await.clone();
            match sender {
                Some(tx) => {
                    let bytes = encode_frame(&frame.envelope);
                    if tx.send(Outbound::Video(bytes)).await.is_err() {
                        // The session died under us; the frame is gone.
                        debug!("outbound channel gone; frame discarded");
                        queue.lock().await.note_drop();
                    }
                }
                None => {
                    queue.lock().await.note_drop();
                    debug!("not connected; frame discarded");
                }
            }
        }
    })
}

/// Reports a queue eviction to the live session's health metrics, if a
/// session exists. Disconnected drops stay local to the queue counter.
pub async fn report_eviction(outbound: &SharedOutbound, evicted: &QueuedFrame) {
    debug!(
        keyframe = evicted.envelope.is_keyframe,
        age_ms = evicted.enqueued_at.elapsed().as_millis() as u64,
        "frame evicted from full queue"
    );
    let sender = outbound.lock().await.clone();
    if let Some(tx) = sender {
        if tx.try_send(Outbound::FrameDropped).is_err() {
            warn!("session outbound full; eviction not recorded in metrics");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(is_keyframe: bool, timestamp_ms: u64) -> FrameEnvelope {
        FrameEnvelope {
            timestamp_ms,
            is_keyframe,
            payload: vec![0u8; 16],
        }
    }

    #[test]
    fn test_queue_holds_up_to_capacity() {
        let now = Instant::now();
        let mut q = FrameQueue::new(5);

        for i in 0..5 {
            assert!(q.push(frame(false, i), now).is_none());
        }
        assert_eq!(q.len(), 5);
        assert_eq!(q.dropped_total(), 0);
    }

    #[test]
    fn test_overflow_evicts_oldest_non_keyframe() {
        let now = Instant::now();
        let mut q = FrameQueue::new(3);

        q.push(frame(true, 1), now);
        q.push(frame(false, 2), now);
        q.push(frame(false, 3), now);

        let evicted = q.push(frame(false, 4), now).expect("must evict");
        assert_eq!(evicted.envelope.timestamp_ms, 2, "oldest non-keyframe goes first");
        assert_eq!(q.dropped_total(), 1);

        // The keyframe survives at the head.
        assert!(q.pop().unwrap().envelope.is_keyframe);
    }

    #[test]
    fn test_overflow_with_all_keyframes_evicts_oldest() {
        let now = Instant::now();
        let mut q = FrameQueue::new(2);

        q.push(frame(true, 1), now);
        q.push(frame(true, 2), now);

        let evicted = q.push(frame(true, 3), now).unwrap();
        assert_eq!(evicted.envelope.timestamp_ms, 1);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_pop_preserves_fifo_order() {
        let now = Instant::now();
        let mut q = FrameQueue::new(5);
        for i in 0..3 {
            q.push(frame(false, i), now);
        }

        assert_eq!(q.pop().unwrap().envelope.timestamp_ms, 0);
        assert_eq!(q.pop().unwrap().envelope.timestamp_ms, 1);
        assert_eq!(q.pop().unwrap().envelope.timestamp_ms, 2);
        assert!(q.pop().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transmitter_paces_to_profile_frame_rate() {
        let queue = shared_frame_queue(DEFAULT_QUEUE_CAPACITY);
        let outbound: SharedOutbound = Arc::new(Mutex::new(None));
        let (out_tx, mut out_rx) = tokio::sync::mpsc::channel(64);
        *outbound.lock().await = Some(out_tx);

        // 10 fps profile: one frame per 100 ms.
        let (_profile_tx, profile_rx) =
            watch::channel(QualityProfile::for_level(QualityLevel::Low));

        {
            let now = Instant::now();
            let mut q = queue.lock().await;
            for i in 0..3 {
                q.push(frame(false, i), now);
            }
        }

        let handle = spawn_frame_transmitter(
            Arc::clone(&queue),
            Arc::clone(&outbound),
            profile_rx,
        );

        // After 150 ms exactly one frame has been sent; after 350 ms, three.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(out_rx.try_recv(), Ok(Outbound::Video(_))));
        assert!(out_rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(out_rx.try_recv(), Ok(Outbound::Video(_))));
        assert!(matches!(out_rx.try_recv(), Ok(Outbound::Video(_))));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transmitter_drops_frames_while_disconnected() {
        let queue = shared_frame_queue(DEFAULT_QUEUE_CAPACITY);
        let outbound: SharedOutbound = Arc::new(Mutex::new(None));
        let (_profile_tx, profile_rx) =
            watch::channel(QualityProfile::for_level(QualityLevel::Low));

        queue.lock().await.push(frame(false, 1), Instant::now());

        let handle = spawn_frame_transmitter(
            Arc::clone(&queue),
            Arc::clone(&outbound),
            profile_rx,
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        let q = queue.lock().await;
        assert!(q.is_empty());
        assert_eq!(q.dropped_total(), 1);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_task_publishes_profile_changes() {
        let now = Instant::now();
        let base = HealthMetrics {
            last_latency_ms: 40.0,
            jitter_ms: 2.0,
            throughput_bps: 0.0,
            average_throughput_bps: 0.0,
            frame_drop_rate: 0.0,
            dropped_frames: 0,
            total_frames_sent: 0,
            consecutive_healthy_checks: 3,
            is_stalled: false,
            last_checked_at: now,
        };
        let (health_tx, health_rx) = watch::channel(base.clone());

        let (profile_rx, handle) =
            spawn_quality_task(QualityConfig::default(), QualityLevel::Low, health_rx);
        assert_eq!(profile_rx.borrow().level, QualityLevel::Low);

        // Good metrics held past the upgrade confirmation window.
        health_tx.send(base).unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(profile_rx.borrow().level, QualityLevel::Ultra);
        handle.abort();
    }
}
