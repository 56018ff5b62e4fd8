//! StreamScreenUseCase: moves captured frames into the transmission queue.
//!
//! The capture side is a trait seam so the pipeline tests with a synthetic
//! source. A real deployment plugs in a platform encoder behind
//! [`FrameSource`]; this use case neither paces nor encodes — it only
//! bridges capture output into the lossy queue and reports evictions.

use async_trait::async_trait;
use screenlink_core::FrameEnvelope;
use thiserror::Error;
use tracing::{debug, info};

use crate::infrastructure::network::connection_manager::SharedOutbound;
use crate::infrastructure::streaming::{report_eviction, SharedFrameQueue};

/// Errors from a frame source.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The source has no more frames and never will.
    #[error("capture source stopped")]
    SourceClosed,

    /// A transient or fatal capture failure.
    #[error("capture failed: {0}")]
    Failed(String),
}

/// One captured, already-encoded frame.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Capture wall-clock, milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    pub is_keyframe: bool,
    pub payload: Vec<u8>,
}

/// Produces encoded frames. Pacing (vsync, damage tracking) is the
/// source's concern; the queue and transmitter handle everything after.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<CapturedFrame, CaptureError>;
}

/// Pulls frames from a source into the shared queue until the source
/// closes or fails.
pub struct StreamScreenUseCase {
    queue: SharedFrameQueue,
    outbound: SharedOutbound,
}

impl StreamScreenUseCase {
    pub fn new(queue: SharedFrameQueue, outbound: SharedOutbound) -> Self {
        Self { queue, outbound }
    }

    /// Runs the capture loop to completion.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Failed`] if the source reports a failure;
    /// a clean [`CaptureError::SourceClosed`] ends the loop with `Ok`.
    pub async fn run(&self, mut source: impl FrameSource) -> Result<(), CaptureError> {
        info!("screen capture loop started");
        loop {
            let frame = match source.next_frame().await {
                Ok(frame) => frame,
                Err(CaptureError::SourceClosed) => {
                    info!("capture source closed; capture loop ending");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let envelope = FrameEnvelope {
                timestamp_ms: frame.timestamp_ms,
                is_keyframe: frame.is_keyframe,
                payload: frame.payload,
            };

            let now = tokio::time::Instant::now().into_std();
            let evicted = self.queue.lock().await.push(envelope, now);
            if let Some(evicted) = evicted {
                report_eviction(&self.outbound, &evicted).await;
            } else {
                debug!("frame enqueued");
            }
        }
    }
}

// ── Synthetic source ──────────────────────────────────────────────────────────

/// Frame source producing a synthetic test pattern at a fixed rate.
///
/// Used by `main` until a platform encoder is wired in, and by tests. Every
/// `keyframe_interval`-th frame is a keyframe, mirroring a real encoder's
/// group-of-pictures structure.
pub struct SyntheticFrameSource {
    frame_interval: std::time::Duration,
    keyframe_interval: u64,
    payload_size: usize,
    counter: u64,
    /// Stop after this many frames; `None` runs forever.
    limit: Option<u64>,
}

impl SyntheticFrameSource {
    pub fn new(fps: u32, payload_size: usize) -> Self {
        Self {
            frame_interval: std::time::Duration::from_secs_f64(1.0 / f64::from(fps.max(1))),
            keyframe_interval: 30,
            payload_size,
            counter: 0,
            limit: None,
        }
    }

    /// Bounded variant for tests.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }
}

#[async_trait]
impl FrameSource for SyntheticFrameSource {
    async fn next_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        if let Some(limit) = self.limit {
            if self.counter >= limit {
                return Err(CaptureError::SourceClosed);
            }
        }
        if self.counter > 0 {
            tokio::time::sleep(self.frame_interval).await;
        }

        let frame = CapturedFrame {
            timestamp_ms: self.counter * self.frame_interval.as_millis() as u64,
            is_keyframe: self.counter % self.keyframe_interval == 0,
            payload: vec![(self.counter % 251) as u8; self.payload_size],
        };
        self.counter += 1;
        Ok(frame)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::streaming::shared_frame_queue;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_frames_land_in_the_queue() {
        let queue = shared_frame_queue(10);
        let outbound: SharedOutbound = Arc::new(Mutex::new(None));
        let use_case = StreamScreenUseCase::new(Arc::clone(&queue), outbound);

        let source = SyntheticFrameSource::new(30, 64).with_limit(3);
        use_case.run(source).await.unwrap();

        assert_eq!(queue.lock().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_synthetic_frame_is_a_keyframe() {
        let queue = shared_frame_queue(10);
        let outbound: SharedOutbound = Arc::new(Mutex::new(None));
        let use_case = StreamScreenUseCase::new(Arc::clone(&queue), outbound);

        use_case
            .run(SyntheticFrameSource::new(30, 8).with_limit(1))
            .await
            .unwrap();

        let frame = queue.lock().await.pop().unwrap();
        assert!(frame.envelope.is_keyframe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_reports_eviction_to_session() {
        let queue = shared_frame_queue(2);
        let (out_tx, mut out_rx) = tokio::sync::mpsc::channel(16);
        let outbound: SharedOutbound = Arc::new(Mutex::new(Some(out_tx)));
        let use_case = StreamScreenUseCase::new(Arc::clone(&queue), Arc::clone(&outbound));

        // 4 frames into a 2-deep queue with nothing draining it.
        use_case
            .run(SyntheticFrameSource::new(30, 8).with_limit(4))
            .await
            .unwrap();

        assert_eq!(queue.lock().await.dropped_total(), 2);
        assert!(matches!(
            out_rx.try_recv(),
            Ok(crate::infrastructure::network::connection_manager::Outbound::FrameDropped)
        ));
    }
}
