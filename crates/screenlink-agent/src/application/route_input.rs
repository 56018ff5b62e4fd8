//! RouteInputUseCase: delivers inbound passthrough messages to an input sink.
//!
//! The relay forwards viewer input (touch, keyboard) through the same
//! WebSocket as control traffic. The connection manager surfaces those as
//! `(kind, payload)` pairs without interpreting them; this use case is the
//! single place that decides where each kind goes. Payloads are delivered
//! unchanged — translation into OS input events belongs to the sink
//! implementation, not here.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for input delivery.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("sink rejected {kind} event: {message}")]
    Sink { kind: String, message: String },
}

/// Destination for viewer input events.
///
/// Infrastructure implementations inject OS input; test implementations
/// record calls.
#[async_trait]
pub trait InputSink: Send + Sync {
    async fn deliver_touch(&self, payload: Value) -> Result<(), String>;
    async fn deliver_keyboard(&self, payload: Value) -> Result<(), String>;
}

/// Routes passthrough messages by kind.
pub struct RouteInputUseCase<S: InputSink> {
    sink: S,
    unknown_kinds: u64,
}

impl<S: InputSink> RouteInputUseCase<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            unknown_kinds: 0,
        }
    }

    /// Messages whose kind no sink method matched.
    pub fn unknown_kinds(&self) -> u64 {
        self.unknown_kinds
    }

    /// Delivers one passthrough message. Unknown kinds are logged and
    /// counted, never an error — the relay may speak newer message types
    /// than this agent knows.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Sink`] when the sink refuses a known kind.
    pub async fn route(&mut self, kind: &str, payload: Value) -> Result<(), RouteError> {
        match kind {
            "touch" => self
                .sink
                .deliver_touch(payload)
                .await
                .map_err(|message| RouteError::Sink {
                    kind: kind.to_string(),
                    message,
                }),
            "keyboard" => self
                .sink
                .deliver_keyboard(payload)
                .await
                .map_err(|message| RouteError::Sink {
                    kind: kind.to_string(),
                    message,
                }),
            other => {
                self.unknown_kinds += 1;
                warn!(kind = other, "unrecognised relay message ignored");
                Ok(())
            }
        }
    }
}

// ── Logging sink ──────────────────────────────────────────────────────────────

/// Sink that logs events instead of injecting them.
///
/// Used by `main` until a platform injector is wired in. In a production
/// kiosk image it is replaced by an injector for the compile target
/// (uinput on Linux).
pub struct LoggingInputSink;

#[async_trait]
impl InputSink for LoggingInputSink {
    async fn deliver_touch(&self, payload: Value) -> Result<(), String> {
        info!(%payload, "touch event received");
        Ok(())
    }

    async fn deliver_keyboard(&self, payload: Value) -> Result<(), String> {
        info!(%payload, "keyboard event received");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Default, Clone)]
    struct RecordingSink {
        touches: Arc<Mutex<Vec<Value>>>,
        keys: Arc<Mutex<Vec<Value>>>,
        refuse: bool,
    }

    #[async_trait]
    impl InputSink for RecordingSink {
        async fn deliver_touch(&self, payload: Value) -> Result<(), String> {
            if self.refuse {
                return Err("injector unavailable".to_string());
            }
            self.touches.lock().await.push(payload);
            Ok(())
        }

        async fn deliver_keyboard(&self, payload: Value) -> Result<(), String> {
            if self.refuse {
                return Err("injector unavailable".to_string());
            }
            self.keys.lock().await.push(payload);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_touch_and_keyboard_reach_their_sink_methods() {
        // Arrange
        let sink = RecordingSink::default();
        let mut use_case = RouteInputUseCase::new(sink.clone());

        // Act
        use_case
            .route("touch", json!({"x": 10, "y": 20}))
            .await
            .unwrap();
        use_case
            .route("keyboard", json!({"key": "Enter"}))
            .await
            .unwrap();

        // Assert – payloads arrive unchanged
        assert_eq!(sink.touches.lock().await.as_slice(), [json!({"x": 10, "y": 20})]);
        assert_eq!(sink.keys.lock().await.as_slice(), [json!({"key": "Enter"})]);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_counted_not_an_error() {
        let mut use_case = RouteInputUseCase::new(RecordingSink::default());

        let result = use_case.route("gamepad", json!({})).await;

        assert!(result.is_ok());
        assert_eq!(use_case.unknown_kinds(), 1);
    }

    #[tokio::test]
    async fn test_sink_refusal_surfaces_as_route_error() {
        let sink = RecordingSink {
            refuse: true,
            ..RecordingSink::default()
        };
        let mut use_case = RouteInputUseCase::new(sink);

        let result = use_case.route("touch", json!({})).await;

        assert!(matches!(result, Err(RouteError::Sink { .. })));
    }
}
