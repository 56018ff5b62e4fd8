//! Scripted mock relay transport for tests.
//!
//! Each scripted session is a pair of channels: the test plays the relay by
//! pushing inbound messages and reading what the agent sent. Connect
//! attempts consume scripted outcomes in order, so a test can express
//! "refuse twice, then accept" directly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{RelayStream, RelayTransport, WireError, WireMessage};

/// The test's side of one accepted session.
pub struct MockRelayHandle {
    /// Messages pushed here arrive at the agent.
    pub to_agent: mpsc::Sender<WireMessage>,
    /// Everything the agent sends shows up here.
    pub from_agent: mpsc::Receiver<WireMessage>,
}

impl MockRelayHandle {
    /// Convenience: next text frame the agent sent, skipping binary.
    pub async fn next_text(&mut self) -> Option<String> {
        while let Some(msg) = self.from_agent.recv().await {
            if let WireMessage::Text(text) = msg {
                return Some(text);
            }
        }
        None
    }

    /// Convenience: next binary frame the agent sent, skipping text.
    pub async fn next_binary(&mut self) -> Option<Vec<u8>> {
        while let Some(msg) = self.from_agent.recv().await {
            if let WireMessage::Binary(bytes) = msg {
                return Some(bytes);
            }
        }
        None
    }

    /// Sends a text frame to the agent.
    pub async fn send_text(&self, text: impl Into<String>) {
        let _ = self.to_agent.send(WireMessage::Text(text.into())).await;
    }
}

enum ScriptedOutcome {
    Refuse(WireError),
    Accept {
        inbound: mpsc::Receiver<WireMessage>,
        outbound: mpsc::Sender<WireMessage>,
    },
}

/// A [`RelayTransport`] that serves pre-scripted connect outcomes.
#[derive(Clone, Default)]
pub struct MockRelayTransport {
    script: Arc<Mutex<VecDeque<ScriptedOutcome>>>,
}

impl MockRelayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a failed connect attempt.
    pub async fn push_refusal(&self) {
        self.script
            .lock()
            .await
            .push_back(ScriptedOutcome::Refuse(WireError::Handshake(
                "connection refused".to_string(),
            )));
    }

    /// Scripts an accepted session and returns the relay-side handle.
    pub async fn push_session(&self) -> MockRelayHandle {
        let (to_agent_tx, to_agent_rx) = mpsc::channel(64);
        let (from_agent_tx, from_agent_rx) = mpsc::channel(64);
        self.script
            .lock()
            .await
            .push_back(ScriptedOutcome::Accept {
                inbound: to_agent_rx,
                outbound: from_agent_tx,
            });
        MockRelayHandle {
            to_agent: to_agent_tx,
            from_agent: from_agent_rx,
        }
    }

    /// Number of scripted outcomes not yet consumed.
    pub async fn remaining(&self) -> usize {
        self.script.lock().await.len()
    }
}

#[async_trait]
impl RelayTransport for MockRelayTransport {
    async fn connect(
        &self,
        _url: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn RelayStream>, WireError> {
        match self.script.lock().await.pop_front() {
            Some(ScriptedOutcome::Refuse(err)) => Err(err),
            Some(ScriptedOutcome::Accept { inbound, outbound }) => Ok(Box::new(MockRelayStream {
                inbound,
                outbound,
                closed: false,
            })),
            None => Err(WireError::Handshake(
                "no scripted session available".to_string(),
            )),
        }
    }
}

struct MockRelayStream {
    inbound: mpsc::Receiver<WireMessage>,
    outbound: mpsc::Sender<WireMessage>,
    closed: bool,
}

#[async_trait]
impl RelayStream for MockRelayStream {
    async fn send_text(&mut self, text: String) -> Result<(), WireError> {
        if self.closed {
            return Err(WireError::Closed);
        }
        self.outbound
            .send(WireMessage::Text(text))
            .await
            .map_err(|_| WireError::Closed)
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), WireError> {
        if self.closed {
            return Err(WireError::Closed);
        }
        self.outbound
            .send(WireMessage::Binary(bytes))
            .await
            .map_err(|_| WireError::Closed)
    }

    async fn next_message(&mut self) -> Option<Result<WireMessage, WireError>> {
        if self.closed {
            return None;
        }
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed = true;
        self.inbound.close();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refusal_then_session_consumed_in_order() {
        let transport = MockRelayTransport::new();
        transport.push_refusal().await;
        let _handle = transport.push_session().await;

        assert!(transport
            .connect("wss://relay.test/ws", Duration::from_secs(1))
            .await
            .is_err());
        assert!(transport
            .connect("wss://relay.test/ws", Duration::from_secs(1))
            .await
            .is_ok());
        assert_eq!(transport.remaining().await, 0);
    }

    #[tokio::test]
    async fn test_messages_flow_both_directions() {
        let transport = MockRelayTransport::new();
        let mut handle = transport.push_session().await;
        let mut stream = transport
            .connect("wss://relay.test/ws", Duration::from_secs(1))
            .await
            .unwrap();

        stream.send_text("hello".to_string()).await.unwrap();
        assert_eq!(handle.next_text().await.as_deref(), Some("hello"));

        handle.send_text("world").await;
        assert_eq!(
            stream.next_message().await.unwrap().unwrap(),
            WireMessage::Text("world".to_string())
        );
    }

    #[tokio::test]
    async fn test_dropping_the_handle_closes_the_stream() {
        let transport = MockRelayTransport::new();
        let handle = transport.push_session().await;
        let mut stream = transport
            .connect("wss://relay.test/ws", Duration::from_secs(1))
            .await
            .unwrap();

        drop(handle);
        assert!(stream.next_message().await.is_none());
        assert!(stream.send_text("x".to_string()).await.is_err());
    }
}
