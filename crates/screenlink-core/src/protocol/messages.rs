//! All ScreenLink control-channel message types.
//!
//! Control messages travel as JSON text frames on the relay connection and
//! are discriminated by a `"type"` field. Unknown types are never coerced
//! into a known variant: [`decode_control`] returns them as
//! [`InboundControl::Passthrough`] so the caller can route (or drop) them
//! explicitly.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ProtocolError;

// ── Roles ─────────────────────────────────────────────────────────────────────

/// Role announced during the authentication handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// A kiosk device that mirrors its screen and accepts input.
    Device,
    /// A remote operator console (consumed for completeness; the agent never
    /// sends this).
    Controller,
}

// ── Device metrics carried inside heartbeats ──────────────────────────────────

/// Local device metrics reported with each heartbeat.
///
/// Every field is optional: a kiosk without a battery simply omits
/// `battery_level`, and the relay treats absent fields as "not reported".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    /// Battery charge percentage (0–100), absent on mains-powered devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    /// Wi-Fi signal strength percentage (0–100), absent on wired transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_strength: Option<u8>,
    /// Free storage in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_available_mb: Option<u64>,
}

// ── Control messages ──────────────────────────────────────────────────────────

/// All typed control messages exchanged with the relay peer.
///
/// The wire representation is internally tagged JSON, e.g.
/// `{"type":"heartbeat_ack","should_reconnect":true,"reconnect_delay_seconds":0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Authentication handshake, sent by the device immediately after the
    /// socket opens.
    Authenticate {
        role: PeerRole,
        device_id: Uuid,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        os_version: Option<String>,
    },

    /// Successful handshake response. Some relay versions send
    /// `"auth_success"` instead of `"authenticated"`; both decode here.
    #[serde(alias = "auth_success")]
    Authenticated {
        device_id: Uuid,
        #[serde(default)]
        message: String,
    },

    /// Failed handshake response. Older relays report this as a generic
    /// `"error"` message carrying a reason.
    #[serde(alias = "error")]
    AuthFailed {
        #[serde(default)]
        reason: String,
    },

    /// Periodic liveness report from the device.
    Heartbeat {
        device_token: String,
        is_active: bool,
        #[serde(default)]
        local_metrics: DeviceMetrics,
    },

    /// Heartbeat acknowledgment from the relay. This is the single
    /// authoritative channel for reconnect policy.
    HeartbeatAck {
        #[serde(default = "default_true")]
        should_reconnect: bool,
        #[serde(default)]
        reconnect_delay_seconds: u32,
        /// Opaque ack field: relay wall-clock at ack time, if reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_time_ms: Option<u64>,
    },
}

fn default_true() -> bool {
    true
}

impl ControlMessage {
    /// Serializes this message to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails (only
    /// possible for non-string map keys, which none of these types have).
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// The `"type"` values [`decode_control`] recognizes as control messages.
/// Anything else is passed through untouched.
const KNOWN_CONTROL_TYPES: &[&str] = &[
    "authenticate",
    "authenticated",
    "auth_success",
    "auth_failed",
    "error",
    "heartbeat",
    "heartbeat_ack",
];

/// A decoded inbound message: either a typed control message or an opaque
/// passthrough (touch/keyboard/control events destined for the input
/// executor, or message types this core does not know).
#[derive(Debug, Clone, PartialEq)]
pub enum InboundControl {
    /// A control message this core interprets.
    Control(ControlMessage),
    /// Any other tagged message; routed onward unchanged.
    Passthrough {
        /// The raw `"type"` value.
        kind: String,
        /// The full JSON object as received.
        raw: serde_json::Value,
    },
}

/// Decodes one inbound JSON text frame.
///
/// Messages with a known `"type"` must parse into [`ControlMessage`] — a
/// malformed heartbeat ack is an error, not a passthrough. Messages with an
/// unknown `"type"` become [`InboundControl::Passthrough`].
///
/// # Errors
///
/// - [`ProtocolError::Decode`] if the text is not a JSON object or a known
///   type fails to parse.
/// - [`ProtocolError::MissingType`] if the object lacks a `"type"` field.
pub fn decode_control(text: &str) -> Result<InboundControl, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if KNOWN_CONTROL_TYPES.contains(&kind.as_str()) {
        let msg: ControlMessage = serde_json::from_value(value)
            .map_err(|e| ProtocolError::Decode(format!("malformed {kind}: {e}")))?;
        Ok(InboundControl::Control(msg))
    } else {
        Ok(InboundControl::Passthrough { kind, raw: value })
    }
}

// ── Heartbeat directive ───────────────────────────────────────────────────────

/// The reconnect policy carried by a heartbeat acknowledgment.
///
/// Authoritative: when `should_reconnect` is false the connection manager
/// must not initiate any reconnection until a newer directive arrives; when
/// `reconnect_delay` is non-zero no attempt may occur before `now + delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatDirective {
    pub should_reconnect: bool,
    pub reconnect_delay: Duration,
}

impl HeartbeatDirective {
    /// The directive that leaves local reconnect policy in charge.
    pub fn permissive() -> Self {
        Self {
            should_reconnect: true,
            reconnect_delay: Duration::ZERO,
        }
    }

    /// Extracts the directive from a [`ControlMessage::HeartbeatAck`].
    ///
    /// Returns `None` for any other message variant.
    pub fn from_ack(msg: &ControlMessage) -> Option<Self> {
        match msg {
            ControlMessage::HeartbeatAck {
                should_reconnect,
                reconnect_delay_seconds,
                ..
            } => Some(Self {
                should_reconnect: *should_reconnect,
                reconnect_delay: Duration::from_secs(u64::from(*reconnect_delay_seconds)),
            }),
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticate_serializes_with_device_role() {
        // Arrange
        let msg = ControlMessage::Authenticate {
            role: PeerRole::Device,
            device_id: Uuid::nil(),
            token: "tok-123".to_string(),
            device_name: Some("lobby-kiosk".to_string()),
            os_version: None,
        };

        // Act
        let json = msg.to_json().unwrap();

        // Assert
        assert!(json.contains("\"type\":\"authenticate\""));
        assert!(json.contains("\"role\":\"device\""));
        assert!(json.contains("\"device_name\":\"lobby-kiosk\""));
        assert!(!json.contains("os_version"), "None fields must be omitted");
    }

    #[test]
    fn test_heartbeat_ack_decodes_with_defaults() {
        // A minimal ack: absent fields fall back to permissive defaults.
        let decoded = decode_control(r#"{"type":"heartbeat_ack"}"#).unwrap();

        match decoded {
            InboundControl::Control(ControlMessage::HeartbeatAck {
                should_reconnect,
                reconnect_delay_seconds,
                server_time_ms,
            }) => {
                assert!(should_reconnect, "default must be true");
                assert_eq!(reconnect_delay_seconds, 0);
                assert_eq!(server_time_ms, None);
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_ack_blocking_directive_round_trips() {
        let decoded = decode_control(
            r#"{"type":"heartbeat_ack","should_reconnect":false,"reconnect_delay_seconds":60}"#,
        )
        .unwrap();

        let InboundControl::Control(msg) = decoded else {
            panic!("expected control message");
        };
        let directive = HeartbeatDirective::from_ack(&msg).unwrap();
        assert!(!directive.should_reconnect);
        assert_eq!(directive.reconnect_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_auth_success_alias_decodes_as_authenticated() {
        let id = Uuid::new_v4();
        let decoded =
            decode_control(&format!(r#"{{"type":"auth_success","device_id":"{id}"}}"#)).unwrap();

        match decoded {
            InboundControl::Control(ControlMessage::Authenticated { device_id, message }) => {
                assert_eq!(device_id, id);
                assert_eq!(message, "");
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn test_error_alias_decodes_as_auth_failed() {
        let decoded =
            decode_control(r#"{"type":"error","reason":"token expired"}"#).unwrap();

        match decoded {
            InboundControl::Control(ControlMessage::AuthFailed { reason }) => {
                assert_eq!(reason, "token expired");
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_becomes_passthrough_not_error() {
        let decoded =
            decode_control(r#"{"type":"touch","x":10,"y":20,"action":"down"}"#).unwrap();

        match decoded {
            InboundControl::Passthrough { kind, raw } => {
                assert_eq!(kind, "touch");
                assert_eq!(raw["x"], 10);
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn test_missing_type_field_is_an_error() {
        let result = decode_control(r#"{"x":10}"#);
        assert!(matches!(result, Err(ProtocolError::MissingType)));
    }

    #[test]
    fn test_malformed_known_type_is_an_error_not_passthrough() {
        // heartbeat requires device_token and is_active; a known type that
        // fails to parse must surface as a decode error.
        let result = decode_control(r#"{"type":"heartbeat"}"#);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_heartbeat_round_trips_with_metrics() {
        let msg = ControlMessage::Heartbeat {
            device_token: "tok".to_string(),
            is_active: true,
            local_metrics: DeviceMetrics {
                battery_level: Some(87),
                wifi_strength: Some(64),
                storage_available_mb: Some(2048),
            },
        };

        let json = msg.to_json().unwrap();
        let decoded = decode_control(&json).unwrap();
        assert_eq!(decoded, InboundControl::Control(msg));
    }

    #[test]
    fn test_directive_from_non_ack_is_none() {
        let msg = ControlMessage::AuthFailed {
            reason: String::new(),
        };
        assert_eq!(HeartbeatDirective::from_ack(&msg), None);
    }
}
