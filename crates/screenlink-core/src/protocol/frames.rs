//! Binary codec for outgoing video frame envelopes.
//!
//! Wire format:
//! ```text
//! [version:1][flags:1][timestamp_ms:8][payload_len:4][payload:N]
//! ```
//! Total header size: 14 bytes. All multi-byte integers are big-endian.
//! Flag bit 0 marks a keyframe. The payload is the already-encoded video
//! data produced by the external capture/encoder collaborator; this codec
//! never inspects it.

use thiserror::Error;

/// Current frame envelope version byte.
pub const FRAME_VERSION: u8 = 0x01;

/// Size of the envelope header in bytes.
pub const FRAME_HEADER_SIZE: usize = 14;

/// Flag bit marking a self-contained (key) frame.
const FLAG_KEYFRAME: u8 = 1 << 0;

/// Errors that can occur while encoding or decoding a frame envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameCodecError {
    /// The byte slice is shorter than the declared header + payload.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The envelope version byte is not supported.
    #[error("unsupported frame envelope version: {0}")]
    UnsupportedVersion(u8),

    /// The declared payload length does not match the available data.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },
}

/// An encoded video frame travelling from the capture pipeline to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEnvelope {
    /// Milliseconds since Unix epoch at capture time. Lets the peer judge
    /// end-to-end staleness without a separate clock-sync channel.
    pub timestamp_ms: u64,
    /// Whether the payload is a self-contained decode starting point.
    pub is_keyframe: bool,
    /// Opaque encoded frame bytes.
    pub payload: Vec<u8>,
}

/// Encodes a [`FrameEnvelope`] into its binary wire form.
pub fn encode_frame(frame: &FrameEnvelope) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
    buf.push(FRAME_VERSION);
    buf.push(if frame.is_keyframe { FLAG_KEYFRAME } else { 0 });
    buf.extend_from_slice(&frame.timestamp_ms.to_be_bytes());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    buf
}

/// Decodes one [`FrameEnvelope`] from `bytes`.
///
/// Returns the envelope and the total number of bytes consumed so the caller
/// can advance its read cursor.
///
/// # Errors
///
/// Returns [`FrameCodecError`] if the bytes are truncated or carry an
/// unsupported version.
pub fn decode_frame(bytes: &[u8]) -> Result<(FrameEnvelope, usize), FrameCodecError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(FrameCodecError::InsufficientData {
            needed: FRAME_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != FRAME_VERSION {
        return Err(FrameCodecError::UnsupportedVersion(version));
    }

    let flags = bytes[1];
    let timestamp_ms = u64::from_be_bytes(bytes[2..10].try_into().expect("8 bytes"));
    let payload_len = u32::from_be_bytes(bytes[10..14].try_into().expect("4 bytes")) as usize;

    let total_needed = FRAME_HEADER_SIZE + payload_len;
    if bytes.len() < total_needed {
        return Err(FrameCodecError::PayloadLengthMismatch {
            declared: payload_len,
            available: bytes.len() - FRAME_HEADER_SIZE,
        });
    }

    let payload = bytes[FRAME_HEADER_SIZE..total_needed].to_vec();
    Ok((
        FrameEnvelope {
            timestamp_ms,
            is_keyframe: flags & FLAG_KEYFRAME != 0,
            payload,
        },
        total_needed,
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
