//! Session error kinds.
//!
//! Protocol-level problems (malformed signalling JSON, unknown message
//! types) never become values of [`SessionError`]; they are logged and
//! skipped where they occur. Everything here is terminal: the first
//! error published to a session's error slot wins and tears it down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer connection entered the Failed state.
    #[error("webrtc connection failed")]
    ConnectionFailed,

    /// Peer construction or an SDP/ICE operation failed; the session
    /// never (re-)enters streaming.
    #[error("peer setup failed: {0}")]
    Setup(#[source] webrtc::Error),

    /// A probe frame could not be handed to the data channel.
    #[error("data channel send failed: {0}")]
    DataChannel(#[source] webrtc::Error),

    /// The signalling socket failed mid-read.
    #[error("signalling read failed: {0}")]
    SignallingRead(#[source] axum::Error),

    /// An outbound signalling frame could not be written.
    #[error("signalling write failed: {0}")]
    SignallingWrite(#[source] axum::Error),

    /// An outbound message failed to serialize.
    #[error("signalling encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// The system randomness source failed while filling a probe payload.
    #[error("probe payload generation failed: {0}")]
    Entropy(#[source] rand::rand_core::OsError),
}
