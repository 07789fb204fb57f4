//! # Signalling Protocol
//!
//! JSON messages carried over the WebSocket signalling channel, one
//! object per message, discriminated by a `type` field.
//!
//! The client always initiates with an `offer`; the server answers and
//! both sides trickle ICE candidates. Once the data channel is up the
//! client sends periodic `metrics_report`s and the server responds with
//! `bitrate_update`s, ending with a single `test_complete`.
//!
//! Unknown `type` values and malformed fields are a local matter for the
//! receiver: log and skip, never tear the session down.

use serde::{Deserialize, Serialize};

/// ICE candidate attributes, matching the browser's
/// `RTCIceCandidate.toJSON()` shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

// ─── Client → Server ────────────────────────────────────────────────────────

/// Everything the client may send over signalling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// SDP offer. Also accepted mid-test as a renegotiation.
    Offer { sdp: String },
    /// Trickled ICE candidate.
    Candidate { candidate: CandidateInit },
    /// Periodic client-side measurements.
    MetricsReport {
        /// Packet loss rate (fraction, 0..1).
        loss_rate: f64,
        /// Inter-arrival jitter in milliseconds.
        jitter: f64,
        /// Received throughput in bits/sec.
        actual_throughput: f64,
    },
}

// ─── Server → Client ────────────────────────────────────────────────────────

/// Everything the server may send over signalling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// SDP answer to a client offer.
    Answer { sdp: String },
    /// Trickled ICE candidate.
    Candidate { candidate: CandidateInit },
    /// Current tuner setpoint, sent after every accepted metrics report.
    BitrateUpdate {
        /// Target bitrate in kbps.
        bitrate: u32,
        #[serde(rename = "final")]
        is_final: bool,
    },
    /// Terminal verdict; sent exactly once, after the last
    /// `bitrate_update`.
    TestComplete {
        /// Maximum stable bitrate in kbps.
        bitrate: u32,
        #[serde(rename = "final")]
        is_final: bool,
    },
}
