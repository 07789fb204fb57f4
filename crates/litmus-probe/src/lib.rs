//! # litmus-probe
//!
//! Core logic for the litmus network capability test: a server pushes a
//! synthetic packet stream at a browser peer while a closed-loop tuner
//! searches for the highest bitrate the path can sustain.
//!
//! Everything in this crate is pure state and arithmetic — no sockets, no
//! async. The service crate (`litmus-server`) wires these pieces to a
//! WebRTC data channel and a WebSocket signalling session.
//!
//! ## Crate structure
//!
//! - [`tuner`] — adaptive bitrate state machine and capability verdict
//! - [`packet`] — probe packet wire format (sequence + send timestamp)
//! - [`pacing`] — send cadence derivation and effective-rate estimation
//! - [`protocol`] — JSON signalling messages exchanged with the client

pub mod pacing;
pub mod packet;
pub mod protocol;
pub mod tuner;
