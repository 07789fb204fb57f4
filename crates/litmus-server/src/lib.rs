//! Litmus server library.
//!
//! Re-exports the router, shared state, and session machinery so they
//! can be used by integration tests (and potentially embedded in other
//! binaries).

pub mod error;
pub mod ids;
pub mod peer;
pub mod routes;
pub mod session;
pub mod state;
pub mod streamer;
