//! # Pacing & Egress Measurement
//!
//! Two halves of the streamer's bookkeeping:
//!
//! - cadence derivation: how often to emit a fixed-size frame so the
//!   send rate tracks the tuner's setpoint;
//! - [`EgressMeter`]: an estimate of what actually left the transport,
//!   corrected by the outbound buffer delta.
//!
//! When the link cannot absorb the requested rate the transport buffers
//! internally, so a raw count of enqueued bytes overstates true egress.
//! Sampling the buffer depth converts enqueue accounting into a
//! conservative egress estimate, which the tuner's deviation branch uses
//! to detect self-inflicted backpressure before loss reports from the
//! client even arrive.

use std::time::Duration;

use quanta::Instant;

/// Frames per second needed to hit `bitrate_kbps` with `frame_len`-byte
/// frames, floored. May be zero for tiny bitrates; see [`send_interval`].
pub fn packets_per_second(bitrate_kbps: u32, frame_len: usize) -> u32 {
    let bits_per_frame = (frame_len * 8) as u64;
    (u64::from(bitrate_kbps) * 1000 / bits_per_frame) as u32
}

/// Inter-frame interval for the given setpoint, clamped to at least
/// 1 packet per second.
pub fn send_interval(bitrate_kbps: u32, frame_len: usize) -> Duration {
    let pps = packets_per_second(bitrate_kbps, frame_len).max(1);
    Duration::from_secs(1) / pps
}

/// Bytes that actually left the transport over one interval: everything
/// enqueued, plus any drain of previously buffered data. A growing
/// buffer contributes nothing (those enqueues are still sitting in it).
pub fn effective_bytes(enqueued: u64, prev_buffered: u64, now_buffered: u64) -> u64 {
    enqueued + prev_buffered.saturating_sub(now_buffered)
}

// ─── Egress Meter ───────────────────────────────────────────────────────────

/// Rolling effective-rate estimator fed by the streamer loop.
#[derive(Debug)]
pub struct EgressMeter {
    sample_interval: Duration,
    bytes_enqueued: u64,
    last_buffered: u64,
    last_sample: Instant,
}

impl EgressMeter {
    pub fn new(sample_interval: Duration) -> Self {
        EgressMeter {
            sample_interval,
            bytes_enqueued: 0,
            last_buffered: 0,
            last_sample: Instant::now(),
        }
    }

    /// Record a frame handed to the transport.
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_enqueued += bytes as u64;
    }

    /// Sample the transport's current outbound buffer depth. Returns the
    /// effective rate in bits/sec once per sample interval, `None` when
    /// called again too soon. Resets the interval accounting on each
    /// produced sample.
    pub fn sample(&mut self, buffered_now: u64) -> Option<f64> {
        let elapsed = self.last_sample.elapsed();
        if elapsed < self.sample_interval || elapsed.is_zero() {
            return None;
        }

        let actual = effective_bytes(self.bytes_enqueued, self.last_buffered, buffered_now);
        let bps = actual as f64 * 8.0 / elapsed.as_secs_f64();

        self.bytes_enqueued = 0;
        self.last_buffered = buffered_now;
        self.last_sample = Instant::now();
        Some(bps)
    }
}
