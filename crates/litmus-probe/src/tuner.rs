//! # Bitrate Tuner
//!
//! Closed-loop controller that discovers the maximum sustainable bitrate
//! of a path. Driven by periodic client feedback samples; emits the
//! current target bitrate and, eventually, a terminal verdict.
//!
//! ```text
//!                       ┌─────────────────┐
//!        stable ×N ────▶│  step up +step  │──── at ceiling / unsafe ──┐
//!                       └─────────────────┘                           │
//!                       ┌─────────────────┐                           ▼
//!        failure ×N ───▶│ step down -step │──── below floor ────▶ complete
//!                       └─────────────────┘                           ▲
//!                       ┌─────────────────┐                           │
//!        deviation ×N ─▶│ clamp to egress │──── below floor ──────────┘
//!                       └─────────────────┘
//! ```
//!
//! Three independent progress counters separate three distinct failure
//! modes: quality degradation (loss/jitter), self-inflicted congestion
//! (the sender cannot emit what the controller asks for), and end-to-end
//! throughput collapse (the client receives far less than the server
//! transmits). Exactly one counter advances per accepted sample.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use quanta::Instant;
use serde::Serialize;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Tuner parameters. Immutable for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct TunerConfig {
    /// Starting bitrate in kbps.
    pub initial_kbps: u32,
    /// Ceiling the tuner will not probe beyond, in kbps.
    pub max_kbps: u32,
    /// Step size for climbing and backing off, in kbps.
    pub step_kbps: u32,
    /// Floor below which the test terminates, in kbps.
    pub min_kbps: u32,
    /// Minimum spacing between state updates; samples arriving faster
    /// than this are accepted but do not advance the machine.
    pub adapt_interval: Duration,
    /// Consecutive qualifying samples required to confirm a setpoint.
    pub stability_window: u32,
    /// Consecutive disqualifying samples required to step down.
    pub failure_window: u32,
    /// Consecutive high-deviation samples required to clamp to egress.
    pub deviation_window: u32,
    /// Maximum packet loss rate considered stable (fraction, 0..1).
    pub loss_threshold: f64,
    /// Maximum jitter considered stable, in milliseconds.
    pub jitter_threshold_ms: f64,
    /// Maximum tolerated gap between setpoint and measured egress, in percent.
    pub max_rate_deviation_pct: f64,
    /// Deviation above which stepping up is considered unsafe, in percent.
    pub step_up_deviation_pct: f64,
    /// Minimum client-received / server-sent ratio considered stable (fraction).
    pub min_throughput_ratio: f64,
    /// A confirmed setpoint must beat the previous best by this factor,
    /// or the search is considered saturated.
    pub significance_ratio: f64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        TunerConfig {
            initial_kbps: 2_000,
            max_kbps: 20_000,
            step_kbps: 1_000,
            min_kbps: 1_000,
            adapt_interval: Duration::from_millis(200),
            stability_window: 8,
            failure_window: 4,
            deviation_window: 4,
            loss_threshold: 0.01,
            jitter_threshold_ms: 20.0,
            max_rate_deviation_pct: 30.0,
            step_up_deviation_pct: 30.0,
            min_throughput_ratio: 0.95,
            significance_ratio: 1.05,
        }
    }
}

// ─── Feedback & Verdict ─────────────────────────────────────────────────────

/// One feedback tuple: client-reported metrics plus the tuner's own
/// latest egress reading.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackSample {
    /// Packet loss rate observed by the client (fraction, 0..1).
    pub loss_rate: f64,
    /// Jitter observed by the client, in milliseconds.
    pub jitter_ms: f64,
    /// Throughput observed by the client, in bits/sec.
    pub client_received_bps: f64,
    /// Rate the server actually pushed onto the wire, in bits/sec.
    pub server_effective_bps: f64,
}

/// The measured capability of the path: the best setpoint the tuner
/// confirmed, with the quality observed at confirmation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Capability {
    /// Highest confirmed-stable bitrate in kbps. Zero until the first
    /// confirmation.
    pub max_stable_kbps: u32,
    /// Loss rate at confirmation (fraction).
    pub loss_rate: f64,
    /// Jitter at confirmation, in milliseconds.
    pub jitter_ms: f64,
}

// ─── Tuner ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TunerState {
    current_kbps: u32,
    stable_count: u32,
    failure_count: u32,
    deviation_count: u32,
    last_adjustment: Instant,
    best_stable: Capability,
    test_complete: bool,
    server_effective_bps: f64,
}

/// The adaptive bitrate tuner. All methods take `&self`; the state is
/// guarded by a single mutex so the streamer and signalling paths can
/// share one instance. No I/O happens under the lock.
#[derive(Debug)]
pub struct Tuner {
    cfg: TunerConfig,
    state: Mutex<TunerState>,
}

impl Tuner {
    pub fn new(cfg: TunerConfig) -> Self {
        let state = TunerState {
            current_kbps: cfg.initial_kbps,
            stable_count: 0,
            failure_count: 0,
            deviation_count: 0,
            last_adjustment: Instant::now(),
            best_stable: Capability::default(),
            test_complete: false,
            server_effective_bps: 0.0,
        };
        Tuner {
            cfg,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TunerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current target bitrate in kbps.
    pub fn current_bitrate(&self) -> u32 {
        self.lock().current_kbps
    }

    /// Whether the test has reached its terminal verdict.
    pub fn is_complete(&self) -> bool {
        self.lock().test_complete
    }

    /// Best confirmed-stable snapshot. Zero-valued until the first
    /// stability confirmation.
    pub fn capability(&self) -> Capability {
        self.lock().best_stable
    }

    /// Latest measured egress rate in bits/sec, published by the streamer.
    pub fn set_server_effective_rate(&self, bps: f64) {
        self.lock().server_effective_bps = bps;
    }

    pub fn server_effective_rate(&self) -> f64 {
        self.lock().server_effective_bps
    }

    /// The control step. Consumes one feedback sample and decides whether
    /// to hold, step up, step down, or terminate. Returns `false` once the
    /// test is complete; callers must stop feeding samples after that.
    pub fn adjust(&self, sample: FeedbackSample) -> bool {
        let mut st = self.lock();
        let cfg = &self.cfg;

        if st.test_complete {
            return false;
        }

        // Rate limit: samples inside the adapt interval are consumed
        // without touching any counter.
        let now = Instant::now();
        if now.duration_since(st.last_adjustment) < cfg.adapt_interval {
            return true;
        }
        st.last_adjustment = now;

        let target_bps = f64::from(st.current_kbps) * 1000.0;
        let server_bps = sample.server_effective_bps;

        // Before the first egress sample both derived checks pass.
        let (deviation_pct, throughput_ok) = if server_bps > 0.0 {
            (
                ((target_bps - server_bps) / target_bps * 100.0).abs(),
                sample.client_received_bps / server_bps >= cfg.min_throughput_ratio,
            )
        } else {
            (0.0, true)
        };

        // Backpressure: the transport is not emitting what we ask of it.
        // The outbound buffer is growing, so clamp toward measured egress
        // before the client's loss reports even catch up.
        if deviation_pct > cfg.max_rate_deviation_pct {
            st.deviation_count += 1;
            if st.deviation_count >= cfg.deviation_window {
                // Never drop more than one step per cycle.
                let floor = st.current_kbps.saturating_sub(cfg.step_kbps);
                let clamped = ((server_bps / 1000.0) as u32).max(floor);
                st.current_kbps = clamped;
                st.deviation_count = 0;
                st.stable_count = 0;
                if st.current_kbps < cfg.min_kbps {
                    st.test_complete = true;
                    return false;
                }
                st.best_stable = Capability {
                    max_stable_kbps: clamped,
                    loss_rate: sample.loss_rate,
                    jitter_ms: sample.jitter_ms,
                };
            }
            return true;
        }
        st.deviation_count = 0;

        let stable = sample.loss_rate <= cfg.loss_threshold
            && sample.jitter_ms <= cfg.jitter_threshold_ms
            && deviation_pct <= cfg.max_rate_deviation_pct
            && throughput_ok;

        if stable {
            st.stable_count += 1;
            st.failure_count = 0;

            if st.stable_count >= cfg.stability_window {
                let candidate = Capability {
                    max_stable_kbps: st.current_kbps,
                    loss_rate: sample.loss_rate,
                    jitter_ms: sample.jitter_ms,
                };

                // Saturation: a confirmation that does not meaningfully
                // beat the previous best ends the search.
                if st.best_stable.max_stable_kbps > 0
                    && f64::from(candidate.max_stable_kbps)
                        < f64::from(st.best_stable.max_stable_kbps) * cfg.significance_ratio
                {
                    st.test_complete = true;
                    return false;
                }

                st.best_stable = candidate;

                if st.current_kbps < cfg.max_kbps && deviation_pct < cfg.step_up_deviation_pct {
                    st.current_kbps = (st.current_kbps + cfg.step_kbps).min(cfg.max_kbps);
                    st.stable_count = 0;
                } else {
                    // Hit the ceiling, or deviation says another step
                    // would only feed the buffer.
                    st.test_complete = true;
                    return false;
                }
            }
        } else {
            st.failure_count += 1;
            st.stable_count = 0;

            if st.failure_count >= cfg.failure_window {
                st.current_kbps = st.current_kbps.saturating_sub(cfg.step_kbps);
                if st.current_kbps < cfg.min_kbps {
                    st.test_complete = true;
                    return false;
                }
                st.failure_count = 0;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Config with the rate limit disabled so tests can feed samples
    /// back-to-back.
    fn test_config() -> TunerConfig {
        TunerConfig {
            adapt_interval: Duration::ZERO,
            ..TunerConfig::default()
        }
    }

    fn stable_sample(kbps: u32) -> FeedbackSample {
        let bps = f64::from(kbps) * 1000.0;
        FeedbackSample {
            loss_rate: 0.0,
            jitter_ms: 5.0,
            client_received_bps: bps,
            server_effective_bps: bps,
        }
    }

    fn lossy_sample(kbps: u32, loss: f64) -> FeedbackSample {
        FeedbackSample {
            loss_rate: loss,
            ..stable_sample(kbps)
        }
    }

    // ─── Construction ───────────────────────────────────────────────────

    #[test]
    fn starts_at_initial_bitrate_with_zero_capability() {
        let tuner = Tuner::new(test_config());
        assert_eq!(tuner.current_bitrate(), 2_000);
        assert!(!tuner.is_complete());
        assert_eq!(tuner.capability(), Capability::default());
    }

    // ─── Rate limit ─────────────────────────────────────────────────────

    #[test]
    fn samples_inside_adapt_interval_do_not_advance_state() {
        let cfg = TunerConfig {
            adapt_interval: Duration::from_secs(60),
            ..TunerConfig::default()
        };
        let tuner = Tuner::new(cfg);

        // Both calls land inside the interval (which also covers the
        // moment of construction), so neither advances anything,
        // regardless of how bad the second sample is.
        assert!(tuner.adjust(stable_sample(2_000)));
        assert!(tuner.adjust(lossy_sample(2_000, 0.9)));
        assert_eq!(tuner.current_bitrate(), 2_000);
        assert!(!tuner.is_complete());
    }

    // ─── Stability branch ───────────────────────────────────────────────

    #[test]
    fn steps_up_after_stability_window() {
        let tuner = Tuner::new(test_config());
        for _ in 0..8 {
            assert!(tuner.adjust(stable_sample(2_000)));
        }
        assert_eq!(tuner.current_bitrate(), 3_000);
        assert_eq!(tuner.capability().max_stable_kbps, 2_000);
    }

    #[test]
    fn loss_equal_to_threshold_is_stable() {
        let tuner = Tuner::new(test_config());
        for _ in 0..8 {
            tuner.adjust(lossy_sample(2_000, 0.01));
        }
        assert_eq!(tuner.current_bitrate(), 3_000, "loss == threshold must qualify");
    }

    #[test]
    fn loss_above_threshold_is_failure() {
        let tuner = Tuner::new(test_config());
        for _ in 0..4 {
            tuner.adjust(lossy_sample(2_000, 0.011));
        }
        assert_eq!(tuner.current_bitrate(), 1_000);
    }

    #[test]
    fn step_up_never_exceeds_max_bitrate() {
        let cfg = TunerConfig {
            initial_kbps: 4_500,
            max_kbps: 5_000,
            ..test_config()
        };
        let tuner = Tuner::new(cfg);
        for _ in 0..8 {
            tuner.adjust(stable_sample(4_500));
        }
        assert_eq!(tuner.current_bitrate(), 5_000);
    }

    // ─── Failure branch ─────────────────────────────────────────────────

    #[test]
    fn terminates_on_floor_after_failure_window() {
        let cfg = TunerConfig {
            initial_kbps: 1_000,
            min_kbps: 1_000,
            ..test_config()
        };
        let tuner = Tuner::new(cfg);
        for i in 0..4 {
            let keep = tuner.adjust(lossy_sample(1_000, 0.5));
            if i < 3 {
                assert!(keep);
            } else {
                assert!(!keep, "fourth bad sample at the floor must terminate");
            }
        }
        assert!(tuner.is_complete());
        assert_eq!(tuner.capability(), Capability::default());
    }

    #[test]
    fn failure_counter_resets_after_step_down() {
        let tuner = Tuner::new(test_config());
        for _ in 0..4 {
            tuner.adjust(lossy_sample(2_000, 0.5));
        }
        assert_eq!(tuner.current_bitrate(), 1_000);
        // Three more bad samples: counter restarted, not yet terminal.
        for _ in 0..3 {
            assert!(tuner.adjust(lossy_sample(1_000, 0.5)));
        }
        assert!(!tuner.is_complete());
    }

    // ─── Deviation branch ───────────────────────────────────────────────

    #[test]
    fn deviation_clamps_at_most_one_step() {
        let cfg = TunerConfig {
            initial_kbps: 10_000,
            ..test_config()
        };
        let tuner = Tuner::new(cfg);
        // Egress stuck at 6 Mbps against a 10 Mbps target: 40% deviation.
        let sample = FeedbackSample {
            loss_rate: 0.0,
            jitter_ms: 5.0,
            client_received_bps: 6_000_000.0,
            server_effective_bps: 6_000_000.0,
        };
        for _ in 0..4 {
            assert!(tuner.adjust(sample));
        }
        // Clamped to current - step, not all the way to measured egress.
        assert_eq!(tuner.current_bitrate(), 9_000);
        assert_eq!(tuner.capability().max_stable_kbps, 9_000);
        assert_eq!(tuner.capability().jitter_ms, 5.0);
    }

    #[test]
    fn deviation_does_not_advance_failure_counter() {
        let cfg = TunerConfig {
            initial_kbps: 10_000,
            ..test_config()
        };
        let tuner = Tuner::new(cfg);
        let deviating = FeedbackSample {
            loss_rate: 0.0,
            jitter_ms: 5.0,
            client_received_bps: 6_000_000.0,
            server_effective_bps: 6_000_000.0,
        };
        // Three deviating samples (below the window), then four clean
        // failures. If deviation leaked into the failure counter the
        // step-down would have happened earlier.
        for _ in 0..3 {
            tuner.adjust(deviating);
        }
        for _ in 0..3 {
            tuner.adjust(lossy_sample(10_000, 0.5));
        }
        assert_eq!(tuner.current_bitrate(), 10_000);
        tuner.adjust(lossy_sample(10_000, 0.5));
        assert_eq!(tuner.current_bitrate(), 9_000);
    }

    #[test]
    fn first_sample_without_egress_reading_cannot_terminate() {
        let tuner = Tuner::new(test_config());
        // No streamer sample yet: server_effective_bps == 0. Deviation
        // and throughput-ratio checks must both pass.
        let sample = FeedbackSample {
            loss_rate: 0.0,
            jitter_ms: 5.0,
            client_received_bps: 0.0,
            server_effective_bps: 0.0,
        };
        assert!(tuner.adjust(sample));
        assert!(!tuner.is_complete());
        assert_eq!(tuner.current_bitrate(), 2_000);
    }

    // ─── Saturation & ceiling ───────────────────────────────────────────

    #[test]
    fn terminates_at_ceiling_with_final_capability() {
        let cfg = TunerConfig {
            initial_kbps: 4_000,
            max_kbps: 4_000,
            ..test_config()
        };
        let tuner = Tuner::new(cfg);
        for i in 0..8 {
            let keep = tuner.adjust(stable_sample(4_000));
            assert_eq!(keep, i < 7);
        }
        assert!(tuner.is_complete());
        assert_eq!(tuner.capability().max_stable_kbps, 4_000);
    }

    #[test]
    fn saturation_check_stops_insignificant_improvement() {
        let cfg = TunerConfig {
            initial_kbps: 10_000,
            ..test_config()
        };
        let tuner = Tuner::new(cfg);
        // Deviation clamp records best = 9000, drops setpoint to 9000.
        let deviating = FeedbackSample {
            loss_rate: 0.0,
            jitter_ms: 5.0,
            client_received_bps: 6_000_000.0,
            server_effective_bps: 6_000_000.0,
        };
        for _ in 0..4 {
            tuner.adjust(deviating);
        }
        assert_eq!(tuner.capability().max_stable_kbps, 9_000);
        // Re-confirming 9000 cannot beat 9000 * 1.05: saturated.
        for _ in 0..8 {
            tuner.adjust(stable_sample(9_000));
        }
        assert!(tuner.is_complete());
        assert_eq!(tuner.capability().max_stable_kbps, 9_000);
    }

    // ─── Monotonic completion ───────────────────────────────────────────

    #[test]
    fn completion_is_terminal() {
        let cfg = TunerConfig {
            initial_kbps: 1_000,
            min_kbps: 1_000,
            ..test_config()
        };
        let tuner = Tuner::new(cfg);
        for _ in 0..4 {
            tuner.adjust(lossy_sample(1_000, 0.5));
        }
        assert!(tuner.is_complete());
        // Perfect samples afterwards change nothing.
        for _ in 0..20 {
            assert!(!tuner.adjust(stable_sample(1_000)));
        }
        assert!(tuner.is_complete());
        assert_eq!(tuner.current_bitrate(), 0);
    }

    // ─── Effective rate plumbing ────────────────────────────────────────

    #[test]
    fn effective_rate_round_trips() {
        let tuner = Tuner::new(test_config());
        assert_eq!(tuner.server_effective_rate(), 0.0);
        tuner.set_server_effective_rate(1_234_567.0);
        assert_eq!(tuner.server_effective_rate(), 1_234_567.0);
    }
}
