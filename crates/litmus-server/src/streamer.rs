//! Probe packet generator.
//!
//! One streamer task per session, started when the browser opens its
//! data channel. The loop paces fixed-size frames at the tuner's current
//! setpoint, recomputing the inter-frame interval every iteration so the
//! cadence tracks setpoint changes immediately, and periodically samples
//! the channel's outbound buffer to publish the effective egress rate
//! back to the tuner.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::TryRngCore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::data_channel::RTCDataChannel;

use litmus_probe::packet::{ProbeHeader, DEFAULT_FRAME_LEN, HEADER_LEN};
use litmus_probe::pacing::{send_interval, EgressMeter};
use litmus_probe::tuner::Tuner;

use crate::error::SessionError;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Streamer parameters, fixed per session.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Probe frame size in bytes (header + random payload).
    pub frame_len: usize,
    /// Hard wall-clock ceiling for the whole test.
    pub max_test_duration: Duration,
    /// Spacing of effective-rate samples.
    pub sample_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            frame_len: DEFAULT_FRAME_LEN,
            max_test_duration: Duration::from_secs(200),
            sample_interval: Duration::from_millis(100),
        }
    }
}

// ─── Transport seam ─────────────────────────────────────────────────────────

/// Outbound side of the probe stream: what the loop needs from the data
/// channel. Abstracted so the loop can be exercised without a live
/// WebRTC stack.
pub trait ProbeSink: Send + Sync {
    /// Hand one frame to the transport.
    fn send_frame(&self, frame: Bytes) -> impl Future<Output = Result<(), SessionError>> + Send;
    /// Current outbound buffer depth in bytes.
    fn buffered_amount(&self) -> impl Future<Output = u64> + Send;
}

impl ProbeSink for RTCDataChannel {
    fn send_frame(&self, frame: Bytes) -> impl Future<Output = Result<(), SessionError>> + Send {
        async move {
            self.send(&frame)
                .await
                .map(|_| ())
                .map_err(SessionError::DataChannel)
        }
    }

    fn buffered_amount(&self) -> impl Future<Output = u64> + Send {
        async move { RTCDataChannel::buffered_amount(self).await as u64 }
    }
}

// ─── Streamer loop ──────────────────────────────────────────────────────────

enum StopReason {
    Cancelled,
    TunerComplete,
    Deadline,
}

/// Run the probe stream until the session is cancelled, the tuner
/// reaches its verdict, the wall-clock ceiling passes, or the transport
/// fails. Normal exits signal `done`; failures are published to the
/// session's error slot (capacity 1; an error already in flight wins).
pub async fn run<S: ProbeSink>(
    conn_id: String,
    sink: Arc<S>,
    tuner: Arc<Tuner>,
    cancel: CancellationToken,
    done: mpsc::Sender<()>,
    errors: mpsc::Sender<SessionError>,
    cfg: StreamConfig,
) {
    match stream_loop(&conn_id, sink.as_ref(), &tuner, &cancel, &cfg).await {
        Ok(StopReason::Cancelled) => {
            tracing::debug!(conn_id = %conn_id, "probe stream cancelled");
            let _ = done.try_send(());
        }
        Ok(StopReason::TunerComplete) => {
            tracing::info!(conn_id = %conn_id, "network testing complete");
            let _ = done.try_send(());
        }
        Ok(StopReason::Deadline) => {
            tracing::info!(conn_id = %conn_id, "max test duration reached");
            let _ = done.try_send(());
        }
        Err(err) => {
            tracing::error!(conn_id = %conn_id, error = %err, "probe stream failed");
            let _ = errors.try_send(err);
        }
    }
}

async fn stream_loop<S: ProbeSink>(
    conn_id: &str,
    sink: &S,
    tuner: &Tuner,
    cancel: &CancellationToken,
    cfg: &StreamConfig,
) -> Result<StopReason, SessionError> {
    let started = Instant::now();
    let mut sequence: u32 = 0;
    let mut meter = EgressMeter::new(cfg.sample_interval);

    loop {
        if tuner.is_complete() {
            return Ok(StopReason::TunerComplete);
        }
        if started.elapsed() >= cfg.max_test_duration {
            return Ok(StopReason::Deadline);
        }

        let wait = send_interval(tuner.current_bitrate(), cfg.frame_len);
        tokio::select! {
            _ = cancel.cancelled() => return Ok(StopReason::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }

        let frame = build_frame(sequence, cfg.frame_len)?;
        sink.send_frame(frame).await?;
        sequence = sequence.wrapping_add(1);
        meter.record_send(cfg.frame_len);

        let buffered = sink.buffered_amount().await;
        if let Some(bps) = meter.sample(buffered) {
            tuner.set_server_effective_rate(bps);
            tracing::debug!(conn_id = %conn_id, effective_bps = bps, buffered, "egress sample");
        }
    }
}

/// Assemble one probe frame: 12-byte header plus random payload.
fn build_frame(sequence: u32, frame_len: usize) -> Result<Bytes, SessionError> {
    let mut frame = BytesMut::with_capacity(frame_len);
    ProbeHeader {
        sequence,
        sent_at_ns: unix_nanos(),
    }
    .encode(&mut frame);
    frame.resize(frame_len, 0);

    OsRng
        .try_fill_bytes(&mut frame[HEADER_LEN..])
        .map_err(SessionError::Entropy)?;
    Ok(frame.freeze())
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use litmus_probe::tuner::{FeedbackSample, TunerConfig};

    #[derive(Default)]
    struct MockSink {
        frames: Mutex<Vec<Bytes>>,
        buffered: AtomicU64,
        fail: bool,
    }

    impl ProbeSink for MockSink {
        fn send_frame(
            &self,
            frame: Bytes,
        ) -> impl Future<Output = Result<(), SessionError>> + Send {
            async move {
                if self.fail {
                    return Err(SessionError::ConnectionFailed);
                }
                self.frames.lock().unwrap().push(frame);
                Ok(())
            }
        }

        fn buffered_amount(&self) -> impl Future<Output = u64> + Send {
            async move { self.buffered.load(Ordering::Relaxed) }
        }
    }

    fn fast_config() -> StreamConfig {
        StreamConfig {
            frame_len: 64,
            max_test_duration: Duration::from_secs(30),
            sample_interval: Duration::from_millis(5),
        }
    }

    fn completed_tuner() -> Arc<Tuner> {
        let tuner = Tuner::new(TunerConfig {
            initial_kbps: 1_000,
            min_kbps: 1_000,
            adapt_interval: Duration::ZERO,
            ..TunerConfig::default()
        });
        for _ in 0..4 {
            tuner.adjust(FeedbackSample {
                loss_rate: 0.9,
                jitter_ms: 100.0,
                client_received_bps: 0.0,
                server_effective_bps: 1_000_000.0,
            });
        }
        assert!(tuner.is_complete());
        Arc::new(tuner)
    }

    // ─── Frame building ─────────────────────────────────────────────────

    #[test]
    fn frame_has_configured_length_and_decodable_header() {
        let frame = build_frame(7, 1_200).unwrap();
        assert_eq!(frame.len(), 1_200);

        let mut slice = &frame[..];
        let header = ProbeHeader::decode(&mut slice).unwrap();
        assert_eq!(header.sequence, 7);
        assert!(header.sent_at_ns > 0);
    }

    #[test]
    fn frame_payload_is_randomized() {
        let a = build_frame(0, 256).unwrap();
        let b = build_frame(0, 256).unwrap();
        assert_ne!(a[HEADER_LEN..], b[HEADER_LEN..]);
    }

    // ─── Loop behavior ──────────────────────────────────────────────────

    #[tokio::test]
    async fn emits_contiguous_sequences_until_cancelled() {
        let sink = Arc::new(MockSink::default());
        let tuner = Arc::new(Tuner::new(TunerConfig::default()));
        let cancel = CancellationToken::new();
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let (err_tx, _err_rx) = mpsc::channel(1);

        let handle = tokio::spawn(run(
            "test".into(),
            sink.clone(),
            tuner.clone(),
            cancel.clone(),
            done_tx,
            err_tx,
            fast_config(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(done_rx.try_recv().is_ok(), "cancellation is a normal exit");
        // Tuner received at least one egress sample along the way.
        assert!(tuner.server_effective_rate() > 0.0);

        let frames = sink.frames.lock().unwrap();
        assert!(!frames.is_empty());
        for (i, frame) in frames.iter().enumerate() {
            let mut slice = &frame[..];
            let header = ProbeHeader::decode(&mut slice).unwrap();
            assert_eq!(header.sequence, i as u32, "sequences contiguous from 0");
        }
    }

    #[tokio::test]
    async fn exits_when_tuner_is_complete() {
        let sink = Arc::new(MockSink::default());
        let cancel = CancellationToken::new();
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let (err_tx, _err_rx) = mpsc::channel(1);

        run(
            "test".into(),
            sink.clone(),
            completed_tuner(),
            cancel,
            done_tx,
            err_tx,
            fast_config(),
        )
        .await;

        assert!(done_rx.try_recv().is_ok());
        assert!(sink.frames.lock().unwrap().is_empty(), "no frames after verdict");
    }

    #[tokio::test]
    async fn exits_at_deadline_without_error() {
        let sink = Arc::new(MockSink::default());
        let tuner = Arc::new(Tuner::new(TunerConfig::default()));
        let cancel = CancellationToken::new();
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let cfg = StreamConfig {
            max_test_duration: Duration::from_millis(30),
            ..fast_config()
        };

        run("test".into(), sink, tuner, cancel, done_tx, err_tx, cfg).await;

        assert!(done_rx.try_recv().is_ok());
        assert!(err_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_failure_reaches_the_error_slot() {
        let sink = Arc::new(MockSink {
            fail: true,
            ..MockSink::default()
        });
        let tuner = Arc::new(Tuner::new(TunerConfig::default()));
        let cancel = CancellationToken::new();
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let (err_tx, mut err_rx) = mpsc::channel(1);

        run(
            "test".into(),
            sink,
            tuner,
            cancel,
            done_tx,
            err_tx,
            fast_config(),
        )
        .await;

        assert!(matches!(err_rx.try_recv(), Ok(SessionError::ConnectionFailed)));
        assert!(done_rx.try_recv().is_err(), "failed exit must not signal done");
    }
}
