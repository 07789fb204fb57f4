//! Per-connection session coordinator.
//!
//! Binds one WebSocket signalling channel to one peer connection, one
//! tuner, and one streamer, and arbitrates their lifecycle:
//!
//! ```text
//!   Signalling ──OnDataChannel──▶ Streaming ──▶ Terminating ──▶ Closed
//!        │                            │
//!        └── offer/candidate ──┐      └── cancel / error / deadline /
//!            metrics_report ───┘          tuner verdict / channel close
//! ```
//!
//! Every write to the socket happens inside the single dispatch loop
//! below; ICE callbacks and the tuner feedback path hand their messages
//! to an mpsc queue instead of touching the socket, so outbound JSON
//! frames never interleave.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use litmus_probe::protocol::{ClientMessage, ServerMessage};
use litmus_probe::tuner::{FeedbackSample, Tuner};

use crate::error::SessionError;
use crate::state::AppState;
use crate::{ids, peer, streamer};

/// Axum handler — upgrades HTTP to the signalling WebSocket and runs the
/// session to completion.
pub async fn handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    tracing::info!("litmus connection attempt");
    ws.on_upgrade(move |socket| async move {
        let conn_id = ids::connection_id();
        match run(state, socket, &conn_id).await {
            Ok(()) => tracing::info!(conn_id = %conn_id, "litmus session closed"),
            Err(err) => tracing::error!(conn_id = %conn_id, error = %err, "litmus session failed"),
        }
    })
}

async fn run(state: AppState, socket: WebSocket, conn_id: &str) -> Result<(), SessionError> {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let cancel = CancellationToken::new();
    let tuner = Arc::new(Tuner::new(state.tuner_config()));
    let stream_cfg = state.stream_config();

    // Outbound queue: transport callbacks push here, the loop writes.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(64);
    // Terminal signals. The error slot has capacity 1: the first error
    // wins and later ones are dropped.
    let (err_tx, mut err_rx) = mpsc::channel::<SessionError>(1);
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

    let pc = peer::build(state.ice_servers()).await?;
    state.register(conn_id.to_string(), cancel.clone());

    // Peer state transitions arrive on the transport's threads.
    {
        let state = state.clone();
        let conn_id = conn_id.to_string();
        let cancel = cancel.clone();
        let err_tx = err_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!(conn_id = %conn_id, state = ?s, "peer connection state changed");
            if matches!(
                s,
                RTCPeerConnectionState::Closed
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
            ) {
                state.unregister(&conn_id);
                if s == RTCPeerConnectionState::Failed {
                    let _ = err_tx.try_send(SessionError::ConnectionFailed);
                }
                cancel.cancel();
            }
            Box::pin(async {})
        }));
    }

    // Locally gathered candidates trickle out over signalling.
    {
        let out_tx = out_tx.clone();
        let conn_id = conn_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let out_tx = out_tx.clone();
            let conn_id = conn_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match peer::candidate_to_wire(&candidate) {
                    Some(init) => {
                        if out_tx
                            .send(ServerMessage::Candidate { candidate: init })
                            .await
                            .is_err()
                        {
                            tracing::debug!(conn_id = %conn_id, "session gone, dropped ICE candidate");
                        }
                    }
                    None => {
                        tracing::warn!(conn_id = %conn_id, "failed to serialize ICE candidate");
                    }
                }
            })
        }));
    }

    // The browser opens the data channel; that moment starts streaming.
    {
        let conn_id = conn_id.to_string();
        let tuner = tuner.clone();
        let cancel = cancel.clone();
        let done_tx = done_tx.clone();
        let err_tx = err_tx.clone();
        let stream_cfg = stream_cfg.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            tracing::info!(conn_id = %conn_id, label = dc.label(), "data channel opened");

            {
                let conn_id = conn_id.clone();
                let cancel = cancel.clone();
                dc.on_close(Box::new(move || {
                    tracing::info!(conn_id = %conn_id, "data channel closed");
                    cancel.cancel();
                    Box::pin(async {})
                }));
            }

            tokio::spawn(streamer::run(
                conn_id.clone(),
                dc,
                tuner.clone(),
                cancel.clone(),
                done_tx.clone(),
                err_tx.clone(),
                stream_cfg.clone(),
            ));
            Box::pin(async {})
        }));
    }

    let deadline = tokio::time::sleep(stream_cfg.max_test_duration);
    tokio::pin!(deadline);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),

            _ = &mut deadline => {
                tracing::info!(conn_id = %conn_id, "session deadline reached");
                break Ok(());
            }

            Some(err) = err_rx.recv() => break Err(err),

            Some(()) = done_rx.recv() => break Ok(()),

            Some(msg) = out_rx.recv() => {
                if let Err(err) = send_json(&mut ws_tx, &msg).await {
                    break Err(err);
                }
            }

            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Err(err) = dispatch(text.as_str(), conn_id, &pc, &tuner, &mut ws_tx).await {
                        break Err(err);
                    }
                }
                // A clean client close is a normal end of session.
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Err(err)) => break Err(SessionError::SignallingRead(err)),
                Some(Ok(_)) => {} // ping/pong handled by axum
            }
        }
    };

    cancel.cancel();
    state.unregister(conn_id);
    if let Err(err) = pc.close().await {
        tracing::warn!(conn_id = %conn_id, error = %err, "peer connection close failed");
    }
    result
}

/// Handle one inbound signalling message. Unparseable input (unknown
/// `type`, missing fields, bad candidate shape) is logged and skipped;
/// the session keeps running.
async fn dispatch(
    raw: &str,
    conn_id: &str,
    pc: &RTCPeerConnection,
    tuner: &Tuner,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> Result<(), SessionError> {
    let msg = match serde_json::from_str::<ClientMessage>(raw) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::warn!(conn_id = %conn_id, error = %err, "skipping invalid signalling message");
            return Ok(());
        }
    };

    match msg {
        ClientMessage::Offer { sdp } => {
            let answer = peer::accept_offer(pc, sdp).await?;
            send_json(ws_tx, &ServerMessage::Answer { sdp: answer }).await
        }

        ClientMessage::Candidate { candidate } => peer::add_remote_candidate(pc, candidate).await,

        ClientMessage::MetricsReport {
            loss_rate,
            jitter,
            actual_throughput,
        } => {
            let server_bps = tuner.server_effective_rate();
            let was_complete = tuner.is_complete();
            let keep_going = tuner.adjust(FeedbackSample {
                loss_rate,
                jitter_ms: jitter,
                client_received_bps: actual_throughput,
                server_effective_bps: server_bps,
            });

            let bitrate = tuner.current_bitrate();
            tracing::info!(
                conn_id = %conn_id,
                loss_rate,
                jitter,
                client_bps = actual_throughput,
                server_bps,
                bitrate,
                "metrics report"
            );

            send_json(
                ws_tx,
                &ServerMessage::BitrateUpdate {
                    bitrate,
                    is_final: !keep_going,
                },
            )
            .await?;

            // The verdict goes out exactly once, on the completing report.
            if !keep_going && !was_complete {
                let capability = tuner.capability();
                tracing::info!(
                    conn_id = %conn_id,
                    max_stable_kbps = capability.max_stable_kbps,
                    loss_rate = capability.loss_rate,
                    jitter_ms = capability.jitter_ms,
                    "network test complete"
                );
                send_json(
                    ws_tx,
                    &ServerMessage::TestComplete {
                        bitrate: capability.max_stable_kbps,
                        is_final: true,
                    },
                )
                .await?;
            }
            Ok(())
        }
    }
}

async fn send_json(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), SessionError> {
    let json = serde_json::to_string(msg)?;
    ws_tx
        .send(Message::Text(json.into()))
        .await
        .map_err(SessionError::SignallingWrite)
}
