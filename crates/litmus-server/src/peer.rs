//! WebRTC peer construction and SDP/ICE plumbing.
//!
//! The browser always initiates: it sends an `offer` over signalling,
//! the server answers, and both sides trickle candidates. The data
//! channel is likewise opened by the browser; the server only reacts
//! via `on_data_channel`.

use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use litmus_probe::protocol::CandidateInit;

use crate::error::SessionError;

/// Public STUN server used when no ICE servers are configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Build a peer connection configured with the given ICE servers.
pub async fn build(ice_servers: &[String]) -> Result<Arc<RTCPeerConnection>, SessionError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(SessionError::Setup)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(SessionError::Setup)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(config)
        .await
        .map_err(SessionError::Setup)?;
    Ok(Arc::new(pc))
}

/// Apply a remote offer and produce the local answer SDP. Also used for
/// mid-test renegotiation: a repeated offer simply replaces the remote
/// description.
pub async fn accept_offer(pc: &RTCPeerConnection, sdp: String) -> Result<String, SessionError> {
    let offer = RTCSessionDescription::offer(sdp).map_err(SessionError::Setup)?;
    pc.set_remote_description(offer)
        .await
        .map_err(SessionError::Setup)?;

    let answer = pc.create_answer(None).await.map_err(SessionError::Setup)?;
    let answer_sdp = answer.sdp.clone();
    pc.set_local_description(answer)
        .await
        .map_err(SessionError::Setup)?;
    Ok(answer_sdp)
}

/// Feed a client-trickled candidate into the peer connection.
pub async fn add_remote_candidate(
    pc: &RTCPeerConnection,
    candidate: CandidateInit,
) -> Result<(), SessionError> {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    };
    pc.add_ice_candidate(init)
        .await
        .map_err(SessionError::Setup)
}

/// Convert a locally gathered candidate to its signalling wire shape.
/// Returns `None` for candidates that cannot be serialized.
pub fn candidate_to_wire(candidate: &RTCIceCandidate) -> Option<CandidateInit> {
    let json = candidate.to_json().ok()?;
    Some(CandidateInit {
        candidate: json.candidate,
        sdp_mid: json.sdp_mid,
        sdp_mline_index: json.sdp_mline_index,
        username_fragment: json.username_fragment,
    })
}
