//! Shared application state.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use litmus_probe::tuner::TunerConfig;

use crate::streamer::StreamConfig;

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    tuner: TunerConfig,
    stream: StreamConfig,
    ice_servers: Vec<String>,
    /// Live sessions keyed by connection id. Used only to enumerate
    /// sessions at shutdown, never for cross-session mutation.
    sessions: DashMap<String, SessionHandle>,
}

/// Handle to a live session.
pub struct SessionHandle {
    /// The session's kill switch.
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(tuner: TunerConfig, stream: StreamConfig, ice_servers: Vec<String>) -> Self {
        AppState {
            inner: Arc::new(Inner {
                tuner,
                stream,
                ice_servers,
                sessions: DashMap::new(),
            }),
        }
    }

    pub fn tuner_config(&self) -> TunerConfig {
        self.inner.tuner.clone()
    }

    pub fn stream_config(&self) -> StreamConfig {
        self.inner.stream.clone()
    }

    pub fn ice_servers(&self) -> &[String] {
        &self.inner.ice_servers
    }

    /// Register a session under its connection id.
    pub fn register(&self, conn_id: String, cancel: CancellationToken) {
        self.inner.sessions.insert(conn_id, SessionHandle { cancel });
    }

    /// Drop a session from the registry. Idempotent.
    pub fn unregister(&self, conn_id: &str) {
        self.inner.sessions.remove(conn_id);
    }

    pub fn live_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Cancel every live session. Entries are removed by the sessions
    /// themselves as they tear down.
    pub fn shutdown_all(&self) {
        for entry in self.inner.sessions.iter() {
            entry.value().cancel.cancel();
        }
    }
}
