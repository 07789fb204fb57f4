//! Litmus network capability test server.
//!
//! Single process: accepts WebSocket signalling sessions, negotiates a
//! WebRTC data channel per client, streams synthetic probe traffic at an
//! adaptively tuned bitrate, and reports the maximum stable bitrate the
//! path sustained. SIGINT cancels every live session and exits.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use litmus_probe::packet::HEADER_LEN;
use litmus_probe::tuner::TunerConfig;
use litmus_server::streamer::StreamConfig;
use litmus_server::{peer, routes, state::AppState};

/// Litmus server daemon.
#[derive(Parser, Debug)]
#[command(name = "litmus-server", about = "Network capability litmus test server")]
struct Cli {
    /// Listen port.
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Optional path prefix in front of /litmus.
    #[arg(long, default_value = "")]
    path_base: String,

    /// Starting bitrate in kbps.
    #[arg(long, default_value_t = 2_000)]
    initial_bitrate: u32,

    /// Bitrate ceiling in kbps.
    #[arg(long, default_value_t = 20_000)]
    max_bitrate: u32,

    /// Climb/back-off step in kbps.
    #[arg(long, default_value_t = 1_000)]
    step_size: u32,

    /// Bitrate floor in kbps; dropping below it ends the test.
    #[arg(long, default_value_t = 1_000)]
    min_bitrate: u32,

    /// Minimum milliseconds between tuner adjustments.
    #[arg(long, default_value_t = 200)]
    adapt_interval_ms: u64,

    /// Consecutive good samples required to confirm a setpoint.
    #[arg(long, default_value_t = 8)]
    stability_window: u32,

    /// Consecutive bad samples required to step down.
    #[arg(long, default_value_t = 4)]
    failure_window: u32,

    /// Consecutive high-deviation samples required to clamp to egress.
    #[arg(long, default_value_t = 4)]
    deviation_window: u32,

    /// Maximum stable packet loss rate (fraction).
    #[arg(long, default_value_t = 0.01)]
    loss_threshold: f64,

    /// Maximum stable jitter in milliseconds.
    #[arg(long, default_value_t = 20.0)]
    jitter_threshold: f64,

    /// Maximum setpoint/egress deviation considered stable, in percent.
    #[arg(long, default_value_t = 30.0)]
    max_rate_deviation: f64,

    /// Deviation above which the tuner will not step up, in percent.
    #[arg(long, default_value_t = 30.0)]
    step_up_deviation: f64,

    /// Minimum client/server throughput ratio considered stable (fraction).
    #[arg(long, default_value_t = 0.95)]
    min_throughput_ratio: f64,

    /// Required improvement factor over the previous best setpoint.
    #[arg(long, default_value_t = 1.05)]
    significance_ratio: f64,

    /// Probe frame size in bytes.
    #[arg(long, default_value_t = 1_200)]
    packet_size: usize,

    /// Hard per-session ceiling in seconds.
    #[arg(long, default_value_t = 200)]
    max_test_duration: u64,

    /// ICE server URL; repeat for multiple.
    #[arg(long = "ice-server", default_values_t = [peer::DEFAULT_STUN_SERVER.to_string()])]
    ice_servers: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    anyhow::ensure!(
        cli.packet_size > HEADER_LEN,
        "--packet-size must exceed the {HEADER_LEN}-byte header"
    );
    anyhow::ensure!(
        cli.min_bitrate <= cli.initial_bitrate && cli.initial_bitrate <= cli.max_bitrate,
        "bitrates must satisfy min <= initial <= max"
    );

    let tuner = TunerConfig {
        initial_kbps: cli.initial_bitrate,
        max_kbps: cli.max_bitrate,
        step_kbps: cli.step_size,
        min_kbps: cli.min_bitrate,
        adapt_interval: Duration::from_millis(cli.adapt_interval_ms),
        stability_window: cli.stability_window,
        failure_window: cli.failure_window,
        deviation_window: cli.deviation_window,
        loss_threshold: cli.loss_threshold,
        jitter_threshold_ms: cli.jitter_threshold,
        max_rate_deviation_pct: cli.max_rate_deviation,
        step_up_deviation_pct: cli.step_up_deviation,
        min_throughput_ratio: cli.min_throughput_ratio,
        significance_ratio: cli.significance_ratio,
    };
    let stream = StreamConfig {
        frame_len: cli.packet_size,
        max_test_duration: Duration::from_secs(cli.max_test_duration),
        ..StreamConfig::default()
    };

    let state = AppState::new(tuner, stream, cli.ice_servers);
    let app = routes::router(state.clone(), &cli.path_base);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!(%addr, path_base = %cli.path_base, "litmus server online");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    tracing::info!("litmus server stopped");
    Ok(())
}

/// Resolve on SIGINT after cancelling every live session.
async fn shutdown_signal(state: AppState) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for SIGINT");
        return;
    }
    tracing::info!(live_sessions = state.live_sessions(), "received SIGINT, shutting down");
    state.shutdown_all();
}
