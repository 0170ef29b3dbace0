#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # runxd
//!
//! Tunnel agent that puts a local HTTP service on a public router without
//! opening an inbound port.
//!
//! runxd dials out to the router named by `RUNX_URL`, then serves requests the
//! router sends back down that connection. Ordinary requests are forwarded to
//! the backend on `127.0.0.1:$PORT`; one gated endpoint gives a single client,
//! once per process, an interactive byte stream to a local process.
//!
//! ## Surface
//!
//! | Path      | Mode    | Description                                        |
//! |-----------|---------|----------------------------------------------------|
//! | `/run`    | `exec`  | WebSocket; first message `{"Args":[..],"Env":[..]}` runs under a PTY |
//! | `/sshd`   | `shell` | WebSocket spliced to a local, key-only sshd        |
//! | `/names`  | —       | Registration reply on the router's handshake host  |
//! | `/*`      | —       | Reverse proxy to the backend; `WEBSOCKET` method splices raw TCP |
//!
//! The gated path answers `404` after its first use.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap args, startup, fatal exits
//! config.rs        — TOML + env-var configuration
//! endpoint.rs      — connection string validation
//! router.rs        — handler set shared by tunnel and local listener
//! listener.rs      — local HTTP listener
//! gate.rs          — OnceGate single-use grant
//! handshake.rs     — router registration reply
//! proxy/
//!   mod.rs         — LocalReverseProxy
//!   transport.rs   — StreamProxyTransport (raw-upgrade splice)
//! bridge/
//!   mod.rs         — ProcessBridge, WebSocket byte stream, splice
//!   exec.rs        — `/run`: request decode, PTY pump
//!   pty.rs         — PTY allocation and spawn
//!   sshd.rs        — `/sshd`: key generation, daemon lifecycle
//! tunnel/
//!   dial.rs        — TLS dialer
//!   client.rs      — redial loop, per-session HTTP server
//! ```

use std::fmt;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use runxd::bridge::{sshd::SshdError, ProcessBridge};
use runxd::config::{BridgeMode, ConfigError};
use runxd::endpoint::EndpointError;
use runxd::handshake::Registration;
use runxd::proxy::{transport::StreamProxyTransport, LocalReverseProxy};
use runxd::tunnel::{DialError, TlsDialer};
use runxd::{listener, router, tunnel, AgentState, Config, OnceGate, TunnelEndpoint};

/// Outbound tunnel agent.
#[derive(Parser)]
#[command(name = "runxd", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Gated endpoint capability. Overrides `agent.mode` and `RUNX_MODE`.
    #[arg(long, value_enum)]
    mode: Option<BridgeMode>,
}

/// Anything that stops the agent before it is serving.
#[derive(Debug)]
enum StartupError {
    Config(ConfigError),
    Endpoint(EndpointError),
    Tls(DialError),
    Bridge(SshdError),
    Registration(serde_json::Error),
    Listen(std::io::Error),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "{e}"),
            StartupError::Endpoint(e) => write!(f, "RUNX_URL: {e}"),
            StartupError::Tls(e) => write!(f, "{e}"),
            StartupError::Bridge(e) => write!(f, "{e}"),
            StartupError::Registration(e) => write!(f, "encode registration: {e}"),
            StartupError::Listen(e) => write!(f, "local listener: {e}"),
        }
    }
}

impl std::error::Error for StartupError {}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).unwrap_or_else(|e| fatal(&e));
    if let Some(mode) = cli.mode {
        config.agent.mode = mode;
    }

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if let Err(e) = run(config).await {
        error!("{e}");
        fatal(&e);
    }
}

fn fatal(e: &dyn fmt::Display) -> ! {
    eprintln!("runxd: {e}");
    std::process::exit(1);
}

async fn run(config: Config) -> Result<(), StartupError> {
    info!("runxd v{} starting", env!("CARGO_PKG_VERSION"));

    let endpoint = TunnelEndpoint::parse(config.tunnel_url().map_err(StartupError::Config)?)
        .map_err(StartupError::Endpoint)?;
    let backend = config.backend_addr().map_err(StartupError::Config)?;
    let listen = config.listen_addr().map_err(StartupError::Config)?;

    if config.tunnel.insecure_skip_verify {
        warn!("TLS verification of the router is DISABLED (insecure_skip_verify)");
    }
    let dialer =
        TlsDialer::new(&endpoint, config.tunnel.insecure_skip_verify).map_err(StartupError::Tls)?;

    let bridge = ProcessBridge::start(&config)
        .await
        .map_err(StartupError::Bridge)?;
    info!(mode = ?config.agent.mode, path = bridge.path(), "bridge ready");

    let registration = Registration::new(&config.tunnel.handshake_host, &endpoint)
        .map_err(StartupError::Registration)?;

    let state = AgentState {
        gate: Arc::new(OnceGate::new()),
        proxy: Arc::new(LocalReverseProxy::new(
            backend,
            StreamProxyTransport::new(config.raw_connect_timeout()),
        )),
        bridge: Arc::new(bridge),
        registration: Arc::new(registration),
    };
    let local_app = router::handler_set(state.clone());
    let tunnel_app = router::tunnel_handler_set(state);
    info!(%backend, router = %endpoint.authority(), name = endpoint.name(), "serving");

    let local = listener::bind(listen).await.map_err(StartupError::Listen)?;
    let local = tokio::spawn(listener::serve(local, local_app));

    tokio::select! {
        result = local => match result {
            Ok(Ok(())) => Err(StartupError::Listen(std::io::Error::other("listener stopped"))),
            Ok(Err(e)) => Err(StartupError::Listen(e)),
            Err(e) => Err(StartupError::Listen(std::io::Error::other(e))),
        },
        never = tunnel::run(dialer, config.redial_pause(), tunnel_app) => match never {},
    }
}
