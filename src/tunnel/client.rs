//! Dial-and-serve loop.
//!
//! Each iteration dials the router, serves the handler set over the resulting
//! connection until it ends, then sleeps a fixed pause. Nothing that happens
//! inside a session is fatal to the loop.

use std::convert::Infallible;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use super::dial::Dialer;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Run the tunnel forever.
pub async fn run<D: Dialer>(dialer: D, pause: Duration, router: Router) -> Infallible {
    let target = dialer.describe();
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        info!(%target, attempt, "dialing router");
        match dialer.dial().await {
            Ok(conn) => {
                info!(%target, "tunnel session established");
                match serve_session(conn, router.clone()).await {
                    Ok(()) => info!(%target, "tunnel session closed"),
                    Err(e) => warn!(%target, error = %e, "tunnel session failed"),
                }
            }
            Err(e) => warn!(%target, error = %e, "dial failed"),
        }
        info!("redialing in {}ms", pause.as_millis());
        tokio::time::sleep(pause).await;
    }
}

/// Serve `router` over one established connection (HTTP/1.1 or HTTP/2,
/// upgrades allowed) until the peer or the transport ends it.
pub async fn serve_session<I>(io: I, router: Router) -> Result<(), BoxError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router);
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http2().enable_connect_protocol();
    builder
        .serve_connection_with_upgrades(TokioIo::new(io), service)
        .await
}
