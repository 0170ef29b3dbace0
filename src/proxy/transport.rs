//! Request transport with a raw-stream escape hatch.
//!
//! Ordinary requests go through a pooled HTTP/1.1 client. A request whose
//! method is the `WEBSOCKET` sentinel instead gets a fresh TCP connection to
//! its target: the request body is copied into the socket and the response
//! body *is* the socket's read side, so the caller ends up holding a raw
//! bidirectional byte stream behind an HTTP-shaped interface.

use std::fmt;
use std::io;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
};
use futures::TryStreamExt;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

/// Method that marks a request as a raw byte-stream splice.
pub const RAW_UPGRADE_METHOD: &str = "WEBSOCKET";

/// Whether `request` asks for a raw splice rather than HTTP forwarding.
pub fn is_raw_upgrade<B>(request: &Request<B>) -> bool {
    request.method().as_str() == RAW_UPGRADE_METHOD
}

/// Failure to produce a response for a forwarded request.
#[derive(Debug)]
pub enum TransportError {
    /// The raw-upgrade request carried no `host:port` to dial.
    NoTarget,
    Connect(io::Error),
    ConnectTimeout(Duration),
    Forward(hyper_util::client::legacy::Error),
    Build(axum::http::Error),
}

impl TransportError {
    /// Status reported to the tunnel peer for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            TransportError::ConnectTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            TransportError::Build(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NoTarget => write!(f, "raw upgrade request has no target authority"),
            TransportError::Connect(e) => write!(f, "connect: {e}"),
            TransportError::ConnectTimeout(d) => {
                write!(f, "connect timed out after {}ms", d.as_millis())
            }
            TransportError::Forward(e) => write!(f, "forward: {e}"),
            TransportError::Build(e) => write!(f, "build response: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

pub struct StreamProxyTransport {
    client: Client<HttpConnector, Body>,
    connect_timeout: Option<Duration>,
}

impl StreamProxyTransport {
    /// `connect_timeout` bounds raw-upgrade dials only; `None` leaves it to
    /// the OS.
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            connect_timeout,
        }
    }

    pub async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, TransportError> {
        if is_raw_upgrade(&request) {
            return self.splice(request).await;
        }
        let response = self
            .client
            .request(request)
            .await
            .map_err(TransportError::Forward)?;
        Ok(response.map(Body::new))
    }

    async fn splice(&self, request: Request<Body>) -> Result<Response<Body>, TransportError> {
        let target = request
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or(TransportError::NoTarget)?;

        let conn = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(&target))
                .await
                .map_err(|_| TransportError::ConnectTimeout(limit))?,
            None => TcpStream::connect(&target).await,
        }
        .map_err(TransportError::Connect)?;
        let _ = conn.set_nodelay(true);
        debug!(%target, "raw upgrade connected");

        let (read_half, mut write_half) = conn.into_split();
        let body = request.into_body();
        tokio::spawn(async move {
            let mut upstream = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
            match tokio::io::copy(&mut upstream, &mut write_half).await {
                Ok(n) => debug!(%target, bytes = n, "raw upgrade request body finished"),
                Err(e) => warn!(%target, error = %e, "raw upgrade request copy failed"),
            }
            let _ = write_half.shutdown().await;
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(Body::from_stream(ReaderStream::new(read_half)))
            .map_err(TransportError::Build)
    }
}
