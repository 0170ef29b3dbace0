//! Registration handshake with the router.
//!
//! On a fresh tunnel session the router asks the agent who it is by sending a
//! request for `/names` on its handshake host. The agent replies with one JSON
//! line naming itself and carrying the pre-shared token from the connection
//! string, then leaves the response open for the life of the session.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::{stream, StreamExt};
use serde::Serialize;
use tracing::info;

use crate::endpoint::TunnelEndpoint;

pub const REGISTRATION_PATH: &str = "/names";

#[derive(Debug, Serialize)]
struct BackendCommand<'a> {
    #[serde(rename = "Op")]
    op: &'static str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Password")]
    password: &'a str,
}

/// The router-facing identity of this agent.
pub struct Registration {
    host: String,
    payload: Bytes,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl Registration {
    pub fn new(host: &str, endpoint: &TunnelEndpoint) -> Result<Self, serde_json::Error> {
        let mut payload = serde_json::to_vec(&BackendCommand {
            op: "add",
            name: endpoint.name(),
            password: endpoint.secret(),
        })?;
        payload.push(b'\n');
        Ok(Self {
            host: host.to_ascii_lowercase(),
            payload: Bytes::from(payload),
        })
    }

    fn matches(&self, request: &Request) -> bool {
        if request.uri().path() != REGISTRATION_PATH {
            return false;
        }
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| request.uri().host());
        host.is_some_and(|h| strip_port(h).eq_ignore_ascii_case(&self.host))
    }

    fn response(&self) -> Response {
        let line = stream::once(futures::future::ready(Ok::<_, Infallible>(
            self.payload.clone(),
        )));
        let body = Body::from_stream(line.chain(stream::pending()));
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their colons.
    if let Some(end) = host.find(']') {
        return &host[..=end];
    }
    host.split(':').next().unwrap_or(host)
}

/// Middleware answering the registration request ahead of every other route.
pub async fn intercept(
    State(registration): State<Arc<Registration>>,
    request: Request,
    next: Next,
) -> Response {
    if registration.matches(&request) {
        info!(host = %registration.host, "answering router registration");
        return registration.response();
    }
    next.run(request).await
}
