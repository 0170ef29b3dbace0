//! The handler sets served on tunnel sessions and on the local listener.

use std::sync::Arc;

use axum::{middleware, routing::any, Router};
use tower_http::trace::TraceLayer;

use crate::state::AgentState;
use crate::{bridge, gate, handshake, proxy};

/// Gated bridge route plus the reverse proxy for everything else.
fn routes(state: AgentState) -> Router {
    let gated = gate::guard(
        Router::new().route(state.bridge.path(), any(bridge::upgrade)),
        Arc::clone(&state.gate),
    );

    Router::new()
        .merge(gated)
        .fallback(proxy::forward)
        .with_state(state)
}

/// What the local listener serves. No registration reply: it carries the
/// router token and is only for the router on the tunnel.
pub fn handler_set(state: AgentState) -> Router {
    routes(state).layer(TraceLayer::new_for_http())
}

/// What each tunnel session serves: [`handler_set`] with the registration
/// intercept in front.
pub fn tunnel_handler_set(state: AgentState) -> Router {
    let registration = Arc::clone(&state.registration);
    routes(state)
        .layer(middleware::from_fn_with_state(
            registration,
            handshake::intercept,
        ))
        .layer(TraceLayer::new_for_http())
}
