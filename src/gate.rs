//! Single-use grant for the gated endpoint.
//!
//! The router hands out one authorization per agent process. The first request
//! that reaches the gated route consumes it; every later request gets a bare
//! `404`, indistinguishable from a route that does not exist.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Extension, Router,
};
use tracing::{error, info};

/// A flag that flips from unused to consumed exactly once.
#[derive(Debug, Default)]
pub struct OnceGate {
    consumed: AtomicBool,
}

impl OnceGate {
    pub const fn new() -> Self {
        Self {
            consumed: AtomicBool::new(false),
        }
    }

    /// Returns `true` for exactly one caller over the gate's lifetime.
    pub fn try_consume(&self) -> bool {
        self.consumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }
}

/// Wrap every route in `router` behind `gate`.
///
/// Only the routes already added to `router` are guarded; merge the result
/// into the outer router afterwards.
pub fn guard<S>(router: Router<S>, gate: Arc<OnceGate>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .route_layer(middleware::from_fn(require_unused_grant))
        .route_layer(Extension(gate))
}

/// Axum middleware that lets the first request through and answers `404` to
/// the rest. The gate is injected via the [`OnceGate`] extension.
pub async fn require_unused_grant(request: Request, next: Next) -> Response {
    let Some(gate) = request.extensions().get::<Arc<OnceGate>>().cloned() else {
        error!("gated route has no OnceGate extension");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    if !gate.try_consume() {
        info!(path = %request.uri().path(), "grant already used; returning 404");
        return StatusCode::NOT_FOUND.into_response();
    }

    info!(path = %request.uri().path(), "grant consumed");
    next.run(request).await
}
