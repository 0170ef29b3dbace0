//! Shared state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;

use crate::bridge::ProcessBridge;
use crate::gate::OnceGate;
use crate::handshake::Registration;
use crate::proxy::LocalReverseProxy;

/// Everything the handler set needs. Cloned per request; all fields are
/// shared, so the tunnel and the local listener see the same gate.
#[derive(Clone)]
pub struct AgentState {
    /// Single-use grant for the bridge endpoint.
    pub gate: Arc<OnceGate>,
    /// Forwarder for every non-gated request.
    pub proxy: Arc<LocalReverseProxy>,
    /// The process behind `/run` or `/sshd`.
    pub bridge: Arc<ProcessBridge>,
    pub registration: Arc<Registration>,
}
