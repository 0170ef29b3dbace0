//! Outbound tunnel to the router.
//!
//! The agent dials the router and then plays the HTTP *server* on the
//! connection it opened: the router sends requests down the tunnel and the
//! agent answers them with the local handler set. When a session ends for any
//! reason, the agent pauses and dials again, forever.

pub mod client;
pub mod dial;

pub use client::{run, serve_session};
pub use dial::{DialError, Dialer, TlsDialer};
