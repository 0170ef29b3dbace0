#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! runxd library — the building blocks of the tunnel agent.
//!
//! - `tunnel` — outbound dial-and-serve loop to the router
//! - `router` — the handler set served over the tunnel and locally
//! - `proxy` — reverse proxy to the loopback backend, raw-upgrade splicing
//! - `gate` — single-use grant in front of the bridge endpoint
//! - `bridge` — PTY command execution (`/run`) and sshd splicing (`/sshd`)
//! - `handshake` — registration reply to the router
//! - `config`, `endpoint` — configuration and connection-string parsing

pub mod bridge;
pub mod config;
pub mod endpoint;
pub mod gate;
pub mod handshake;
pub mod listener;
pub mod proxy;
pub mod router;
pub mod state;
pub mod tunnel;

pub use config::Config;
pub use endpoint::TunnelEndpoint;
pub use gate::OnceGate;
pub use state::AgentState;
