//! Per-frame drivers tying connections, ping and replication together.
//!
//! The simulation calls `update` once per frame on the main thread and
//! reacts to the [NetworkEvent]s drained afterwards.

mod client;
mod config;
mod events;
mod server;

pub use client::ClientNetwork;
pub use config::{
    DEFAULT_HANDSHAKE_RESEND, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS, NetworkConfig,
};
pub use events::{DisconnectReason, NetworkEvent};
pub use server::{ConnectionInfo, ServerNetwork};
