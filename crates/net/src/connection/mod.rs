//! Connections and the handshake that produces them.
//!
//! A stream connect is followed by a client datagram, a server datagram
//! reply carrying the connection id, and a stream acknowledgement of that
//! id. Only then is either side `Established`.

mod attempt;
mod error;
mod listener;
mod manager;
mod peer;
mod state;

pub use attempt::{AttemptConfig, AttemptStatus, ConnectionAttempt};
pub use error::HandshakeError;
pub use listener::{ConnectionAttemptListener, ListenerConfig, ListenerEvent};
pub use manager::ConnectionManager;
pub use peer::Connection;
pub use state::{ConnectionId, ConnectionState, ConnectionStatus};
