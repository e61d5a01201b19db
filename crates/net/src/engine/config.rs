use std::time::Duration;

use crate::connection::{AttemptConfig, ListenerConfig};
use crate::ping::DEFAULT_PING_INTERVAL;
use crate::protocol::DEFAULT_PORT;
use crate::replication::{
    DEFAULT_CREATIONS_PER_FRAME, DEFAULT_MAX_UPDATE_BODY, MAX_REPLICATION_SLOTS,
    ReplicationConfig,
};
use crate::transport::PacketLossSimulation;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_RESEND: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Stream and datagram sockets share this port number.
    pub port: u16,
    pub handshake_timeout: Duration,
    /// How often a client repeats its handshake datagram until answered.
    pub handshake_resend_interval: Duration,
    pub ping_interval: Duration,
    pub max_connections: usize,
    pub creations_per_frame: usize,
    pub max_update_body: usize,
    /// Frame offsets within this many frames are not corrected.
    pub frame_correction_tolerance: i64,
    pub packet_loss: PacketLossSimulation,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handshake_resend_interval: DEFAULT_HANDSHAKE_RESEND,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            creations_per_frame: DEFAULT_CREATIONS_PER_FRAME,
            max_update_body: DEFAULT_MAX_UPDATE_BODY,
            frame_correction_tolerance: 1,
            packet_loss: PacketLossSimulation::default(),
        }
    }
}

impl NetworkConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Connections beyond the replication slot count cannot be served.
    pub fn effective_max_connections(&self) -> usize {
        self.max_connections.min(MAX_REPLICATION_SLOTS)
    }

    pub(crate) fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            handshake_timeout: self.handshake_timeout,
            ping_interval: self.ping_interval,
            packet_loss: self.packet_loss.clone(),
        }
    }

    pub(crate) fn attempt(&self) -> AttemptConfig {
        AttemptConfig {
            handshake_timeout: self.handshake_timeout,
            resend_interval: self.handshake_resend_interval,
            ping_interval: self.ping_interval,
            packet_loss: self.packet_loss.clone(),
        }
    }

    pub(crate) fn replication(&self) -> ReplicationConfig {
        ReplicationConfig {
            creations_per_frame: self.creations_per_frame,
            max_message_body: self.max_update_body,
        }
    }
}
