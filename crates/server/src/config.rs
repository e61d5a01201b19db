use std::time::Duration;

use arena_net::{NetworkConfig, PacketLossSimulation};

/// Simulation frames per second on both host and client. Gob extrapolation
/// assumes this rate.
pub const TICK_RATE: u32 = 60;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub network: NetworkConfig,
    /// Stop after this many frames; runs until disconnected when `None`.
    pub max_frames: Option<u64>,
    pub status_interval: Duration,
}

impl DriverConfig {
    pub fn new(port: u16, max_connections: usize, loss_percent: f32) -> Self {
        let packet_loss = if loss_percent > 0.0 {
            PacketLossSimulation::dropping(loss_percent)
        } else {
            PacketLossSimulation::default()
        };

        Self {
            network: NetworkConfig {
                max_connections,
                packet_loss,
                ..NetworkConfig::with_port(port)
            },
            max_frames: None,
            status_interval: Duration::from_secs(5),
        }
    }
}
