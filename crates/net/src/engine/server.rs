use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::connection::{
    Connection, ConnectionAttemptListener, ConnectionId, ConnectionManager, ConnectionStatus,
    ListenerEvent,
};
use crate::protocol::{ArenaFinished, ArenaStart, CollisionEvent, Disconnect, Message};
use crate::replication::{
    GobCollection, GobId, ReplicationEngine, ReplicationRole, SerializationModeFlags,
};
use crate::simulation::FrameClock;
use crate::transport::{NetworkStats, SocketTransport};

use super::{DisconnectReason, NetworkConfig, NetworkEvent};

/// Snapshot of one connection for display and diagnostics.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub ping: Duration,
    pub frame_offset: i64,
    pub status: ConnectionStatus,
    pub stats: NetworkStats,
}

/// Server side of the network: accepts connections, answers pings, runs
/// arenas and replicates the authoritative gobs to every game client.
pub struct ServerNetwork {
    config: NetworkConfig,
    listener: ConnectionAttemptListener,
    connections: ConnectionManager,
    replication: ReplicationEngine,
    arena: Option<u32>,
    events: VecDeque<NetworkEvent>,
}

impl ServerNetwork {
    pub fn bind(ip: IpAddr, config: NetworkConfig) -> io::Result<Self> {
        let listener =
            ConnectionAttemptListener::bind(SocketAddr::new(ip, config.port), config.listener())?;

        Ok(Self {
            connections: ConnectionManager::new(config.effective_max_connections()),
            replication: ReplicationEngine::new(ReplicationRole::Server, config.replication()),
            listener,
            arena: None,
            events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn arena(&self) -> Option<u32> {
        self.arena
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = NetworkEvent> + '_ {
        self.events.drain(..)
    }

    /// One network frame. Call once per simulation frame, after the
    /// simulation has advanced `clock`.
    pub fn update(&mut self, clock: &FrameClock, gobs: &mut GobCollection) {
        let now = Instant::now();

        self.accept(now);
        self.receive(clock, gobs, now);
        self.ping(now);
        self.replicate(clock, gobs);
        self.flush();
    }

    pub fn start_arena(&mut self, arena_id: u32, clock: &FrameClock) {
        if let Some(previous) = self.arena {
            self.finish_arena_inner(previous);
        }
        log::info!("Starting arena {} at frame {}", arena_id, clock.frame_number());

        self.arena = Some(arena_id);
        self.replication.reset();
        for id in self.connections.ids() {
            self.invite(id, clock);
        }
        self.events.push_back(NetworkEvent::ArenaStarted {
            arena_id,
            frame_number: clock.frame_number(),
        });
    }

    /// Ends the running arena. The caller clears its own gobs.
    pub fn finish_arena(&mut self) {
        if let Some(arena_id) = self.arena {
            self.finish_arena_inner(arena_id);
        }
    }

    fn finish_arena_inner(&mut self, arena_id: u32) {
        log::info!("Finishing arena {}", arena_id);
        let message = Message::ArenaFinished(ArenaFinished { arena_id });
        let mut failed = Vec::new();
        for connection in self.connections.iter_mut() {
            if connection.status().current_arena != Some(arena_id) {
                continue;
            }
            connection.status_mut().leave_arena();
            if let Err(e) = connection.send(&message) {
                failed.push((connection.id(), DisconnectReason::Transport(e.to_string())));
            }
        }
        for (id, reason) in failed {
            self.teardown(id, reason);
        }

        self.arena = None;
        self.replication.reset();
        self.events.push_back(NetworkEvent::ArenaFinished { arena_id });
    }

    pub fn queue_collision(&mut self, event: CollisionEvent) {
        self.replication.queue_collision(event);
    }

    pub fn force_update(&mut self, gob: GobId) {
        self.replication.force_update(gob);
    }

    /// Says goodbye to one connection and tears it down.
    pub fn disconnect(&mut self, id: ConnectionId, reason: &str) {
        if let Some(connection) = self.connections.get(id) {
            let _ = connection.send(&Message::Disconnect(Disconnect {
                reason: reason.to_string(),
            }));
            connection.flush();
        }
        self.teardown(id, DisconnectReason::Local(reason.to_string()));
    }

    /// Says goodbye to every connection, then closes the listener and the
    /// datagram socket the connections share.
    pub fn shutdown(&mut self) {
        for id in self.connections.ids() {
            self.disconnect(id, "server shutting down");
        }
        self.listener.dispose();
    }

    pub fn connection_info(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|connection| ConnectionInfo {
                id: connection.id(),
                remote_addr: connection.remote_addr(),
                ping: connection.ping().ping_time(),
                frame_offset: connection.ping().remote_frame_number_offset(),
                status: connection.status().clone(),
                stats: connection.stats(),
            })
            .collect()
    }

    /// Statistics of the shared datagram socket.
    pub fn datagram_stats(&self) -> NetworkStats {
        self.listener.datagram().stats()
    }

    fn accept(&mut self, now: Instant) {
        for event in self.listener.poll(now) {
            match event {
                ListenerEvent::Established(connection) => self.admit(connection),
                ListenerEvent::Failed { peer, error } => {
                    self.events.push_back(NetworkEvent::ConnectionAttemptFailed {
                        addr: peer,
                        reason: error.to_string(),
                    });
                }
            }
        }

        for error in self.listener.datagram().errors().drain() {
            log::warn!("Shared datagram socket: {}", error);
        }
    }

    fn admit(&mut self, mut connection: Connection) {
        let id = connection.id();
        let addr = connection.remote_addr();

        if self.connections.is_full() || !self.replication.add_connection(id) {
            log::warn!("Refusing connection {} from {}: server full", id, addr);
            let _ = connection.send(&Message::Disconnect(Disconnect {
                reason: DisconnectReason::ServerFull.to_string(),
            }));
            connection.flush();
            connection.dispose();
            self.events.push_back(NetworkEvent::ConnectionAttemptFailed {
                addr,
                reason: DisconnectReason::ServerFull.to_string(),
            });
            return;
        }

        if let Err(mut connection) = self.connections.insert(connection) {
            self.replication.remove_connection(id);
            connection.dispose();
            return;
        }
        self.events.push_back(NetworkEvent::ConnectionEstablished {
            connection: id,
            addr,
        });
    }

    fn receive(&mut self, clock: &FrameClock, gobs: &mut GobCollection, now: Instant) {
        for id in self.connections.ids() {
            let Some(connection) = self.connections.get_mut(id) else {
                continue;
            };

            if let Some(error) = connection.take_errors().into_iter().next() {
                self.teardown(id, DisconnectReason::Transport(error));
                continue;
            }

            for message in connection.drain_messages() {
                if let Err(reason) = self.handle_message(id, message, clock, gobs, now) {
                    self.teardown(id, reason);
                    break;
                }
            }
        }
    }

    fn handle_message(
        &mut self,
        id: ConnectionId,
        message: Message,
        clock: &FrameClock,
        gobs: &mut GobCollection,
        now: Instant,
    ) -> Result<(), DisconnectReason> {
        let Some(connection) = self.connections.get_mut(id) else {
            return Ok(());
        };

        match message {
            Message::Ping(ping) => {
                let pong = connection.ping().reply(&ping, clock);
                send(connection, &pong)?;
            }
            Message::Pong(pong) => connection.ping_mut().handle_pong(&pong, now, clock),
            Message::GobUpdate(update) => {
                let Some(arena_id) = self.arena else {
                    return Ok(());
                };
                if !connection.status().is_game_client(arena_id) {
                    log::debug!("Ignoring gob update from {} outside the arena", id);
                    return Ok(());
                }
                let frames_ago = connection.ping().frames_ago(update.frame_number, clock);
                let updated = gobs.apply_update(
                    &update,
                    SerializationModeFlags::VARYING_DATA_FROM_CLIENT,
                    frames_ago,
                    Some(id),
                );
                if !updated.is_empty() {
                    self.events.push_back(NetworkEvent::GobsUpdated {
                        from: id,
                        gobs: updated,
                    });
                }
            }
            Message::PlayerSettings(settings) => {
                log::info!("Connection {} is '{}'", id, settings.name);
                connection.status_mut().set_player_settings_received();
                self.events.push_back(NetworkEvent::PlayerSettingsReceived {
                    connection: id,
                    settings,
                });
                self.invite(id, clock);
            }
            Message::ArenaLoaded(loaded) => {
                let was_playing = connection.status().is_playing;
                if connection.status_mut().mark_playing(loaded.arena_id)
                    && !was_playing
                    && self.arena == Some(loaded.arena_id)
                {
                    log::info!("Connection {} joined arena {}", id, loaded.arena_id);
                    self.events.push_back(NetworkEvent::ClientReady {
                        connection: id,
                        arena_id: loaded.arena_id,
                    });
                }
            }
            Message::Disconnect(disconnect) => {
                return Err(DisconnectReason::Remote(disconnect.reason));
            }
            Message::HandshakeDatagram(_) | Message::HandshakeAck(_) => {
                log::trace!("Late handshake message from {}", id);
            }
            other => {
                log::warn!(
                    "Ignoring {:?} from connection {}: not sent by clients",
                    other.message_type(),
                    id
                );
            }
        }
        Ok(())
    }

    /// Brings a connection with player settings into the running arena.
    fn invite(&mut self, id: ConnectionId, clock: &FrameClock) {
        let Some(arena_id) = self.arena else {
            return;
        };
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        let status = connection.status();
        if !status.has_player_settings || status.current_arena == Some(arena_id) {
            return;
        }

        connection.status_mut().enter_arena(arena_id);
        let start = Message::ArenaStart(ArenaStart {
            arena_id,
            frame_number: clock.frame_number(),
        });
        if let Err(e) = connection.send(&start) {
            self.teardown(id, DisconnectReason::Transport(e.to_string()));
        }
    }

    fn ping(&mut self, now: Instant) {
        let mut failed = Vec::new();
        for connection in self.connections.iter_mut() {
            if let Some(ping) = connection.ping_mut().update(now) {
                if let Err(e) = connection.send(&ping) {
                    failed.push((connection.id(), e.to_string()));
                }
            }
        }
        for (id, error) in failed {
            self.teardown(id, DisconnectReason::Transport(error));
        }
    }

    fn replicate(&mut self, clock: &FrameClock, gobs: &mut GobCollection) {
        let targets = match self.arena {
            Some(arena_id) => self.connections.game_client_ids(arena_id),
            None => Vec::new(),
        };

        let mut failed = Vec::new();
        for (id, message) in self.replication.replicate(clock, gobs, &targets) {
            let Some(connection) = self.connections.get(id) else {
                continue;
            };
            if let Err(e) = connection.send(&message) {
                log::warn!("Replication to {} failed: {}", id, e);
                failed.push((id, e.to_string()));
            }
        }
        for (id, error) in failed {
            self.teardown(id, DisconnectReason::Transport(error));
        }
    }

    fn flush(&self) {
        for connection in self.connections.iter() {
            connection.flush();
        }
        self.listener.datagram().flush();
    }

    fn teardown(&mut self, id: ConnectionId, reason: DisconnectReason) {
        if !self.connections.remove(id) {
            return;
        }
        self.replication.remove_connection(id);
        log::info!("Connection {} lost: {}", id, reason);
        self.events.push_back(NetworkEvent::ConnectionLost {
            connection: id,
            reason,
        });
    }
}

impl Drop for ServerNetwork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn send(connection: &Connection, message: &Message) -> Result<(), DisconnectReason> {
    connection
        .send(message)
        .map_err(|e| DisconnectReason::Transport(e.to_string()))
}
