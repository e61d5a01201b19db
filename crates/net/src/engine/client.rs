use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use crate::connection::{AttemptStatus, Connection, ConnectionAttempt, ConnectionId, HandshakeError};
use crate::ping::{FrameSynchronizer, PingInfo};
use crate::protocol::{ArenaLoaded, ArenaStart, Disconnect, Message, PlayerSettings};
use crate::replication::{
    GobCollection, GobRegistry, ReplicationEngine, ReplicationRole, SerializationModeFlags,
};
use crate::simulation::FrameClock;
use crate::transport::NetworkStats;

use super::{DisconnectReason, NetworkConfig, NetworkEvent};

/// Client side of the network: runs the handshake, mirrors the server's gobs
/// into the local collection and sends updates for the gobs this client
/// owns.
pub struct ClientNetwork {
    config: NetworkConfig,
    server_addr: SocketAddr,
    attempt: Option<ConnectionAttempt>,
    connection: Option<Connection>,
    replication: Option<ReplicationEngine>,
    registry: GobRegistry,
    synchronizer: FrameSynchronizer,
    arena: Option<u32>,
    events: VecDeque<NetworkEvent>,
}

impl ClientNetwork {
    pub fn connect(
        server_addr: SocketAddr,
        config: NetworkConfig,
        registry: GobRegistry,
    ) -> Result<Self, HandshakeError> {
        let attempt = ConnectionAttempt::start(server_addr, config.attempt())?;

        Ok(Self {
            synchronizer: FrameSynchronizer::new(
                config.frame_correction_tolerance,
                config.ping_interval,
            ),
            config,
            server_addr,
            attempt: Some(attempt),
            connection: None,
            replication: None,
            registry,
            arena: None,
            events: VecDeque::new(),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn is_connecting(&self) -> bool {
        self.attempt.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Our id as assigned by the server, once connected.
    pub fn local_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(Connection::id)
    }

    pub fn arena(&self) -> Option<u32> {
        self.arena
    }

    pub fn ping(&self) -> Option<&PingInfo> {
        self.connection.as_ref().map(Connection::ping)
    }

    pub fn stats(&self) -> Option<NetworkStats> {
        self.connection.as_ref().map(Connection::stats)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = NetworkEvent> + '_ {
        self.events.drain(..)
    }

    /// One network frame. May move `clock` when the server's frame counter
    /// disagrees with ours.
    pub fn update(&mut self, clock: &mut FrameClock, gobs: &mut GobCollection) {
        let now = Instant::now();

        self.poll_attempt(now);
        if self.connection.is_none() {
            return;
        }

        if let Err(reason) = self.receive(clock, gobs, now) {
            self.teardown(reason);
            return;
        }
        if let Err(reason) = self.send_pings(clock, now) {
            self.teardown(reason);
            return;
        }
        if let Err(reason) = self.replicate(clock, gobs) {
            self.teardown(reason);
            return;
        }
        if let Some(connection) = &self.connection {
            connection.flush();
        }
    }

    pub fn send_player_settings(&mut self, settings: PlayerSettings) -> Result<(), DisconnectReason> {
        let Some(connection) = &self.connection else {
            return Err(DisconnectReason::Local("not connected".into()));
        };
        connection
            .send(&Message::PlayerSettings(settings))
            .map_err(|e| DisconnectReason::Transport(e.to_string()))
    }

    /// Abandons a pending attempt or says goodbye to the server.
    pub fn disconnect(&mut self, reason: &str) {
        if let Some(mut attempt) = self.attempt.take() {
            attempt.cancel();
        }
        if let Some(connection) = &self.connection {
            let _ = connection.send(&Message::Disconnect(Disconnect {
                reason: reason.to_string(),
            }));
            connection.flush();
            self.teardown(DisconnectReason::Local(reason.to_string()));
        }
    }

    fn poll_attempt(&mut self, now: Instant) {
        let Some(attempt) = &mut self.attempt else {
            return;
        };

        match attempt.poll(now) {
            AttemptStatus::Pending => {}
            AttemptStatus::Established(connection) => {
                let id = connection.id();
                let mut replication = ReplicationEngine::new(
                    ReplicationRole::Client { local_id: id },
                    self.config.replication(),
                );
                replication.add_connection(id);

                self.attempt = None;
                self.replication = Some(replication);
                self.connection = Some(connection);
                self.events.push_back(NetworkEvent::ConnectionEstablished {
                    connection: id,
                    addr: self.server_addr,
                });
            }
            AttemptStatus::Failed(error) => {
                self.attempt = None;
                self.events.push_back(NetworkEvent::ConnectionAttemptFailed {
                    addr: self.server_addr,
                    reason: error.to_string(),
                });
            }
        }
    }

    fn receive(
        &mut self,
        clock: &mut FrameClock,
        gobs: &mut GobCollection,
        now: Instant,
    ) -> Result<(), DisconnectReason> {
        let Some(connection) = &mut self.connection else {
            return Ok(());
        };
        if let Some(error) = connection.take_errors().into_iter().next() {
            return Err(DisconnectReason::Transport(error));
        }

        let from = connection.id();
        for message in connection.drain_messages() {
            match message {
                Message::Ping(ping) => {
                    let pong = connection.ping().reply(&ping, clock);
                    send(connection, &pong)?;
                }
                Message::Pong(pong) => connection.ping_mut().handle_pong(&pong, now, clock),
                Message::GobCreation(creation) => {
                    let frames_ago = connection.ping().frames_ago(creation.frame_number, clock);
                    let created = gobs.apply_creation(&creation, &self.registry, frames_ago);
                    if !created.is_empty() {
                        self.events.push_back(NetworkEvent::GobsCreated { from, gobs: created });
                    }
                }
                Message::GobUpdate(update) => {
                    let frames_ago = connection.ping().frames_ago(update.frame_number, clock);
                    let updated = gobs.apply_update(
                        &update,
                        SerializationModeFlags::VARYING_DATA_FROM_SERVER,
                        frames_ago,
                        None,
                    );
                    if !updated.is_empty() {
                        self.events.push_back(NetworkEvent::GobsUpdated { from, gobs: updated });
                    }
                    if !update.collisions.is_empty() {
                        self.events.push_back(NetworkEvent::CollisionsReceived {
                            from,
                            collisions: update.collisions,
                        });
                    }
                }
                Message::GobDeletion(deletion) => {
                    let deleted = gobs.apply_deletion(&deletion);
                    if !deleted.is_empty() {
                        self.events.push_back(NetworkEvent::GobsDeleted { from, gobs: deleted });
                    }
                }
                Message::ArenaStart(start) => {
                    enter_arena(connection, &start, clock, gobs)?;
                    if let Some(replication) = &mut self.replication {
                        replication.reset();
                    }
                    self.arena = Some(start.arena_id);
                    self.events.push_back(NetworkEvent::ArenaStarted {
                        arena_id: start.arena_id,
                        frame_number: start.frame_number,
                    });
                }
                Message::ArenaFinished(finished) => {
                    log::info!("Arena {} finished", finished.arena_id);
                    gobs.clear();
                    if let Some(replication) = &mut self.replication {
                        replication.reset();
                    }
                    connection.status_mut().leave_arena();
                    self.arena = None;
                    self.events.push_back(NetworkEvent::ArenaFinished {
                        arena_id: finished.arena_id,
                    });
                }
                Message::Disconnect(disconnect) => {
                    return Err(DisconnectReason::Remote(disconnect.reason));
                }
                Message::HandshakeReply(_) => log::trace!("Late handshake reply"),
                other => {
                    log::warn!("Ignoring {:?} from server", other.message_type());
                }
            }
        }
        Ok(())
    }

    fn send_pings(&mut self, clock: &mut FrameClock, now: Instant) -> Result<(), DisconnectReason> {
        let Some(connection) = &mut self.connection else {
            return Ok(());
        };

        if let Some(ping) = connection.ping_mut().update(now) {
            send(connection, &ping)?;
        }

        if self.arena.is_none() {
            self.synchronizer.release_hold(connection.ping_mut(), now);
        } else if let Some(delta) = self.synchronizer.synchronize(connection.ping_mut(), clock, now) {
            self.events.push_back(NetworkEvent::FrameNumberCorrected {
                delta,
                frame_number: clock.frame_number(),
            });
        }
        Ok(())
    }

    fn replicate(
        &mut self,
        clock: &FrameClock,
        gobs: &mut GobCollection,
    ) -> Result<(), DisconnectReason> {
        let (Some(connection), Some(replication)) = (&self.connection, &mut self.replication)
        else {
            return Ok(());
        };
        let targets = if self.arena.is_some() {
            vec![connection.id()]
        } else {
            Vec::new()
        };

        for (_, message) in replication.replicate(clock, gobs, &targets) {
            send(connection, &message)?;
        }
        Ok(())
    }

    fn teardown(&mut self, reason: DisconnectReason) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        connection.dispose();
        self.replication = None;
        self.arena = None;

        log::info!("Connection to {} lost: {}", self.server_addr, reason);
        self.events.push_back(NetworkEvent::ConnectionLost {
            connection: connection.id(),
            reason,
        });
    }
}

impl Drop for ClientNetwork {
    fn drop(&mut self) {
        self.disconnect("client shutting down");
    }
}

/// Starts a fresh arena session: drops local gobs, adopts the server's frame
/// number and acknowledges the arena.
fn enter_arena(
    connection: &mut Connection,
    start: &ArenaStart,
    clock: &mut FrameClock,
    gobs: &mut GobCollection,
) -> Result<(), DisconnectReason> {
    log::info!(
        "Entering arena {} at server frame {}",
        start.arena_id,
        start.frame_number
    );
    gobs.clear();

    let delta = start.frame_number.saturating_sub(clock.frame_number());
    clock.set_frame_number(start.frame_number);
    connection.ping_mut().shift_frame_offsets(delta);

    let status = connection.status_mut();
    status.set_player_settings_received();
    status.enter_arena(start.arena_id);
    status.mark_playing(start.arena_id);

    send(
        connection,
        &Message::ArenaLoaded(ArenaLoaded {
            arena_id: start.arena_id,
        }),
    )
}

fn send(connection: &Connection, message: &Message) -> Result<(), DisconnectReason> {
    connection
        .send(message)
        .map_err(|e| DisconnectReason::Transport(e.to_string()))
}
