use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use arena_net::{
    ClientNetwork, ConnectionId, FixedTimestep, FrameClock, GobCollection, NetworkEvent,
    PlayerSettings,
};

use crate::arena::extrapolate;
use crate::config::{DriverConfig, TICK_RATE};
use crate::gobs::{self, SHIP, Ship};

pub fn run(server_addr: SocketAddr, name: String, config: DriverConfig) -> Result<()> {
    let mut client = ClientNetwork::connect(server_addr, config.network.clone(), gobs::registry())?;

    let mut clock = FrameClock::new(TICK_RATE);
    let mut timestep = FixedTimestep::new(TICK_RATE);
    let mut gobs = GobCollection::new();

    let mut last_frame = Instant::now();
    let mut last_status = last_frame;
    let mut frames = 0u64;

    loop {
        let now = Instant::now();
        timestep.accumulate(now - last_frame);
        last_frame = now;

        while timestep.consume_frame() {
            clock.advance();
            extrapolate(&mut gobs, clock.frame_duration());
            if let Some(local_id) = client.local_id() {
                pilot(&mut gobs, local_id, &clock);
            }

            client.update(&mut clock, &mut gobs);
            let events: Vec<NetworkEvent> = client.drain_events().collect();
            for event in events {
                match event {
                    NetworkEvent::ConnectionEstablished { connection, .. } => {
                        log::info!("Connected to {} as {}", server_addr, connection);
                        client
                            .send_player_settings(PlayerSettings {
                                name: name.clone(),
                                data: Vec::new(),
                            })
                            .map_err(|reason| anyhow!("sending player settings: {reason}"))?;
                    }
                    NetworkEvent::ConnectionAttemptFailed { reason, .. } => {
                        bail!("could not connect to {server_addr}: {reason}");
                    }
                    NetworkEvent::ConnectionLost { reason, .. } => {
                        log::info!("Disconnected: {}", reason);
                        return Ok(());
                    }
                    NetworkEvent::ArenaStarted {
                        arena_id,
                        frame_number,
                    } => {
                        log::info!("Playing arena {} from frame {}", arena_id, frame_number);
                    }
                    NetworkEvent::CollisionsReceived { collisions, .. } => {
                        log::debug!("{} hits", collisions.len());
                    }
                    other => log::trace!("{:?}", other),
                }
            }
            frames += 1;
        }

        if config.max_frames.is_some_and(|max| frames >= max) {
            client.disconnect("done");
            return Ok(());
        }
        if now.duration_since(last_status) >= config.status_interval {
            last_status = now;
            if let Some(ping) = client.ping() {
                log::info!(
                    "Frame {}: {} gobs, ping {:.1} ms, frame offset {}",
                    clock.frame_number(),
                    gobs.len(),
                    ping.ping_time().as_secs_f64() * 1000.0,
                    ping.remote_frame_number_offset()
                );
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Flies the local ship in wide circles, firing constantly.
fn pilot(gobs: &mut GobCollection, local_id: ConnectionId, clock: &FrameClock) {
    let Some(id) = gobs
        .iter()
        .find(|gob| gob.type_name() == SHIP && gob.owner() == Some(local_id))
        .map(|gob| gob.id())
    else {
        return;
    };
    let Some(ship) = gobs.get_as_mut::<Ship>(id) else {
        return;
    };

    let t = clock.total_game_time().as_secs_f32();
    ship.controls.thrust = 1.0;
    ship.controls.turn = (t * 0.5).sin();
    ship.controls.fire = true;
}
