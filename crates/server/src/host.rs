use std::net::IpAddr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arena_net::{FixedTimestep, FrameClock, NetworkEvent, ServerNetwork};

use crate::arena::Arena;
use crate::config::{DriverConfig, TICK_RATE};

pub fn run(bind: IpAddr, arena_id: u32, config: DriverConfig) -> Result<()> {
    let mut server = ServerNetwork::bind(bind, config.network.clone())
        .with_context(|| format!("failed to listen on {}:{}", bind, config.network.port))?;
    log::info!("Hosting arena {} on {}", arena_id, server.local_addr());

    let mut clock = FrameClock::new(TICK_RATE);
    let mut timestep = FixedTimestep::new(TICK_RATE);
    let mut arena = Arena::new();
    server.start_arena(arena_id, &clock);

    let mut last_frame = Instant::now();
    let mut last_status = last_frame;
    let mut frames = 0u64;

    loop {
        let now = Instant::now();
        timestep.accumulate(now - last_frame);
        last_frame = now;

        while timestep.consume_frame() {
            clock.advance();
            for hit in arena.step(clock.frame_duration()) {
                server.force_update(hit.gob2_id);
                server.queue_collision(hit);
            }

            server.update(&clock, &mut arena.gobs);
            let events: Vec<NetworkEvent> = server.drain_events().collect();
            for event in events {
                handle_event(&mut arena, event);
            }
            frames += 1;
        }

        if config.max_frames.is_some_and(|max| frames >= max) {
            break;
        }
        if now.duration_since(last_status) >= config.status_interval {
            last_status = now;
            log_status(&server, &arena, &clock);
        }
        thread::sleep(Duration::from_millis(1));
    }

    log::info!("Shutting down after {} frames", frames);
    server.finish_arena();
    arena.clear();
    server.shutdown();
    Ok(())
}

fn handle_event(arena: &mut Arena, event: NetworkEvent) {
    match event {
        NetworkEvent::ConnectionEstablished { connection, addr } => {
            log::info!("Connection {} from {}", connection, addr);
        }
        NetworkEvent::ConnectionAttemptFailed { addr, reason } => {
            log::warn!("Connection attempt from {} failed: {}", addr, reason);
        }
        NetworkEvent::PlayerSettingsReceived {
            connection,
            settings,
        } => {
            log::info!("Player '{}' on connection {}", settings.name, connection);
        }
        NetworkEvent::ClientReady { connection, .. } => {
            arena.spawn_ship(connection);
        }
        NetworkEvent::ConnectionLost { connection, reason } => {
            log::info!("Connection {} lost: {}", connection, reason);
            arena.remove_ship(connection);
        }
        other => log::debug!("{:?}", other),
    }
}

fn log_status(server: &ServerNetwork, arena: &Arena, clock: &FrameClock) {
    log::info!(
        "Frame {}: {} connections, {} ships, {} gobs",
        clock.frame_number(),
        server.connections().len(),
        arena.ship_count(),
        arena.gobs.len()
    );
    for info in server.connection_info() {
        log::info!(
            "  {} {} ping {:.1} ms, frame offset {}, sent {} B, received {} B",
            info.id,
            info.remote_addr,
            info.ping.as_secs_f64() * 1000.0,
            info.frame_offset,
            info.stats.bytes_sent,
            info.stats.bytes_received
        );
    }
    let shared = server.datagram_stats();
    log::debug!(
        "Datagrams: {} sent, {} received, {} discarded, {} dropped",
        shared.messages_sent,
        shared.messages_received,
        shared.datagrams_discarded,
        shared.datagrams_dropped
    );
}
