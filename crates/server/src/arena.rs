use std::collections::BTreeMap;
use std::time::Duration;

use arena_net::{CollisionEvent, ConnectionId, GobCollection, GobId};
use glam::Vec2;

use crate::gobs::{BULLET, BULLET_SPEED, Bullet, SHIP, SHIP_RADIUS, Ship};

const FIRE_COOLDOWN: Duration = Duration::from_millis(300);
const BULLET_DAMAGE: f32 = 10.0;
const SPAWN_RADIUS: f32 = 20.0;
const PALETTE: [u32; 6] = [0xe6194b, 0x3cb44b, 0xffe119, 0x4363d8, 0xf58231, 0x911eb4];

/// Authoritative demo world on the host: one ship per playing client and
/// the bullets they fire.
#[derive(Default)]
pub struct Arena {
    pub gobs: GobCollection,
    ships: BTreeMap<ConnectionId, GobId>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ship_count(&self) -> usize {
        self.ships.len()
    }

    pub fn spawn_ship(&mut self, owner: ConnectionId) -> GobId {
        if let Some(&id) = self.ships.get(&owner) {
            return id;
        }

        let id = self.gobs.allocate_id();
        let slot = self.ships.len();
        let angle = slot as f32 * std::f32::consts::TAU / PALETTE.len() as f32;
        let ship = Ship::new(
            id,
            Some(owner),
            PALETTE[slot % PALETTE.len()],
            Vec2::from_angle(angle) * SPAWN_RADIUS,
        );

        if let Err(e) = self.gobs.add(Box::new(ship)) {
            log::error!("Cannot spawn ship for {}: {}", owner, e);
        }
        self.ships.insert(owner, id);
        log::info!("Spawned ship {} for connection {}", id, owner);
        id
    }

    pub fn remove_ship(&mut self, owner: ConnectionId) {
        if let Some(id) = self.ships.remove(&owner) {
            self.gobs.remove(id);
        }
    }

    /// Drops every gob, e.g. when the arena ends.
    pub fn clear(&mut self) {
        self.gobs.clear();
        self.ships.clear();
    }

    /// Advances the world one frame. Returns the hits, as collision events
    /// between bullet and ship.
    pub fn step(&mut self, dt: Duration) -> Vec<CollisionEvent> {
        let ids: Vec<(GobId, &'static str)> =
            self.gobs.iter().map(|gob| (gob.id(), gob.type_name())).collect();

        let mut shots = Vec::new();
        let mut ships = Vec::new();
        let mut expired = Vec::new();

        for (id, type_name) in &ids {
            match *type_name {
                SHIP => {
                    let Some(ship) = self.gobs.get_as_mut::<Ship>(*id) else {
                        continue;
                    };
                    ship.step(dt.as_secs_f32());
                    ship.fire_cooldown = ship.fire_cooldown.saturating_sub(dt);
                    if ship.controls.fire && ship.fire_cooldown.is_zero() {
                        ship.fire_cooldown = FIRE_COOLDOWN;
                        let heading = ship.heading();
                        shots.push((
                            ship.id,
                            ship.position + heading * (SHIP_RADIUS + 0.1),
                            ship.velocity + heading * BULLET_SPEED,
                        ));
                    }
                    ships.push((ship.id, ship.position));
                }
                BULLET => {
                    let Some(bullet) = self.gobs.get_as_mut::<Bullet>(*id) else {
                        continue;
                    };
                    bullet.step(dt);
                    if bullet.is_expired() {
                        expired.push(bullet.id);
                    }
                }
                _ => {}
            }
        }

        for id in expired {
            self.gobs.remove(id);
        }
        for (shooter, origin, velocity) in shots {
            let id = self.gobs.allocate_id();
            if let Err(e) = self.gobs.add(Box::new(Bullet::new(id, shooter, origin, velocity))) {
                log::error!("Cannot spawn bullet: {}", e);
            }
        }

        self.resolve_hits(&ships)
    }

    fn resolve_hits(&mut self, ships: &[(GobId, Vec2)]) -> Vec<CollisionEvent> {
        let mut hits = Vec::new();
        for gob in self.gobs.iter().filter(|gob| gob.type_name() == BULLET) {
            let Some(bullet) = self.gobs.get_as::<Bullet>(gob.id()) else {
                continue;
            };
            let target = ships.iter().find(|(ship, position)| {
                *ship != bullet.shooter && position.distance(bullet.position) < SHIP_RADIUS
            });
            if let Some(&(ship, _)) = target {
                hits.push(CollisionEvent {
                    gob1_id: bullet.id,
                    gob2_id: ship,
                    area1_id: 0,
                    area2_id: 0,
                });
            }
        }

        for hit in &hits {
            self.gobs.remove(hit.gob1_id);
            if let Some(ship) = self.gobs.get_as_mut::<Ship>(hit.gob2_id) {
                ship.health = (ship.health - BULLET_DAMAGE).max(0.0);
            }
        }
        hits
    }
}

/// Client-side extrapolation between server updates.
pub fn extrapolate(gobs: &mut GobCollection, dt: Duration) {
    let ids: Vec<GobId> = gobs.iter().map(|gob| gob.id()).collect();
    for id in ids {
        if let Some(ship) = gobs.get_as_mut::<Ship>(id) {
            ship.step(dt.as_secs_f32());
        } else if let Some(bullet) = gobs.get_as_mut::<Bullet>(id) {
            bullet.step(dt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ships_are_spawned_once_per_owner() {
        let mut arena = Arena::new();
        let a = arena.spawn_ship(ConnectionId(1));
        assert_eq!(arena.spawn_ship(ConnectionId(1)), a);
        let b = arena.spawn_ship(ConnectionId(2));
        assert_ne!(a, b);
        assert_eq!(arena.ship_count(), 2);

        arena.remove_ship(ConnectionId(1));
        assert_eq!(arena.ship_count(), 1);
        assert!(!arena.gobs.contains(a));
        assert_eq!(arena.gobs.take_removed(), vec![a]);
    }

    #[test]
    fn firing_spawns_bullets_that_expire() {
        let mut arena = Arena::new();
        let ship = arena.spawn_ship(ConnectionId(1));
        arena.gobs.get_as_mut::<Ship>(ship).unwrap().controls.fire = true;

        let dt = Duration::from_millis(100);
        arena.step(dt);
        assert_eq!(arena.gobs.len(), 2);

        arena.gobs.get_as_mut::<Ship>(ship).unwrap().controls.fire = false;
        for _ in 0..25 {
            arena.step(dt);
        }
        assert_eq!(arena.gobs.len(), 1);
    }

    #[test]
    fn bullets_hit_other_ships() {
        let mut arena = Arena::new();
        let shooter = arena.spawn_ship(ConnectionId(1));
        let target = arena.spawn_ship(ConnectionId(2));
        arena.gobs.get_as_mut::<Ship>(target).unwrap().position = Vec2::new(100.0, 0.0);

        let bullet = arena.gobs.allocate_id();
        arena
            .gobs
            .add(Box::new(Bullet::new(
                bullet,
                shooter,
                Vec2::new(99.5, 0.0),
                Vec2::ZERO,
            )))
            .unwrap();

        let hits = arena.step(Duration::from_millis(16));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].gob1_id, bullet);
        assert_eq!(hits[0].gob2_id, target);
        assert!(!arena.gobs.contains(bullet));
        assert_eq!(arena.gobs.get_as::<Ship>(target).unwrap().health, 90.0);
    }
}
