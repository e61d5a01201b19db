use std::time::Duration;

use arena_net::{ConnectionId, Gob, GobError, GobHeader, GobId, GobRegistry, SerializationModeFlags};
use glam::Vec2;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::config::TICK_RATE;

pub const SHIP: &str = "ship";
pub const BULLET: &str = "bullet";

pub const SHIP_RADIUS: f32 = 1.0;
const SHIP_THRUST: f32 = 12.0;
const SHIP_TURN_RATE: f32 = 3.0;
const SHIP_DRAG: f32 = 0.5;
pub const BULLET_SPEED: f32 = 30.0;
pub const BULLET_LIFETIME: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Archive, Serialize, Deserialize)]
pub struct ShipControls {
    pub thrust: f32,
    pub turn: f32,
    pub fire: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
struct ShipState {
    position: [f32; 2],
    velocity: [f32; 2],
    rotation: f32,
    health: f32,
}

/// Wire form of a ship. Which parts are present depends on the mode.
#[derive(Debug, Archive, Serialize, Deserialize)]
struct ShipData {
    color: Option<u32>,
    state: Option<ShipState>,
    controls: Option<ShipControls>,
}

#[derive(Debug, Archive, Serialize, Deserialize)]
struct BulletData {
    shooter: GobId,
    origin: [f32; 2],
    velocity: [f32; 2],
}

fn append(bytes: Result<AlignedVec, rancor::Error>, out: &mut Vec<u8>) {
    match bytes {
        Ok(bytes) => out.extend_from_slice(&bytes),
        Err(e) => log::error!("Failed to serialize gob data: {}", e),
    }
}

fn aligned(data: &[u8]) -> AlignedVec {
    let mut aligned: AlignedVec = AlignedVec::with_capacity(data.len());
    aligned.extend_from_slice(data);
    aligned
}

fn malformed(type_name: &str, error: rancor::Error) -> GobError {
    GobError::Malformed {
        type_name: type_name.into(),
        reason: error.to_string(),
    }
}

/// A player ship. The server owns its motion; the controlling client owns
/// its controls.
#[derive(Debug, Clone)]
pub struct Ship {
    pub id: GobId,
    pub owner: Option<ConnectionId>,
    pub color: u32,
    pub position: Vec2,
    pub velocity: Vec2,
    pub rotation: f32,
    pub health: f32,
    pub controls: ShipControls,
    pub fire_cooldown: Duration,
}

impl Ship {
    pub fn new(id: GobId, owner: Option<ConnectionId>, color: u32, position: Vec2) -> Self {
        Self {
            id,
            owner,
            color,
            position,
            velocity: Vec2::ZERO,
            rotation: 0.0,
            health: 100.0,
            controls: ShipControls::default(),
            fire_cooldown: Duration::ZERO,
        }
    }

    fn construct(header: &GobHeader) -> Box<dyn Gob> {
        Box::new(Ship::new(header.id, header.owner, 0, Vec2::ZERO))
    }

    pub fn heading(&self) -> Vec2 {
        Vec2::from_angle(self.rotation)
    }

    pub fn step(&mut self, dt: f32) {
        self.rotation += self.controls.turn.clamp(-1.0, 1.0) * SHIP_TURN_RATE * dt;
        let thrust = self.heading() * self.controls.thrust.clamp(0.0, 1.0) * SHIP_THRUST;
        self.velocity += (thrust - self.velocity * SHIP_DRAG) * dt;
        self.position += self.velocity * dt;
    }
}

impl Gob for Ship {
    fn id(&self) -> GobId {
        self.id
    }

    fn type_name(&self) -> &'static str {
        SHIP
    }

    fn layer_index(&self) -> u8 {
        1
    }

    fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    fn network_update_period(&self) -> Duration {
        Duration::from_millis(50)
    }

    fn serialize(&self, mode: SerializationModeFlags, out: &mut Vec<u8>) {
        let data = ShipData {
            color: mode
                .contains(SerializationModeFlags::CONSTANT_DATA_FROM_SERVER)
                .then_some(self.color),
            state: mode
                .contains(SerializationModeFlags::VARYING_DATA_FROM_SERVER)
                .then_some(ShipState {
                    position: self.position.to_array(),
                    velocity: self.velocity.to_array(),
                    rotation: self.rotation,
                    health: self.health,
                }),
            controls: mode
                .contains(SerializationModeFlags::VARYING_DATA_FROM_CLIENT)
                .then_some(self.controls),
        };
        append(rkyv::to_bytes::<rancor::Error>(&data), out);
    }

    fn deserialize(
        &mut self,
        mode: SerializationModeFlags,
        data: &[u8],
        frames_ago: i64,
    ) -> Result<(), GobError> {
        let data = rkyv::from_bytes::<ShipData, rancor::Error>(&aligned(data))
            .map_err(|e| malformed(SHIP, e))?;

        if let Some(color) = data.color.filter(|_| {
            mode.contains(SerializationModeFlags::CONSTANT_DATA_FROM_SERVER)
        }) {
            self.color = color;
        }
        if let Some(state) = data.state.filter(|_| {
            mode.contains(SerializationModeFlags::VARYING_DATA_FROM_SERVER)
        }) {
            self.velocity = Vec2::from_array(state.velocity);
            self.rotation = state.rotation;
            self.health = state.health;
            // The state is `frames_ago` frames old; move it forward.
            let elapsed = frames_ago as f32 / TICK_RATE as f32;
            self.position = Vec2::from_array(state.position) + self.velocity * elapsed;
        }
        if let Some(controls) = data.controls.filter(|_| {
            mode.contains(SerializationModeFlags::VARYING_DATA_FROM_CLIENT)
        }) {
            self.controls = controls;
        }
        Ok(())
    }
}

/// A projectile. Its whole trajectory is known at creation, so it is never
/// updated.
#[derive(Debug, Clone)]
pub struct Bullet {
    pub id: GobId,
    pub shooter: GobId,
    pub position: Vec2,
    pub velocity: Vec2,
    pub age: Duration,
}

impl Bullet {
    pub fn new(id: GobId, shooter: GobId, origin: Vec2, velocity: Vec2) -> Self {
        Self {
            id,
            shooter,
            position: origin,
            velocity,
            age: Duration::ZERO,
        }
    }

    fn construct(header: &GobHeader) -> Box<dyn Gob> {
        Box::new(Bullet::new(header.id, 0, Vec2::ZERO, Vec2::ZERO))
    }

    pub fn step(&mut self, dt: Duration) {
        self.position += self.velocity * dt.as_secs_f32();
        self.age += dt;
    }

    pub fn is_expired(&self) -> bool {
        self.age >= BULLET_LIFETIME
    }
}

impl Gob for Bullet {
    fn id(&self) -> GobId {
        self.id
    }

    fn type_name(&self) -> &'static str {
        BULLET
    }

    fn layer_index(&self) -> u8 {
        2
    }

    fn is_mutable(&self) -> bool {
        false
    }

    fn network_update_period(&self) -> Duration {
        Duration::ZERO
    }

    fn serialize(&self, mode: SerializationModeFlags, out: &mut Vec<u8>) {
        if !mode.contains(SerializationModeFlags::CONSTANT_DATA_FROM_SERVER) {
            return;
        }
        let data = BulletData {
            shooter: self.shooter,
            origin: self.position.to_array(),
            velocity: self.velocity.to_array(),
        };
        append(rkyv::to_bytes::<rancor::Error>(&data), out);
    }

    fn deserialize(
        &mut self,
        mode: SerializationModeFlags,
        data: &[u8],
        frames_ago: i64,
    ) -> Result<(), GobError> {
        if !mode.contains(SerializationModeFlags::CONSTANT_DATA_FROM_SERVER) {
            return Ok(());
        }
        let data = rkyv::from_bytes::<BulletData, rancor::Error>(&aligned(data))
            .map_err(|e| malformed(BULLET, e))?;

        self.shooter = data.shooter;
        self.velocity = Vec2::from_array(data.velocity);
        let elapsed = Duration::from_secs_f32(
            frames_ago.max(0) as f32 / TICK_RATE as f32,
        );
        self.position = Vec2::from_array(data.origin);
        self.step(elapsed);
        Ok(())
    }
}

pub fn registry() -> GobRegistry {
    let mut registry = GobRegistry::new();
    registry.register(SHIP, Ship::construct);
    registry.register(BULLET, Bullet::construct);
    registry
}
