use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::connection::ConnectionId;
use crate::protocol::{
    CollisionEvent, GobCreation, GobCreationEntry, GobDeletion, GobUpdate, GobUpdateEntry, Message,
};
use crate::simulation::FrameClock;

use super::{Gob, GobCollection, GobId, SerializationModeFlags};

/// Connection slots are tracked in a `u64` bitmask per gob.
pub const MAX_REPLICATION_SLOTS: usize = 64;
pub const DEFAULT_CREATIONS_PER_FRAME: usize = 10;
pub const DEFAULT_MAX_UPDATE_BODY: usize = 16 * 1024;

/// Rough archive overhead per entry and per message, used to keep message
/// bodies under the configured cap.
const ENTRY_OVERHEAD: usize = 24;
const MESSAGE_OVERHEAD: usize = 64;
const COLLISION_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationRole {
    /// Creates, updates and deletes every relevant gob.
    Server,
    /// Only sends client-varying updates for the gobs `local_id` owns.
    Client { local_id: ConnectionId },
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub creations_per_frame: usize,
    /// Cap on the estimated body size of one creation or update message.
    pub max_message_body: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            creations_per_frame: DEFAULT_CREATIONS_PER_FRAME,
            max_message_body: DEFAULT_MAX_UPDATE_BODY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    last_update: Option<Duration>,
    forced: bool,
}

#[derive(Debug, Default)]
struct GobReplication {
    /// Bit per slot: creation has been sent.
    created_for: u64,
    slots: Vec<SlotState>,
}

impl GobReplication {
    fn is_created_for(&self, slot: usize) -> bool {
        self.created_for & (1 << slot) != 0
    }

    fn slot_mut(&mut self, slot: usize) -> &mut SlotState {
        if self.slots.len() <= slot {
            self.slots.resize(slot + 1, SlotState::default());
        }
        &mut self.slots[slot]
    }

    fn slot(&self, slot: usize) -> SlotState {
        self.slots.get(slot).copied().unwrap_or_default()
    }
}

/// Decides each frame which gobs go to which connection.
///
/// Per (gob, connection) pair, a creation always precedes updates and a
/// deletion is only sent when the creation was. Collision events queued
/// since the last pass ride on each destination's update message once.
pub struct ReplicationEngine {
    role: ReplicationRole,
    config: ReplicationConfig,
    slots: BTreeMap<ConnectionId, usize>,
    free_slots: u64,
    tracking: BTreeMap<GobId, GobReplication>,
    collisions: Vec<CollisionEvent>,
}

impl ReplicationEngine {
    pub fn new(role: ReplicationRole, config: ReplicationConfig) -> Self {
        Self {
            role,
            config,
            slots: BTreeMap::new(),
            free_slots: u64::MAX,
            tracking: BTreeMap::new(),
            collisions: Vec::new(),
        }
    }

    pub fn role(&self) -> ReplicationRole {
        self.role
    }

    /// Returns false when every slot is taken.
    pub fn add_connection(&mut self, id: ConnectionId) -> bool {
        if self.slots.contains_key(&id) {
            return true;
        }
        if self.free_slots == 0 {
            log::warn!("No replication slot left for connection {}", id);
            return false;
        }
        let slot = self.free_slots.trailing_zeros() as usize;
        self.free_slots &= !(1 << slot);
        self.slots.insert(id, slot);
        true
    }

    /// Forgets everything sent to the connection; its slot may be reused.
    pub fn remove_connection(&mut self, id: ConnectionId) {
        let Some(slot) = self.slots.remove(&id) else {
            return;
        };
        for replication in self.tracking.values_mut() {
            replication.created_for &= !(1 << slot);
            if let Some(state) = replication.slots.get_mut(slot) {
                *state = SlotState::default();
            }
        }
        self.free_slots |= 1 << slot;
    }

    pub fn has_connection(&self, id: ConnectionId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Sends the gob to every connection that knows it on the next pass,
    /// regardless of its update period.
    pub fn force_update(&mut self, gob: GobId) {
        let replication = self.tracking.entry(gob).or_default();
        for &slot in self.slots.values() {
            replication.slot_mut(slot).forced = true;
        }
    }

    pub fn queue_collision(&mut self, event: CollisionEvent) {
        self.collisions.push(event);
    }

    pub fn pending_collisions(&self) -> &[CollisionEvent] {
        &self.collisions
    }

    pub fn is_created_for(&self, gob: GobId, connection: ConnectionId) -> bool {
        match (self.tracking.get(&gob), self.slots.get(&connection)) {
            (Some(replication), Some(&slot)) => replication.is_created_for(slot),
            _ => false,
        }
    }

    /// Drops all per-gob state, e.g. when an arena ends. Connections keep
    /// their slots.
    pub fn reset(&mut self) {
        self.tracking.clear();
        self.collisions.clear();
    }

    /// One replication pass. `targets` are the connections that receive
    /// traffic this frame; on a client that is the server connection.
    pub fn replicate(
        &mut self,
        clock: &FrameClock,
        gobs: &mut GobCollection,
        targets: &[ConnectionId],
    ) -> Vec<(ConnectionId, Message)> {
        let removed = gobs.take_removed();
        let targets: Vec<(ConnectionId, usize)> = targets
            .iter()
            .filter_map(|id| self.slots.get(id).map(|&slot| (*id, slot)))
            .collect();

        let mut out = Vec::new();
        match self.role {
            ReplicationRole::Server => {
                self.deletions(clock, &removed, &targets, &mut out);
                let created = self.creations(clock, gobs, &targets, &mut out);
                self.updates(clock, gobs, &targets, &created, &mut out);
            }
            ReplicationRole::Client { local_id } => {
                for id in &removed {
                    self.tracking.remove(id);
                }
                self.client_updates(clock, gobs, local_id, &targets, &mut out);
            }
        }

        // Collisions go out with this pass or never, even with no targets.
        self.collisions.clear();
        out
    }

    fn deletions(
        &mut self,
        clock: &FrameClock,
        removed: &[GobId],
        targets: &[(ConnectionId, usize)],
        out: &mut Vec<(ConnectionId, Message)>,
    ) {
        if removed.is_empty() {
            return;
        }

        for &(id, slot) in targets {
            let gob_ids: Vec<GobId> = removed
                .iter()
                .copied()
                .filter(|gob| {
                    self.tracking
                        .get(gob)
                        .is_some_and(|replication| replication.is_created_for(slot))
                })
                .collect();
            if !gob_ids.is_empty() {
                out.push((
                    id,
                    Message::GobDeletion(GobDeletion {
                        frame_number: clock.frame_number(),
                        gob_ids,
                    }),
                ));
            }
        }

        for gob in removed {
            self.tracking.remove(gob);
        }
    }

    /// Returns the (gob, slot) pairs created this pass.
    fn creations(
        &mut self,
        clock: &FrameClock,
        gobs: &GobCollection,
        targets: &[(ConnectionId, usize)],
        out: &mut Vec<(ConnectionId, Message)>,
    ) -> HashSet<(GobId, usize)> {
        let mut created = HashSet::new();

        for &(id, slot) in targets {
            let mut entries = Vec::new();
            let mut body_size = MESSAGE_OVERHEAD;

            for gob in gobs.iter().filter(|gob| gob.is_relevant()) {
                if entries.len() >= self.config.creations_per_frame {
                    break;
                }
                let replication = self.tracking.entry(gob.id()).or_default();
                if replication.is_created_for(slot) {
                    continue;
                }

                let entry = creation_entry(gob);
                let size = ENTRY_OVERHEAD + entry.type_name.len() + entry.data.len();
                if !entries.is_empty() && body_size + size > self.config.max_message_body {
                    break;
                }
                body_size += size;

                replication.created_for |= 1 << slot;
                // The creation carries everything; the follow-up update is
                // sent on the next pass.
                *replication.slot_mut(slot) = SlotState {
                    last_update: Some(clock.total_game_time()),
                    forced: true,
                };
                created.insert((gob.id(), slot));
                entries.push(entry);
            }

            if !entries.is_empty() {
                log::trace!("Creating {} gobs for connection {}", entries.len(), id);
                out.push((
                    id,
                    Message::GobCreation(GobCreation {
                        frame_number: clock.frame_number(),
                        gobs: entries,
                    }),
                ));
            }
        }

        created
    }

    fn updates(
        &mut self,
        clock: &FrameClock,
        gobs: &GobCollection,
        targets: &[(ConnectionId, usize)],
        created: &HashSet<(GobId, usize)>,
        out: &mut Vec<(ConnectionId, Message)>,
    ) {
        let now = clock.total_game_time();

        for &(id, slot) in targets {
            let mut due: Vec<(&dyn Gob, SlotState)> = gobs
                .iter()
                .filter(|gob| gob.is_relevant() && !created.contains(&(gob.id(), slot)))
                .filter_map(|gob| {
                    let replication = self.tracking.get(&gob.id())?;
                    if !replication.is_created_for(slot) {
                        return None;
                    }
                    let state = replication.slot(slot);
                    is_due(gob, state, now).then_some((gob, state))
                })
                .collect();
            // Forced first, then the longest-waiting.
            due.sort_by_key(|(gob, state)| (!state.forced, state.last_update, gob.id()));

            let entries = self.fill_update(
                due.into_iter().map(|(gob, _)| gob),
                slot,
                now,
                SerializationModeFlags::VARYING_DATA_FROM_SERVER,
            );

            if !entries.is_empty() || !self.collisions.is_empty() {
                out.push((
                    id,
                    Message::GobUpdate(GobUpdate {
                        frame_number: clock.frame_number(),
                        gobs: entries,
                        collisions: self.collisions.clone(),
                    }),
                ));
            }
        }
    }

    fn client_updates(
        &mut self,
        clock: &FrameClock,
        gobs: &GobCollection,
        local_id: ConnectionId,
        targets: &[(ConnectionId, usize)],
        out: &mut Vec<(ConnectionId, Message)>,
    ) {
        let now = clock.total_game_time();

        for &(id, slot) in targets {
            let mut due: Vec<(&dyn Gob, SlotState)> = gobs
                .iter()
                .filter(|gob| gob.owner() == Some(local_id) && gob.is_relevant())
                .filter_map(|gob| {
                    let state = self
                        .tracking
                        .get(&gob.id())
                        .map(|replication| replication.slot(slot))
                        .unwrap_or_default();
                    is_due(gob, state, now).then_some((gob, state))
                })
                .collect();
            due.sort_by_key(|(gob, state)| (!state.forced, state.last_update, gob.id()));

            let entries = self.fill_update(
                due.into_iter().map(|(gob, _)| gob),
                slot,
                now,
                SerializationModeFlags::VARYING_DATA_FROM_CLIENT,
            );

            if !entries.is_empty() {
                out.push((
                    id,
                    Message::GobUpdate(GobUpdate {
                        frame_number: clock.frame_number(),
                        gobs: entries,
                        collisions: Vec::new(),
                    }),
                ));
            }
        }
    }

    /// Serializes due gobs until the body cap is reached; the rest stay due.
    fn fill_update<'a>(
        &mut self,
        due: impl Iterator<Item = &'a dyn Gob>,
        slot: usize,
        now: Duration,
        mode: SerializationModeFlags,
    ) -> Vec<GobUpdateEntry> {
        let mut entries = Vec::new();
        let mut body_size = MESSAGE_OVERHEAD + self.collisions.len() * COLLISION_SIZE;

        for gob in due {
            let mut data = Vec::new();
            gob.serialize(mode, &mut data);
            let size = ENTRY_OVERHEAD + data.len();
            if !entries.is_empty() && body_size + size > self.config.max_message_body {
                break;
            }
            body_size += size;

            *self.tracking.entry(gob.id()).or_default().slot_mut(slot) = SlotState {
                last_update: Some(now),
                forced: false,
            };
            entries.push(GobUpdateEntry {
                gob_id: gob.id(),
                data,
            });
        }
        entries
    }
}

fn creation_entry(gob: &dyn Gob) -> GobCreationEntry {
    let mut data = Vec::new();
    gob.serialize(SerializationModeFlags::ALL_FROM_SERVER, &mut data);
    GobCreationEntry {
        gob_id: gob.id(),
        type_name: gob.type_name().to_string(),
        layer_index: gob.layer_index(),
        owner: gob.owner().map(|owner| owner.0),
        data,
    }
}

fn is_due(gob: &dyn Gob, state: SlotState, now: Duration) -> bool {
    if state.forced {
        return true;
    }
    let period = gob.network_update_period();
    if !gob.is_mutable() || period.is_zero() {
        return false;
    }
    match state.last_update {
        Some(last) => now.saturating_sub(last) >= period,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Counter;
    use super::*;
    use std::collections::BTreeSet;

    const C1: ConnectionId = ConnectionId(1);
    const C2: ConnectionId = ConnectionId(2);

    fn server() -> ReplicationEngine {
        let mut engine =
            ReplicationEngine::new(ReplicationRole::Server, ReplicationConfig::default());
        engine.add_connection(C1);
        engine.add_connection(C2);
        engine
    }

    fn counters(ids: impl IntoIterator<Item = GobId>) -> GobCollection {
        let mut gobs = GobCollection::new();
        for id in ids {
            gobs.add(Box::new(Counter::new(id))).unwrap();
        }
        gobs
    }

    fn created_ids(out: &[(ConnectionId, Message)], to: ConnectionId) -> Vec<GobId> {
        out.iter()
            .filter(|(id, _)| *id == to)
            .filter_map(|(_, message)| match message {
                Message::GobCreation(creation) => Some(creation.gobs.iter().map(|g| g.gob_id)),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn updated_ids(out: &[(ConnectionId, Message)], to: ConnectionId) -> Vec<GobId> {
        out.iter()
            .filter(|(id, _)| *id == to)
            .filter_map(|(_, message)| match message {
                Message::GobUpdate(update) => Some(update.gobs.iter().map(|g| g.gob_id)),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn advance(clock: &mut FrameClock, frames: usize) {
        for _ in 0..frames {
            clock.advance();
        }
    }

    #[test]
    fn creation_cap_carries_over_without_duplicates() {
        let mut engine = server();
        let mut gobs = counters(1..=25);
        let mut clock = FrameClock::new(60);

        let mut seen = Vec::new();
        let mut per_frame = Vec::new();
        for _ in 0..4 {
            let out = engine.replicate(&clock, &mut gobs, &[C1]);
            let created = created_ids(&out, C1);
            per_frame.push(created.len());
            seen.extend(created);
            clock.advance();
        }

        assert_eq!(per_frame, vec![10, 10, 5, 0]);
        let unique: BTreeSet<GobId> = seen.iter().copied().collect();
        assert_eq!(unique.len(), 25);
        assert_eq!(seen.len(), 25);
    }

    #[test]
    fn scenario_create_then_update_after_period() {
        let mut engine = server();
        let mut gobs = GobCollection::new();
        let mut a = Counter::new(1);
        a.period = Duration::from_millis(100);
        let mut b = Counter::new(2);
        b.period = Duration::ZERO;
        gobs.add(Box::new(a)).unwrap();
        gobs.add(Box::new(b)).unwrap();
        let mut clock = FrameClock::new(50);

        let out = engine.replicate(&clock, &mut gobs, &[C1]);
        assert_eq!(created_ids(&out, C1), vec![1, 2]);
        assert!(updated_ids(&out, C1).is_empty());

        // Follow-up forced update for both.
        clock.advance();
        let out = engine.replicate(&clock, &mut gobs, &[C1]);
        assert_eq!(updated_ids(&out, C1), vec![1, 2]);

        // Period not yet elapsed; B never updates periodically.
        advance(&mut clock, 2);
        let out = engine.replicate(&clock, &mut gobs, &[C1]);
        assert!(updated_ids(&out, C1).is_empty());

        advance(&mut clock, 3);
        let out = engine.replicate(&clock, &mut gobs, &[C1]);
        assert_eq!(updated_ids(&out, C1), vec![1]);

        engine.force_update(2);
        clock.advance();
        let out = engine.replicate(&clock, &mut gobs, &[C1]);
        assert_eq!(updated_ids(&out, C1), vec![2]);
    }

    #[test]
    fn nothing_reaches_a_connection_before_its_creation() {
        let mut engine = ReplicationEngine::new(
            ReplicationRole::Server,
            ReplicationConfig {
                creations_per_frame: 3,
                ..ReplicationConfig::default()
            },
        );
        engine.add_connection(C1);
        let mut gobs = counters(1..=9);
        let mut clock = FrameClock::new(20);
        let mut created = BTreeSet::new();

        for frame in 0..8 {
            if frame == 1 {
                gobs.remove(8);
                gobs.remove(2);
            }
            let out = engine.replicate(&clock, &mut gobs, &[C1]);
            for (_, message) in &out {
                match message {
                    Message::GobCreation(creation) => {
                        created.extend(creation.gobs.iter().map(|g| g.gob_id))
                    }
                    Message::GobUpdate(update) => {
                        assert!(update.gobs.iter().all(|g| created.contains(&g.gob_id)))
                    }
                    Message::GobDeletion(deletion) => {
                        assert_eq!(deletion.gob_ids, vec![2]);
                        assert!(deletion.gob_ids.iter().all(|id| created.contains(id)));
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            clock.advance();
        }
        assert!(!created.contains(&8));
    }

    #[test]
    fn collisions_attach_once_per_destination() {
        let mut engine = server();
        let mut gobs = counters([1]);
        let mut clock = FrameClock::new(60);
        engine.replicate(&clock, &mut gobs, &[C1, C2]);
        clock.advance();
        engine.replicate(&clock, &mut gobs, &[C1, C2]);

        let event = CollisionEvent {
            gob1_id: 1,
            gob2_id: 1,
            area1_id: 0,
            area2_id: 2,
        };
        engine.queue_collision(event);
        clock.advance();
        let out = engine.replicate(&clock, &mut gobs, &[C1, C2]);

        // Only events, no due gobs: an update still goes to both.
        assert_eq!(out.len(), 2);
        for (_, message) in &out {
            let Message::GobUpdate(update) = message else {
                panic!("expected update");
            };
            assert!(update.gobs.is_empty());
            assert_eq!(update.collisions, vec![event]);
        }

        clock.advance();
        let out = engine.replicate(&clock, &mut gobs, &[C1, C2]);
        assert!(out.is_empty());
        assert!(engine.pending_collisions().is_empty());
    }

    #[test]
    fn collisions_without_targets_are_dropped() {
        let mut engine = server();
        let mut gobs = counters([1]);
        let mut clock = FrameClock::new(60);
        engine.replicate(&clock, &mut gobs, &[C1]);

        engine.queue_collision(CollisionEvent {
            gob1_id: 1,
            gob2_id: 1,
            area1_id: 0,
            area2_id: 0,
        });
        clock.advance();
        assert!(engine.replicate(&clock, &mut gobs, &[]).is_empty());
        assert!(engine.pending_collisions().is_empty());

        clock.advance();
        let out = engine.replicate(&clock, &mut gobs, &[C1]);
        assert!(out.iter().all(|(_, message)| match message {
            Message::GobUpdate(update) => update.collisions.is_empty(),
            _ => true,
        }));
    }

    #[test]
    fn update_body_cap_defers_remaining_gobs() {
        let mut engine = ReplicationEngine::new(
            ReplicationRole::Server,
            ReplicationConfig {
                creations_per_frame: 100,
                max_message_body: MESSAGE_OVERHEAD + 3 * (ENTRY_OVERHEAD + 4),
            },
        );
        engine.add_connection(C1);
        let mut gobs = counters(1..=5);
        let mut clock = FrameClock::new(60);

        // Creations are capped by the same body budget.
        let mut created = Vec::new();
        for _ in 0..4 {
            let out = engine.replicate(&clock, &mut gobs, &[C1]);
            created.extend(created_ids(&out, C1));
            clock.advance();
        }
        assert_eq!(created.len(), 5);

        for id in 1..=5 {
            engine.force_update(id);
        }
        let first = updated_ids(&engine.replicate(&clock, &mut gobs, &[C1]), C1);
        clock.advance();
        let second = updated_ids(&engine.replicate(&clock, &mut gobs, &[C1]), C1);
        assert_eq!(first.len(), 3);
        assert!(second.len() >= 2);
        let all: BTreeSet<GobId> = first.iter().chain(&second).copied().collect();
        assert_eq!(all, (1..=5).collect::<BTreeSet<GobId>>());
    }

    #[test]
    fn removed_connection_gets_fresh_creations() {
        let mut engine = server();
        let mut gobs = counters([1, 2]);
        let clock = FrameClock::new(60);

        engine.replicate(&clock, &mut gobs, &[C1]);
        assert!(engine.is_created_for(1, C1));

        engine.remove_connection(C1);
        assert!(!engine.is_created_for(1, C1));
        let out = engine.replicate(&clock, &mut gobs, &[C1]);
        assert!(out.is_empty());

        engine.add_connection(C1);
        let out = engine.replicate(&clock, &mut gobs, &[C1]);
        assert_eq!(created_ids(&out, C1), vec![1, 2]);
    }

    #[test]
    fn client_sends_only_owned_gobs() {
        let local = ConnectionId(7);
        let server_link = ConnectionId(7);
        let mut engine = ReplicationEngine::new(
            ReplicationRole::Client { local_id: local },
            ReplicationConfig::default(),
        );
        engine.add_connection(server_link);

        let mut gobs = GobCollection::new();
        let mut mine = Counter::new(1);
        mine.owner = Some(local);
        mine.value = 42;
        gobs.add(Box::new(mine)).unwrap();
        gobs.add(Box::new(Counter::new(2))).unwrap();

        let clock = FrameClock::new(60);
        let out = engine.replicate(&clock, &mut gobs, &[server_link]);
        assert_eq!(out.len(), 1);
        let Message::GobUpdate(update) = &out[0].1 else {
            panic!("expected update");
        };
        assert_eq!(update.gobs.len(), 1);
        assert_eq!(update.gobs[0].gob_id, 1);
        assert_eq!(update.gobs[0].data, 42u32.to_le_bytes());
        assert!(created_ids(&out, server_link).is_empty());
    }
}
