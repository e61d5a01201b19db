use std::any::Any;
use std::collections::BTreeMap;

use crate::connection::ConnectionId;
use crate::protocol::{GobCreation, GobDeletion, GobUpdate};

use super::{Gob, GobError, GobHeader, GobId, GobRegistry, SerializationModeFlags};

/// The simulation's gobs, in id order, plus the relevant gobs removed since
/// the last replication pass.
pub struct GobCollection {
    gobs: BTreeMap<GobId, Box<dyn Gob>>,
    removed: Vec<GobId>,
    next_id: GobId,
}

impl Default for GobCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl GobCollection {
    pub fn new() -> Self {
        Self {
            gobs: BTreeMap::new(),
            removed: Vec::new(),
            next_id: 1,
        }
    }

    pub fn allocate_id(&mut self) -> GobId {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        id
    }

    pub fn add(&mut self, gob: Box<dyn Gob>) -> Result<GobId, GobError> {
        let id = gob.id();
        if self.gobs.contains_key(&id) {
            return Err(GobError::DuplicateId(id));
        }
        if id >= self.next_id {
            self.next_id = id.saturating_add(1);
        }
        self.gobs.insert(id, gob);
        Ok(id)
    }

    /// Removes a gob. Relevant gobs are queued for deletion messages.
    pub fn remove(&mut self, id: GobId) -> Option<Box<dyn Gob>> {
        let gob = self.gobs.remove(&id)?;
        if gob.is_relevant() {
            self.removed.push(id);
        }
        Some(gob)
    }

    pub fn take_removed(&mut self) -> Vec<GobId> {
        std::mem::take(&mut self.removed)
    }

    pub fn get(&self, id: GobId) -> Option<&dyn Gob> {
        self.gobs.get(&id).map(|gob| gob.as_ref())
    }

    pub fn get_mut(&mut self, id: GobId) -> Option<&mut Box<dyn Gob>> {
        self.gobs.get_mut(&id)
    }

    /// Typed access for the simulation that owns the concrete gob types.
    pub fn get_as<T: Gob>(&self, id: GobId) -> Option<&T> {
        let gob: &dyn Any = self.gobs.get(&id)?.as_ref();
        gob.downcast_ref()
    }

    pub fn get_as_mut<T: Gob>(&mut self, id: GobId) -> Option<&mut T> {
        let gob: &mut dyn Any = self.gobs.get_mut(&id)?.as_mut();
        gob.downcast_mut()
    }

    pub fn contains(&self, id: GobId) -> bool {
        self.gobs.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Gob> {
        self.gobs.values().map(|gob| gob.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Gob>> {
        self.gobs.values_mut()
    }

    pub fn len(&self) -> usize {
        self.gobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gobs.is_empty()
    }

    /// Drops everything without queueing deletions, e.g. between arenas.
    pub fn clear(&mut self) {
        self.gobs.clear();
        self.removed.clear();
    }

    /// Constructs the gobs of a creation message. Ids that already exist
    /// and entries that fail to construct are skipped.
    pub fn apply_creation(
        &mut self,
        creation: &GobCreation,
        registry: &GobRegistry,
        frames_ago: i64,
    ) -> Vec<GobId> {
        let mut created = Vec::new();
        for entry in &creation.gobs {
            if self.gobs.contains_key(&entry.gob_id) {
                log::debug!("Ignoring repeated creation of gob {}", entry.gob_id);
                continue;
            }

            let header = GobHeader {
                id: entry.gob_id,
                layer_index: entry.layer_index,
                owner: entry.owner.map(ConnectionId),
            };
            let mut gob = match registry.create(&entry.type_name, &header) {
                Ok(gob) => gob,
                Err(e) => {
                    log::warn!("Cannot create gob {}: {}", entry.gob_id, e);
                    continue;
                }
            };
            if let Err(e) = gob.deserialize(
                SerializationModeFlags::ALL_FROM_SERVER,
                &entry.data,
                frames_ago,
            ) {
                log::warn!("Dropping gob {}: {}", entry.gob_id, e);
                continue;
            }

            if entry.gob_id >= self.next_id {
                self.next_id = entry.gob_id.saturating_add(1);
            }
            self.gobs.insert(entry.gob_id, gob);
            created.push(entry.gob_id);
        }
        created
    }

    /// Applies an update message. With `sender` set, only gobs owned by
    /// that connection accept the data. Unknown ids are ignored.
    pub fn apply_update(
        &mut self,
        update: &GobUpdate,
        mode: SerializationModeFlags,
        frames_ago: i64,
        sender: Option<ConnectionId>,
    ) -> Vec<GobId> {
        let mut updated = Vec::new();
        for entry in &update.gobs {
            let Some(gob) = self.gobs.get_mut(&entry.gob_id) else {
                log::trace!("Ignoring update for unknown gob {}", entry.gob_id);
                continue;
            };
            if let Some(sender) = sender {
                if gob.owner() != Some(sender) {
                    log::warn!(
                        "Connection {} sent update for gob {} it doesn't own",
                        sender,
                        entry.gob_id
                    );
                    continue;
                }
            }
            match gob.deserialize(mode, &entry.data, frames_ago) {
                Ok(()) => updated.push(entry.gob_id),
                Err(e) => log::warn!("Bad update for gob {}: {}", entry.gob_id, e),
            }
        }
        updated
    }

    /// Removes the listed gobs without queueing deletions of our own.
    pub fn apply_deletion(&mut self, deletion: &GobDeletion) -> Vec<GobId> {
        deletion
            .gob_ids
            .iter()
            .filter(|id| {
                let removed = self.gobs.remove(*id).is_some();
                if !removed {
                    log::debug!("Ignoring deletion of unknown gob {}", id);
                }
                removed
            })
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{COUNTER, Counter, registry};
    use super::*;
    use crate::protocol::{GobCreationEntry, GobUpdateEntry};

    fn counter_entry(id: GobId, constant: u32, value: u32, owner: Option<u32>) -> GobCreationEntry {
        let mut data = constant.to_le_bytes().to_vec();
        data.extend_from_slice(&value.to_le_bytes());
        GobCreationEntry {
            gob_id: id,
            type_name: COUNTER.into(),
            layer_index: 0,
            owner,
            data,
        }
    }

    fn value_of(gobs: &GobCollection, id: GobId) -> u32 {
        let mut out = Vec::new();
        gobs.get(id)
            .unwrap()
            .serialize(SerializationModeFlags::VARYING_DATA_FROM_SERVER, &mut out);
        u32::from_le_bytes(out.try_into().unwrap())
    }

    #[test]
    fn removal_queues_only_relevant_gobs() {
        let mut gobs = GobCollection::new();
        let mut effect = Counter::new(2);
        effect.relevant = false;
        gobs.add(Box::new(Counter::new(1))).unwrap();
        gobs.add(Box::new(effect)).unwrap();

        assert!(matches!(
            gobs.add(Box::new(Counter::new(1))),
            Err(GobError::DuplicateId(1))
        ));

        gobs.remove(1);
        gobs.remove(2);
        assert!(gobs.remove(3).is_none());
        assert_eq!(gobs.take_removed(), vec![1]);
        assert!(gobs.take_removed().is_empty());
        assert_eq!(gobs.allocate_id(), 3);
    }

    #[test]
    fn typed_access_downcasts() {
        let mut gobs = GobCollection::new();
        gobs.add(Box::new(Counter::new(1))).unwrap();

        gobs.get_as_mut::<Counter>(1).unwrap().value = 9;
        assert_eq!(gobs.get_as::<Counter>(1).unwrap().value, 9);
        assert!(gobs.get_as::<Counter>(2).is_none());
    }

    #[test]
    fn creation_skips_unknown_types_and_duplicates() {
        let registry = registry();
        let mut gobs = GobCollection::new();
        let mut wall = counter_entry(9, 0, 0, None);
        wall.type_name = "wall".into();

        let creation = GobCreation {
            frame_number: 10,
            gobs: vec![counter_entry(4, 1, 2, Some(8)), wall],
        };
        assert_eq!(gobs.apply_creation(&creation, &registry, 0), vec![4]);
        assert_eq!(gobs.apply_creation(&creation, &registry, 0), Vec::<GobId>::new());

        let gob = gobs.get(4).unwrap();
        assert_eq!(gob.owner(), Some(ConnectionId(8)));
        assert_eq!(value_of(&gobs, 4), 2);
    }

    #[test]
    fn highest_gob_id_does_not_overflow_allocation() {
        let registry = registry();
        let mut gobs = GobCollection::new();
        let creation = GobCreation {
            frame_number: 0,
            gobs: vec![counter_entry(GobId::MAX, 1, 2, None)],
        };

        assert_eq!(gobs.apply_creation(&creation, &registry, 0), vec![GobId::MAX]);
        assert_eq!(value_of(&gobs, GobId::MAX), 2);

        // The id space is exhausted; allocation stays pinned at the top.
        let id = gobs.allocate_id();
        assert_eq!(id, GobId::MAX);
        assert!(matches!(
            gobs.add(Box::new(Counter::new(id))),
            Err(GobError::DuplicateId(GobId::MAX))
        ));
    }

    #[test]
    fn update_ignores_unknown_ids_and_foreign_owners() {
        let registry = registry();
        let mut gobs = GobCollection::new();
        gobs.apply_creation(
            &GobCreation {
                frame_number: 0,
                gobs: vec![counter_entry(1, 0, 0, Some(5)), counter_entry(2, 0, 0, None)],
            },
            &registry,
            0,
        );

        let update = GobUpdate {
            frame_number: 1,
            gobs: [1, 2, 99]
                .into_iter()
                .map(|id| GobUpdateEntry {
                    gob_id: id,
                    data: 7u32.to_le_bytes().to_vec(),
                })
                .collect(),
            collisions: vec![],
        };

        let from_owner = gobs.apply_update(
            &update,
            SerializationModeFlags::VARYING_DATA_FROM_CLIENT,
            0,
            Some(ConnectionId(5)),
        );
        assert_eq!(from_owner, vec![1]);
        assert_eq!(value_of(&gobs, 2), 0);

        let from_server =
            gobs.apply_update(&update, SerializationModeFlags::VARYING_DATA_FROM_SERVER, 3, None);
        assert_eq!(from_server, vec![1, 2]);
        assert_eq!(value_of(&gobs, 2), 7);
    }

    #[test]
    fn deletion_of_unknown_gob_is_ignored() {
        let mut gobs = GobCollection::new();
        gobs.add(Box::new(Counter::new(1))).unwrap();

        let deleted = gobs.apply_deletion(&GobDeletion {
            frame_number: 0,
            gob_ids: vec![1, 42],
        });
        assert_eq!(deleted, vec![1]);
        assert!(gobs.is_empty());
        assert!(gobs.take_removed().is_empty());
    }
}
