use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use crate::connection::ConnectionId;

pub type GobId = u32;

bitflags! {
    /// Which parts of a gob's state a serialize or deserialize call covers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SerializationModeFlags: u8 {
        /// Set once at creation, owned by the server.
        const CONSTANT_DATA_FROM_SERVER = 1 << 0;
        /// Changes over time, owned by the server.
        const VARYING_DATA_FROM_SERVER = 1 << 1;
        const CONSTANT_DATA_FROM_CLIENT = 1 << 2;
        /// Changes over time, owned by the client controlling the gob.
        const VARYING_DATA_FROM_CLIENT = 1 << 3;

        const ALL_FROM_SERVER = Self::CONSTANT_DATA_FROM_SERVER.bits()
            | Self::VARYING_DATA_FROM_SERVER.bits();
    }
}

#[derive(Debug, Error)]
pub enum GobError {
    #[error("no constructor registered for gob type '{0}'")]
    UnknownType(String),

    #[error("gob {0} already exists")]
    DuplicateId(GobId),

    #[error("malformed {type_name} data: {reason}")]
    Malformed { type_name: String, reason: String },
}

/// Identity a gob is constructed with on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GobHeader {
    pub id: GobId,
    pub layer_index: u8,
    pub owner: Option<ConnectionId>,
}

/// A replicated game object, as seen by the network layer.
pub trait Gob: Any + Send {
    fn id(&self) -> GobId;

    /// Key into the [GobRegistry] on the receiving side.
    fn type_name(&self) -> &'static str;

    fn layer_index(&self) -> u8 {
        0
    }

    /// Connection whose client controls this gob, if any.
    fn owner(&self) -> Option<ConnectionId> {
        None
    }

    /// Whether remote peers need to know this gob exists. Purely local
    /// effects return false and are never replicated.
    fn is_relevant(&self) -> bool {
        true
    }

    /// Immutable gobs are only ever sent once, at creation.
    fn is_mutable(&self) -> bool {
        true
    }

    /// Minimum time between periodic updates to one destination. Zero
    /// disables periodic updates; forced updates still go out.
    fn network_update_period(&self) -> Duration;

    fn serialize(&self, mode: SerializationModeFlags, out: &mut Vec<u8>);

    /// `frames_ago` is how many local frames old the data is; gobs may
    /// extrapolate.
    fn deserialize(
        &mut self,
        mode: SerializationModeFlags,
        data: &[u8],
        frames_ago: i64,
    ) -> Result<(), GobError>;
}

pub type GobConstructor = fn(&GobHeader) -> Box<dyn Gob>;

/// Maps type names to constructors. Filled at startup with every gob type
/// the peer can receive.
#[derive(Default)]
pub struct GobRegistry {
    constructors: HashMap<String, GobConstructor>,
}

impl GobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: &str, constructor: GobConstructor) {
        if self
            .constructors
            .insert(type_name.to_string(), constructor)
            .is_some()
        {
            log::warn!("Gob type '{}' registered twice", type_name);
        }
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub fn create(&self, type_name: &str, header: &GobHeader) -> Result<Box<dyn Gob>, GobError> {
        self.constructors
            .get(type_name)
            .map(|constructor| constructor(header))
            .ok_or_else(|| GobError::UnknownType(type_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{COUNTER, Counter, registry};
    use super::*;

    #[test]
    fn registry_constructs_known_types() {
        let registry = registry();
        let header = GobHeader {
            id: 7,
            layer_index: 0,
            owner: Some(ConnectionId(3)),
        };

        let gob = registry.create(COUNTER, &header).unwrap();
        assert_eq!(gob.id(), 7);
        assert_eq!(gob.owner(), Some(ConnectionId(3)));

        assert!(matches!(
            registry.create("wall", &header),
            Err(GobError::UnknownType(name)) if name == "wall"
        ));
    }

    #[test]
    fn mode_flags_select_serialized_fields() {
        let mut counter = Counter::new(1);
        counter.constant = 11;
        counter.value = 22;

        let mut all = Vec::new();
        counter.serialize(SerializationModeFlags::ALL_FROM_SERVER, &mut all);
        assert_eq!(all.len(), 8);

        let mut varying = Vec::new();
        counter.serialize(SerializationModeFlags::VARYING_DATA_FROM_SERVER, &mut varying);
        assert_eq!(varying, 22u32.to_le_bytes());

        let mut copy = Counter::new(1);
        copy.deserialize(SerializationModeFlags::ALL_FROM_SERVER, &all, 2)
            .unwrap();
        assert_eq!((copy.constant, copy.value, copy.last_frames_ago), (11, 22, 2));

        assert!(
            copy.deserialize(SerializationModeFlags::ALL_FROM_SERVER, &all[..5], 0)
                .is_err()
        );
    }
}
