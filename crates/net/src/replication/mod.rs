//! Gob replication: which gobs go to which connection, and applying what
//! arrives.

mod collection;
mod engine;
mod gob;

pub use collection::GobCollection;
pub use engine::{
    DEFAULT_CREATIONS_PER_FRAME, DEFAULT_MAX_UPDATE_BODY, MAX_REPLICATION_SLOTS,
    ReplicationConfig, ReplicationEngine, ReplicationRole,
};
pub use gob::{
    Gob, GobConstructor, GobError, GobHeader, GobId, GobRegistry, SerializationModeFlags,
};

#[cfg(test)]
pub(crate) use gob::testing;
