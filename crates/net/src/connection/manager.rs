use std::collections::BTreeMap;

use super::{Connection, ConnectionId};

/// Established connections, keyed by id.
pub struct ConnectionManager {
    connections: BTreeMap<ConnectionId, Connection>,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: BTreeMap::new(),
            max_connections,
        }
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Hands the connection back when the registry is full.
    pub fn insert(&mut self, connection: Connection) -> Result<ConnectionId, Connection> {
        if self.is_full() {
            return Err(connection);
        }
        let id = connection.id();
        self.connections.insert(id, connection);
        Ok(id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Disposes the connection's transports, then drops it from the
    /// registry.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        match self.connections.get_mut(&id) {
            Some(connection) => {
                connection.dispose();
                self.connections.remove(&id);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        for connection in self.connections.values_mut() {
            connection.dispose();
        }
        self.connections.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Connections that receive replication for `arena_id`.
    pub fn game_client_ids(&self, arena_id: u32) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.status().is_game_client(arena_id))
            .map(Connection::id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
