use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique connection identifier. Ids are never reused; a peer that
/// reconnects gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    Closing,
    Closed,
}

/// Where a remote game client stands in the current arena session.
///
/// Within one arena the flags only move forward; entering a different arena
/// or leaving resets them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub has_player_settings: bool,
    pub current_arena: Option<u32>,
    pub is_playing: bool,
}

impl ConnectionStatus {
    pub fn set_player_settings_received(&mut self) {
        self.has_player_settings = true;
    }

    pub fn enter_arena(&mut self, arena_id: u32) {
        if self.current_arena != Some(arena_id) {
            self.current_arena = Some(arena_id);
            self.is_playing = false;
        }
    }

    /// Only counts for the arena the connection is currently in.
    pub fn mark_playing(&mut self, arena_id: u32) -> bool {
        if self.current_arena == Some(arena_id) {
            self.is_playing = true;
        }
        self.is_playing
    }

    pub fn leave_arena(&mut self) {
        self.current_arena = None;
        self.is_playing = false;
    }

    /// Receives replication traffic for `arena_id`.
    pub fn is_game_client(&self, arena_id: u32) -> bool {
        self.has_player_settings && self.is_playing && self.current_arena == Some(arena_id)
    }
}
