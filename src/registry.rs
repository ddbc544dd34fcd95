//! Room membership registry.
//!
//! In-memory map of room id → member set + creation time. Rooms are created
//! lazily on first join and reclaimed by a periodic sweep once they have
//! been empty for longer than the retention window.
//!
//! The registry holds no ambient time source: every operation takes `now`
//! explicitly so tests can drive the clock. Callers are responsible for
//! serializing access (the relay wraps one instance in `Arc<Mutex<…>>`);
//! the sweep runs under the same lock as join/leave, so a concurrent
//! re-join cannot race a deletion — emptiness is checked at deletion time,
//! not at scan time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{validate_room_id, PeerId};

// ── Constants ───────────────────────────────────────────────

/// How long an empty room is retained before the sweep may delete it.
pub const ROOM_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Interval between sweep ticks.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum members per room. Only pairwise negotiation is supported; a
/// third join is rejected with `RegistryError::RoomFull`.
pub const ROOM_CAPACITY: usize = 2;

// ── Error types ─────────────────────────────────────────────

/// Membership errors. Both variants are user-visible via the relay's
/// `error` event; neither mutates registry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Room id does not match `^[A-Za-z0-9-]{4,32}$`.
    InvalidRoomId,
    /// Room already holds `ROOM_CAPACITY` members.
    RoomFull,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::InvalidRoomId => write!(f, "Invalid room ID"),
            RegistryError::RoomFull => write!(f, "Room is full"),
        }
    }
}

impl std::error::Error for RegistryError {}

// ── Room state ──────────────────────────────────────────────

struct Room {
    /// Members in join order. Join order matters only insofar as the
    /// joiner's returned peer list puts the negotiation counterpart first.
    members: Vec<PeerId>,
    created_at: Instant,
}

// ── Registry ────────────────────────────────────────────────

/// Owns all room state. One instance per relay process.
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    retention: Duration,
}

impl RoomRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            retention,
        }
    }

    /// Add `peer_id` to `room_id`, creating the room if absent.
    ///
    /// Returns the room's other current members; the caller treats the
    /// first entry, if any, as the peer to negotiate with. Rejects an
    /// invalid id or a full room without creating or mutating anything.
    pub fn join(
        &mut self,
        room_id: &str,
        peer_id: &str,
        now: Instant,
    ) -> Result<Vec<PeerId>, RegistryError> {
        if !validate_room_id(room_id) {
            return Err(RegistryError::InvalidRoomId);
        }

        if let Some(room) = self.rooms.get(room_id) {
            if !room.members.iter().any(|m| m == peer_id)
                && room.members.len() >= ROOM_CAPACITY
            {
                return Err(RegistryError::RoomFull);
            }
        }

        let room = self.rooms.entry(room_id.to_string()).or_insert_with(|| Room {
            members: Vec::new(),
            created_at: now,
        });

        let others: Vec<PeerId> = room
            .members
            .iter()
            .filter(|m| *m != peer_id)
            .cloned()
            .collect();

        if !room.members.iter().any(|m| m == peer_id) {
            room.members.push(peer_id.to_string());
        }

        Ok(others)
    }

    /// Remove `peer_id` from `room_id` if present. The room itself stays
    /// until the sweep reclaims it.
    pub fn leave(&mut self, room_id: &str, peer_id: &str) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.members.retain(|m| m != peer_id);
        }
    }

    /// Other members of `room_id`, excluding `peer_id`. Used by the relay
    /// to pick broadcast targets.
    pub fn members_except(&self, room_id: &str, peer_id: &str) -> Vec<PeerId> {
        match self.rooms.get(room_id) {
            Some(room) => room
                .members
                .iter()
                .filter(|m| *m != peer_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Delete rooms that are empty and older than the retention window.
    /// Returns the number of rooms removed. Emptiness is evaluated here,
    /// at deletion time, under the caller's lock.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let retention = self.retention;
        let before = self.rooms.len();
        self.rooms.retain(|room_id, room| {
            let expired = room.members.is_empty()
                && now.duration_since(room.created_at) > retention;
            if expired {
                eprintln!("[registry] swept empty room: {}", room_id);
            }
            !expired
        });
        before - self.rooms.len()
    }

    /// Number of live rooms (swept or not yet created rooms excluded).
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

// ── Tests ───────────────────────────────────────────────────
