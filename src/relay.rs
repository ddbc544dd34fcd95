//! Per-connection signaling router on top of `RoomRegistry`.
//!
//! The relay's only jobs are delivery scoping and membership liveness:
//! it validates room ids, tracks each connection's current room, forwards
//! addressed `signal`/`ice-candidate` events verbatim, and broadcasts
//! join/leave notifications to the rest of the room. Payload contents are
//! never inspected.
//!
//! Connections deliver outbound events through per-peer mpsc outboxes; the
//! socket loop in `server.rs` drains its own outbox between reads. All
//! membership mutation happens under one mutex, shared with the sweep, so
//! joins and leaves for the same room are linearized.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::protocol::{generate_peer_id, ClientEvent, PeerId, ServerEvent};
use crate::registry::RoomRegistry;

// ── Shared state ────────────────────────────────────────────

struct RelayState {
    registry: RoomRegistry,
    /// Outbound event queues by connection peer id. A missing entry means
    /// the peer is gone; forwarding to it silently no-ops.
    outboxes: HashMap<PeerId, mpsc::Sender<ServerEvent>>,
}

/// The relay core, shared by all connection threads and the sweeper.
#[derive(Clone)]
pub struct SignalingRelay {
    state: Arc<Mutex<RelayState>>,
}

impl SignalingRelay {
    pub fn new(room_retention: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                registry: RoomRegistry::new(room_retention),
                outboxes: HashMap::new(),
            })),
        }
    }

    /// Register a new connection: assigns a fresh peer id and an outbox
    /// the socket loop drains. The first queued event is the `welcome`
    /// carrying the assigned id.
    pub fn register(&self) -> (RelayConn, mpsc::Receiver<ServerEvent>) {
        let peer_id = generate_peer_id();
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(ServerEvent::Welcome {
            peer_id: peer_id.clone(),
        });
        self.lock().outboxes.insert(peer_id.clone(), tx);
        eprintln!("[relay] connect: {}", peer_id);
        (
            RelayConn {
                peer_id,
                current_room: None,
                relay: self.clone(),
            },
            rx,
        )
    }

    /// Reclaim long-empty rooms. Runs under the same lock as join/leave,
    /// so a room repopulated since the last tick survives.
    pub fn sweep(&self, now: Instant) -> usize {
        self.lock().registry.sweep(now)
    }

    pub fn room_count(&self) -> usize {
        self.lock().registry.room_count()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        // A connection thread that panicked while holding the lock must
        // not wedge every other room; each mutation is a single map
        // operation, so the state stays consistent.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ── Per-connection handler ──────────────────────────────────

/// One relay connection: its assigned peer id and at most one current
/// room. Created by `SignalingRelay::register`, driven by the socket
/// loop, and closed exactly once via `disconnect`.
pub struct RelayConn {
    peer_id: PeerId,
    current_room: Option<String>,
    relay: SignalingRelay,
}

impl RelayConn {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Route one inbound client event.
    pub fn handle(&mut self, event: ClientEvent, now: Instant) {
        match event {
            ClientEvent::JoinRoom { room_id } => self.join_room(&room_id, now),
            ClientEvent::Signal { to, payload } => {
                self.forward(
                    &to,
                    ServerEvent::Signal {
                        from: self.peer_id.clone(),
                        payload,
                    },
                );
            }
            ClientEvent::IceCandidate { to, candidate } => {
                self.forward(
                    &to,
                    ServerEvent::IceCandidate {
                        from: self.peer_id.clone(),
                        candidate,
                    },
                );
            }
        }
    }

    /// Leave the current room (if any) without emitting events, then join
    /// the new one. Validation failure is the one user-visible error.
    fn join_room(&mut self, room_id: &str, now: Instant) {
        let mut state = self.relay.lock();

        if let Some(previous) = self.current_room.take() {
            state.registry.leave(&previous, &self.peer_id);
        }

        match state.registry.join(room_id, &self.peer_id, now) {
            Ok(peers) => {
                self.current_room = Some(room_id.to_string());
                eprintln!(
                    "[relay] join: {} -> {} ({} peer(s) present)",
                    self.peer_id,
                    room_id,
                    peers.len()
                );

                let is_initiator = !peers.is_empty();
                send_to(
                    &state,
                    &self.peer_id,
                    ServerEvent::RoomJoined {
                        room_id: room_id.to_string(),
                        peers: peers.clone(),
                        is_initiator,
                    },
                );
                for peer in &peers {
                    send_to(
                        &state,
                        peer,
                        ServerEvent::PeerJoined {
                            peer_id: self.peer_id.clone(),
                        },
                    );
                }
            }
            Err(e) => {
                eprintln!("[relay] join rejected for {}: {}", self.peer_id, e);
                send_to(
                    &state,
                    &self.peer_id,
                    ServerEvent::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    /// Verbatim opaque forward. A vanished target drops the message; the
    /// sender is not notified.
    fn forward(&self, to: &str, event: ServerEvent) {
        let state = self.relay.lock();
        if !send_to(&state, to, event) {
            eprintln!(
                "[relay] drop: {} -> {} (target not connected)",
                self.peer_id, to
            );
        }
    }

    /// Leave the room and notify the remaining members. Called from the
    /// socket loop on close, reset, or read error; safe to call twice.
    pub fn disconnect(&mut self) {
        let mut state = self.relay.lock();

        if state.outboxes.remove(&self.peer_id).is_none() {
            return; // already disconnected
        }
        eprintln!("[relay] disconnect: {}", self.peer_id);

        if let Some(room_id) = self.current_room.take() {
            state.registry.leave(&room_id, &self.peer_id);
            let remaining = state.registry.members_except(&room_id, &self.peer_id);
            for peer in &remaining {
                send_to(
                    &state,
                    peer,
                    ServerEvent::PeerLeft {
                        peer_id: self.peer_id.clone(),
                    },
                );
            }
        }
    }
}

impl Drop for RelayConn {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Queue `event` for `to`. Returns false if the peer is gone (the send
/// silently no-ops per the routing-error policy).
fn send_to(state: &RelayState, to: &str, event: ServerEvent) -> bool {
    match state.outboxes.get(to) {
        Some(tx) => tx.send(event).is_ok(),
        None => false,
    }
}

// ── Tests ───────────────────────────────────────────────────
