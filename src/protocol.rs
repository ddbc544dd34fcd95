//! Relay wire protocol: room-id grammar, peer-id generation, and the
//! JSON event types exchanged between clients and the signaling relay.
//!
//! Events are tagged by a `"type"` field with kebab-case names and
//! camelCase payload fields, matching the web client's schema:
//!
//!   client → relay: join-room, signal, ice-candidate
//!   relay → client: room-joined, peer-joined, signal, ice-candidate,
//!                   peer-left, error
//!
//! `signal.payload` and `ice-candidate.candidate` are opaque JSON values.
//! The relay forwards them verbatim and never inspects their contents, so
//! the negotiation protocol can evolve without touching the relay.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

// ── Constants ───────────────────────────────────────────────

/// Minimum room identifier length.
pub const ROOM_ID_MIN_LEN: usize = 4;

/// Maximum room identifier length.
pub const ROOM_ID_MAX_LEN: usize = 32;

/// Length of a relay-assigned peer identifier.
pub const PEER_ID_LEN: usize = 16;

// ── Identifiers ─────────────────────────────────────────────

/// Transient relay-assigned identifier for one physical connection.
/// Never persisted, never reused across reconnects.
pub type PeerId = String;

/// Validate a room identifier against the grammar `^[A-Za-z0-9-]{4,32}$`.
pub fn validate_room_id(room_id: &str) -> bool {
    if room_id.len() < ROOM_ID_MIN_LEN || room_id.len() > ROOM_ID_MAX_LEN {
        return false;
    }
    room_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Generate a fresh 16-character alphanumeric peer id.
pub fn generate_peer_id() -> PeerId {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PEER_ID_LEN)
        .map(char::from)
        .collect()
}

// ── Client → relay events ───────────────────────────────────

/// Events a client sends to the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "join-room")]
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    #[serde(rename = "signal")]
    Signal {
        to: PeerId,
        payload: serde_json::Value,
    },

    #[serde(rename = "ice-candidate")]
    IceCandidate {
        to: PeerId,
        candidate: serde_json::Value,
    },
}

// ── Relay → client events ───────────────────────────────────

/// Events the relay sends to a client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Sent once immediately after the connection is accepted: the peer id
    /// assigned to this connection. The client needs it to compute
    /// politeness against a remote peer.
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },

    #[serde(rename = "room-joined")]
    RoomJoined {
        #[serde(rename = "roomId")]
        room_id: String,
        peers: Vec<PeerId>,
        #[serde(rename = "isInitiator")]
        is_initiator: bool,
    },

    #[serde(rename = "peer-joined")]
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },

    #[serde(rename = "signal")]
    Signal {
        from: PeerId,
        payload: serde_json::Value,
    },

    #[serde(rename = "ice-candidate")]
    IceCandidate {
        from: PeerId,
        candidate: serde_json::Value,
    },

    #[serde(rename = "peer-left")]
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

// ── Parse / encode helpers ──────────────────────────────────

/// Parse an inbound client event from a WebSocket text frame.
/// Malformed frames are the caller's problem to drop (logged, silent).
pub fn parse_client_event(text: &str) -> Result<ClientEvent, serde_json::Error> {
    serde_json::from_str(text)
}

/// Encode a server event for a WebSocket text frame.
pub fn encode_server_event(event: &ServerEvent) -> String {
    // ServerEvent contains only string/bool/Value fields; serialization
    // cannot fail for these shapes.
    serde_json::to_string(event).unwrap_or_else(|_| String::from("{\"type\":\"error\",\"message\":\"encode failure\"}"))
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Room id grammar ─────────────────────────────────────

    #[test]
    fn valid_room_ids_accepted() {
        assert!(validate_room_id("abcd"));
        assert!(validate_room_id("abcd1234"));
        assert!(validate_room_id("room-with-dashes"));
        assert!(validate_room_id("ABC-123-xyz"));
        assert!(validate_room_id(&"a".repeat(32)));
    }

    #[test]
    fn short_room_id_rejected() {
        assert!(!validate_room_id(""));
        assert!(!validate_room_id("abc"));
    }

    #[test]
    fn long_room_id_rejected() {
        assert!(!validate_room_id(&"a".repeat(33)));
    }

    #[test]
    fn bad_characters_rejected() {
        assert!(!validate_room_id("room_underscore"));
        assert!(!validate_room_id("room space"));
        assert!(!validate_room_id("room!bang"));
        assert!(!validate_room_id("ro\u{f6}m-umlaut"));
    }

    // ── Peer id ─────────────────────────────────────────────

    #[test]
    fn peer_id_length_and_charset() {
        let id = generate_peer_id();
        assert_eq!(id.len(), PEER_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn peer_ids_are_distinct() {
        // 62^16 space; a collision here means the generator is broken.
        assert_ne!(generate_peer_id(), generate_peer_id());
    }

    // ── Wire format ─────────────────────────────────────────

    #[test]
    fn join_room_wire_format() {
        let event = parse_client_event(r#"{"type":"join-room","roomId":"abcd1234"}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinRoom {
                room_id: "abcd1234".to_string()
            }
        );
    }

    #[test]
    fn signal_payload_is_opaque() {
        let text = r#"{"type":"signal","to":"peer-b","payload":{"type":"offer","sdp":"v=0\r\n","anything":[1,2]}}"#;
        let event = parse_client_event(text).unwrap();
        match event {
            ClientEvent::Signal { to, payload } => {
                assert_eq!(to, "peer-b");
                // Arbitrary structure survives untouched.
                assert_eq!(payload["anything"][1], 2);
            }
            other => panic!("expected Signal, got {other:?}"),
        }
    }

    #[test]
    fn room_joined_wire_format() {
        let event = ServerEvent::RoomJoined {
            room_id: "abcd1234".to_string(),
            peers: vec!["p1".to_string()],
            is_initiator: true,
        };
        let json: serde_json::Value =
            serde_json::from_str(&encode_server_event(&event)).unwrap();
        assert_eq!(json["type"], "room-joined");
        assert_eq!(json["roomId"], "abcd1234");
        assert_eq!(json["peers"][0], "p1");
        assert_eq!(json["isInitiator"], true);
    }

    #[test]
    fn peer_left_wire_format() {
        let event = ServerEvent::PeerLeft {
            peer_id: "p9".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&encode_server_event(&event)).unwrap();
        assert_eq!(json["type"], "peer-left");
        assert_eq!(json["peerId"], "p9");
    }

    #[test]
    fn welcome_wire_format() {
        let event = ServerEvent::Welcome {
            peer_id: "abc123".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&encode_server_event(&event)).unwrap();
        assert_eq!(json["type"], "welcome");
        assert_eq!(json["peerId"], "abc123");
    }

    #[test]
    fn malformed_event_fails_to_parse() {
        assert!(parse_client_event("not json").is_err());
        assert!(parse_client_event(r#"{"type":"join-room"}"#).is_err());
        assert!(parse_client_event(r#"{"type":"unknown-event"}"#).is_err());
    }

    #[test]
    fn signal_missing_to_fails() {
        assert!(parse_client_event(r#"{"type":"signal","payload":{}}"#).is_err());
    }

    #[test]
    fn server_signal_roundtrip() {
        let event = ServerEvent::Signal {
            from: "peer-a".to_string(),
            payload: serde_json::json!({"type": "offer", "sdp": "v=0"}),
        };
        let text = encode_server_event(&event);
        let back: ServerEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }
}
