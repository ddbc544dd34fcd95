//! Opaque peer-transport capability boundary.
//!
//! The actual media/session-description machinery (SDP encoding, ICE, NAT
//! traversal) lives outside this crate. The negotiation core only needs a
//! small capability surface: create an offer/answer, apply a remote
//! description, add a candidate, open the data channel. Descriptions and
//! candidates are opaque JSON values end to end — this crate never looks
//! inside them.
//!
//! Tests drive the negotiation machine with scripted in-memory transports;
//! a production build plugs a real WebRTC stack in behind this trait.

use serde_json::Value;

// ── Channel policy ──────────────────────────────────────────

/// Reliability policy for the bidirectional data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPolicy {
    /// Guaranteed in-order delivery.
    pub ordered: bool,
    /// Bounded retransmit count for failed messages.
    pub max_retransmits: u16,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: 10,
        }
    }
}

// ── Error type ──────────────────────────────────────────────

/// Failure reported by the underlying transport capability.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

// ── Transport-side events ───────────────────────────────────

/// Asynchronous notifications from the transport, drained by the
/// supervisor between relay events.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local network-discovery candidate to forward to the remote peer.
    LocalCandidate(Value),
    /// The data channel opened; negotiation is complete.
    ChannelOpened,
    /// An inbound application frame from the channel.
    ChannelMessage(Vec<u8>),
    /// The channel closed. On its own this is not a session transition.
    ChannelClosed,
    /// The connection failed (e.g. ICE failure). Fatal for the session.
    Failed(String),
}

// ── Capability trait ────────────────────────────────────────

/// The opaque negotiation capability handed to the client core.
///
/// Each call either completes or fails before the supervisor acts on the
/// next relay event, preserving the single-timeline model: no two
/// negotiation steps are ever in flight at once.
pub trait PeerTransport {
    /// Create a local offer and apply it as the local description.
    /// Returns the opaque offer payload to send via `signal`.
    fn create_offer(&mut self) -> Result<Value, TransportError>;

    /// Create a local answer (remote offer must already be applied) and
    /// apply it as the local description. Returns the opaque payload.
    fn create_answer(&mut self) -> Result<Value, TransportError>;

    /// Apply a remote offer or answer description.
    fn apply_remote_description(&mut self, description: &Value) -> Result<(), TransportError>;

    /// Add one remote network-discovery candidate.
    fn add_candidate(&mut self, candidate: &Value) -> Result<(), TransportError>;

    /// Roll back an uncommitted local offer (polite side yielding in a
    /// collision).
    fn rollback_local(&mut self) -> Result<(), TransportError>;

    /// Open the bidirectional ordered channel (requester side only).
    fn open_channel(&mut self, policy: &ChannelPolicy) -> Result<(), TransportError>;

    /// Send one application frame over the opened channel.
    fn send_message(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Drain transport events that arrived since the last poll.
    fn poll_events(&mut self) -> Vec<TransportEvent>;

    /// Close the channel and the underlying connection. Must be idempotent.
    fn close(&mut self);
}

// ── Tests ───────────────────────────────────────────────────
