//! Pairlink library — two-party chat over a peer data channel, with a
//! lightweight room-scoped signaling relay.
//!
//! Server side: `registry` + `relay` implement the room lifecycle and the
//! blind forwarding of negotiation traffic. Client side: `negotiation`,
//! `channel` and `supervisor` implement the collision-safe session
//! machine, the in-channel chat protocol and the connection lifecycle.
//! `protocol` carries the shared relay wire format.

pub mod channel;
pub mod config;
pub mod negotiation;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod supervisor;
pub mod transport;
