//! Application-message protocol over the opened data channel.
//!
//! Once negotiation completes, all chat traffic rides the direct channel;
//! the relay is out of the loop. Frames are JSON text tagged by `"type"`:
//!
//!   - `chat`            — message content + sender timestamp (ms)
//!   - `identity`        — the sender's participant (sent on open)
//!   - `identity-update` — display-name change mid-session
//!
//! Attribution is positional: entries are tagged with a sender slot
//! (local/remote) at receipt time, and the display name is resolved
//! through the latest known participant when the history is read. A late
//! `identity` therefore retroactively relabels chat received under the
//! "peer" placeholder, without rewriting stored entries.
//!
//! Unknown types and malformed frames are logged and dropped.

use serde::{Deserialize, Serialize};

// ── Participant ─────────────────────────────────────────────

/// Stable, client-chosen human identity. Distinct from the relay's
/// transient `PeerId`: this one survives reconnects.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

/// Display name used for remote chat before an `identity` arrives.
pub const PEER_PLACEHOLDER: &str = "peer";

// ── Wire messages ───────────────────────────────────────────

/// Messages exchanged over the opened channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ChannelMessage {
    #[serde(rename = "chat")]
    Chat {
        content: String,
        /// Sender clock, milliseconds since UNIX epoch.
        timestamp: u64,
    },

    #[serde(rename = "identity")]
    Identity { participant: Participant },

    #[serde(rename = "identity-update")]
    IdentityUpdate { participant: Participant },
}

/// Frame parse failures. All are dropped by the caller, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelParseError {
    NotUtf8,
    Malformed(String),
}

impl std::fmt::Display for ChannelParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelParseError::NotUtf8 => write!(f, "channel frame is not UTF-8"),
            ChannelParseError::Malformed(detail) => {
                write!(f, "channel frame parse error: {detail}")
            }
        }
    }
}

impl std::error::Error for ChannelParseError {}

/// Parse one channel frame.
pub fn parse_channel_message(bytes: &[u8]) -> Result<ChannelMessage, ChannelParseError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ChannelParseError::NotUtf8)?;
    serde_json::from_str(text).map_err(|e| ChannelParseError::Malformed(e.to_string()))
}

/// Encode a channel message to JSON bytes.
pub fn encode_channel_message(msg: &ChannelMessage) -> Vec<u8> {
    // Tagged enum over plain strings/ints; serialization cannot fail.
    serde_json::to_vec(msg).unwrap_or_default()
}

/// Current time in milliseconds since UNIX epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── History ─────────────────────────────────────────────────

/// Which side of the channel produced an entry. Names are resolved from
/// this slot at read time, not stored per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderSlot {
    Local,
    Remote,
}

/// One stored chat entry.
#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub content: String,
    pub timestamp: u64,
    pub slot: SenderSlot,
}

/// A history entry with the sender name resolved for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub content: String,
    pub timestamp: u64,
    pub sender_name: String,
    pub mine: bool,
}

// ── Session ─────────────────────────────────────────────────

/// Wraps one opened bidirectional channel: framing, identity exchange,
/// and the in-memory chat history. History is session-scoped and never
/// persisted; channel closure alone does not clear it.
pub struct ChannelSession {
    local: Participant,
    remote: Option<Participant>,
    history: Vec<ChatEntry>,
}

impl ChannelSession {
    pub fn new(local: Participant) -> Self {
        Self {
            local,
            remote: None,
            history: Vec::new(),
        }
    }

    /// First message to send when the channel opens: our identity.
    pub fn on_open(&self) -> ChannelMessage {
        ChannelMessage::Identity {
            participant: self.local.clone(),
        }
    }

    /// Apply one received channel message.
    pub fn receive(&mut self, msg: ChannelMessage) {
        match msg {
            ChannelMessage::Chat { content, timestamp } => {
                self.history.push(ChatEntry {
                    content,
                    timestamp,
                    slot: SenderSlot::Remote,
                });
            }
            ChannelMessage::Identity { participant }
            | ChannelMessage::IdentityUpdate { participant } => {
                eprintln!(
                    "[channel] remote participant is '{}' ({})",
                    participant.name, participant.id
                );
                self.remote = Some(participant);
            }
        }
    }

    /// Build the chat frame for `content`, appending it to local history.
    /// The caller sends the returned message over the channel.
    pub fn send_chat(&mut self, content: &str) -> ChannelMessage {
        let timestamp = now_ms();
        self.history.push(ChatEntry {
            content: content.to_string(),
            timestamp,
            slot: SenderSlot::Local,
        });
        ChannelMessage::Chat {
            content: content.to_string(),
            timestamp,
        }
    }

    /// Announce a local display-name change to the remote side.
    pub fn update_local_name(&mut self, name: &str) -> ChannelMessage {
        self.local.name = name.to_string();
        ChannelMessage::IdentityUpdate {
            participant: self.local.clone(),
        }
    }

    pub fn local_participant(&self) -> &Participant {
        &self.local
    }

    pub fn remote_participant(&self) -> Option<&Participant> {
        self.remote.as_ref()
    }

    /// Current display name for the remote slot.
    fn remote_name(&self) -> &str {
        self.remote
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or(PEER_PLACEHOLDER)
    }

    /// History with sender names resolved against the latest identities.
    pub fn history(&self) -> Vec<RenderedMessage> {
        self.history
            .iter()
            .map(|entry| RenderedMessage {
                content: entry.content.clone(),
                timestamp: entry.timestamp,
                sender_name: match entry.slot {
                    SenderSlot::Local => self.local.name.clone(),
                    SenderSlot::Remote => self.remote_name().to_string(),
                },
                mine: entry.slot == SenderSlot::Local,
            })
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────
