//! Per-remote-peer negotiation state machine.
//!
//! Every relay or transport event is converted into one `SessionEvent` and
//! fed through `NegotiationSession::handle`, which returns the effects the
//! supervisor must perform (create/apply descriptions, flush candidates,
//! close the transport, surface a user message). The transition logic does
//! no I/O, so glare and buffering behavior is unit-testable without
//! sockets or a real WebRTC stack.
//!
//! Collision handling follows the polite/impolite scheme: politeness is a
//! deterministic total order over (local, remote) peer ids — the
//! lexicographically lesser id is polite — so both sides agree without
//! coordination. When offers cross, the impolite side ignores the incoming
//! offer and keeps waiting; the polite side rolls back its own offer and
//! accepts the remote one.

use serde_json::Value;

use crate::protocol::PeerId;

// ── Signal classification ───────────────────────────────────

/// What kind of negotiation message an opaque `signal` payload carries.
/// The relay never looks at this; only the receiving client does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Unknown,
}

/// Peek at `payload.type` to classify an incoming signal.
pub fn classify_signal(payload: &Value) -> SignalKind {
    match payload.get("type").and_then(|v| v.as_str()) {
        Some("offer") => SignalKind::Offer,
        Some("answer") => SignalKind::Answer,
        _ => SignalKind::Unknown,
    }
}

// ── Phases, roles, events, effects ──────────────────────────

/// Handshake phase. `Waiting` is the recoverable post-failure resting
/// state; `Idle` means the session is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Waiting,
    Offering,
    Answering,
    Negotiating,
    Established,
}

/// Which side of the handshake this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Found the peer already in the room; opens the channel, sends the
    /// first offer.
    Requester,
    /// Was discovered via `peer-joined`; waits for an offer.
    Responder,
}

/// One typed event fed into the machine. Relay-driven events carry the
/// sender's peer id so the central guard can reject cross-talk.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The requester's offer was created and sent via signal.
    OfferSent,
    /// The responder's answer was created and sent via signal.
    AnswerSent,
    OfferReceived { from: PeerId, payload: Value },
    AnswerReceived { from: PeerId, payload: Value },
    CandidateReceived { from: PeerId, candidate: Value },
    PeerLeft { peer_id: PeerId },
    /// The data channel opened; negotiation is complete.
    ChannelOpened,
    /// A local negotiation step (create/apply offer or answer) failed.
    /// Recoverable: the session returns to `Waiting`.
    StepFailed { reason: String },
    /// The underlying transport reported failure. Fatal for this session.
    TransportFailed { reason: String },
}

/// Side effects the supervisor performs after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open the data channel with the configured policy (requester only).
    OpenChannel,
    /// Create + locally apply an offer, then send it; report back with
    /// `OfferSent` or `StepFailed`.
    CreateOffer,
    /// Create + locally apply an answer, then send it; report back with
    /// `AnswerSent` or `StepFailed`.
    CreateAnswer,
    /// Roll back the uncommitted local offer before accepting the remote
    /// one (polite side of a collision).
    RollbackLocal,
    /// Apply a remote description (offer or answer payload).
    ApplyRemoteDescription(Value),
    /// Apply one buffered or live candidate. A failure skips this
    /// candidate only; the batch continues.
    ApplyCandidate(Value),
    /// Close channel + transport. Part of teardown.
    CloseTransport,
    /// Surface a recoverable, user-visible connectivity message.
    NotifyUser(String),
}

// ── Session ─────────────────────────────────────────────────

/// State for negotiating with exactly one remote peer. At most one of
/// these exists at a time; a new remote peer requires tearing the old
/// session down first.
#[derive(Debug)]
pub struct NegotiationSession {
    remote_peer: PeerId,
    role: Role,
    polite: bool,
    phase: Phase,
    making_offer: bool,
    ignore_offer: bool,
    remote_description_set: bool,
    pending_candidates: Vec<Value>,
    /// Stamped by the supervisor; transport completions from an older
    /// epoch must never reach this session.
    epoch: u64,
}

impl NegotiationSession {
    /// Session for the side that found the peer already present
    /// (`room-joined` with a nonempty peer list). Returned effects open
    /// the channel and start the first offer.
    pub fn requester(local_peer: &str, remote_peer: &str, epoch: u64) -> (Self, Vec<Effect>) {
        let session = Self {
            remote_peer: remote_peer.to_string(),
            role: Role::Requester,
            polite: is_polite(local_peer, remote_peer),
            phase: Phase::Offering,
            making_offer: true,
            ignore_offer: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            epoch,
        };
        (session, vec![Effect::OpenChannel, Effect::CreateOffer])
    }

    /// Session for the side discovered later (`peer-joined`). Waits for
    /// the remote offer.
    pub fn responder(local_peer: &str, remote_peer: &str, epoch: u64) -> Self {
        Self {
            remote_peer: remote_peer.to_string(),
            role: Role::Responder,
            polite: is_polite(local_peer, remote_peer),
            phase: Phase::Answering,
            making_offer: false,
            ignore_offer: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            epoch,
        }
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_torn_down(&self) -> bool {
        self.phase == Phase::Idle
    }

    #[cfg(test)]
    pub(crate) fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Feed one event through the machine. Exactly one transition per
    /// event; returns the effects to perform, in order.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        if self.phase == Phase::Idle {
            // Torn down: discard everything. Candidates arriving here are
            // the one case where dropping them silently is allowed.
            eprintln!("[negotiation] event after teardown discarded: {event:?}");
            return Vec::new();
        }

        // ignore_offer lives until the next event, then resets.
        let ignored_last = self.ignore_offer;
        self.ignore_offer = false;

        match event {
            SessionEvent::OfferSent => {
                self.making_offer = false;
                self.phase = Phase::Negotiating;
                Vec::new()
            }

            SessionEvent::AnswerSent => {
                self.phase = Phase::Negotiating;
                Vec::new()
            }

            SessionEvent::OfferReceived { from, payload } => {
                if !self.sender_is_active(&from, "signal") {
                    return Vec::new();
                }
                self.on_offer(payload)
            }

            SessionEvent::AnswerReceived { from, payload } => {
                if !self.sender_is_active(&from, "signal") {
                    return Vec::new();
                }
                self.on_answer(payload, ignored_last)
            }

            SessionEvent::CandidateReceived { from, candidate } => {
                if !self.sender_is_active(&from, "ice-candidate") {
                    return Vec::new();
                }
                if self.remote_description_set {
                    vec![Effect::ApplyCandidate(candidate)]
                } else {
                    self.pending_candidates.push(candidate);
                    Vec::new()
                }
            }

            SessionEvent::PeerLeft { peer_id } => {
                if peer_id != self.remote_peer {
                    eprintln!(
                        "[negotiation] peer-left for '{}' ignored (active peer is '{}')",
                        peer_id, self.remote_peer
                    );
                    return Vec::new();
                }
                self.teardown()
            }

            SessionEvent::ChannelOpened => {
                self.phase = Phase::Established;
                Vec::new()
            }

            SessionEvent::StepFailed { reason } => {
                eprintln!("[negotiation] step failed: {}", reason);
                self.making_offer = false;
                self.phase = Phase::Waiting;
                vec![Effect::NotifyUser(
                    "Connection negotiation failed".to_string(),
                )]
            }

            SessionEvent::TransportFailed { reason } => {
                eprintln!("[negotiation] transport failed: {}", reason);
                let mut effects = self.teardown();
                effects.push(Effect::NotifyUser(
                    "Connection failed. You may need a different network.".to_string(),
                ));
                effects
            }
        }
    }

    /// Tear the session down: close channel + transport, clear buffers and
    /// flags, return to `Idle`. Idempotent — a second call is a no-op, so
    /// closely-spaced failure signals (ICE failure then peer-left) clean
    /// up exactly once.
    pub fn teardown(&mut self) -> Vec<Effect> {
        if self.phase == Phase::Idle {
            return Vec::new();
        }
        self.phase = Phase::Idle;
        self.making_offer = false;
        self.ignore_offer = false;
        self.remote_description_set = false;
        self.pending_candidates.clear();
        vec![Effect::CloseTransport]
    }

    // ── Internal transitions ────────────────────────────────

    /// Central sender guard: both signal and candidate deliveries must
    /// come from the active remote peer. Protects against cross-talk
    /// after a peer churn.
    fn sender_is_active(&self, from: &str, kind: &str) -> bool {
        if from == self.remote_peer {
            return true;
        }
        eprintln!(
            "[negotiation] {} from '{}' rejected (active peer is '{}')",
            kind, from, self.remote_peer
        );
        false
    }

    /// An incoming offer collides when we are mid-offer ourselves: either
    /// still creating one, or we sent one and are waiting for its answer.
    fn offer_collision(&self) -> bool {
        self.making_offer || self.awaiting_answer()
    }

    fn awaiting_answer(&self) -> bool {
        self.role == Role::Requester
            && matches!(self.phase, Phase::Offering | Phase::Negotiating)
            && !self.remote_description_set
    }

    fn on_offer(&mut self, payload: Value) -> Vec<Effect> {
        let collision = self.offer_collision();

        if collision && !self.polite {
            // Impolite side of glare: drop the incoming offer and keep
            // waiting for the remote side to yield.
            eprintln!(
                "[negotiation] glare: impolite side ignoring offer from '{}'",
                self.remote_peer
            );
            self.ignore_offer = true;
            return Vec::new();
        }

        let mut effects = Vec::new();
        if collision {
            // Polite side: abandon our own offer, then accept theirs.
            eprintln!(
                "[negotiation] glare: polite side rolling back for '{}'",
                self.remote_peer
            );
            self.making_offer = false;
            effects.push(Effect::RollbackLocal);
        }

        effects.push(Effect::ApplyRemoteDescription(payload));
        self.remote_description_set = true;
        effects.extend(self.flush_candidates());
        effects.push(Effect::CreateAnswer);
        self.phase = Phase::Answering;
        effects
    }

    fn on_answer(&mut self, payload: Value, ignored_last: bool) -> Vec<Effect> {
        if !self.awaiting_answer() {
            if ignored_last {
                // The remote answered our (still live) offer right after
                // we ignored theirs; only reachable for the impolite side
                // whose awaiting_answer still holds, so landing here means
                // the answer is genuinely out of place.
                eprintln!("[negotiation] discarding answer after ignored offer");
            } else {
                eprintln!(
                    "[negotiation] WARNING: answer from '{}' discarded (not awaiting one)",
                    self.remote_peer
                );
            }
            return Vec::new();
        }

        let mut effects = vec![Effect::ApplyRemoteDescription(payload)];
        self.remote_description_set = true;
        effects.extend(self.flush_candidates());
        effects
    }

    /// Emit buffered candidates in arrival order and clear the queue.
    fn flush_candidates(&mut self) -> Vec<Effect> {
        self.pending_candidates
            .drain(..)
            .map(Effect::ApplyCandidate)
            .collect()
    }
}

/// Deterministic politeness: the lexicographically lesser peer id is
/// polite. Symmetric on both sides without coordination.
pub fn is_polite(local_peer: &str, remote_peer: &str) -> bool {
    local_peer < remote_peer
}

// ── Tests ───────────────────────────────────────────────────
