//! Connection supervisor: owns the signaling link, the peer transport and
//! the negotiation session, and drives them as one logical timeline.
//!
//! The supervisor is the only component with side effects. It executes the
//! effects the negotiation machine emits, feeds completions back in as
//! events, and keeps the chat channel session alive across peer churn and
//! relay reconnects so history is never lost.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use tungstenite::protocol::WebSocket;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::Message;

use crate::channel::{encode_channel_message, parse_channel_message, ChannelSession, Participant};
use crate::config::ClientConfig;
use crate::negotiation::{classify_signal, Effect, NegotiationSession, Phase, SessionEvent, SignalKind};
use crate::protocol::{ClientEvent, PeerId, ServerEvent};
use crate::transport::{PeerTransport, TransportError, TransportEvent};

// ── Timing ──────────────────────────────────────────────────

/// How long to wait for the relay's handshake events (welcome, room-joined)
/// before giving up on an attempt.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-read poll granularity while waiting on a deadline.
const HANDSHAKE_POLL: Duration = Duration::from_millis(100);

// ── Signaling link ──────────────────────────────────────────

/// Failure on the signaling link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkError(pub String);

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "signaling link error: {}", self.0)
    }
}

impl std::error::Error for LinkError {}

/// One client connection to the relay. `recv` is a bounded poll so the
/// supervisor can interleave transport draining with relay traffic.
pub trait SignalingLink {
    fn send(&mut self, event: &ClientEvent) -> Result<(), LinkError>;

    /// Wait up to `timeout` for the next server event. `Ok(None)` means
    /// nothing arrived in time; `Err` means the link is dead.
    fn recv(&mut self, timeout: Duration) -> Result<Option<ServerEvent>, LinkError>;

    fn close(&mut self);
}

// ── WebSocket link ──────────────────────────────────────────

type WsStream = WebSocket<MaybeTlsStream<std::net::TcpStream>>;

/// Production signaling link over a plain WebSocket.
pub struct WsLink {
    ws: WsStream,
}

impl WsLink {
    pub fn connect(url: &str) -> Result<Self, LinkError> {
        let (ws, _response) = tungstenite::connect(url)
            .map_err(|e| LinkError(format!("connect to {}: {}", url, e)))?;
        Ok(Self { ws })
    }
}

impl SignalingLink for WsLink {
    fn send(&mut self, event: &ClientEvent) -> Result<(), LinkError> {
        let json = serde_json::to_string(event).map_err(|e| LinkError(e.to_string()))?;
        self.ws
            .send(Message::Text(json))
            .map_err(|e| LinkError(e.to_string()))
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<ServerEvent>, LinkError> {
        // A zero read timeout means "block forever" to the OS; clamp it.
        let timeout = timeout.max(Duration::from_millis(1));
        match self.ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp
                .set_read_timeout(Some(timeout))
                .map_err(|e| LinkError(e.to_string()))?,
            #[allow(unreachable_patterns)]
            _ => {
                return Err(LinkError(
                    "read timeout not supported for this stream type".to_string(),
                ))
            }
        }

        match self.ws.read() {
            Ok(msg) if msg.is_ping() || msg.is_pong() => Ok(None),
            Ok(Message::Text(text)) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| LinkError(format!("malformed server event: {}", e))),
            Ok(Message::Close(_)) => Err(LinkError("server closed the connection".to_string())),
            Ok(other) => {
                eprintln!("[link] ignoring unexpected frame: {:?}", other);
                Ok(None)
            }
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(LinkError(e.to_string())),
        }
    }

    fn close(&mut self) {
        let _ = self.ws.close(None);
    }
}

// ── Errors ──────────────────────────────────────────────────

#[derive(Debug)]
pub enum SupervisorError {
    Link(LinkError),
    Transport(TransportError),
    /// The relay answered the handshake with something unexpected, or
    /// with an explicit error event (invalid room id, room full).
    Handshake(String),
    /// Chat was attempted while no channel is open.
    NotConnected,
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Link(e) => write!(f, "{}", e),
            SupervisorError::Transport(e) => write!(f, "{}", e),
            SupervisorError::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            SupervisorError::NotConnected => write!(f, "not connected to a peer"),
        }
    }
}

impl std::error::Error for SupervisorError {}

impl From<LinkError> for SupervisorError {
    fn from(e: LinkError) -> Self {
        SupervisorError::Link(e)
    }
}

impl From<TransportError> for SupervisorError {
    fn from(e: TransportError) -> Self {
        SupervisorError::Transport(e)
    }
}

// ── Connection state ────────────────────────────────────────

/// User-visible connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live relay link.
    Disconnected,
    /// Dialing the relay / waiting for the room handshake.
    Connecting,
    /// In the room, alone. Ready to negotiate when a peer appears.
    Waiting,
    /// Negotiating with a peer.
    Signaling,
    /// Data channel open.
    Connected,
}

// ── Supervisor ──────────────────────────────────────────────

type LinkFactory<L> = Box<dyn FnMut(&str) -> Result<L, LinkError>>;
type TransportFactory<T> = Box<dyn FnMut(&ClientConfig) -> Result<T, TransportError>>;

/// Drives one room membership: relay link, at most one negotiation
/// session, and the chat channel.
pub struct ConnectionSupervisor<L: SignalingLink, T: PeerTransport> {
    config: ClientConfig,
    room_id: String,
    connect_link: LinkFactory<L>,
    create_transport: TransportFactory<T>,
    link: Option<L>,
    transport: Option<T>,
    session: Option<NegotiationSession>,
    channel: ChannelSession,
    state: ConnectionState,
    local_peer: Option<PeerId>,
    last_error: Option<String>,
    notices: Vec<String>,
    epoch: u64,
}

impl<L: SignalingLink, T: PeerTransport> ConnectionSupervisor<L, T> {
    pub fn new(
        config: ClientConfig,
        room_id: &str,
        local: Participant,
        connect_link: LinkFactory<L>,
        create_transport: TransportFactory<T>,
    ) -> Self {
        Self {
            config,
            room_id: room_id.to_string(),
            connect_link,
            create_transport,
            link: None,
            transport: None,
            session: None,
            channel: ChannelSession::new(local),
            state: ConnectionState::Disconnected,
            local_peer: None,
            last_error: None,
            notices: Vec::new(),
            epoch: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Relay-assigned id for this client, once the handshake completed.
    pub fn local_peer_id(&self) -> Option<&str> {
        self.local_peer.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Drain accumulated user-facing connectivity notices.
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    /// Rendered chat history, names resolved as of now.
    pub fn history(&self) -> Vec<crate::channel::RenderedMessage> {
        self.channel.history()
    }

    // ── Connecting ──────────────────────────────────────────

    /// Dial the relay and join the room, retrying up to the configured
    /// attempt count. Any previous session is torn down first; chat
    /// history survives.
    pub fn connect(&mut self) -> Result<(), SupervisorError> {
        let mut last: Option<SupervisorError> = None;
        for attempt in 1..=self.config.reconnect_attempts.max(1) {
            if attempt > 1 {
                eprintln!(
                    "[supervisor] retrying relay connection (attempt {}/{})",
                    attempt, self.config.reconnect_attempts
                );
            }
            match self.try_connect() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    eprintln!("[supervisor] connection attempt {} failed: {}", attempt, e);
                    last = Some(e);
                }
            }
        }
        self.state = ConnectionState::Disconnected;
        let err = last.unwrap_or(SupervisorError::Handshake("no attempts made".to_string()));
        self.last_error = Some(err.to_string());
        Err(err)
    }

    /// One physical connection: dial, wait for welcome, join exactly once,
    /// wait for room-joined.
    fn try_connect(&mut self) -> Result<(), SupervisorError> {
        self.drop_session();
        if let Some(mut old) = self.link.take() {
            old.close();
        }
        self.local_peer = None;
        self.state = ConnectionState::Connecting;

        let mut link = (self.connect_link)(&self.config.signaling_url)?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let peer_id = loop {
            match Self::recv_until(&mut link, deadline)? {
                ServerEvent::Welcome { peer_id } => break peer_id,
                other => eprintln!("[supervisor] expected welcome, ignoring {:?}", other),
            }
        };
        eprintln!("[supervisor] assigned peer id '{}'", peer_id);

        link.send(&ClientEvent::JoinRoom {
            room_id: self.room_id.clone(),
        })?;

        let peers = loop {
            match Self::recv_until(&mut link, deadline)? {
                ServerEvent::RoomJoined { peers, .. } => break peers,
                ServerEvent::Error { message } => {
                    return Err(SupervisorError::Handshake(message));
                }
                other => eprintln!("[supervisor] before room-joined, ignoring {:?}", other),
            }
        };

        eprintln!(
            "[supervisor] joined room '{}' with {} peer(s) present",
            self.room_id,
            peers.len()
        );
        self.local_peer = Some(peer_id);
        self.link = Some(link);
        self.state = ConnectionState::Waiting;
        self.last_error = None;

        // Arriving second: the existing occupant is our remote peer and we
        // start the negotiation.
        if let Some(remote) = peers.first().cloned() {
            self.start_requester(&remote)?;
        }
        Ok(())
    }

    fn recv_until(link: &mut L, deadline: Instant) -> Result<ServerEvent, SupervisorError> {
        loop {
            if Instant::now() >= deadline {
                return Err(SupervisorError::Handshake(
                    "timed out waiting for the relay".to_string(),
                ));
            }
            if let Some(event) = link.recv(HANDSHAKE_POLL)? {
                return Ok(event);
            }
        }
    }

    // ── Event pump ──────────────────────────────────────────

    /// One scheduling slice: drain transport events, poll the relay for up
    /// to `timeout`, drain again. Reconnects if the link died.
    pub fn pump(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        self.drain_transport();

        let received = match self.link.as_mut() {
            Some(link) => match link.recv(timeout) {
                Ok(ev) => ev,
                Err(e) => {
                    eprintln!("[supervisor] signaling link lost: {}", e);
                    self.notices
                        .push("Reconnecting to the signaling server...".to_string());
                    self.connect()?;
                    None
                }
            },
            None => return Err(SupervisorError::NotConnected),
        };
        if let Some(event) = received {
            self.on_server_event(event);
        }

        self.drain_transport();
        self.sync_state();
        Ok(())
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Welcome { peer_id } => {
                eprintln!("[supervisor] ignoring duplicate welcome for '{}'", peer_id);
            }
            ServerEvent::RoomJoined { room_id, .. } => {
                eprintln!("[supervisor] ignoring duplicate room-joined for '{}'", room_id);
            }
            ServerEvent::PeerJoined { peer_id } => {
                match &self.session {
                    Some(s) if s.remote_peer() == peer_id => {
                        eprintln!("[supervisor] peer '{}' already in session", peer_id);
                    }
                    Some(s) => {
                        // Two-person rooms make this unreachable via the
                        // relay; keep the active session regardless.
                        eprintln!(
                            "[supervisor] ignoring peer-joined from '{}' while paired with '{}'",
                            peer_id,
                            s.remote_peer()
                        );
                    }
                    None => {
                        if let Err(e) = self.start_responder(&peer_id) {
                            eprintln!("[supervisor] failed to prepare for '{}': {}", peer_id, e);
                        }
                    }
                }
            }
            ServerEvent::Signal { from, payload } => {
                let event = match classify_signal(&payload) {
                    SignalKind::Offer => SessionEvent::OfferReceived { from, payload },
                    SignalKind::Answer => SessionEvent::AnswerReceived { from, payload },
                    SignalKind::Unknown => {
                        eprintln!("[supervisor] dropping unclassifiable signal from '{}'", from);
                        return;
                    }
                };
                // An offer can outrun our peer-joined; seed the session.
                if self.session.is_none() {
                    let from = match &event {
                        SessionEvent::OfferReceived { from, .. } => from.clone(),
                        SessionEvent::AnswerReceived { from, .. } => from.clone(),
                        _ => return,
                    };
                    if let Err(e) = self.start_responder(&from) {
                        eprintln!("[supervisor] failed to prepare for '{}': {}", from, e);
                        return;
                    }
                }
                self.feed(event);
            }
            ServerEvent::IceCandidate { from, candidate } => {
                if self.session.is_none() {
                    if let Err(e) = self.start_responder(&from) {
                        eprintln!("[supervisor] failed to prepare for '{}': {}", from, e);
                        return;
                    }
                }
                self.feed(SessionEvent::CandidateReceived { from, candidate });
            }
            ServerEvent::PeerLeft { peer_id } => {
                eprintln!("[supervisor] peer '{}' left the room", peer_id);
                self.feed(SessionEvent::PeerLeft { peer_id });
            }
            ServerEvent::Error { message } => {
                eprintln!("[supervisor] relay error: {}", message);
                self.last_error = Some(message);
            }
        }
    }

    // ── Session wiring ──────────────────────────────────────

    fn start_requester(&mut self, remote: &str) -> Result<(), SupervisorError> {
        let local = self.require_local_peer()?;
        self.transport = Some((self.create_transport)(&self.config)?);
        self.epoch += 1;
        eprintln!(
            "[supervisor] negotiating with '{}' as requester (session {})",
            remote, self.epoch
        );
        let (session, effects) = NegotiationSession::requester(&local, remote, self.epoch);
        self.session = Some(session);
        self.state = ConnectionState::Signaling;
        self.run_effects(effects);
        Ok(())
    }

    fn start_responder(&mut self, remote: &str) -> Result<(), SupervisorError> {
        let local = self.require_local_peer()?;
        self.transport = Some((self.create_transport)(&self.config)?);
        self.epoch += 1;
        eprintln!(
            "[supervisor] awaiting offer from '{}' (session {})",
            remote, self.epoch
        );
        self.session = Some(NegotiationSession::responder(&local, remote, self.epoch));
        self.state = ConnectionState::Signaling;
        Ok(())
    }

    fn require_local_peer(&self) -> Result<PeerId, SupervisorError> {
        self.local_peer
            .clone()
            .ok_or_else(|| SupervisorError::Handshake("no peer id assigned yet".to_string()))
    }

    /// Run the machine to quiescence: every effect may complete with a
    /// follow-up event, which is handled before anything else happens.
    fn feed(&mut self, event: SessionEvent) {
        let mut queue = VecDeque::new();
        queue.push_back(event);
        while let Some(event) = queue.pop_front() {
            let effects = match self.session.as_mut() {
                Some(session) => session.handle(event),
                None => {
                    eprintln!("[supervisor] no session for event, discarding");
                    break;
                }
            };
            for effect in effects {
                if let Some(follow_up) = self.perform(effect) {
                    // A failed step invalidates the rest of its batch.
                    let failed = matches!(follow_up, SessionEvent::StepFailed { .. });
                    queue.push_back(follow_up);
                    if failed {
                        break;
                    }
                }
            }
        }
        self.reap_session();
        self.sync_state();
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<SessionEvent> = VecDeque::new();
        for effect in effects {
            if let Some(follow_up) = self.perform(effect) {
                let failed = matches!(follow_up, SessionEvent::StepFailed { .. });
                queue.push_back(follow_up);
                if failed {
                    break;
                }
            }
        }
        while let Some(event) = queue.pop_front() {
            self.feed(event);
        }
        self.reap_session();
        self.sync_state();
    }

    /// Execute one effect. Returns the completion event to feed back, if
    /// the effect has one.
    fn perform(&mut self, effect: Effect) -> Option<SessionEvent> {
        match effect {
            Effect::OpenChannel => {
                let policy = self.config.channel_policy;
                match self.transport.as_mut() {
                    Some(t) => match t.open_channel(&policy) {
                        Ok(()) => None,
                        Err(e) => Some(SessionEvent::StepFailed {
                            reason: e.to_string(),
                        }),
                    },
                    None => None,
                }
            }
            Effect::CreateOffer => {
                let payload = match self.transport.as_mut()?.create_offer() {
                    Ok(p) => p,
                    Err(e) => {
                        return Some(SessionEvent::StepFailed {
                            reason: e.to_string(),
                        })
                    }
                };
                match self.send_signal(payload) {
                    Ok(()) => Some(SessionEvent::OfferSent),
                    Err(e) => Some(SessionEvent::StepFailed {
                        reason: e.to_string(),
                    }),
                }
            }
            Effect::CreateAnswer => {
                let payload = match self.transport.as_mut()?.create_answer() {
                    Ok(p) => p,
                    Err(e) => {
                        return Some(SessionEvent::StepFailed {
                            reason: e.to_string(),
                        })
                    }
                };
                match self.send_signal(payload) {
                    Ok(()) => Some(SessionEvent::AnswerSent),
                    Err(e) => Some(SessionEvent::StepFailed {
                        reason: e.to_string(),
                    }),
                }
            }
            Effect::RollbackLocal => match self.transport.as_mut()?.rollback_local() {
                Ok(()) => None,
                Err(e) => Some(SessionEvent::StepFailed {
                    reason: e.to_string(),
                }),
            },
            Effect::ApplyRemoteDescription(description) => {
                match self.transport.as_mut()?.apply_remote_description(&description) {
                    Ok(()) => None,
                    Err(e) => Some(SessionEvent::StepFailed {
                        reason: e.to_string(),
                    }),
                }
            }
            Effect::ApplyCandidate(candidate) => {
                // A bad candidate is skipped; the rest of the batch and the
                // session continue.
                if let Some(t) = self.transport.as_mut() {
                    if let Err(e) = t.add_candidate(&candidate) {
                        eprintln!("[supervisor] skipping candidate: {}", e);
                    }
                }
                None
            }
            Effect::CloseTransport => {
                if let Some(mut t) = self.transport.take() {
                    t.close();
                }
                None
            }
            Effect::NotifyUser(message) => {
                eprintln!("[supervisor] {}", message);
                self.notices.push(message);
                None
            }
        }
    }

    fn send_signal(&mut self, payload: serde_json::Value) -> Result<(), SupervisorError> {
        let to = match &self.session {
            Some(s) => s.remote_peer().to_string(),
            None => return Err(SupervisorError::NotConnected),
        };
        let link = self.link.as_mut().ok_or(SupervisorError::NotConnected)?;
        link.send(&ClientEvent::Signal { to, payload })?;
        Ok(())
    }

    /// Drop a session that tore itself down, so the next peer starts clean.
    fn reap_session(&mut self) {
        if self.session.as_ref().is_some_and(|s| s.is_torn_down()) {
            self.session = None;
            if let Some(mut t) = self.transport.take() {
                t.close();
            }
        }
    }

    fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            for effect in session.teardown() {
                self.perform(effect);
            }
        }
        if let Some(mut t) = self.transport.take() {
            t.close();
        }
    }

    fn sync_state(&mut self) {
        if self.link.is_none() {
            self.state = ConnectionState::Disconnected;
            return;
        }
        self.state = match &self.session {
            None => ConnectionState::Waiting,
            Some(s) => match s.phase() {
                Phase::Established => ConnectionState::Connected,
                Phase::Waiting => ConnectionState::Waiting,
                _ => ConnectionState::Signaling,
            },
        };
    }

    // ── Transport events ────────────────────────────────────

    fn drain_transport(&mut self) {
        let events = match self.transport.as_mut() {
            Some(t) => t.poll_events(),
            None => return,
        };
        for event in events {
            self.on_transport_event(event);
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let to = match &self.session {
                    Some(s) => s.remote_peer().to_string(),
                    None => return,
                };
                if let Some(link) = self.link.as_mut() {
                    if let Err(e) = link.send(&ClientEvent::IceCandidate { to, candidate }) {
                        eprintln!("[supervisor] failed to forward candidate: {}", e);
                    }
                }
            }
            TransportEvent::ChannelOpened => {
                self.feed(SessionEvent::ChannelOpened);
                // Introduce ourselves as soon as the channel is usable.
                let frame = encode_channel_message(&self.channel.on_open());
                if let Some(t) = self.transport.as_mut() {
                    if let Err(e) = t.send_message(&frame) {
                        eprintln!("[supervisor] failed to send identity: {}", e);
                    }
                }
            }
            TransportEvent::ChannelMessage(bytes) => match parse_channel_message(&bytes) {
                Ok(msg) => self.channel.receive(msg),
                Err(e) => eprintln!("[supervisor] dropping malformed channel frame: {}", e),
            },
            TransportEvent::ChannelClosed => {
                eprintln!("[supervisor] data channel closed");
            }
            TransportEvent::Failed(reason) => {
                self.feed(SessionEvent::TransportFailed { reason });
            }
        }
    }

    // ── Chat ────────────────────────────────────────────────

    /// Send a chat line. Only valid while the channel is open.
    pub fn send_chat(&mut self, content: &str) -> Result<(), SupervisorError> {
        if self.state != ConnectionState::Connected {
            return Err(SupervisorError::NotConnected);
        }
        let msg = self.channel.send_chat(content);
        let frame = encode_channel_message(&msg);
        self.transport
            .as_mut()
            .ok_or(SupervisorError::NotConnected)?
            .send_message(&frame)?;
        Ok(())
    }

    /// Change the local display name. Applied to history immediately and
    /// announced to the peer if a channel is open.
    pub fn set_display_name(&mut self, name: &str) {
        let msg = self.channel.update_local_name(name);
        if self.state != ConnectionState::Connected {
            return;
        }
        let frame = encode_channel_message(&msg);
        if let Some(t) = self.transport.as_mut() {
            if let Err(e) = t.send_message(&frame) {
                eprintln!("[supervisor] failed to announce rename: {}", e);
            }
        }
    }

    /// Leave the room and close everything down.
    pub fn shutdown(&mut self) {
        self.drop_session();
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.state = ConnectionState::Disconnected;
    }
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelMessage;
    use crate::transport::ChannelPolicy;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    // Scripted relay link: events to deliver, plus a log of what the
    // supervisor sent.
    #[derive(Default)]
    struct FakeLinkState {
        inbox: VecDeque<ServerEvent>,
        sent: Vec<ClientEvent>,
        fail_recv: bool,
        connects: u32,
    }

    #[derive(Clone)]
    struct LinkHandle(Rc<RefCell<FakeLinkState>>);

    impl LinkHandle {
        fn new() -> Self {
            Self(Rc::new(RefCell::new(FakeLinkState::default())))
        }

        fn push(&self, event: ServerEvent) {
            self.0.borrow_mut().inbox.push_back(event);
        }

        fn sent(&self) -> Vec<ClientEvent> {
            self.0.borrow().sent.clone()
        }

        fn kill(&self) {
            self.0.borrow_mut().fail_recv = true;
        }

        fn connects(&self) -> u32 {
            self.0.borrow().connects
        }
    }

    struct FakeLink(LinkHandle);

    impl SignalingLink for FakeLink {
        fn send(&mut self, event: &ClientEvent) -> Result<(), LinkError> {
            self.0 .0.borrow_mut().sent.push(event.clone());
            Ok(())
        }

        fn recv(&mut self, _timeout: Duration) -> Result<Option<ServerEvent>, LinkError> {
            let mut state = self.0 .0.borrow_mut();
            if state.fail_recv {
                return Err(LinkError("connection reset".to_string()));
            }
            Ok(state.inbox.pop_front())
        }

        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct FakeTransportState {
        events: VecDeque<TransportEvent>,
        sent_frames: Vec<Vec<u8>>,
        offers: u32,
        answers: u32,
        remote_descriptions: Vec<serde_json::Value>,
        applied_candidates: Vec<serde_json::Value>,
        candidate_calls: u32,
        channel_opened: bool,
        closed: bool,
        fail_offer: bool,
        /// 1-based call index at which `add_candidate` fails.
        fail_candidate_at: Option<u32>,
    }

    #[derive(Clone)]
    struct TransportHandle(Rc<RefCell<FakeTransportState>>);

    impl TransportHandle {
        fn new() -> Self {
            Self(Rc::new(RefCell::new(FakeTransportState::default())))
        }

        fn push(&self, event: TransportEvent) {
            self.0.borrow_mut().events.push_back(event);
        }

        fn frames(&self) -> Vec<ChannelMessage> {
            self.0
                .borrow()
                .sent_frames
                .iter()
                .map(|f| parse_channel_message(f).expect("well-formed frame"))
                .collect()
        }
    }

    struct FakeTransport(TransportHandle);

    impl PeerTransport for FakeTransport {
        fn create_offer(&mut self) -> Result<serde_json::Value, TransportError> {
            let mut state = self.0 .0.borrow_mut();
            if state.fail_offer {
                return Err(TransportError("offer creation failed".to_string()));
            }
            state.offers += 1;
            Ok(json!({"type": "offer", "sdp": "local"}))
        }

        fn create_answer(&mut self) -> Result<serde_json::Value, TransportError> {
            self.0 .0.borrow_mut().answers += 1;
            Ok(json!({"type": "answer", "sdp": "local"}))
        }

        fn apply_remote_description(
            &mut self,
            description: &serde_json::Value,
        ) -> Result<(), TransportError> {
            self.0
                 .0
                .borrow_mut()
                .remote_descriptions
                .push(description.clone());
            Ok(())
        }

        fn add_candidate(&mut self, candidate: &serde_json::Value) -> Result<(), TransportError> {
            let mut state = self.0 .0.borrow_mut();
            state.candidate_calls += 1;
            if state.fail_candidate_at == Some(state.candidate_calls) {
                return Err(TransportError("candidate rejected".to_string()));
            }
            state.applied_candidates.push(candidate.clone());
            Ok(())
        }

        fn rollback_local(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn open_channel(&mut self, _policy: &ChannelPolicy) -> Result<(), TransportError> {
            self.0 .0.borrow_mut().channel_opened = true;
            Ok(())
        }

        fn send_message(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.0 .0.borrow_mut().sent_frames.push(bytes.to_vec());
            Ok(())
        }

        fn poll_events(&mut self) -> Vec<TransportEvent> {
            self.0 .0.borrow_mut().events.drain(..).collect()
        }

        fn close(&mut self) {
            self.0 .0.borrow_mut().closed = true;
        }
    }

    fn supervisor(
        link: &LinkHandle,
        transport: &TransportHandle,
    ) -> ConnectionSupervisor<FakeLink, FakeTransport> {
        let link = link.clone();
        let transport = transport.clone();
        let mut config = ClientConfig::default();
        config.reconnect_attempts = 3;
        ConnectionSupervisor::new(
            config,
            "demo-room",
            Participant {
                id: "local".to_string(),
                name: "Alice".to_string(),
            },
            Box::new(move |_url| {
                link.0.borrow_mut().connects += 1;
                link.0.borrow_mut().fail_recv = false;
                Ok(FakeLink(link.clone()))
            }),
            Box::new(move |_config| Ok(FakeTransport(transport.clone()))),
        )
    }

    fn welcome(peer_id: &str) -> ServerEvent {
        ServerEvent::Welcome {
            peer_id: peer_id.to_string(),
        }
    }

    fn room_joined(peers: &[&str]) -> ServerEvent {
        ServerEvent::RoomJoined {
            room_id: "demo-room".to_string(),
            peers: peers.iter().map(|p| p.to_string()).collect(),
            is_initiator: !peers.is_empty(),
        }
    }

    #[test]
    fn first_joiner_waits_for_a_peer() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        link.push(welcome("aaaa"));
        link.push(room_joined(&[]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");

        assert_eq!(sup.state(), ConnectionState::Waiting);
        assert_eq!(sup.local_peer_id(), Some("aaaa"));
        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], ClientEvent::JoinRoom { room_id } if room_id == "demo-room"));
    }

    #[test]
    fn second_joiner_offers_to_the_occupant() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        link.push(welcome("bbbb"));
        link.push(room_joined(&["aaaa"]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");

        assert_eq!(sup.state(), ConnectionState::Signaling);
        assert!(transport.0.borrow().channel_opened);
        assert_eq!(transport.0.borrow().offers, 1);
        let sent = link.sent();
        assert!(matches!(&sent[1],
            ClientEvent::Signal { to, payload }
                if to == "aaaa" && payload["type"] == "offer"));
    }

    #[test]
    fn handshake_error_event_fails_the_connect() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        for _ in 0..3 {
            link.push(welcome("cccc"));
            link.push(ServerEvent::Error {
                message: "Room is full".to_string(),
            });
        }

        let mut sup = supervisor(&link, &transport);
        let err = sup.connect().expect_err("room is full");
        assert!(matches!(err, SupervisorError::Handshake(m) if m == "Room is full"));
        assert_eq!(sup.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn responder_answers_an_incoming_offer() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        link.push(welcome("aaaa"));
        link.push(room_joined(&[]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");

        link.push(ServerEvent::PeerJoined {
            peer_id: "bbbb".to_string(),
        });
        link.push(ServerEvent::Signal {
            from: "bbbb".to_string(),
            payload: json!({"type": "offer", "sdp": "remote"}),
        });
        sup.pump(Duration::ZERO).expect("pump");
        sup.pump(Duration::ZERO).expect("pump");

        assert_eq!(sup.state(), ConnectionState::Signaling);
        assert_eq!(transport.0.borrow().answers, 1);
        assert_eq!(transport.0.borrow().remote_descriptions.len(), 1);
        let sent = link.sent();
        assert!(matches!(sent.last(),
            Some(ClientEvent::Signal { to, payload })
                if to == "bbbb" && payload["type"] == "answer"));
    }

    #[test]
    fn offer_outrunning_peer_joined_still_gets_answered() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        link.push(welcome("aaaa"));
        link.push(room_joined(&[]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");

        link.push(ServerEvent::Signal {
            from: "bbbb".to_string(),
            payload: json!({"type": "offer", "sdp": "remote"}),
        });
        sup.pump(Duration::ZERO).expect("pump");

        assert_eq!(transport.0.borrow().answers, 1);
    }

    #[test]
    fn channel_open_promotes_to_connected_and_sends_identity() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        link.push(welcome("bbbb"));
        link.push(room_joined(&["aaaa"]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");

        link.push(ServerEvent::Signal {
            from: "aaaa".to_string(),
            payload: json!({"type": "answer", "sdp": "remote"}),
        });
        sup.pump(Duration::ZERO).expect("pump");
        transport.push(TransportEvent::ChannelOpened);
        sup.pump(Duration::ZERO).expect("pump");

        assert_eq!(sup.state(), ConnectionState::Connected);
        let frames = transport.frames();
        assert!(matches!(&frames[0],
            ChannelMessage::Identity { participant } if participant.name == "Alice"));
    }

    #[test]
    fn local_candidates_are_forwarded_to_the_remote_peer() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        link.push(welcome("bbbb"));
        link.push(room_joined(&["aaaa"]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");

        transport.push(TransportEvent::LocalCandidate(json!({"candidate": "c1"})));
        sup.pump(Duration::ZERO).expect("pump");

        let sent = link.sent();
        assert!(matches!(sent.last(),
            Some(ClientEvent::IceCandidate { to, candidate })
                if to == "aaaa" && candidate["candidate"] == "c1"));
    }

    #[test]
    fn one_bad_candidate_does_not_stop_the_flush() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        transport.0.borrow_mut().fail_candidate_at = Some(2);
        link.push(welcome("aaaa"));
        link.push(room_joined(&[]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");

        // Candidates outrun the offer and buffer inside the session.
        for n in 0..3 {
            link.push(ServerEvent::IceCandidate {
                from: "bbbb".to_string(),
                candidate: json!({"candidate": format!("candidate:{n}")}),
            });
            sup.pump(Duration::ZERO).expect("pump");
        }
        link.push(ServerEvent::Signal {
            from: "bbbb".to_string(),
            payload: json!({"type": "offer", "sdp": "remote"}),
        });
        sup.pump(Duration::ZERO).expect("pump");

        // The middle candidate was rejected; the others applied in order
        // and the answer still went out.
        {
            let state = transport.0.borrow();
            assert_eq!(state.candidate_calls, 3);
            assert_eq!(state.applied_candidates.len(), 2);
            assert_eq!(state.applied_candidates[0]["candidate"], "candidate:0");
            assert_eq!(state.applied_candidates[1]["candidate"], "candidate:2");
            assert_eq!(state.answers, 1);
        }
        assert_eq!(sup.state(), ConnectionState::Signaling);
        let sent = link.sent();
        assert!(matches!(sent.last(),
            Some(ClientEvent::Signal { payload, .. }) if payload["type"] == "answer"));
    }

    #[test]
    fn chat_requires_an_open_channel() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        link.push(welcome("aaaa"));
        link.push(room_joined(&[]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");

        let err = sup.send_chat("hello").expect_err("no channel yet");
        assert!(matches!(err, SupervisorError::NotConnected));
    }

    #[test]
    fn peer_left_tears_down_and_returns_to_waiting() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        link.push(welcome("bbbb"));
        link.push(room_joined(&["aaaa"]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");

        transport.push(TransportEvent::ChannelOpened);
        sup.pump(Duration::ZERO).expect("pump");
        assert_eq!(sup.state(), ConnectionState::Connected);

        link.push(ServerEvent::PeerLeft {
            peer_id: "aaaa".to_string(),
        });
        sup.pump(Duration::ZERO).expect("pump");

        assert_eq!(sup.state(), ConnectionState::Waiting);
        assert!(transport.0.borrow().closed);
    }

    #[test]
    fn link_loss_reconnects_and_rejoins_once() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        link.push(welcome("aaaa"));
        link.push(room_joined(&[]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");
        assert_eq!(link.connects(), 1);

        // Queue the replacement handshake, then kill the current link.
        link.push(welcome("dddd"));
        link.push(room_joined(&[]));
        link.kill();
        sup.pump(Duration::ZERO).expect("reconnects");

        assert_eq!(link.connects(), 2);
        assert_eq!(sup.local_peer_id(), Some("dddd"));
        let joins = link
            .sent()
            .iter()
            .filter(|e| matches!(e, ClientEvent::JoinRoom { .. }))
            .count();
        assert_eq!(joins, 2);
        assert_eq!(sup.state(), ConnectionState::Waiting);
    }

    #[test]
    fn chat_history_survives_a_reconnect() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        link.push(welcome("bbbb"));
        link.push(room_joined(&["aaaa"]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");
        transport.push(TransportEvent::ChannelOpened);
        sup.pump(Duration::ZERO).expect("pump");
        sup.send_chat("still here?").expect("chat sends");

        link.push(welcome("eeee"));
        link.push(room_joined(&[]));
        link.kill();
        sup.pump(Duration::ZERO).expect("reconnects");

        let history = sup.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "still here?");
        assert!(history[0].mine);
    }

    #[test]
    fn failed_offer_creation_recovers_to_waiting() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        transport.0.borrow_mut().fail_offer = true;
        link.push(welcome("bbbb"));
        link.push(room_joined(&["aaaa"]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake itself succeeds");

        assert_eq!(sup.state(), ConnectionState::Waiting);
        let notices = sup.take_notices();
        assert!(notices.iter().any(|n| n.contains("negotiation failed")));
    }

    #[test]
    fn transport_failure_surfaces_the_network_notice() {
        let link = LinkHandle::new();
        let transport = TransportHandle::new();
        link.push(welcome("bbbb"));
        link.push(room_joined(&["aaaa"]));

        let mut sup = supervisor(&link, &transport);
        sup.connect().expect("handshake succeeds");

        transport.push(TransportEvent::Failed("ice failed".to_string()));
        sup.pump(Duration::ZERO).expect("pump");

        assert_eq!(sup.state(), ConnectionState::Waiting);
        let notices = sup.take_notices();
        assert!(notices
            .iter()
            .any(|n| n.contains("different network")));
    }
}
