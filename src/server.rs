//! WebSocket front end for the signaling relay.
//!
//! Thread-per-connection: each accepted socket gets a registered relay
//! connection and a polling loop that alternates between draining the
//! connection's outbox and reading client frames. A background thread
//! sweeps idle rooms on the configured interval.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::{Message, WebSocket};

use crate::config::RelayConfig;
use crate::protocol::{encode_server_event, parse_client_event};
use crate::relay::SignalingRelay;

/// Read timeout for the per-connection polling loop. Low enough to drain
/// the outbox promptly, high enough to avoid busy-spinning.
const POLL_READ_TIMEOUT: Duration = Duration::from_millis(50);

type WsStream = WebSocket<TcpStream>;

/// A bound relay server, not yet accepting.
pub struct RelayServer {
    listener: TcpListener,
    relay: SignalingRelay,
    config: RelayConfig,
}

impl RelayServer {
    /// Bind the listen socket. Port 0 picks an ephemeral port, which
    /// `local_addr` then reports.
    pub fn bind(config: RelayConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        let relay = SignalingRelay::new(config.room_retention);
        Ok(Self {
            listener,
            relay,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> &SignalingRelay {
        &self.relay
    }

    /// Accept loop. Runs until the process exits.
    pub fn run(self) -> io::Result<()> {
        let sweeper = self.relay.clone();
        let interval = self.config.sweep_interval;
        thread::spawn(move || loop {
            thread::sleep(interval);
            let reclaimed = sweeper.sweep(Instant::now());
            if reclaimed > 0 {
                eprintln!("[relay] reclaimed {} idle room(s)", reclaimed);
            }
        });

        loop {
            let (stream, addr) = self.listener.accept()?;
            let relay = self.relay.clone();
            let config = self.config.clone();
            thread::spawn(move || {
                if let Err(e) = serve_client(stream, relay, &config) {
                    eprintln!("[relay] connection from {} ended: {}", addr, e);
                }
            });
        }
    }
}

/// Complete the WebSocket handshake, enforcing the origin allow-list.
fn accept_client(stream: TcpStream, config: &RelayConfig) -> Result<WsStream, Box<dyn std::error::Error>> {
    let allowed = config.clone();
    let ws = tungstenite::accept_hdr(stream, move |req: &Request, response: Response| {
        let origin = req
            .headers()
            .get("Origin")
            .and_then(|v| v.to_str().ok());
        if allowed.origin_allowed(origin) {
            Ok(response)
        } else {
            eprintln!("[relay] refusing connection from origin {:?}", origin);
            let mut refusal = ErrorResponse::new(Some("origin not allowed".to_string()));
            *refusal.status_mut() = StatusCode::FORBIDDEN;
            Err(refusal)
        }
    })
    .map_err(|e| format!("websocket handshake failed: {}", e))?;
    Ok(ws)
}

/// One connection: register, then poll until the client goes away.
fn serve_client(
    stream: TcpStream,
    relay: SignalingRelay,
    config: &RelayConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut ws = accept_client(stream, config)?;
    ws.get_ref().set_read_timeout(Some(POLL_READ_TIMEOUT))?;

    let (mut conn, outbox) = relay.register();
    eprintln!("[relay] client connected as '{}'", conn.peer_id());

    loop {
        // Outbox first so events queued by other connections go out even
        // while this client is quiet.
        while let Ok(event) = outbox.try_recv() {
            ws.send(Message::Text(encode_server_event(&event)))?;
        }

        match ws.read() {
            Ok(msg) if msg.is_ping() || msg.is_pong() => continue,
            Ok(Message::Text(text)) => match parse_client_event(&text) {
                Ok(event) => conn.handle(event, Instant::now()),
                Err(e) => {
                    eprintln!("[relay] '{}' sent a malformed event: {}", conn.peer_id(), e);
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(other) => {
                eprintln!("[relay] '{}' sent an unexpected frame: {:?}", conn.peer_id(), other);
            }
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed) => break,
            Err(e) => return Err(e.into()),
        }
    }

    eprintln!("[relay] client '{}' disconnected", conn.peer_id());
    conn.disconnect();
    Ok(())
}
