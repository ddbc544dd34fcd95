//! pairlink-relay — room-scoped signaling relay for two-party chat.
//!
//! Usage: pairlink-relay [--port <PORT>] [--allow-origin <ORIGIN>]...
//!
//! Environment: PAIRLINK_PORT, PAIRLINK_ALLOWED_ORIGINS (comma-separated).
//! CLI flags override the environment.

use pairlink::config::RelayConfig;
use pairlink::server::RelayServer;

fn parse_args(config: &mut RelayConfig) {
    let argv: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--port" => {
                i += 1;
                config.port = match argv.get(i).and_then(|s| s.parse::<u16>().ok()) {
                    Some(p) if p > 0 => p,
                    _ => {
                        eprintln!("--port requires a valid port number (1-65535)");
                        std::process::exit(1);
                    }
                };
            }
            "--allow-origin" => {
                i += 1;
                match argv.get(i) {
                    Some(origin) if !origin.is_empty() => {
                        config.allowed_origins.push(origin.clone());
                    }
                    _ => {
                        eprintln!("--allow-origin requires an origin, e.g. https://chat.example.com");
                        std::process::exit(1);
                    }
                }
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!("Usage: pairlink-relay [--port <PORT>] [--allow-origin <ORIGIN>]...");
                std::process::exit(1);
            }
        }
        i += 1;
    }
}

fn main() {
    let mut config = RelayConfig::from_env();
    parse_args(&mut config);

    let server = match RelayServer::bind(config.clone()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[relay] FATAL: cannot bind port {}: {}", config.port, e);
            std::process::exit(1);
        }
    };

    eprintln!("[relay] listening on port {}", config.port);
    if config.allowed_origins.is_empty() {
        eprintln!("[relay] origin check disabled (no allow-list configured)");
    } else {
        eprintln!("[relay] allowed origins: {}", config.allowed_origins.join(", "));
    }

    if let Err(e) = server.run() {
        eprintln!("[relay] FATAL: accept loop failed: {}", e);
        std::process::exit(1);
    }
}
