//! WebSocket relay
//!
//! Accepts WebSocket sessions and relays every message received on one
//! session to all connected sessions. Payloads are forwarded untouched.
//!
//! A single coordinator task owns the peer table; connection tasks only
//! talk to it through a channel, so relayed messages from one session
//! keep their order.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use chatter_ws::{Command, Config, Connection, ConnectionHandle, Event};

/// Relay every WebSocket message to all connected sessions
#[derive(Debug, Parser)]
#[command(name = "chatter-relay", version)]
struct Cli {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "CHATTER_BIND")]
    bind: String,

    /// TCP port to listen on
    #[arg(long, default_value_t = 3210, env = "CHATTER_PORT")]
    port: u16,

    /// Largest accepted frame or message, in bytes
    #[arg(long, default_value_t = 1024 * 1024, env = "CHATTER_MAX_PAYLOAD")]
    max_payload: usize,

    /// Subprotocols to accept, comma-separated
    #[arg(long, default_value = "json", env = "CHATTER_PROTOCOL", value_delimiter = ',')]
    protocol: Vec<String>,
}

impl Cli {
    fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.bind, self.port))
    }

    fn config(&self) -> Config {
        self.protocol
            .iter()
            .filter(|p| !p.is_empty())
            .fold(
                Config::builder().max_payload_length(self.max_payload),
                |builder, p| builder.protocol(p.as_str()),
            )
            .build()
    }
}

/// What connection tasks report to the coordinator
#[derive(Debug)]
enum RelayEvent {
    Joined { id: u64, handle: ConnectionHandle },
    Session { id: u64, event: Event },
    Left { id: u64 },
}

/// Owns the peer table and handles one event at a time
async fn coordinator(mut rx: mpsc::Receiver<RelayEvent>) {
    let mut peers: HashMap<u64, ConnectionHandle> = HashMap::new();

    while let Some(event) = rx.recv().await {
        match event {
            RelayEvent::Joined { id, handle } => {
                peers.insert(id, handle);
                info!(id, peers = peers.len(), "peer joined");
            }
            RelayEvent::Session {
                id,
                event: Event::Message { payload, is_text },
            } => {
                debug!(id, len = payload.len(), "relaying message");
                peers.retain(|peer, handle| {
                    let command = Command::Send {
                        payload: payload.clone(),
                        is_text,
                    };
                    match handle.try_command(command) {
                        Ok(()) => true,
                        Err(chatter_ws::Error::ConnectionClosed) => false,
                        Err(err) => {
                            // A peer that cannot keep up misses the message
                            warn!(peer, error = %err, "dropping relayed message");
                            true
                        }
                    }
                });
            }
            RelayEvent::Session {
                id,
                event: Event::PeerClose { code, reason },
            } => {
                info!(id, code, reason = %reason, "peer closed");
                peers.remove(&id);
            }
            RelayEvent::Session {
                id,
                event: Event::Error(kind),
            } => {
                warn!(id, ?kind, "session failed");
                peers.remove(&id);
            }
            RelayEvent::Session {
                event: Event::Pong(_),
                ..
            } => {}
            RelayEvent::Left { id } => {
                if peers.remove(&id).is_some() {
                    info!(id, peers = peers.len(), "peer left");
                }
            }
        }
    }
}

async fn serve(id: u64, stream: TcpStream, config: Config, relay: mpsc::Sender<RelayEvent>) {
    let conn = match Connection::accept(stream, config).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(id, error = %err, "handshake failed");
            return;
        }
    };
    debug!(id, path = ?conn.path(), protocol = ?conn.subprotocol(), "session open");

    let (handle, commands) = conn.command_channel();
    if relay.send(RelayEvent::Joined { id, handle }).await.is_err() {
        return;
    }

    conn.run(relay.clone(), commands, move |event| RelayEvent::Session { id, event })
        .await;
    let _ = relay.send(RelayEvent::Left { id }).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let addr = cli.addr()?;
    let config = cli.config();

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, protocols = ?config.protocols, "relay listening");

    let (relay_tx, relay_rx) = mpsc::channel(1024);
    tokio::spawn(coordinator(relay_rx));

    let mut next_id = 0u64;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                stream.set_nodelay(true).ok();
                next_id += 1;
                debug!(id = next_id, %peer, "accepted connection");
                tokio::spawn(serve(next_id, stream, config.clone(), relay_tx.clone()));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
