//! Per-connection relay loop.
//!
//! A [`Relay`] owns one accepted client for its whole life:
//!
//! ```text
//! Connecting ──> Active ──> Closing ──> Closed
//!      │                       ▲
//!      └── connect failed ─────┘
//! ```
//!
//! While `Active` it blocks until either socket is readable, optionally
//! sleeps for the defrag delay, then services the client side and the
//! server side in that order. A zero-length read from either side, or any
//! I/O error, moves it to `Closing`, where both sockets are shut down and a
//! single disconnect line is logged.

use crate::callback::{Callback, Direction, Pipeline};
use crate::connection::ConnectionPair;
use crate::log::ConnectionLog;
use crate::Error;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Why a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosedBy {
    /// Client closed its socket.
    Client,
    /// Server closed its socket.
    Server,
    /// The outbound connection could not be established.
    ConnectFailed(String),
    /// Read or write failure on an established socket.
    Error(String),
}

/// Traffic counters for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub messages_up: u64,
    pub bytes_up: u64,
    pub messages_down: u64,
    pub bytes_down: u64,
    pub closed_by: Option<ClosedBy>,
}

impl RelayStats {
    fn record(&mut self, direction: Direction, bytes: usize) {
        match direction {
            Direction::ClientToServer => {
                self.messages_up += 1;
                self.bytes_up += bytes as u64;
            }
            Direction::ServerToClient => {
                self.messages_down += 1;
                self.bytes_down += bytes as u64;
            }
        }
    }
}

/// Where client messages go.
#[derive(Debug, Clone)]
pub enum Target {
    /// Forward to a real server at this address.
    Remote(String),
    /// Answer locally with this handler.
    Sink(Callback),
}

/// Read-side settings captured when the connection is accepted.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub client_chunk_size: usize,
    pub server_chunk_size: usize,
    pub defrag_delay: Option<Duration>,
}

/// Relay loop for one accepted connection.
#[derive(Debug)]
pub struct Relay {
    id: u64,
    target: Target,
    pipeline: Pipeline,
    settings: RelaySettings,
    log: ConnectionLog,
    stats: RelayStats,
}

impl Relay {
    pub fn new(
        id: u64,
        target: Target,
        pipeline: Pipeline,
        settings: RelaySettings,
        log: ConnectionLog,
    ) -> Self {
        Self {
            id,
            target,
            pipeline,
            settings,
            log,
            stats: RelayStats::default(),
        }
    }

    /// Serve `client` until either side disconnects.
    ///
    /// Runs the whole lifecycle (connecting, active, closing) and returns
    /// once both sockets are closed.
    pub async fn run(mut self, client: TcpStream) -> RelayStats {
        let mut pair = ConnectionPair::new(self.id, client, None);
        let peer = pair
            .peer()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        self.log.event(&format!("connect #{} from {}", self.id, peer));

        let closed_by = match self.connect(&mut pair).await {
            Ok(()) => self.pump(&mut pair).await,
            Err(e) => {
                warn!(conn = self.id, error = %e, "Outbound connect failed");
                ClosedBy::ConnectFailed(e.to_string())
            }
        };

        pair.close().await;
        self.log.event(&disconnect_line(self.id, &closed_by));
        debug!(conn = self.id, closed_by = ?closed_by, "Connection closed");

        self.stats.closed_by = Some(closed_by);
        self.stats
    }

    async fn connect(&mut self, pair: &mut ConnectionPair) -> crate::Result<()> {
        let Target::Remote(addr) = &self.target else {
            return Ok(());
        };

        let server = TcpStream::connect(addr).await.map_err(|source| Error::Connect {
            addr: addr.clone(),
            source,
        })?;
        debug!(conn = self.id, server = %addr, "Connected to server");
        if self.log.is_debug() {
            self.log.event(&format!("connected to server {}", addr));
        }
        pair.attach_server(server);
        Ok(())
    }

    async fn pump(&mut self, pair: &mut ConnectionPair) -> ClosedBy {
        let mut client_buf = vec![0u8; self.settings.client_chunk_size];
        let mut server_buf = if pair.has_server() {
            vec![0u8; self.settings.server_chunk_size]
        } else {
            Vec::new()
        };

        loop {
            if let Err(e) = pair.readable().await {
                return ClosedBy::Error(e.to_string());
            }

            if let Some(delay) = self.settings.defrag_delay {
                tokio::time::sleep(delay).await;
            }

            match pair.try_recv_client(&mut client_buf) {
                Ok(Some(0)) => return ClosedBy::Client,
                Ok(Some(n)) => {
                    let message = client_buf[..n].to_vec();
                    if let Err(e) = self.on_client_message(pair, message).await {
                        return ClosedBy::Error(e.to_string());
                    }
                }
                Ok(None) => {}
                Err(e) => return ClosedBy::Error(e.to_string()),
            }

            if !pair.has_server() {
                continue;
            }

            match pair.try_recv_server(&mut server_buf) {
                Ok(Some(0)) => return ClosedBy::Server,
                Ok(Some(n)) => {
                    let message = server_buf[..n].to_vec();
                    if let Err(e) = self.on_server_message(pair, message).await {
                        return ClosedBy::Error(e.to_string());
                    }
                }
                Ok(None) => {}
                Err(e) => return ClosedBy::Error(e.to_string()),
            }
        }
    }

    async fn on_client_message(
        &mut self,
        pair: &mut ConnectionPair,
        message: Vec<u8>,
    ) -> io::Result<()> {
        let message = self.transform(Direction::ClientToServer, message);
        self.record("client -> server", Direction::ClientToServer, &message);

        let reply = match &self.target {
            Target::Remote(_) => None,
            Target::Sink(handler) => {
                Some(handler.call(&message).unwrap_or_else(|| message.clone()))
            }
        };

        match reply {
            None => pair.send_server(&message).await,
            Some(reply) => {
                self.record("handler -> client", Direction::ServerToClient, &reply);
                pair.send_client(&reply).await
            }
        }
    }

    async fn on_server_message(
        &mut self,
        pair: &mut ConnectionPair,
        message: Vec<u8>,
    ) -> io::Result<()> {
        let message = self.transform(Direction::ServerToClient, message);
        self.record("server -> client", Direction::ServerToClient, &message);
        pair.send_client(&message).await
    }

    fn transform(&self, direction: Direction, message: Vec<u8>) -> Vec<u8> {
        let applied = self.pipeline.apply(direction, message);
        if applied.invoked && self.log.is_debug() {
            let name = match direction {
                Direction::ClientToServer => "send",
                Direction::ServerToClient => "receive",
            };
            let outcome = if applied.replaced { "replaced" } else { "unchanged" };
            self.log
                .event(&format!("{} callback invoked, message {}", name, outcome));
        }
        applied.message
    }

    fn record(&mut self, label: &str, direction: Direction, message: &[u8]) {
        self.stats.record(direction, message.len());
        debug!(conn = self.id, direction = %direction, bytes = message.len(), "Relayed message");

        let line = if self.log.is_debug() {
            format!(
                "{}: {} bytes: {}",
                label,
                message.len(),
                String::from_utf8_lossy(message).escape_debug()
            )
        } else {
            format!("{}: {} bytes", label, message.len())
        };
        self.log.event(&line);
    }
}

fn disconnect_line(id: u64, closed_by: &ClosedBy) -> String {
    match closed_by {
        ClosedBy::Client => format!("disconnect #{}: client closed", id),
        ClosedBy::Server => format!("disconnect #{}: server closed", id),
        ClosedBy::ConnectFailed(e) => format!("disconnect #{}: {}", id, e),
        ClosedBy::Error(e) => format!("disconnect #{}: error: {}", id, e),
    }
}
