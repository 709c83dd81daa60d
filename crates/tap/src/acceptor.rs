//! The tap handle and its accept loop.
//!
//! [`Tap`] is the operator-facing handle: it holds the configuration, the
//! callbacks and the event log, and can be cloned freely so one copy can
//! adjust verbosity or the log file while another runs [`Tap::go`].
//!
//! Binding produces a [`BoundTap`], which accepts connections until its
//! cancellation token fires. In parallel mode every accepted connection gets
//! its own tokio task; in serial mode the acceptor runs the relay inline and
//! further clients wait in the listen backlog.

use crate::callback::{Callback, Pipeline};
use crate::config::{self, TapConfig, TapMode, Verbosity};
use crate::log::{Console, EventLog};
use crate::relay::{Relay, RelaySettings, Target};
use crate::timestamp::Timestamp;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Settings {
    config: TapConfig,
    send: Option<Callback>,
    receive: Option<Callback>,
    handler: Option<Callback>,
}

#[derive(Debug)]
struct Inner {
    settings: RwLock<Settings>,
    log: EventLog,
    connections: AtomicU64,
}

/// A man-in-the-middle relay between clients and one server.
#[derive(Debug, Clone)]
pub struct Tap {
    inner: Arc<Inner>,
}

impl Tap {
    /// Build a tap from a validated configuration.
    ///
    /// A sink-mode tap built this way echoes every message until a handler
    /// is set with [`Tap::handler`].
    pub fn from_config(config: TapConfig) -> Result<Self> {
        config.validate()?;

        let log = EventLog::new(config.verbosity);
        if let Some(path) = config.log_file.as_deref() {
            log.set_log_file(path);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                settings: RwLock::new(Settings {
                    config,
                    send: None,
                    receive: None,
                    handler: None,
                }),
                log,
                connections: AtomicU64::new(0),
            }),
        })
    }

    /// Full relay to `remote_host:remote_port`, listening on the same port.
    pub fn relay(remote_host: impl Into<String>, remote_port: u16) -> Result<Self> {
        Self::from_config(TapConfig::relay(remote_host, remote_port))
    }

    /// Sink on `local_port` answering every message with `handler`.
    pub fn sink(local_port: u16, handler: Callback) -> Result<Self> {
        let tap = Self::from_config(TapConfig::sink(local_port))?;
        tap.handler(handler);
        Ok(tap)
    }

    /// Listen on `port` instead of the remote port.
    pub fn local_port(self, port: u16) -> Self {
        self.inner.settings.write().config.local_port = Some(port);
        self
    }

    /// Set verbosity: 0 silent, 1 normal, 2 debug with payloads.
    pub fn verbose(&self, level: u8) {
        self.set_verbosity(Verbosity::from(level));
    }

    pub fn set_verbosity(&self, verbosity: Verbosity) {
        self.inner.settings.write().config.verbosity = verbosity;
        self.inner.log.set_verbosity(verbosity);
    }

    pub fn verbosity(&self) -> Verbosity {
        self.inner.log.verbosity()
    }

    /// Transform applied to client-to-server traffic.
    pub fn send_callback(&self, callback: Callback) {
        self.inner.settings.write().send = Some(callback);
    }

    /// Transform applied to server-to-client traffic.
    pub fn receive_callback(&self, callback: Callback) {
        self.inner.settings.write().receive = Some(callback);
    }

    /// Response handler for sink mode.
    pub fn handler(&self, callback: Callback) {
        self.inner.settings.write().handler = Some(callback);
    }

    pub fn parallel(&self, parallel: bool) {
        self.inner.settings.write().config.parallel = parallel;
    }

    /// Append events to `path`; an empty string turns logging off.
    ///
    /// Returns whether a log file is active afterwards. Failing to open the
    /// file is reported on the console, never fatal.
    pub fn log_file(&self, path: &str) -> bool {
        let active = self.inner.log.set_log_file(path);
        self.inner.settings.write().config.log_file = active.then(|| path.to_string());
        active
    }

    pub fn is_logging(&self) -> bool {
        self.inner.log.is_logging()
    }

    /// Sleep this long before each read; 0 disables.
    pub fn defrag_delay(&self, secs: f64) -> Result<()> {
        config::validate_defrag_delay(secs)?;
        self.inner.settings.write().config.defrag_delay_secs = secs;
        Ok(())
    }

    /// Replace the `HH:MM:SS` formatter used in log and echo lines.
    pub fn timestamp<F>(&self, f: F)
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.inner.log.set_timestamp(Timestamp::new(f));
    }

    /// Send console echo lines to `writer` instead of stdout.
    pub fn console<W>(&self, writer: W)
    where
        W: std::io::Write + Send + 'static,
    {
        self.inner.log.set_console(Console::new(writer));
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> TapConfig {
        self.inner.settings.read().config.clone()
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> u64 {
        self.inner.connections.load(Ordering::Relaxed)
    }

    /// Bind the listening socket.
    pub async fn bind(&self) -> Result<BoundTap> {
        let config = self.config();
        let addr = config.bind_address();

        let listener = bind_listener(&addr, config.backlog)
            .await
            .map_err(|source| Error::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(address = %local_addr, remote = ?config.remote_address(), "Tap listening");
        self.inner.log.event(&format!(
            "listening on {} -> {}",
            local_addr,
            config.remote_address().as_deref().unwrap_or("sink")
        ));

        Ok(BoundTap {
            tap: self.clone(),
            listener,
            limit: config
                .max_parallel_connections
                .map(|max| Arc::new(Semaphore::new(max))),
        })
    }

    /// Bind and serve forever.
    pub async fn go(&self) -> Result<()> {
        self.go_until(CancellationToken::new()).await
    }

    /// Bind and serve until `shutdown` is cancelled.
    pub async fn go_until(&self, shutdown: CancellationToken) -> Result<()> {
        self.bind().await?.serve(shutdown).await
    }

    /// Build the relay for connection `id` from the current settings.
    fn prepare(&self, id: u64) -> (Relay, bool) {
        let settings = self.inner.settings.read();
        let config = &settings.config;

        let target = match &config.mode {
            TapMode::Relay {
                remote_host,
                remote_port,
            } => Target::Remote(format!("{}:{}", remote_host, remote_port)),
            TapMode::Sink => Target::Sink(
                settings
                    .handler
                    .clone()
                    .unwrap_or_else(Callback::identity),
            ),
        };
        let pipeline = Pipeline::new(settings.send.clone(), settings.receive.clone());
        let relay_settings = RelaySettings {
            client_chunk_size: config.client_chunk_size,
            server_chunk_size: config.server_chunk_size,
            defrag_delay: config.defrag_delay(),
        };

        let relay = Relay::new(
            id,
            target,
            pipeline,
            relay_settings,
            self.inner.log.connection(id),
        );
        (relay, config.parallel)
    }
}

async fn bind_listener(addr: &str, backlog: u32) -> std::io::Result<TcpListener> {
    let sock_addr = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "address did not resolve")
    })?;

    let socket = match sock_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    // Windows lets a second socket steal a port bound with SO_REUSEADDR.
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(sock_addr)?;
    socket.listen(backlog)
}

/// A tap with a bound listener, ready to serve.
#[derive(Debug)]
pub struct BoundTap {
    tap: Tap,
    listener: TcpListener,
    limit: Option<Arc<Semaphore>>,
}

impl BoundTap {
    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tap(&self) -> &Tap {
        &self.tap
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Connections already dispatched keep running after this returns. In
    /// serial mode the connection being served finishes before the token is
    /// observed.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Tap shutting down");
                    self.tap.inner.log.event("shutdown");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        self.tap.inner.log.event(&format!("accept failed: {}", e));
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                }
            };

            let id = self.tap.inner.connections.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(conn = id, peer = %peer, "Accepted connection");
            self.dispatch(id, stream).await;
        }
    }

    async fn dispatch(&self, id: u64, stream: TcpStream) {
        let (relay, parallel) = self.tap.prepare(id);

        if !parallel {
            relay.run(stream).await;
            return;
        }

        let permit = match &self.limit {
            None => None,
            Some(limit) => match limit.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(conn = id, "No free relay slot, serving connection inline");
                    self.tap
                        .inner
                        .log
                        .event(&format!("dispatch of #{} failed, serving inline", id));
                    relay.run(stream).await;
                    return;
                }
            },
        };

        tokio::spawn(async move {
            let _permit = permit;
            relay.run(stream).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_requires_host_and_port() {
        assert!(matches!(Tap::relay("", 80), Err(Error::Config(_))));
        assert!(matches!(Tap::relay("localhost", 0), Err(Error::Config(_))));
    }

    #[test]
    fn test_setters_update_config() {
        let tap = Tap::relay("localhost", 8080).unwrap().local_port(9090);
        tap.verbose(2);
        tap.parallel(false);
        tap.defrag_delay(0.5).unwrap();

        let config = tap.config();
        assert_eq!(config.effective_local_port(), 9090);
        assert_eq!(config.verbosity, Verbosity::Debug);
        assert!(!config.parallel);
        assert_eq!(config.defrag_delay(), Some(Duration::from_millis(500)));
        assert!(tap.defrag_delay(-1.0).is_err());
    }

    #[test]
    fn test_clones_share_state() {
        let tap = Tap::relay("localhost", 8080).unwrap();
        let handle = tap.clone();
        handle.verbose(0);
        assert_eq!(tap.verbosity(), Verbosity::Silent);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let tap = Tap::from_config(
            TapConfig::sink(port)
                .with_bind_host("127.0.0.1")
                .with_verbosity(Verbosity::Silent),
        )
        .unwrap();

        // SO_REUSEADDR does not allow two listeners on one port.
        assert!(matches!(tap.bind().await, Err(Error::Bind { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rebind_after_served_connection() {
        let tap = Tap::from_config(
            TapConfig::sink(0)
                .with_bind_host("127.0.0.1")
                .with_verbosity(Verbosity::Silent),
        )
        .unwrap();
        let bound = tap.bind().await.unwrap();
        let port = bound.local_addr().unwrap().port();
        let token = CancellationToken::new();
        let server = tokio::spawn(bound.serve(token.clone()));

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"x").await.unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut client).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"x");

        token.cancel();
        server.await.unwrap().unwrap();

        let again = tap.clone().local_port(port);
        assert!(again.bind().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_serve_returns() {
        let tap = Tap::from_config(
            TapConfig::sink(0)
                .with_bind_host("127.0.0.1")
                .with_verbosity(Verbosity::Silent),
        )
        .unwrap();
        let bound = tap.bind().await.unwrap();
        assert_ne!(bound.local_addr().unwrap().port(), 0);

        let token = CancellationToken::new();
        token.cancel();
        bound.serve(token).await.unwrap();
    }
}
