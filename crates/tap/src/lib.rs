//! Wiretap - a transparent TCP man-in-the-middle relay.
//!
//! A [`Tap`] listens on a local port, accepts client connections, opens a
//! matching connection to the real server and forwards bytes in both
//! directions. Every message read from either side passes through an
//! optional callback before it is forwarded, so traffic can be observed,
//! logged, delayed or rewritten in transit.
//!
//! # Example
//!
//! ```ignore
//! use wiretap::{Callback, Tap};
//!
//! let tap = Tap::relay("db.internal", 5432)?.local_port(15432);
//! tap.verbose(2);
//! tap.log_file("tap.log");
//! tap.send_callback(Callback::text(|s| Some(s.replace("SELECT", "select"))));
//! tap.go().await?;
//! ```
//!
//! A tap can also run in sink mode, where no server exists and a handler
//! computes the response for each inbound message:
//!
//! ```ignore
//! let echo = Tap::sink(9000, Callback::text(|s| Some(s.to_uppercase())))?;
//! echo.go().await?;
//! ```

pub mod acceptor;
pub mod callback;
pub mod config;
pub mod connection;
pub mod log;
pub mod relay;
pub mod timestamp;

pub use acceptor::{BoundTap, Tap};
pub use callback::{Callback, Direction, Pipeline};
pub use config::{TapConfig, TapMode, Verbosity};
pub use connection::ConnectionPair;
pub use log::{Console, ConnectionLog, EventLog};
pub use relay::{ClosedBy, RelayStats};
pub use timestamp::Timestamp;

// Re-exported so callers can cancel `go_until` without a direct dependency.
pub use tokio_util::sync::CancellationToken;

/// Result type for tap operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the relay engine.
///
/// `Config`, `Bind` and `Yaml` are startup-fatal. `Connect` and `Io` only
/// ever end the connection they occurred on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
