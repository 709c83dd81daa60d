//! Configuration for the echo server and client.

use std::fmt;
use std::str::FromStr;
use wiretap::Callback;

/// How the echo server rewrites what it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    /// Send the message back unchanged.
    #[default]
    None,
    Upper,
    Lower,
    Reverse,
}

impl Transform {
    pub fn apply(&self, text: &str) -> String {
        match self {
            Self::None => text.to_string(),
            Self::Upper => text.to_uppercase(),
            Self::Lower => text.to_lowercase(),
            Self::Reverse => text.chars().rev().collect(),
        }
    }

    /// The transform as a sink handler. `None` defers to the tap's own
    /// echo of the original message.
    pub fn callback(self) -> Callback {
        match self {
            Self::None => Callback::identity(),
            other => Callback::text(move |s| Some(other.apply(s))),
        }
    }
}

impl FromStr for Transform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "upper" => Ok(Self::Upper),
            "lower" => Ok(Self::Lower),
            "reverse" => Ok(Self::Reverse),
            other => Err(format!(
                "unknown transform '{}', expected none, upper, lower or reverse",
                other
            )),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Upper => "upper",
            Self::Lower => "lower",
            Self::Reverse => "reverse",
        };
        f.write_str(name)
    }
}

/// Settings shared by [`EchoServer`](super::EchoServer) and
/// [`EchoClient`](super::EchoClient).
///
/// The server uses `host`, `port` and `transform`; the client uses the
/// address and the timeouts.
#[derive(Debug, Clone)]
pub struct EchoConfig {
    /// Interface the server listens on, or the host the client dials.
    pub host: String,
    /// Listening port (0 picks a free one) or target port.
    pub port: u16,
    /// How the server rewrites each message before answering.
    pub transform: Transform,
    /// Give up dialing after this many milliseconds.
    pub connect_timeout_ms: u64,
    /// Give up waiting for a reply after this many milliseconds (0 waits forever).
    pub read_timeout_ms: u64,
    /// Client read buffer; longer replies are cut at this length.
    pub buffer_size: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9999,
            transform: Transform::None,
            connect_timeout_ms: 5000,
            read_timeout_ms: 0,
            buffer_size: 64 * 1024,
        }
    }
}

impl EchoConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Server configuration bound to all interfaces.
    pub fn server(port: u16) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port,
            ..Default::default()
        }
    }

    /// Client configuration for `host:port`.
    pub fn client(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port)
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_read_timeout(mut self, timeout_ms: u64) -> Self {
        self.read_timeout_ms = timeout_ms;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
