//! Per-direction message callbacks.
//!
//! A callback receives each message read from one side of the connection
//! and may return a replacement. Returning `None`, or an empty message,
//! leaves the original untouched, so a callback that only observes traffic
//! cannot truncate it by accident.

use std::fmt;
use std::sync::Arc;

type Transform = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

/// A user-supplied message transform.
#[derive(Clone)]
pub struct Callback(Arc<Transform>);

impl Callback {
    /// Wrap a byte-level transform.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wrap a text transform.
    ///
    /// Messages that are not valid UTF-8 skip the transform and are relayed
    /// as they are.
    pub fn text<F>(f: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self::new(move |msg| {
            let text = std::str::from_utf8(msg).ok()?;
            f(text).map(String::into_bytes)
        })
    }

    /// Callback that never replaces anything.
    pub fn identity() -> Self {
        Self::new(|_| None)
    }

    /// Run the transform. `None` means keep the original message.
    pub fn call(&self, msg: &[u8]) -> Option<Vec<u8>> {
        (self.0)(msg).filter(|out| !out.is_empty())
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

/// Direction a message travels through the tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server; handled by the send callback.
    ClientToServer,
    /// Server to client; handled by the receive callback.
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToServer => f.write_str("client -> server"),
            Self::ServerToClient => f.write_str("server -> client"),
        }
    }
}

/// Result of running a message through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Message to forward.
    pub message: Vec<u8>,
    /// A callback was registered for this direction and ran.
    pub invoked: bool,
    /// The callback's output replaced the original.
    pub replaced: bool,
}

/// The pair of optional callbacks used by one connection.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    send: Option<Callback>,
    receive: Option<Callback>,
}

impl Pipeline {
    pub fn new(send: Option<Callback>, receive: Option<Callback>) -> Self {
        Self { send, receive }
    }

    pub fn callback(&self, direction: Direction) -> Option<&Callback> {
        match direction {
            Direction::ClientToServer => self.send.as_ref(),
            Direction::ServerToClient => self.receive.as_ref(),
        }
    }

    /// Pass a message through the callback registered for `direction`.
    pub fn apply(&self, direction: Direction, message: Vec<u8>) -> Applied {
        let Some(callback) = self.callback(direction) else {
            return Applied {
                message,
                invoked: false,
                replaced: false,
            };
        };

        match callback.call(&message) {
            Some(replacement) => Applied {
                message: replacement,
                invoked: true,
                replaced: true,
            },
            None => Applied {
                message,
                invoked: true,
                replaced: false,
            },
        }
    }
}
