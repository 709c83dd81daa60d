//! Echo server and client.
//!
//! The server is a sink-mode tap; the client is the request/response
//! companion used to talk to it, or to any tap in front of it.
//!
//! ```bash
//! # Upper-casing echo server on 9998
//! wiretap echo --port 9998 --transform upper
//!
//! # Tap in front of it on 9999, then send through the tap
//! wiretap relay --remote-host localhost --remote-port 9998 --local-port 9999
//! wiretap send --port 9999 hello
//! ```

mod client;
mod config;
mod server;

pub use client::{EchoClient, Reply};
pub use config::{EchoConfig, Transform};
pub use server::EchoServer;
