//! Test doubles for exercising taps.
//!
//! # WARNING: TEST-ONLY
//!
//! These connectors exist to validate a relay end to end. They are NOT meant
//! for production traffic:
//! - The client assumes one read returns the whole reply
//! - The server only rewrites text with a fixed set of transforms
//!
//! # Usage
//!
//! ```ignore
//! use wiretap_connectors::echo::{EchoClient, EchoConfig, EchoServer, Transform};
//!
//! // Server that upper-cases every message.
//! let server = EchoServer::new(EchoConfig::server(9998).with_transform(Transform::Upper))?;
//! let (addr, shutdown) = server.start().await?;
//!
//! let mut client = EchoClient::connect(EchoConfig::client("localhost", addr.port())).await?;
//! assert_eq!(client.send_and_receive("hi").await?.text().as_deref(), Some("HI"));
//! client.disconnect().await?;
//! shutdown.cancel();
//! ```

pub mod echo;
