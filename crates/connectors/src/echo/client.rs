//! Echo client.
//!
//! Sends one message at a time and waits for the reply.

use super::config::EchoConfig;
use anyhow::Result;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Bytes returned by the peer in one read.
    Message(Vec<u8>),
    /// The peer closed the connection instead of answering.
    Disconnected,
}

impl Reply {
    /// Reply as text, `None` when disconnected.
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Message(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Self::Disconnected => None,
        }
    }
}

/// Request/response client for taps and echo servers.
///
/// # Example
///
/// ```ignore
/// use wiretap_connectors::echo::{EchoClient, EchoConfig};
///
/// let mut client = EchoClient::connect(EchoConfig::client("localhost", 9998)).await?;
/// let reply = client.send_and_receive("hello").await?;
/// client.disconnect().await?;
/// ```
#[derive(Debug)]
pub struct EchoClient {
    config: EchoConfig,
    stream: Option<TcpStream>,
}

impl EchoClient {
    /// Connect to the configured address.
    pub async fn connect(config: EchoConfig) -> Result<Self> {
        let addr = config.address();
        info!(address = %addr, "Echo client connecting");

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr)).await??;

        info!(address = %addr, "Connected to server");
        Ok(Self {
            config,
            stream: Some(stream),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Send `message` and wait for one reply.
    ///
    /// A zero-length read means the peer hung up; the client is then
    /// disconnected and further requests fail.
    pub async fn send_and_receive(&mut self, message: impl AsRef<[u8]>) -> Result<Reply> {
        let message = message.as_ref();
        let Some(stream) = self.stream.as_mut() else {
            anyhow::bail!("Not connected");
        };

        stream.write_all(message).await?;
        debug!(bytes = message.len(), "Sent request");

        let mut buf = vec![0u8; self.config.buffer_size];
        let read = stream.read(&mut buf);
        let n = if self.config.read_timeout_ms > 0 {
            let timeout = Duration::from_millis(self.config.read_timeout_ms);
            tokio::time::timeout(timeout, read).await??
        } else {
            read.await?
        };

        if n == 0 {
            debug!("Server closed the connection");
            self.stream = None;
            return Ok(Reply::Disconnected);
        }

        buf.truncate(n);
        debug!(bytes = n, "Received reply");
        Ok(Reply::Message(buf))
    }

    /// Close the connection. Does nothing if already closed.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            info!(address = %self.config.address(), "Disconnected from server");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::{EchoServer, Transform};

    async fn upper_server() -> (std::net::SocketAddr, wiretap::CancellationToken) {
        let config = EchoConfig::new("127.0.0.1", 0).with_transform(Transform::Upper);
        EchoServer::new(config).unwrap().start().await.unwrap()
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (addr, shutdown) = upper_server().await;

        let mut client = EchoClient::connect(EchoConfig::client("127.0.0.1", addr.port()))
            .await
            .unwrap();
        let reply = client.send_and_receive("hello").await.unwrap();
        assert_eq!(reply.text().as_deref(), Some("HELLO"));

        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
        assert!(client.send_and_receive("again").await.is_err());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reply_cut_at_buffer_size() {
        let (addr, shutdown) = upper_server().await;

        let config = EchoConfig::client("127.0.0.1", addr.port())
            .with_buffer_size(4)
            .with_read_timeout(5000);
        let mut client = EchoClient::connect(config).await.unwrap();
        let reply = client.send_and_receive("abcdef").await.unwrap();
        assert_eq!(reply, Reply::Message(b"ABCD".to_vec()));

        client.disconnect().await.unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnected_reply() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept, read the request, hang up without answering.
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let _ = stream.read(&mut buf).await;
        });

        let mut client = EchoClient::connect(EchoConfig::client("127.0.0.1", port))
            .await
            .unwrap();
        let reply = client.send_and_receive("anyone?").await.unwrap();
        assert_eq!(reply, Reply::Disconnected);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(EchoClient::connect(EchoConfig::client("127.0.0.1", port))
            .await
            .is_err());
    }
}
