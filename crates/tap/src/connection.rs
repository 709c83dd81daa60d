//! The client/server socket pair served by one relay task.

use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection pair is closed")
}

/// Non-blocking read: `Ok(None)` when the socket has no data yet.
fn try_recv(stream: Option<&TcpStream>, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let stream = stream.ok_or_else(closed)?;
    match stream.try_read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

async fn send(stream: Option<&mut TcpStream>, data: &[u8]) -> io::Result<()> {
    let stream = stream.ok_or_else(closed)?;
    stream.write_all(data).await
}

/// Client socket plus, outside sink mode, the matching server socket.
///
/// Once [`close`](Self::close) has run both handles are gone and every
/// further operation fails with `NotConnected`.
#[derive(Debug)]
pub struct ConnectionPair {
    id: u64,
    peer: Option<SocketAddr>,
    client: Option<TcpStream>,
    server: Option<TcpStream>,
}

impl ConnectionPair {
    pub fn new(id: u64, client: TcpStream, server: Option<TcpStream>) -> Self {
        let peer = client.peer_addr().ok();
        Self {
            id,
            peer,
            client: Some(client),
            server,
        }
    }

    /// Sequence number assigned by the acceptor.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Client address, if the OS could still report it at accept time.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn has_server(&self) -> bool {
        self.server.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_none() && self.server.is_none()
    }

    /// Attach the outbound connection once it is established.
    pub fn attach_server(&mut self, server: TcpStream) {
        self.server = Some(server);
    }

    /// Wait until the client or the server has something to read.
    ///
    /// The client is polled first so it wins when both are ready.
    pub async fn readable(&self) -> io::Result<()> {
        let client = self.client.as_ref().ok_or_else(closed)?;
        match &self.server {
            Some(server) => {
                tokio::select! {
                    biased;
                    r = client.readable() => r,
                    r = server.readable() => r,
                }
            }
            None => client.readable().await,
        }
    }

    pub fn try_recv_client(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        try_recv(self.client.as_ref(), buf)
    }

    pub fn try_recv_server(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        try_recv(self.server.as_ref(), buf)
    }

    pub async fn send_client(&mut self, data: &[u8]) -> io::Result<()> {
        send(self.client.as_mut(), data).await
    }

    pub async fn send_server(&mut self, data: &[u8]) -> io::Result<()> {
        send(self.server.as_mut(), data).await
    }

    /// Shut down and drop both sockets. Safe to call more than once.
    pub async fn close(&mut self) {
        for mut stream in [self.client.take(), self.server.take()].into_iter().flatten() {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Returns (our end, their end).
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connect, accept) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn test_client_data_is_readable() {
        let (ours, mut theirs) = socket_pair().await;
        let pair = ConnectionPair::new(1, ours, None);
        assert!(!pair.has_server());

        theirs.write_all(b"ping").await.unwrap();
        pair.readable().await.unwrap();

        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        while got.len() < 4 {
            if let Some(n) = pair.try_recv_client(&mut buf).unwrap() {
                got.extend_from_slice(&buf[..n]);
            } else {
                pair.readable().await.unwrap();
            }
        }
        assert_eq!(got, b"ping");
    }

    #[tokio::test]
    async fn test_server_side_send_and_receive() {
        let (client, _client_peer) = socket_pair().await;
        let (server, mut server_peer) = socket_pair().await;
        let mut pair = ConnectionPair::new(2, client, Some(server));

        pair.send_server(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_signals_peers() {
        let (client, mut client_peer) = socket_pair().await;
        let (server, mut server_peer) = socket_pair().await;
        let mut pair = ConnectionPair::new(3, client, Some(server));

        pair.close().await;
        pair.close().await;
        assert!(pair.is_closed());

        let mut buf = [0u8; 8];
        assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
        assert_eq!(server_peer.read(&mut buf).await.unwrap(), 0);

        let err = pair.send_client(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(pair.readable().await.is_err());
    }
}
