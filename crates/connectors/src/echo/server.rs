//! Echo server.
//!
//! A sink-mode tap whose handler applies a [`Transform`](super::Transform).

use super::config::EchoConfig;
use anyhow::Result;
use std::net::SocketAddr;
use tracing::info;
use wiretap::{CancellationToken, Tap, TapConfig, Verbosity};

/// A minimal request/response server for exercising taps.
///
/// # Example
///
/// ```ignore
/// use wiretap_connectors::echo::{EchoConfig, EchoServer, Transform};
///
/// let server = EchoServer::new(EchoConfig::server(9998).with_transform(Transform::Upper))?;
/// let (addr, shutdown) = server.start().await?;
/// ```
#[derive(Debug, Clone)]
pub struct EchoServer {
    config: EchoConfig,
    tap: Tap,
}

impl EchoServer {
    pub fn new(config: EchoConfig) -> Result<Self> {
        let tap = Tap::from_config(
            TapConfig::sink(config.port)
                .with_bind_host(config.host.clone())
                .with_verbosity(Verbosity::Silent),
        )?;
        tap.handler(config.transform.callback());
        Ok(Self { config, tap })
    }

    /// The underlying tap, e.g. to raise its verbosity.
    pub fn tap(&self) -> &Tap {
        &self.tap
    }

    /// Bind and serve in the background.
    ///
    /// Returns the bound address and the token that stops the server.
    pub async fn start(&self) -> Result<(SocketAddr, CancellationToken)> {
        let bound = self.tap.bind().await?;
        let addr = bound.local_addr()?;
        let shutdown = CancellationToken::new();

        info!(address = %addr, transform = %self.config.transform, "Echo server listening");
        tokio::spawn(bound.serve(shutdown.clone()));
        Ok((addr, shutdown))
    }

    /// Bind and serve until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(address = %self.config.address(), transform = %self.config.transform, "Echo server starting");
        self.tap.go_until(shutdown).await?;
        Ok(())
    }
}
