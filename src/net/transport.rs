//! WebTransport server implementation
//!
//! Each session's first bidirectional stream carries the framed protocol;
//! everything past the handshake is handled by [`serve_connection`].

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::net::connection::serve_connection;
use crate::net::room::RoomRegistry;
use crate::net::tls::TlsConfig;

/// WebTransport server
pub struct WebTransportServer {
    config: ServerConfig,
    tls_config: TlsConfig,
    registry: Arc<RoomRegistry>,
}

impl WebTransportServer {
    pub async fn new(config: ServerConfig, registry: Arc<RoomRegistry>) -> anyhow::Result<Self> {
        let tls_config = TlsConfig::load(&config).await?;
        Ok(Self {
            config,
            tls_config,
            registry,
        })
    }

    /// Get the certificate hash for client configuration
    pub fn cert_hash(&self) -> &str {
        &self.tls_config.cert_hash
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.config.bind_address, self.config.port)
    }

    /// Accept sessions until the endpoint fails
    pub async fn run(self) -> anyhow::Result<()> {
        use wtransport::Endpoint;

        let bind_addr = self.bind_addr();
        let server_config = wtransport::ServerConfig::builder()
            .with_bind_address(bind_addr)
            .with_identity(self.tls_config.identity)
            .build();

        let server = Endpoint::server(server_config)?;
        tracing::info!("WebTransport server listening on {}", bind_addr);

        loop {
            let incoming = server.accept().await;
            let registry = self.registry.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_session(incoming, registry).await {
                    tracing::warn!("Connection error: {}", e);
                }
            });
        }
    }
}

/// Handle a single WebTransport session
async fn handle_session(
    incoming: wtransport::endpoint::IncomingSession,
    registry: Arc<RoomRegistry>,
) -> anyhow::Result<()> {
    let session_request = incoming.await?;
    tracing::debug!(
        "New session from: {:?}, path: {}",
        session_request.authority(),
        session_request.path()
    );

    let connection = session_request.accept().await?;
    let remote = connection.remote_address();

    tokio::select! {
        stream = connection.accept_bi() => {
            let (send, recv) = stream?;
            tracing::debug!(%remote, "protocol stream opened");
            serve_connection(recv, send, registry).await?;
        }
        reason = connection.closed() => {
            tracing::debug!(%remote, "session closed before opening a stream: {}", reason);
        }
    }
    Ok(())
}
