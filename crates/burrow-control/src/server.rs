//! Control listener

use burrow_auth::Identity;
use burrow_router::TunnelRegistry;
use burrow_transport::{AsyncIo, MuxConnection, Role};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ControlServerConfig;
use crate::handshake::accept_handshake;
use crate::session::AgentSession;
use crate::ControlError;

/// Accepts agent control connections
#[derive(Clone)]
pub struct ControlServer {
    host: Arc<Identity>,
    registry: Arc<TunnelRegistry>,
    config: Arc<ControlServerConfig>,
    tls: Option<TlsAcceptor>,
}

impl ControlServer {
    pub fn new(host: Identity, registry: Arc<TunnelRegistry>, config: ControlServerConfig) -> Self {
        Self {
            host: Arc::new(host),
            registry,
            config: Arc::new(config),
            tls: None,
        }
    }

    /// Wrap accepted connections in TLS
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn host_thumbprint(&self) -> String {
        self.host.thumbprint()
    }

    /// Accept connections until the listener fails
    pub async fn serve(self, listener: TcpListener) -> Result<(), ControlError> {
        info!(
            "Control server listening on {} ({}, host key {})",
            listener.local_addr()?,
            if self.tls.is_some() { "TLS" } else { "plain TCP" },
            self.host.thumbprint()
        );

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept control connection: {}", e);
                    continue;
                }
            };
            let _ = socket.set_nodelay(true);
            debug!("Control connection from {}", peer);

            let server = self.clone();
            tokio::spawn(async move {
                let result = match server.tls.clone() {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(stream) => server.handle_connection(stream, peer.to_string()).await,
                        Err(e) => {
                            warn!("TLS handshake with {} failed: {}", peer, e);
                            return;
                        }
                    },
                    None => server.handle_connection(socket, peer.to_string()).await,
                };
                if let Err(e) = result {
                    warn!("Control connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    /// Authenticate and serve one agent over `io`
    pub async fn handle_connection<IO>(&self, io: IO, peer: String) -> Result<(), ControlError>
    where
        IO: AsyncIo + 'static,
    {
        let connection = Arc::new(MuxConnection::new(io, Role::Server, peer));

        let agent = match timeout(
            self.config.handshake_timeout,
            accept_handshake(&connection, &self.host, &self.config),
        )
        .await
        {
            Ok(Ok(agent)) => agent,
            Ok(Err(e)) => {
                connection.close("handshake failed");
                return Err(e);
            }
            Err(_) => {
                connection.close("handshake timeout");
                return Err(ControlError::Timeout("agent handshake"));
            }
        };

        info!(
            client_id = %agent.client_id,
            thumbprint = %agent.thumbprint,
            "Agent connected from {}",
            connection.remote()
        );

        AgentSession::new(connection, agent, self.registry.clone(), self.config.clone())
            .run()
            .await;
        Ok(())
    }
}
