//! The TCP front door: binds the listening socket, accepts connections
//! (optionally completing a TLS handshake), and spawns one session task per
//! client, all feeding the single hub task.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use squawkbus_protocol::v1::DEFAULT_PORT;

use crate::authentication::AuthenticationManager;
use crate::authorization::{AuthorizationRepository, AuthorizationSpec};
use crate::hub::{Hub, SessionEvent};
use crate::session::run_session;
use crate::{BrokerError, SessionId, tls};

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub tls: Option<TlsConfig>,
    pub password_file: Option<PathBuf>,
    pub authorization_file: Option<PathBuf>,
    pub authorization_specs: Vec<AuthorizationSpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            tls: None,
            password_file: None,
            authorization_file: None,
            authorization_specs: Vec::new(),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    hub_tx: mpsc::Sender<SessionEvent>,
    hub_task: JoinHandle<()>,
    authentication: Arc<AuthenticationManager>,
}

impl Server {
    /// Load configuration, start the hub task, and bind the listening socket.
    /// Configuration failures here are fatal to startup.
    pub async fn bind(config: ServerConfig) -> Result<Server, BrokerError> {
        let authorizations = AuthorizationRepository::make(
            config.authorization_file.as_deref(),
            &config.authorization_specs,
        )?;
        let authentication = Arc::new(AuthenticationManager::new(
            config.password_file.as_deref(),
        )?);
        let acceptor = match &config.tls {
            Some(tls) => Some(tls::create_acceptor(tls)?),
            None => None,
        };

        let (hub_tx, hub_rx) = mpsc::channel(32);
        let hub_task = tokio::spawn(Hub::run(authorizations, hub_rx));

        let listener = TcpListener::bind(config.addr).await?;
        tracing::info!(
            "listening on {}{}",
            listener.local_addr()?,
            match acceptor {
                Some(_) => " using TLS",
                None => "",
            }
        );

        Ok(Server {
            listener,
            acceptor,
            hub_tx,
            hub_task,
            authentication,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BrokerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires, then close every session
    /// gracefully.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), BrokerError> {
        let mut next_session: SessionId = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let session = next_session;
                    next_session += 1;
                    self.spawn_session(stream, peer, session);
                }
            }
        }

        let _ = self.hub_tx.send(SessionEvent::Shutdown).await;
        let _ = self.hub_task.await;
        Ok(())
    }

    fn spawn_session(&self, stream: tokio::net::TcpStream, peer: SocketAddr, session: SessionId) {
        let hub_tx = self.hub_tx.clone();
        let authentication = self.authentication.clone();
        let acceptor = self.acceptor.clone();

        tokio::spawn(async move {
            tracing::debug!(%peer, session, "accepted connection");

            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        run_session(stream, peer, session, hub_tx, authentication).await
                    }
                    Err(error) => Err(BrokerError::Io(error)),
                },
                None => run_session(stream, peer, session, hub_tx, authentication).await,
            };

            match result {
                Ok(()) => tracing::debug!(%peer, "session ended"),
                Err(error) => tracing::warn!(%peer, %error, "session closed"),
            }
        });
    }
}
