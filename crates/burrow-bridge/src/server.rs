//! Bridge transport server
//!
//! TCP accept loop, optional TLS, WebSocket upgrade, then one
//! [`spawn_peer`] per connection. Bind and TLS setup failures are the only
//! fatal errors; everything after that is scoped to a single connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{self, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use burrow_core::BridgeConfig;
use rustls::pki_types::CertificateDer;

use crate::backend::FsBackend;
use crate::connection::{spawn_peer, ConnectionError, PeerHandle};
use crate::mount::MountRegistry;
use crate::router::Dispatcher;
use crate::tls::{acceptor_from_config, TlsError};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}

/// A bound, not yet serving, bridge
pub struct BridgeServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    certificate: Option<CertificateDer<'static>>,
    dispatcher: Arc<Dispatcher>,
    connection_semaphore: Arc<Semaphore>,
    max_frame_size: usize,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
    peers: Arc<DashMap<u64, PeerHandle>>,
    next_peer: AtomicU64,
}

impl BridgeServer {
    /// Bind the listener and prepare TLS
    pub async fn bind(
        config: &BridgeConfig,
        registry: Arc<MountRegistry>,
        backend: Arc<dyn FsBackend>,
    ) -> Result<Self, ServerError> {
        let (tls, certificate) = match &config.tls {
            Some(tls) => {
                let (acceptor, cert) = acceptor_from_config(tls)?;
                (Some(acceptor), Some(cert))
            }
            None => (None, None),
        };

        let addr = SocketAddr::new(config.bind, config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            local_addr,
            tls,
            certificate,
            dispatcher: Arc::new(Dispatcher::new(registry, backend)),
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections.max(1))),
            max_frame_size: config.max_frame_size,
            handshake_timeout: config.handshake_timeout(),
            shutdown: CancellationToken::new(),
            peers: Arc::new(DashMap::new()),
            next_peer: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` or `wss://` URL of this server
    pub fn url(&self) -> String {
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        format!("{}://{}", scheme, self.local_addr)
    }

    pub fn registry(&self) -> &Arc<MountRegistry> {
        self.dispatcher.registry()
    }

    /// Leaf certificate served over TLS, for clients that pin it
    pub fn certificate(&self) -> Option<&CertificateDer<'static>> {
        self.certificate.as_ref()
    }

    /// Cancelling this token stops the accept loop and closes every connection
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handles for the currently connected peers
    pub fn peers(&self) -> Vec<PeerHandle> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// Accept connections until shut down
    pub async fn serve(&self) -> Result<(), ServerError> {
        info!(
            "Bridge listening on {} ({} mount(s))",
            self.url(),
            self.registry().len()
        );

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.connection_semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, remote) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // Per-connection accept failures (e.g. EMFILE) are not fatal
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
            let ctx = PeerContext {
                id,
                remote,
                tls: self.tls.clone(),
                dispatcher: self.dispatcher.clone(),
                max_frame_size: self.max_frame_size,
                handshake_timeout: self.handshake_timeout,
                shutdown: self.shutdown.clone(),
                peers: self.peers.clone(),
            };

            tokio::spawn(async move {
                match ctx.run(stream).await {
                    Ok(()) => debug!("Connection {} from {} closed", id, remote),
                    Err(e) => warn!("Connection {} from {} failed: {}", id, remote, e),
                }
                drop(permit);
            });
        }

        info!("Bridge on {} stopped", self.local_addr);
        Ok(())
    }
}

struct PeerContext {
    id: u64,
    remote: SocketAddr,
    tls: Option<TlsAcceptor>,
    dispatcher: Arc<Dispatcher>,
    max_frame_size: usize,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
    peers: Arc<DashMap<u64, PeerHandle>>,
}

impl PeerContext {
    /// TLS and the WebSocket upgrade share one deadline, so a peer that
    /// connects and goes quiet gives its permit back.
    async fn run(self, stream: TcpStream) -> Result<(), ConnectionError> {
        let _ = stream.set_nodelay(true);
        let deadline = Instant::now() + self.handshake_timeout;
        match self.tls.clone() {
            Some(acceptor) => {
                let accept = async { acceptor.accept(stream).await.map_err(ConnectionError::Tls) };
                match self.handshake_step(deadline, accept).await? {
                    Some(stream) => self.upgrade(stream, deadline).await,
                    None => Ok(()),
                }
            }
            None => self.upgrade(stream, deadline).await,
        }
    }

    /// `None` when the server shut down mid-handshake
    async fn handshake_step<F, T>(
        &self,
        deadline: Instant,
        step: F,
    ) -> Result<Option<T>, ConnectionError>
    where
        F: Future<Output = Result<T, ConnectionError>>,
    {
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(None),
            out = time::timeout_at(deadline, step) => match out {
                Ok(result) => result.map(Some),
                Err(_) => Err(ConnectionError::HandshakeTimeout(self.remote)),
            },
        }
    }

    async fn upgrade<S>(self, stream: S, deadline: Instant) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let accept = async { accept_async(stream).await.map_err(ConnectionError::from) };
        let Some(ws) = self.handshake_step(deadline, accept).await? else {
            return Ok(());
        };
        info!("Editor connected from {}", self.remote);

        let (handle, task) = spawn_peer(
            ws,
            Some(self.dispatcher.clone()),
            self.max_frame_size,
            self.shutdown.clone(),
        );
        self.peers.insert(self.id, handle);

        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Connection task for {} panicked: {}", self.remote, e);
                Ok(())
            }
        };

        self.peers.remove(&self.id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::client::BridgeClient;
    use burrow_core::{ErrorCode, FsResponse, TlsConfig};
    use futures_util::{SinkExt, StreamExt};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio_tungstenite::tungstenite::Message;

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            port: 0,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..BridgeConfig::default()
        }
    }

    async fn start(config: BridgeConfig) -> (tempfile::TempDir, Arc<BridgeServer>, String) {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("a.txt"), b"alpha").unwrap();

        let registry = Arc::new(MountRegistry::new());
        let token = registry.register("t", temp.path()).unwrap();
        let server = Arc::new(
            BridgeServer::bind(&config, registry, Arc::new(LocalBackend))
                .await
                .unwrap(),
        );
        let serving = server.clone();
        tokio::spawn(async move { serving.serve().await });
        (temp, server, token)
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let (_temp, server, _token) = start(test_config()).await;
        let config = BridgeConfig {
            port: server.local_addr().port(),
            ..test_config()
        };
        let err = BridgeServer::bind(&config, Arc::new(MountRegistry::new()), Arc::new(LocalBackend))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_unknown_token_keeps_connection_open() {
        let (_temp, server, token) = start(test_config()).await;
        let client = BridgeClient::connect(&server.url()).await.unwrap();

        let err = client
            .stat("burrow://00000000000000000000000000000000/a.txt")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MountNotFound));

        // Same connection still serves requests
        let stat = client
            .stat(&format!("burrow://{}/a.txt", token))
            .await
            .unwrap();
        assert_eq!(stat.size, 5);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_only_that_connection() {
        let (_temp, server, token) = start(test_config()).await;

        let (mut bad, _) = tokio_tungstenite::connect_async(server.url()).await.unwrap();
        let good = BridgeClient::connect(&server.url()).await.unwrap();

        bad.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        // The server drops the bad connection
        loop {
            match bad.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }

        let uri = format!("burrow://{}/a.txt", token);
        assert_eq!(good.read_file(&uri).await.unwrap(), &b"alpha"[..]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (_temp, server, token) = start(test_config()).await;
        let client = BridgeClient::connect(&server.url()).await.unwrap();
        client.ping().await.unwrap();

        server.shutdown_token().cancel();
        client.closed().await;
        let err = client
            .stat(&format!("burrow://{}/a.txt", token))
            .await
            .unwrap_err();
        assert_eq!(err, crate::router::CallError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_tls_with_pinned_certificate() {
        let config = BridgeConfig {
            tls: Some(TlsConfig {
                self_signed: true,
                ..TlsConfig::default()
            }),
            ..test_config()
        };
        let (_temp, server, token) = start(config).await;
        assert!(server.url().starts_with("wss://"));

        let cert = server.certificate().unwrap().clone();
        let client = BridgeClient::connect_tls(server.local_addr(), "localhost", cert)
            .await
            .unwrap();

        let (body, _) = client
            .request(
                &burrow_core::FsRequest::ReadDirectory {
                    uri: format!("burrow://{}/", token),
                },
                None,
            )
            .await
            .unwrap();
        match body {
            FsResponse::Entries { entries } => assert_eq!(entries.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_limit_queues_extra_clients() {
        let config = BridgeConfig {
            max_connections: 1,
            ..test_config()
        };
        let (_temp, server, _token) = start(config).await;

        let first = BridgeClient::connect(&server.url()).await.unwrap();
        first.ping().await.unwrap();
        assert_eq!(server.connection_count(), 1);

        let url = server.url();
        let second = tokio::spawn(async move {
            let client = BridgeClient::connect(&url).await?;
            client.ping().await.map(|_| client)
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!second.is_finished());

        first.close();
        let second = second.await.unwrap().unwrap();
        second.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_socket_does_not_starve_listener() {
        use tokio::io::AsyncReadExt;

        let config = BridgeConfig {
            max_connections: 1,
            handshake_timeout_secs: 1,
            ..test_config()
        };
        let (_temp, server, _token) = start(config).await;

        let mut silent = TcpStream::connect(server.local_addr()).await.unwrap();

        let url = server.url();
        let pinged = time::timeout(Duration::from_secs(5), async move {
            let client = BridgeClient::connect(&url).await?;
            client.ping().await
        })
        .await;
        assert!(matches!(pinged, Ok(Ok(_))));

        let mut buf = [0u8; 16];
        let read = time::timeout(Duration::from_secs(1), silent.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
    }
}
