//! SSH session seams
//!
//! The orchestrator works in terms of byte streams, a [`Handshaker`] that
//! turns a stream into a session, and [`SshSession`]s that open forwards.
//! [`RusshHandshaker`] is the production implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::key;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DialError;
use crate::provider::{AuthMethod, ResolvedHost};

/// Any bidirectional byte channel
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn ByteStream>;

/// An authenticated SSH connection
#[async_trait]
pub trait SshSession: Send + Sync + 'static {
    /// Open a direct-tcpip channel to `host:port` as seen from the remote side
    async fn open_forward(&self, host: &str, port: u16) -> Result<BoxedStream, DialError>;

    /// Disconnect; closes the underlying transport in both directions
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Runs the SSH handshake and authentication over a transport
#[async_trait]
pub trait Handshaker: Send + Sync + 'static {
    async fn handshake(
        &self,
        host: &ResolvedHost,
        transport: BoxedStream,
    ) -> Result<Arc<dyn SshSession>, DialError>;
}

/// Normalize `SHA256:abc=` / `abc` to the bare base64 digest
fn bare_fingerprint(fingerprint: &str) -> &str {
    let fingerprint = fingerprint.trim();
    let fingerprint = fingerprint.strip_prefix("SHA256:").unwrap_or(fingerprint);
    fingerprint.trim_end_matches('=')
}

/// russh event handler; only host-key checking is customised
struct ClientHandler {
    alias: String,
    accepted: Vec<String>,
    rejected: Arc<AtomicBool>,
}

impl ClientHandler {
    fn accepts(&self, fingerprint: &str) -> bool {
        self.accepted.is_empty()
            || self
                .accepted
                .iter()
                .any(|f| bare_fingerprint(f) == bare_fingerprint(fingerprint))
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        let ok = self.accepts(&fingerprint);
        if ok {
            debug!("Host key for {} accepted: SHA256:{}", self.alias, fingerprint);
        } else {
            warn!("Host key for {} rejected: SHA256:{}", self.alias, fingerprint);
            self.rejected.store(true, Ordering::SeqCst);
        }
        Ok(ok)
    }
}

/// Handshaker backed by `russh`
pub struct RusshHandshaker {
    config: Arc<client::Config>,
}

impl RusshHandshaker {
    pub fn new(keepalive: Option<Duration>) -> Self {
        let config = client::Config {
            keepalive_interval: keepalive,
            ..client::Config::default()
        };
        Self {
            config: Arc::new(config),
        }
    }

    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        host: &ResolvedHost,
    ) -> Result<bool, DialError> {
        let failed = |e: russh::Error| DialError::Handshake {
            host: host.alias.clone(),
            reason: e.to_string(),
        };

        match &host.auth {
            AuthMethod::None => handle
                .authenticate_none(host.user.as_str())
                .await
                .map_err(failed),
            AuthMethod::Password(password) => handle
                .authenticate_password(host.user.as_str(), password.as_str())
                .await
                .map_err(failed),
            AuthMethod::PublicKey { path, passphrase } => {
                let key = russh_keys::load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                    DialError::Handshake {
                        host: host.alias.clone(),
                        reason: format!("cannot load {:?}: {}", path, e),
                    }
                })?;
                handle
                    .authenticate_publickey(host.user.as_str(), Arc::new(key))
                    .await
                    .map_err(failed)
            }
        }
    }
}

impl Default for RusshHandshaker {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(30)))
    }
}

#[async_trait]
impl Handshaker for RusshHandshaker {
    async fn handshake(
        &self,
        host: &ResolvedHost,
        transport: BoxedStream,
    ) -> Result<Arc<dyn SshSession>, DialError> {
        let rejected = Arc::new(AtomicBool::new(false));
        let handler = ClientHandler {
            alias: host.alias.clone(),
            accepted: host.host_key_fingerprints.clone(),
            rejected: rejected.clone(),
        };

        let mut handle = client::connect_stream(self.config.clone(), transport, handler)
            .await
            .map_err(|e| {
                if rejected.load(Ordering::SeqCst) {
                    DialError::HostKeyRejected(host.alias.clone())
                } else {
                    DialError::Handshake {
                        host: host.alias.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        if !Self::authenticate(&mut handle, host).await? {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(DialError::AuthFailed {
                user: host.user.clone(),
                host: host.alias.clone(),
            });
        }

        info!("Authenticated to {} as {}", host.alias, host.user);
        Ok(Arc::new(RusshSession {
            alias: host.alias.clone(),
            handle: Mutex::new(handle),
            closed: AtomicBool::new(false),
        }))
    }
}

struct RusshSession {
    alias: String,
    handle: Mutex<Handle<ClientHandler>>,
    closed: AtomicBool,
}

#[async_trait]
impl SshSession for RusshSession {
    async fn open_forward(&self, host: &str, port: u16) -> Result<BoxedStream, DialError> {
        if self.is_closed() {
            return Err(DialError::Forward {
                host: host.to_string(),
                port,
                reason: format!("session to {} is closed", self.alias),
            });
        }

        let channel = self
            .handle
            .lock()
            .await
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| DialError::Forward {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;

        debug!("Opened forward to {}:{} through {}", host, port, self.alias);
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Disconnect from {} failed: {}", self.alias, e);
        }
        debug!("Closed session to {}", self.alias);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
