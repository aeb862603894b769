//! SSH dial orchestration
//!
//! Each top-level dial gets its own OS thread running a current-thread
//! runtime. That runtime owns every hop of the chain until the control is
//! released, so a dial stuck in a provider or handshake never holds up
//! another one.
//!
//! Dialing one alias:
//!
//! 1. Resolve it through the [`ConfigProvider`]
//! 2. Connect: plain TCP, or if a proxy command is configured, dial the jump
//!    alias recursively and open a forward through it
//! 3. Hand the stream to the [`Handshaker`]
//!
//! Every await races the dial's cancellation token. Once established the
//! thread parks until cancelled, then closes the hops outermost first.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use burrow_core::{LogLevel, LogRecord, SshConfig};

use crate::control::{DialHandle, DialResult, DialShared, Established, SshControl};
use crate::error::DialError;
use crate::provider::{ConfigProvider, ResolvedHost};
use crate::proxy::{self, ProxyCommand};
use crate::session::{BoxedStream, Handshaker, RusshHandshaker, SshSession};

/// Dial limits
#[derive(Clone, Debug)]
pub struct DialOptions {
    pub connect_timeout: Duration,
    /// `None` waits for the provider indefinitely
    pub provider_timeout: Option<Duration>,
    pub max_jump_depth: usize,
    /// Records kept for late event subscribers (0 = all)
    pub event_history: usize,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self::from(&SshConfig::default())
    }
}

impl From<&SshConfig> for DialOptions {
    fn from(config: &SshConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            provider_timeout: config.provider_timeout(),
            max_jump_depth: config.max_jump_depth,
            event_history: config.event_history,
        }
    }
}

/// Where a dial is; tracks the outermost host only
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialState {
    Resolving,
    Connecting,
    Handshaking,
    Established,
    Failed,
    Cancelled,
    /// Released after being established
    Closed,
}

impl DialState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DialState::Failed | DialState::Cancelled | DialState::Closed)
    }
}

/// Dials hosts by alias
#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn ConfigProvider>,
    handshaker: Arc<dyn Handshaker>,
    options: DialOptions,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        handshaker: Arc<dyn Handshaker>,
        options: DialOptions,
    ) -> Self {
        Self {
            provider,
            handshaker,
            options,
        }
    }

    /// Orchestrator using the russh handshaker configured from `[ssh]`
    pub fn with_russh(provider: Arc<dyn ConfigProvider>, config: &SshConfig) -> Self {
        Self::new(
            provider,
            Arc::new(RusshHandshaker::new(config.keepalive())),
            DialOptions::from(config),
        )
    }

    pub fn options(&self) -> &DialOptions {
        &self.options
    }

    /// Start dialing `alias` on a dedicated thread
    pub fn start(&self, alias: &str) -> DialHandle {
        let shared = Arc::new(DialShared::new(alias, self.options.event_history));
        let (result_tx, result_rx) = oneshot::channel();

        let ctx = DialContext {
            provider: self.provider.clone(),
            handshaker: self.handshaker.clone(),
            options: self.options.clone(),
            shared: shared.clone(),
        };

        let spawned = std::thread::Builder::new()
            .name(format!("burrow-dial-{}", alias))
            .spawn(move || ctx.run_on_thread(result_tx));

        if let Err(e) = spawned {
            // The closure (and with it the result sender) is gone, so the
            // handle reports a runtime error on wait.
            let record = LogRecord::error("dial", format!("cannot spawn dial thread: {}", e))
                .with("host", alias);
            record.emit();
            shared.events.send(record);
            shared.set_state(DialState::Failed);
            shared.events.fail(e.to_string());
        }

        DialHandle::new(shared, result_rx)
    }

    /// Dial `alias` and wait for the result
    pub async fn dial(&self, alias: &str) -> Result<SshControl, DialError> {
        self.start(alias).wait().await
    }
}

/// One hop of an established chain
struct Hop {
    alias: String,
    depth: usize,
    session: Arc<dyn SshSession>,
}

/// Everything the dial thread needs
struct DialContext {
    provider: Arc<dyn ConfigProvider>,
    handshaker: Arc<dyn Handshaker>,
    options: DialOptions,
    shared: Arc<DialShared>,
}

impl DialContext {
    fn run_on_thread(self, result_tx: oneshot::Sender<DialResult>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let err = DialError::Runtime(e.to_string());
                self.finish_failed(&err);
                let _ = result_tx.send(Err(err));
                return;
            }
        };

        runtime.block_on(self.run(result_tx));
    }

    async fn run(&self, result_tx: oneshot::Sender<DialResult>) {
        let token = self.shared.token.clone();
        let alias = self.shared.alias.clone();
        let mut hops = Vec::new();

        match dial_host(self, alias.clone(), 0, token.clone(), &mut hops).await {
            Ok(session) => {
                self.shared.set_state(DialState::Established);
                let chain: Vec<String> = hops.iter().map(|hop| hop.alias.clone()).collect();
                self.record(
                    LogLevel::Info,
                    &alias,
                    0,
                    format!("Established {} via [{}]", alias, chain.join(" -> ")),
                );

                let (finished_tx, finished_rx) = oneshot::channel();
                let established = Established {
                    session,
                    chain,
                    finished: finished_rx,
                };
                if result_tx.send(Ok(established)).is_err() {
                    debug!("Nobody is waiting for {}; tearing down", alias);
                    token.cancel();
                }

                token.cancelled().await;
                self.teardown(hops).await;
                self.shared.set_state(DialState::Closed);
                self.shared.events.complete();
                let _ = finished_tx.send(());
            }
            Err(err) => {
                self.teardown(hops).await;
                self.finish_failed(&err);
                let _ = result_tx.send(Err(err));
            }
        }
    }

    fn finish_failed(&self, err: &DialError) {
        let alias = &self.shared.alias;
        if err.is_cancelled() {
            self.shared.set_state(DialState::Cancelled);
            self.record(LogLevel::Info, alias, 0, format!("Dial to {} cancelled", alias));
            self.shared.events.complete();
        } else {
            self.shared.set_state(DialState::Failed);
            self.record(LogLevel::Error, alias, 0, format!("Dial to {} failed: {}", alias, err));
            self.shared.events.fail(err.to_string());
        }
    }

    /// Close hops outermost first
    async fn teardown(&self, hops: Vec<Hop>) {
        for hop in hops.into_iter().rev() {
            hop.session.close().await;
            self.record(
                LogLevel::Info,
                &hop.alias,
                hop.depth,
                format!("Closed session to {}", hop.alias),
            );
        }
    }

    fn enter(&self, depth: usize, state: DialState) {
        if depth == 0 {
            self.shared.set_state(state);
        }
    }

    fn record(&self, level: LogLevel, alias: &str, depth: usize, message: String) {
        let record = LogRecord::new(level, "dial", message)
            .with("host", alias)
            .with("depth", depth);
        record.emit();
        self.shared.events.send(record);
    }

    async fn resolve(
        &self,
        alias: &str,
        token: &CancellationToken,
    ) -> Result<ResolvedHost, DialError> {
        let lookup = self.provider.resolve(alias);
        match self.options.provider_timeout {
            Some(limit) => cancellable(token, time::timeout(limit, lookup))
                .await?
                .map_err(|_| DialError::Timeout(format!("resolving {}", alias)))?,
            None => cancellable(token, lookup).await?,
        }
    }

    async fn connect_direct(
        &self,
        host: &ResolvedHost,
        token: &CancellationToken,
    ) -> Result<BoxedStream, DialError> {
        let connect = time::timeout(
            self.options.connect_timeout,
            TcpStream::connect((host.hostname.as_str(), host.port)),
        );

        let stream = match cancellable(token, connect).await? {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DialError::Connect {
                    host: host.hostname.clone(),
                    port: host.port,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(DialError::Timeout(format!(
                    "connecting to {}:{}",
                    host.hostname, host.port
                )))
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", host.alias, e);
        }
        Ok(Box::new(stream))
    }
}

/// Dial one alias, recursing through its jump host if it has one.
/// Established sessions are pushed onto `hops` innermost first.
fn dial_host<'a>(
    ctx: &'a DialContext,
    alias: String,
    depth: usize,
    token: CancellationToken,
    hops: &'a mut Vec<Hop>,
) -> BoxFuture<'a, Result<Arc<dyn SshSession>, DialError>> {
    async move {
        let max = ctx.options.max_jump_depth;
        if depth > max {
            return Err(DialError::JumpDepthExceeded { alias, max });
        }

        ctx.enter(depth, DialState::Resolving);
        ctx.record(LogLevel::Info, &alias, depth, format!("Resolving {}", alias));
        let host = ctx.resolve(&alias, &token).await?;

        ctx.enter(depth, DialState::Connecting);
        let transport = match &host.proxy_command {
            Some(template) => {
                let command =
                    ProxyCommand::parse(&proxy::expand(template, &host.hostname, host.port))?;
                ctx.record(
                    LogLevel::Info,
                    &alias,
                    depth,
                    format!(
                        "Connecting to {} through {} ({})",
                        alias, command.host_alias, command.stdio_forward
                    ),
                );

                let jump = dial_host(
                    ctx,
                    command.host_alias.clone(),
                    depth + 1,
                    token.child_token(),
                    hops,
                )
                .await?;

                let target = &command.stdio_forward;
                cancellable(&token, jump.open_forward(&target.host, target.port)).await??
            }
            None => {
                ctx.record(
                    LogLevel::Info,
                    &alias,
                    depth,
                    format!("Connecting to {}:{}", host.hostname, host.port),
                );
                ctx.connect_direct(&host, &token).await?
            }
        };

        ctx.enter(depth, DialState::Handshaking);
        ctx.record(LogLevel::Debug, &alias, depth, format!("Handshaking with {}", alias));
        let session = cancellable(&token, ctx.handshaker.handshake(&host, transport)).await??;

        hops.push(Hop {
            alias: alias.clone(),
            depth,
            session: session.clone(),
        });
        Ok(session)
    }
    .boxed()
}

/// Race `fut` against cancellation
async fn cancellable<F, T>(token: &CancellationToken, fut: F) -> Result<T, DialError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DialError::Cancelled),
        out = fut => Ok(out),
    }
}
