//! Handles returned by the orchestrator
//!
//! [`DialHandle`] follows a dial that is still in progress; [`SshControl`]
//! owns an established chain. Both share one cancellation token with the
//! dial thread, so cancelling either tears down every hop of the chain.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use burrow_core::{LogRecord, Replay, ReplayReceiver};

use crate::dial::DialState;
use crate::error::DialError;
use crate::session::{BoxedStream, SshSession};

/// State shared between a dial thread and the handles observing it
pub(crate) struct DialShared {
    pub(crate) alias: String,
    pub(crate) token: CancellationToken,
    pub(crate) events: Replay<LogRecord>,
    state: Mutex<DialState>,
}

impl DialShared {
    pub(crate) fn new(alias: &str, event_history: usize) -> Self {
        Self {
            alias: alias.to_string(),
            token: CancellationToken::new(),
            events: Replay::new(event_history),
            state: Mutex::new(DialState::Resolving),
        }
    }

    pub(crate) fn state(&self) -> DialState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: DialState) {
        *self.state.lock() = state;
    }
}

/// What the dial thread hands back once the outer session is up
pub(crate) struct Established {
    pub(crate) session: Arc<dyn SshSession>,
    pub(crate) chain: Vec<String>,
    pub(crate) finished: oneshot::Receiver<()>,
}

pub(crate) type DialResult = Result<Established, DialError>;

/// A dial in progress
pub struct DialHandle {
    shared: Arc<DialShared>,
    result: Option<oneshot::Receiver<DialResult>>,
}

impl DialHandle {
    pub(crate) fn new(shared: Arc<DialShared>, result: oneshot::Receiver<DialResult>) -> Self {
        Self {
            shared,
            result: Some(result),
        }
    }

    pub fn alias(&self) -> &str {
        &self.shared.alias
    }

    pub fn state(&self) -> DialState {
        self.shared.state()
    }

    /// Abort the dial. Safe to call any number of times.
    pub fn cancel(&self) {
        self.shared.token.cancel();
    }

    pub fn events(&self) -> ReplayReceiver<LogRecord> {
        self.shared.events.subscribe()
    }

    /// Wait for the dial to finish. Dropping the returned future cancels it.
    pub async fn wait(mut self) -> Result<SshControl, DialError> {
        let Some(result) = self.result.take() else {
            return Err(DialError::Runtime("dial result already taken".into()));
        };

        let guard = self.shared.token.clone().drop_guard();
        let outcome = result.await;
        guard.disarm();

        match outcome {
            Ok(Ok(established)) => Ok(SshControl::new(self.shared.clone(), established)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DialError::Runtime(format!(
                "dial thread for {} exited without a result",
                self.shared.alias
            ))),
        }
    }
}

impl Drop for DialHandle {
    fn drop(&mut self) {
        if self.result.is_some() {
            self.shared.token.cancel();
        }
    }
}

/// An established SSH connection, possibly reached through jump hosts
///
/// Call [`SshControl::release`] when done. Dropping the control still
/// cancels the chain but cannot wait for the teardown to finish.
pub struct SshControl {
    shared: Arc<DialShared>,
    session: Arc<dyn SshSession>,
    chain: Vec<String>,
    finished: Option<oneshot::Receiver<()>>,
}

impl SshControl {
    fn new(shared: Arc<DialShared>, established: Established) -> Self {
        Self {
            shared,
            session: established.session,
            chain: established.chain,
            finished: Some(established.finished),
        }
    }

    pub fn alias(&self) -> &str {
        &self.shared.alias
    }

    /// Aliases of every hop in dial order, ending with this host
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    pub fn session(&self) -> &Arc<dyn SshSession> {
        &self.session
    }

    pub fn state(&self) -> DialState {
        self.shared.state()
    }

    /// Open a forward from the remote host
    pub async fn open_forward(&self, host: &str, port: u16) -> Result<BoxedStream, DialError> {
        if self.is_cancelled() {
            return Err(DialError::Cancelled);
        }
        self.session.open_forward(host, port).await
    }

    /// Start tearing down the chain. Idempotent.
    pub fn cancel(&self) {
        self.shared.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Progress and teardown records, including everything already logged
    pub fn events(&self) -> ReplayReceiver<LogRecord> {
        self.shared.events.subscribe()
    }

    /// The underlying replay stream, for subscribing after release
    pub fn event_log(&self) -> Replay<LogRecord> {
        self.shared.events.clone()
    }

    /// Cancel and wait until every hop is closed
    pub async fn release(mut self) {
        self.cancel();
        if let Some(finished) = self.finished.take() {
            let _ = finished.await;
        }
    }
}

impl Drop for SshControl {
    fn drop(&mut self) {
        if self.finished.is_some() && !self.is_cancelled() {
            warn!("SSH control for {} dropped without release", self.shared.alias);
        }
        self.cancel();
    }
}

impl std::fmt::Debug for SshControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshControl")
            .field("alias", &self.shared.alias)
            .field("chain", &self.chain)
            .field("state", &self.state())
            .finish()
    }
}
