//! Directory of running bridge servers
//!
//! Components that need a bridge on a given port share it through a
//! [`ServiceDirectory`] they are handed explicitly. The first `acquire`
//! starts the server, later ones take a reference, and the last `release`
//! shuts it down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::{BridgeServer, ServerError};

struct Entry {
    server: Arc<BridgeServer>,
    task: JoinHandle<Result<(), ServerError>>,
    refs: usize,
}

#[derive(Default)]
pub struct ServiceDirectory {
    services: Mutex<HashMap<u16, Entry>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the bridge on `port`, binding and starting it with `start` if
    /// none is running yet
    pub async fn acquire<F, Fut>(&self, port: u16, start: F) -> Result<Arc<BridgeServer>, ServerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BridgeServer, ServerError>>,
    {
        let mut services = self.services.lock().await;

        if let Some(entry) = services.get_mut(&port) {
            if !entry.task.is_finished() {
                entry.refs += 1;
                debug!("Bridge on port {} now has {} user(s)", port, entry.refs);
                return Ok(entry.server.clone());
            }
            warn!("Bridge on port {} exited on its own, restarting", port);
            services.remove(&port);
        }

        let server = Arc::new(start().await?);
        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve().await });

        info!("Started bridge service on port {}", port);
        services.insert(
            port,
            Entry {
                server: server.clone(),
                task,
                refs: 1,
            },
        );
        Ok(server)
    }

    /// Drop one reference; the server stops when none remain.
    /// Returns `true` if this call stopped it.
    pub async fn release(&self, port: u16) -> bool {
        let entry = {
            let mut services = self.services.lock().await;
            let Some(entry) = services.get_mut(&port) else {
                return false;
            };
            if entry.refs > 1 {
                entry.refs -= 1;
                return false;
            }
            match services.remove(&port) {
                Some(entry) => entry,
                None => return false,
            }
        };

        entry.server.shutdown_token().cancel();
        match entry.task.await {
            Ok(Err(e)) => warn!("Bridge on port {} stopped with error: {}", port, e),
            Err(e) => warn!("Bridge task on port {} panicked: {}", port, e),
            Ok(Ok(())) => {}
        }
        info!("Stopped bridge service on port {}", port);
        true
    }

    pub async fn get(&self, port: u16) -> Option<Arc<BridgeServer>> {
        self.services
            .lock()
            .await
            .get(&port)
            .map(|e| e.server.clone())
    }

    pub async fn references(&self, port: u16) -> usize {
        self.services
            .lock()
            .await
            .get(&port)
            .map_or(0, |e| e.refs)
    }

    pub async fn len(&self) -> usize {
        self.services.lock().await.len()
    }

    /// Stop everything regardless of outstanding references
    pub async fn shutdown(&self) {
        let entries: Vec<(u16, Entry)> = self.services.lock().await.drain().collect();
        for (port, entry) in entries {
            entry.server.shutdown_token().cancel();
            let _ = entry.task.await;
            debug!("Shut down bridge on port {}", port);
        }
    }
}
