//! One registered cluster: credentials slot, lifecycle flags and cancellation scope.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use kdash_core::{ClusterInfo, ClusterStatus};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provider::ClusterCredentials;

#[derive(Debug)]
pub struct ClusterConnection<C> {
    id: String,
    credentials: ArcSwapOption<C>,
    authenticated: AtomicBool,
    running: AtomicBool,
    generation: AtomicU64,
    cancel: CancellationToken,
    auth_gate: Mutex<()>,
}

impl<C: ClusterCredentials> ClusterConnection<C> {
    pub(crate) fn new(id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            id: id.into(),
            credentials: ArcSwapOption::const_empty(),
            authenticated: AtomicBool::new(false),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            cancel,
            auth_gate: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current credentials, if authenticated.
    pub fn credentials(&self) -> Option<Arc<C>> {
        self.credentials.load_full()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn mark_running(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Bumped every time credentials are installed.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) async fn lock_auth(&self) -> MutexGuard<'_, ()> {
        self.auth_gate.lock().await
    }

    pub(crate) fn install_credentials(&self, creds: C) -> Arc<C> {
        let creds = Arc::new(creds);
        self.credentials.store(Some(Arc::clone(&creds)));
        self.authenticated.store(true, Ordering::Release);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(cluster = %self.id, generation, "credentials installed");
        creds
    }

    /// Child token for work bound to this cluster; cancelled by [`ClusterConnection::stop`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Cancel every watcher of this cluster. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.running.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Probe the live cluster. A never-authenticated cluster is reported unhealthy without authenticating.
    pub async fn health(&self) -> bool {
        let Some(creds) = self.credentials() else {
            return false;
        };
        match creds.probe().await {
            Ok(()) => true,
            Err(e) => {
                warn!(cluster = %self.id, error = %e, "health probe failed");
                false
            }
        }
    }

    pub fn info(&self) -> ClusterInfo {
        let status = if self.is_running() {
            ClusterStatus::Running
        } else if self.is_authenticated() {
            ClusterStatus::Authenticated
        } else {
            ClusterStatus::Registered
        };
        ClusterInfo {
            id: self.id.clone(),
            name: self.id.clone(),
            api_url: self.credentials().and_then(|c| c.api_url()).unwrap_or_default(),
            status,
        }
    }
}
