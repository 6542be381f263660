//! Shared execution resources keyed by session-provider identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::error::SessionError;
use crate::transport::SessionProvider;

static GLOBAL_GROUPS: LazyLock<Arc<EventLoopGroupManager>> =
    LazyLock::new(|| Arc::new(EventLoopGroupManager::new()));

/// A runtime handle that transport work is spawned on.
#[derive(Clone)]
pub struct EventLoopGroup {
    label: Arc<str>,
    handle: Handle,
    // Keeps a dedicated runtime alive while any clone exists.
    runtime: Option<Arc<OwnedRuntime>>,
    // Upgradable until the borrowed runtime drops its tasks.
    liveness: Option<Weak<()>>,
}

impl EventLoopGroup {
    /// Borrow a runtime owned elsewhere.
    ///
    /// A parked task is spawned on `handle` so the group can tell when that
    /// runtime has shut down; see [`EventLoopGroup::is_alive`].
    #[must_use]
    pub fn from_handle(label: impl Into<Arc<str>>, handle: Handle) -> Self {
        let token = Arc::new(());
        let liveness = Arc::downgrade(&token);
        drop(handle.spawn(async move {
            std::future::pending::<()>().await;
            drop(token);
        }));
        Self {
            label: label.into(),
            handle,
            runtime: None,
            liveness: Some(liveness),
        }
    }

    fn from_runtime(label: impl Into<Arc<str>>, runtime: Runtime) -> Self {
        Self {
            label: label.into(),
            handle: runtime.handle().clone(),
            runtime: Some(Arc::new(OwnedRuntime(Some(runtime)))),
            liveness: None,
        }
    }

    /// False once a borrowed runtime has shut down. Work spawned on a dead
    /// runtime is dropped without running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.liveness
            .as_ref()
            .is_none_or(|token| token.strong_count() > 0)
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("label", &self.label)
            .field("dedicated", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}

struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics.
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Lazily creates and then reuses one group per provider id.
///
/// A group whose borrowed runtime has shut down is rebuilt on next use, so a
/// long-lived manager keeps working across runtimes.
#[derive(Default)]
pub struct EventLoopGroupManager {
    groups: Mutex<HashMap<String, EventLoopGroup>>,
}

impl EventLoopGroupManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_GROUPS)
    }

    /// Returns the group for `provider.id()`, creating it on first use.
    ///
    /// # Errors
    /// Propagates the provider's group construction failure.
    pub fn group(&self, provider: &dyn SessionProvider) -> Result<EventLoopGroup, SessionError> {
        if let Some(group) = self.groups.lock().get(provider.id())
            && group.is_alive()
        {
            return Ok(group.clone());
        }

        // Build outside the lock; a concurrent live winner is kept.
        let created = provider.group()?;
        let mut groups = self.groups.lock();
        match groups.get(provider.id()) {
            Some(existing) if existing.is_alive() => Ok(existing.clone()),
            stale => {
                if stale.is_some() {
                    debug!(provider_id = provider.id(), "event loop group runtime is gone; replacing");
                } else {
                    debug!(provider_id = provider.id(), group = created.label(), "event loop group created");
                }
                groups.insert(provider.id().to_owned(), created.clone());
                Ok(created)
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.lock().is_empty()
    }
}

impl fmt::Debug for EventLoopGroupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopGroupManager")
            .field("groups", &self.len())
            .finish()
    }
}

/// Runs transport work on the tokio runtime that asks for the group, until
/// that runtime shuts down.
#[derive(Debug, Clone)]
pub struct CurrentRuntimeProvider {
    id: String,
}

impl CurrentRuntimeProvider {
    pub const DEFAULT_ID: &'static str = "current-runtime";

    #[must_use]
    pub fn new() -> Self {
        Self::with_id(Self::DEFAULT_ID)
    }

    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for CurrentRuntimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionProvider for CurrentRuntimeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn group(&self) -> Result<EventLoopGroup, SessionError> {
        let handle = Handle::try_current()
            .map_err(|e| SessionError::Configuration(format!("no tokio runtime: {e}")))?;
        Ok(EventLoopGroup::from_handle(self.id.as_str(), handle))
    }
}

/// Owns a separate multi-threaded runtime for its sessions.
#[derive(Debug, Clone)]
pub struct DedicatedRuntimeProvider {
    id: String,
    worker_threads: usize,
}

impl DedicatedRuntimeProvider {
    #[must_use]
    pub fn new(id: impl Into<String>, worker_threads: usize) -> Self {
        Self {
            id: id.into(),
            worker_threads: worker_threads.max(1),
        }
    }
}

impl SessionProvider for DedicatedRuntimeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn group(&self) -> Result<EventLoopGroup, SessionError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .thread_name(format!("http-session-{}", self.id))
            .enable_all()
            .build()
            .map_err(|e| SessionError::Configuration(format!("runtime for {}: {e}", self.id)))?;
        Ok(EventLoopGroup::from_runtime(self.id.as_str(), runtime))
    }
}
