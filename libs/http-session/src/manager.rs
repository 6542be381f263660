//! Shared pool of transport clients keyed by configuration.
//!
//! Sessions with equal [`SessionConfiguration`]s on the same provider share a
//! single [`Client`]. Entries are refreshed on every lookup; a sweep retires
//! entries that went unused for longer than the configured lifetime and have
//! no request in flight.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fnv::FnvHasher;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};

use crate::client::Client;
use crate::config::{ClientManagerConfig, SessionConfiguration};
use crate::error::SessionError;
use crate::event_loop::EventLoopGroupManager;
use crate::transport::{SessionProvider, TransportFactory};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Pool key: the provider identity plus every configuration field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigurationFingerprint {
    provider_id: String,
    configuration: SessionConfiguration,
}

impl ConfigurationFingerprint {
    #[must_use]
    pub fn new(provider_id: impl Into<String>, configuration: SessionConfiguration) -> Self {
        Self {
            provider_id: provider_id.into(),
            configuration,
        }
    }

    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    #[must_use]
    pub fn configuration(&self) -> &SessionConfiguration {
        &self.configuration
    }

    /// Short digest for log correlation. Equality never relies on it.
    #[must_use]
    pub fn digest(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

struct PoolEntry {
    client: Arc<Client>,
    read_at: Instant,
}

pub struct ClientManager {
    factory: Arc<dyn TransportFactory>,
    groups: Arc<EventLoopGroupManager>,
    config: ClientManagerConfig,
    entries: Mutex<HashMap<ConfigurationFingerprint, PoolEntry>>,
}

impl ClientManager {
    #[must_use]
    pub fn new(factory: Arc<dyn TransportFactory>, config: ClientManagerConfig) -> Self {
        Self {
            factory,
            groups: EventLoopGroupManager::global(),
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Use `groups` instead of the process-wide group manager.
    #[must_use]
    pub fn with_event_loop_groups(mut self, groups: Arc<EventLoopGroupManager>) -> Self {
        self.groups = groups;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ClientManagerConfig {
        &self.config
    }

    /// Return the pooled client for `configuration` on `provider`, creating
    /// it on first use.
    ///
    /// Construction runs outside the pool lock. When two callers race on the
    /// same key, the first insert wins and the loser's client is shut down.
    ///
    /// # Errors
    /// Group or transport construction failures; nothing is pooled then.
    pub fn client(
        &self,
        configuration: &SessionConfiguration,
        provider: &dyn SessionProvider,
    ) -> Result<Arc<Client>, SessionError> {
        let key = ConfigurationFingerprint::new(provider.id(), configuration.clone());
        if let Some(client) = self.lookup(&key) {
            return Ok(client);
        }

        let digest = key.digest();
        let group = self.groups.group(provider)?;
        let transport = self
            .factory
            .make_client(configuration, &group)
            .inspect_err(|e| {
                warn!(fingerprint = digest, error = %e, "failed to construct pooled client");
            })?;
        let created = Arc::new(Client::new(transport, group));

        let mut entries = self.entries.lock();
        match entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.read_at = Instant::now();
                let winner = Arc::clone(&entry.client);
                drop(entries);
                debug!(fingerprint = digest, "lost construction race; discarding client");
                discard(created);
                Ok(winner)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PoolEntry {
                    client: Arc::clone(&created),
                    read_at: Instant::now(),
                });
                info!(
                    fingerprint = digest,
                    client_id = created.id(),
                    provider_id = provider.id(),
                    "pooled client created"
                );
                Ok(created)
            }
        }
    }

    fn lookup(&self, key: &ConfigurationFingerprint) -> Option<Arc<Client>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if entry.client.is_closed() {
            entries.remove(key);
            return None;
        }
        if !entry.client.group().is_alive() {
            debug!(client_id = entry.client.id(), "pooled client's runtime is gone; rebuilding");
            entries.remove(key);
            return None;
        }
        entry.read_at = Instant::now();
        trace!(client_id = entry.client.id(), "pooled client reused");
        Some(Arc::clone(&entry.client))
    }

    /// Retire every entry idle for longer than the lifetime.
    ///
    /// Returns the number of clients shut down.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    /// [`ClientManager::sweep`] as seen from `now`.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let lifetime = self.config.lifetime;
        let expired: Vec<_> = self
            .entries
            .lock()
            .extract_if(|_, entry| {
                now.saturating_duration_since(entry.read_at) > lifetime
                    && entry.client.close_if_idle()
            })
            .collect();
        release(expired).await
    }

    /// Retire every idle entry regardless of age. Busy entries stay pooled.
    ///
    /// Returns the number of clients shut down.
    pub async fn shutdown_all(&self) -> usize {
        let idle: Vec<_> = self
            .entries
            .lock()
            .extract_if(|_, entry| entry.client.close_if_idle())
            .collect();
        release(idle).await
    }

    /// Run [`ClientManager::sweep`] every `sweep_interval` until the handle is
    /// stopped or dropped, or the manager itself is dropped.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let manager = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let task = tokio::spawn(run_sweeper(manager, period, cancelled));
        SweeperHandle {
            _stop_on_drop: token.clone().drop_guard(),
            token,
            task,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientManager")
            .field("config", &self.config)
            .field("clients", &self.len())
            .finish_non_exhaustive()
    }
}

async fn release(retired: Vec<(ConfigurationFingerprint, PoolEntry)>) -> usize {
    let mut released = 0;
    for (key, entry) in retired {
        let digest = key.digest();
        match entry.client.release_transport().await {
            Ok(()) => {
                info!(fingerprint = digest, client_id = entry.client.id(), "pooled client expired");
                released += 1;
            }
            Err(e) => {
                warn!(fingerprint = digest, client_id = entry.client.id(), error = %e, "failed to shut down expired client");
            }
        }
    }
    released
}

fn discard(client: Arc<Client>) {
    let handle = client.group().handle().clone();
    handle.spawn(async move {
        if let Err(e) = client.shutdown().await {
            warn!(client_id = client.id(), error = %e, "failed to shut down discarded client");
        }
    });
}

async fn run_sweeper(manager: Weak<ClientManager>, period: Duration, cancelled: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancelled.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let released = manager.sweep().await;
        if released > 0 {
            debug!(released, remaining = manager.len(), "sweep finished");
        }
    }
    debug!("client sweeper stopped");
}

/// Owner of the background sweep task. Dropping it stops the sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    _stop_on_drop: DropGuard,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "client sweeper did not exit cleanly");
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
