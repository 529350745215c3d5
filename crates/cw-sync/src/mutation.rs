//! Optimistic cache writes with rollback.

use cw_client_api::{ClientApiResult, RemoteApi};
use cw_sync_contract::validation::validate_resource_key;
use cw_sync_contract::ResourceKey;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::cache::{QueryCache, QueryState};
use crate::config::ConflictPolicy;
use crate::{Result, SyncError};

const TRANSITION_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Applied,
    Confirmed,
    RolledBack,
}

/// One in-flight speculative write
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub id: u64,
    pub key: ResourceKey,
    /// Cache state before the write; `None` when the key was not cached
    pub previous_value: Option<QueryState>,
    pub applied_value: Value,
    pub status: MutationStatus,
}

type KeyLocks = HashMap<ResourceKey, Arc<AsyncMutex<()>>>;

/// Applies speculative values to the cache ahead of the remote call that
/// makes them real, then either confirms and reconciles with server truth
/// or restores the snapshot.
///
/// Mutations on one key are serialized according to the [`ConflictPolicy`];
/// mutations on different keys run independently.
#[derive(Clone)]
pub struct OptimisticMutationCoordinator {
    cache: QueryCache,
    api: Arc<dyn RemoteApi>,
    policy: ConflictPolicy,
    locks: Arc<Mutex<KeyLocks>>,
    pending: Arc<Mutex<HashMap<ResourceKey, PendingMutation>>>,
    transitions: broadcast::Sender<PendingMutation>,
    next_id: Arc<AtomicU64>,
}

impl OptimisticMutationCoordinator {
    pub fn new(cache: QueryCache, api: Arc<dyn RemoteApi>, policy: ConflictPolicy) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            cache,
            api,
            policy,
            locks: Arc::default(),
            pending: Arc::default(),
            transitions,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// The applied, unsettled mutation on `key`
    pub fn pending(&self, key: &ResourceKey) -> Option<PendingMutation> {
        self.pending_map().get(key).cloned()
    }

    pub fn in_flight(&self) -> usize {
        self.pending_map().len()
    }

    /// Every status change of every mutation, in order
    pub fn transitions(&self) -> broadcast::Receiver<PendingMutation> {
        self.transitions.subscribe()
    }

    /// Write `new_value` under `key`, run `remote_call`, then confirm or roll
    /// back. The remote call's error is returned as `RemoteCallFailed`.
    pub async fn mutate<T, F, Fut>(
        &self,
        key: &ResourceKey,
        new_value: Value,
        remote_call: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ClientApiResult<T>>,
    {
        self.mutate_with(key, move |_| Ok(new_value), remote_call)
            .await
    }

    /// Like [`OptimisticMutationCoordinator::mutate`], deriving the
    /// speculative value from the cached one. An error from `patch` leaves
    /// the cache untouched and skips the remote call.
    pub async fn mutate_with<T, P, F, Fut>(
        &self,
        key: &ResourceKey,
        patch: P,
        remote_call: F,
    ) -> Result<T>
    where
        P: FnOnce(Option<&Value>) -> Result<Value>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ClientApiResult<T>>,
    {
        validate_resource_key(key)?;
        let lock = self.acquire(key).await?;

        let (previous_value, applied_value) = self.cache.apply_speculative(key, patch)?;
        let mutation = PendingMutation {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            key: key.clone(),
            previous_value,
            applied_value,
            status: MutationStatus::Applied,
        };
        debug!(%key, id = mutation.id, "speculative write applied");
        let in_flight = InFlight::start(self, mutation, lock);

        match remote_call().await {
            Ok(value) => {
                in_flight.confirm();
                // Server truth replaces the speculative value
                let _ = self.reconcile(key).await;
                Ok(value)
            }
            Err(err) => {
                warn!(%key, error = %err, "remote call failed, rolling back");
                in_flight.roll_back();
                Err(SyncError::RemoteCallFailed(err))
            }
        }
    }

    /// Run a remote call that changes `key` without a speculative write,
    /// serialized with other mutations on the key, and reconcile afterwards.
    pub async fn execute<T, F, Fut>(&self, key: &ResourceKey, remote_call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ClientApiResult<T>>,
    {
        validate_resource_key(key)?;
        let _lock = self.acquire(key).await?;

        let value = remote_call().await?;
        let _ = self.reconcile(key).await;
        Ok(value)
    }

    /// Mark `key` and everything under it stale, then refetch `key`. A failed
    /// refetch leaves the entry stale for the next read or refresh.
    pub async fn reconcile(&self, key: &ResourceKey) -> Result<()> {
        self.cache.invalidate_quiet(key);
        if !self.cache.contains(key) {
            return Ok(());
        }
        match self.cache.refetch(self.api.as_ref(), key).await {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(%key, error = %err, "reconcile failed, entry left stale");
                Err(err)
            }
        }
    }

    /// Mark `key` and everything under it stale for background refetching
    pub fn invalidate(&self, key: &ResourceKey) {
        self.cache.invalidate(key);
    }

    async fn acquire(&self, key: &ResourceKey) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop locks nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };

        match self.policy {
            ConflictPolicy::Reject => lock.try_lock_owned().map_err(|_| {
                debug!(%key, "mutation rejected, key busy");
                SyncError::conflict(key)
            }),
            ConflictPolicy::Queue => Ok(lock.lock_owned().await),
        }
    }

    fn pending_map(&self) -> MutexGuard<'_, HashMap<ResourceKey, PendingMutation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, mutation: &PendingMutation) {
        let _ = self.transitions.send(mutation.clone());
    }
}

/// Settles a mutation exactly once. If dropped while still applied (the
/// caller's future was dropped mid-call) the snapshot is restored.
struct InFlight<'a> {
    coordinator: &'a OptimisticMutationCoordinator,
    mutation: PendingMutation,
    _lock: OwnedMutexGuard<()>,
}

impl<'a> InFlight<'a> {
    fn start(
        coordinator: &'a OptimisticMutationCoordinator,
        mutation: PendingMutation,
        lock: OwnedMutexGuard<()>,
    ) -> Self {
        coordinator
            .pending_map()
            .insert(mutation.key.clone(), mutation.clone());
        coordinator.publish(&mutation);
        Self {
            coordinator,
            mutation,
            _lock: lock,
        }
    }

    fn confirm(mut self) {
        self.coordinator.cache.settle(&self.mutation.key);
        self.finish(MutationStatus::Confirmed);
    }

    fn roll_back(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        self.coordinator
            .cache
            .rollback(&self.mutation.key, self.mutation.previous_value.clone());
        self.finish(MutationStatus::RolledBack);
    }

    fn finish(&mut self, status: MutationStatus) {
        self.mutation.status = status;
        self.coordinator.pending_map().remove(&self.mutation.key);
        self.coordinator.publish(&self.mutation);
        debug!(key = %self.mutation.key, id = self.mutation.id, ?status, "mutation settled");
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.mutation.status == MutationStatus::Applied {
            warn!(key = %self.mutation.key, "mutation abandoned in flight, rolling back");
            self.restore();
        }
    }
}
