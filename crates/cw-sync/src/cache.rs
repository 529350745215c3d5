//! Local read cache keyed by [`ResourceKey`].
//!
//! Reads hydrate entries from the remote store. Writes other than hydration
//! are crate-private: only the invalidation dispatcher, the polling fallback
//! and the mutation coordinator change entries.

use cw_client_api::RemoteApi;
use cw_sync_contract::ResourceKey;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::polling::RefreshSink;
use crate::Result;

const EVENT_CAPACITY: usize = 256;

/// State of one cached query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState {
    Loading,
    Ready(Value),
    Error(String),
}

impl QueryState {
    pub fn data(&self) -> Option<&Value> {
        match self {
            QueryState::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, QueryState::Ready(_))
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, QueryState::Loading)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// An entry got a new state
    Updated(ResourceKey),
    /// Entries under this prefix were marked stale
    Invalidated(ResourceKey),
    /// An entry was dropped
    Removed(ResourceKey),
}

#[derive(Debug, Clone)]
struct Entry {
    state: QueryState,
    stale: bool,
    /// A speculative value is applied; hydration must not overwrite it
    pinned: bool,
    /// Changes on every speculative write, settle and rollback. A fetch
    /// started under an older generation is discarded.
    generation: u64,
}

impl Entry {
    fn fresh(state: QueryState, generation: u64) -> Self {
        Self {
            state,
            stale: false,
            pinned: false,
            generation,
        }
    }
}

#[derive(Clone)]
pub struct QueryCache {
    entries: Arc<RwLock<HashMap<ResourceKey, Entry>>>,
    events: broadcast::Sender<CacheEvent>,
    generations: Arc<AtomicU64>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: Arc::default(),
            events,
            generations: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ResourceKey, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ResourceKey, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CacheEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn get(&self, key: &ResourceKey) -> Option<QueryState> {
        self.read().get(key).map(|entry| entry.state.clone())
    }

    /// The ready value under `key`, if any
    pub fn data(&self, key: &ResourceKey) -> Option<Value> {
        self.read()
            .get(key)
            .and_then(|entry| entry.state.data().cloned())
    }

    pub fn is_stale(&self, key: &ResourceKey) -> bool {
        self.read().get(key).is_some_and(|entry| entry.stale)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stale, unpinned entries under `prefix`
    pub fn stale_keys(&self, prefix: &ResourceKey) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self
            .read()
            .iter()
            .filter(|(key, entry)| entry.stale && !entry.pinned && prefix.is_prefix_of(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Cached state of `key`, fetching it when missing or stale
    pub async fn query(&self, api: &dyn RemoteApi, key: &ResourceKey) -> Result<QueryState> {
        let cached = self
            .read()
            .get(key)
            .filter(|entry| !entry.stale && !matches!(entry.state, QueryState::Error(_)))
            .map(|entry| entry.state.clone());
        if let Some(state) = cached {
            return Ok(state);
        }

        match self.refetch(api, key).await {
            Ok(_) => Ok(self.get(key).unwrap_or(QueryState::Loading)),
            Err(err) => match self.get(key) {
                Some(state) => Ok(state),
                None => Err(err),
            },
        }
    }

    /// Load the server value of `key` into the cache.
    ///
    /// Missing entries pass through `Loading`. Existing data is kept while
    /// the fetch is in flight and also kept, still stale, if it fails. A
    /// result that arrives after a speculative write, settle or rollback of
    /// the entry is discarded.
    pub async fn refetch(&self, api: &dyn RemoteApi, key: &ResourceKey) -> Result<Value> {
        let (generation, inserted) = {
            let mut entries = self.write();
            match entries.get(key) {
                Some(entry) => (entry.generation, false),
                None => {
                    let generation = self.next_generation();
                    entries.insert(key.clone(), Entry::fresh(QueryState::Loading, generation));
                    (generation, true)
                }
            }
        };
        if inserted {
            self.emit(CacheEvent::Updated(key.clone()));
        }

        debug!(%key, generation, "refetching");
        match api.fetch(key).await {
            Ok(value) => {
                self.hydrate(key, generation, Ok(value.clone()));
                Ok(value)
            }
            Err(err) => {
                warn!(%key, error = %err, "refetch failed");
                self.hydrate(key, generation, Err(err.to_string()));
                Err(err.into())
            }
        }
    }

    fn hydrate(
        &self,
        key: &ResourceKey,
        generation: u64,
        result: std::result::Result<Value, String>,
    ) {
        {
            let mut entries = self.write();
            let Some(entry) = entries.get_mut(key) else {
                debug!(%key, "entry dropped while fetching, discarding result");
                return;
            };

            if entry.generation != generation {
                debug!(%key, "entry changed while fetching, discarding result");
                return;
            }
            if entry.pinned {
                debug!(%key, "keeping speculative value over fetched one");
                entry.stale = true;
                return;
            }

            match result {
                Ok(value) => {
                    entry.state = QueryState::Ready(value);
                    entry.stale = false;
                }
                Err(message) if !entry.state.is_ready() => {
                    entry.state = QueryState::Error(message);
                    entry.stale = false;
                }
                Err(_) => {
                    entry.stale = true;
                }
            }
        }
        self.emit(CacheEvent::Updated(key.clone()));
    }

    /// Mark every entry under `prefix` stale. Returns how many were marked.
    pub(crate) fn invalidate(&self, prefix: &ResourceKey) -> usize {
        let marked = self.mark_stale(prefix);
        self.emit(CacheEvent::Invalidated(prefix.clone()));
        marked
    }

    /// Like [`QueryCache::invalidate`] but without waking background
    /// refetching; for callers that refetch themselves.
    pub(crate) fn invalidate_quiet(&self, prefix: &ResourceKey) -> usize {
        self.mark_stale(prefix)
    }

    fn mark_stale(&self, prefix: &ResourceKey) -> usize {
        let mut entries = self.write();
        let mut marked = 0;
        for (key, entry) in entries.iter_mut() {
            if prefix.is_prefix_of(key) {
                entry.stale = true;
                marked += 1;
            }
        }
        marked
    }

    /// Snapshot `key` and replace it with `patch(current)` in one step,
    /// pinning the entry until [`QueryCache::settle`] or
    /// [`QueryCache::rollback`]. Nothing changes if `patch` fails.
    pub(crate) fn apply_speculative<F>(
        &self,
        key: &ResourceKey,
        patch: F,
    ) -> Result<(Option<QueryState>, Value)>
    where
        F: FnOnce(Option<&Value>) -> Result<Value>,
    {
        let applied = {
            let mut entries = self.write();
            let snapshot = entries.get(key).map(|entry| entry.state.clone());
            let value = patch(snapshot.as_ref().and_then(QueryState::data))?;
            entries.insert(
                key.clone(),
                Entry {
                    state: QueryState::Ready(value.clone()),
                    stale: false,
                    pinned: true,
                    generation: self.next_generation(),
                },
            );
            (snapshot, value)
        };
        self.emit(CacheEvent::Updated(key.clone()));
        Ok(applied)
    }

    /// Unpin a confirmed speculative value
    pub(crate) fn settle(&self, key: &ResourceKey) {
        let generation = self.next_generation();
        if let Some(entry) = self.write().get_mut(key) {
            entry.pinned = false;
            entry.generation = generation;
        }
    }

    /// Restore the pre-mutation snapshot; `None` removes the entry.
    ///
    /// An invalidation that landed while the speculative value was pinned
    /// survives: the restored entry stays stale and is handed to background
    /// refetching.
    pub(crate) fn rollback(&self, key: &ResourceKey, snapshot: Option<QueryState>) {
        let generation = self.next_generation();
        let (event, stale) = {
            let mut entries = self.write();
            let stale = entries.get(key).is_some_and(|entry| entry.stale);
            match snapshot {
                Some(state) => {
                    let mut entry = Entry::fresh(state, generation);
                    entry.stale = stale;
                    entries.insert(key.clone(), entry);
                    (CacheEvent::Updated(key.clone()), stale)
                }
                None => {
                    entries.remove(key);
                    (CacheEvent::Removed(key.clone()), false)
                }
            }
        };
        self.emit(event);
        if stale {
            debug!(%key, "invalidated while pinned, restored entry left stale");
            self.emit(CacheEvent::Invalidated(key.clone()));
        }
    }
}

impl RefreshSink for QueryCache {
    fn refresh(&self, keys: &[ResourceKey]) {
        for key in keys {
            self.invalidate(key);
        }
    }
}
