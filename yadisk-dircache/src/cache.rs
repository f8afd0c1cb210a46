use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::builder::{BuilderConfig, BuilderError, BuilderWorker, Snapshot};
use crate::bus::{CacheId, InvalidationBus, InvalidationReceiver};
use crate::paths;
use crate::transport::{DirectoryTransport, TransportError};
use crate::tree::TreeNode;

const DEFAULT_TTL_SECS: u64 = 30;
const DEFAULT_MAX_ENTRIES: usize = 64;
const LOAD_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Age after which an entry is stale.
    pub ttl: Duration,
    pub max_entries: usize,
    pub builder: BuilderConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_entries: DEFAULT_MAX_ENTRIES,
            builder: BuilderConfig::default(),
        }
    }
}

/// Listings with and without dot-files are cached independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: String,
    pub include_hidden: bool,
}

impl CacheKey {
    pub fn new(path: &str, include_hidden: bool) -> Result<Self, CacheError> {
        let path = paths::normalize(path).ok_or_else(|| CacheError::InvalidPath(path.to_string()))?;
        Ok(Self {
            path,
            include_hidden,
        })
    }

    fn both(path: &str) -> [CacheKey; 2] {
        [false, true].map(|include_hidden| CacheKey {
            path: path.to_string(),
            include_hidden,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub stale_while_revalidate: bool,
    pub include_hidden: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            stale_while_revalidate: true,
            include_hidden: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Arc<TreeNode>,
    pub cached_at: Instant,
    /// Strictly increasing across every write of the cache.
    pub generation: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() < ttl
    }
}

/// Progress of a load, published for every snapshot the builder emits.
#[derive(Debug, Clone)]
pub struct LoadEvent {
    pub key: CacheKey,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("transport error: {0}")]
    Transport(Arc<TransportError>),
    #[error("tree builder error: {0}")]
    Builder(#[from] BuilderError),
}

impl From<TransportError> for CacheError {
    fn from(err: TransportError) -> Self {
        Self::Transport(Arc::new(err))
    }
}

type LoadResult = Result<Arc<TreeNode>, CacheError>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

struct InFlight {
    id: u64,
    load: SharedLoad,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<CacheKey, InFlight>,
    revalidating: HashSet<CacheKey>,
    next_generation: u64,
    next_fetch_id: u64,
}

impl CacheState {
    fn write(&mut self, key: CacheKey, data: Arc<TreeNode>, max_entries: usize) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.entries.insert(
            key,
            CacheEntry {
                data,
                cached_at: Instant::now(),
                generation,
            },
        );
        self.evict(max_entries);
        generation
    }

    fn evict(&mut self, max_entries: usize) {
        while self.entries.len() > max_entries.max(1) {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            debug!(path = %oldest.path, "evicting oldest listing");
            self.entries.remove(&oldest);
        }
    }

    /// Drops both hidden variants, detaching any in-flight fetch for them.
    fn remove_path(&mut self, path: &str) {
        for key in CacheKey::both(path) {
            self.entries.remove(&key);
            self.in_flight.remove(&key);
        }
    }
}

struct CacheInner {
    config: CacheConfig,
    transport: Arc<dyn DirectoryTransport>,
    state: Mutex<CacheState>,
    events: broadcast::Sender<LoadEvent>,
    bus: Option<(InvalidationBus, CacheId)>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().expect("directory cache lock poisoned")
    }

    fn invalidate_local(&self, path: &str) {
        let mut state = self.lock();
        state.remove_path(path);
        if let Some(parent) = paths::parent(path) {
            state.remove_path(&parent);
        }
        debug!(path, "invalidated listing and its parent");
    }

    fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.in_flight.clear();
    }

    fn finish_fetch(&self, key: &CacheKey, id: u64, result: &LoadResult) {
        let mut state = self.lock();
        if state.in_flight.get(key).is_some_and(|flight| flight.id == id) {
            state.in_flight.remove(key);
        }
        if let Ok(tree) = result {
            let generation = state.write(key.clone(), Arc::clone(tree), self.config.max_entries);
            debug!(path = %key.path, generation, "committed fetched listing");
        }
    }

    fn finish_revalidation(
        &self,
        key: &CacheKey,
        observed: u64,
        result: Result<TreeNode, CacheError>,
    ) {
        let mut state = self.lock();
        state.revalidating.remove(key);
        match result {
            Ok(tree) => {
                let current = state.entries.get(key).map(|entry| entry.generation);
                if current == Some(observed) {
                    let generation =
                        state.write(key.clone(), Arc::new(tree), self.config.max_entries);
                    debug!(path = %key.path, generation, "committed revalidated listing");
                } else {
                    debug!(
                        path = %key.path,
                        observed,
                        ?current,
                        "discarding revalidation superseded by a newer write"
                    );
                }
            }
            Err(err) => warn!(path = %key.path, "background revalidation failed: {err}"),
        }
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().ok().and_then(Option::take) {
            listener.abort();
        }
    }
}

/// Time-bounded cache of directory trees with single-flight fetching and
/// stale-while-revalidate reads. Clones share the same state.
#[derive(Clone)]
pub struct DirectoryCache {
    inner: Arc<CacheInner>,
}

impl DirectoryCache {
    pub fn new(transport: Arc<dyn DirectoryTransport>, config: CacheConfig) -> Self {
        Self::build(transport, config, None)
    }

    /// Joins `bus`: invalidations made here reach every other cache on the
    /// bus and theirs reach this one. Must be called within a tokio runtime.
    pub fn with_bus(
        transport: Arc<dyn DirectoryTransport>,
        config: CacheConfig,
        bus: &InvalidationBus,
    ) -> Self {
        let id = bus.register();
        let receiver = bus.subscribe();
        let cache = Self::build(transport, config, Some((bus.clone(), id)));
        let handle = tokio::spawn(listen(Arc::downgrade(&cache.inner), id, receiver));
        *cache
            .inner
            .listener
            .lock()
            .expect("directory cache listener lock poisoned") = Some(handle);
        cache
    }

    fn build(
        transport: Arc<dyn DirectoryTransport>,
        config: CacheConfig,
        bus: Option<(InvalidationBus, CacheId)>,
    ) -> Self {
        let (events, _) = broadcast::channel(LOAD_EVENT_CAPACITY);
        Self {
            inner: Arc::new(CacheInner {
                config,
                transport,
                state: Mutex::new(CacheState::default()),
                events,
                bus,
                listener: Mutex::new(None),
            }),
        }
    }

    /// Bus identity, when the cache was created with [`DirectoryCache::with_bus`].
    pub fn id(&self) -> Option<CacheId> {
        self.inner.bus.as_ref().map(|(_, id)| *id)
    }

    /// Fresh entries are returned as is. A stale entry is returned at once
    /// when `stale_while_revalidate` is set, with one background refresh
    /// started for its key; otherwise the caller waits for a fetch.
    pub async fn get(&self, path: &str, options: ReadOptions) -> Result<Arc<TreeNode>, CacheError> {
        let key = CacheKey::new(path, options.include_hidden)?;
        if let Some(entry) = self.peek_key(&key) {
            if entry.is_fresh(self.inner.config.ttl) {
                debug!(path = %key.path, generation = entry.generation, "cache hit");
                return Ok(entry.data);
            }
            if options.stale_while_revalidate {
                debug!(path = %key.path, generation = entry.generation, "serving stale listing");
                self.spawn_revalidation(key, entry.generation);
                return Ok(entry.data);
            }
        }
        debug!(path = %key.path, "cache miss");
        self.load_shared(key).await
    }

    /// Loads `path` from the transport, joining an in-flight load for the
    /// same key if there is one. Failures are shared but never cached.
    pub async fn fetch(&self, path: &str, include_hidden: bool) -> Result<Arc<TreeNode>, CacheError> {
        let key = CacheKey::new(path, include_hidden)?;
        self.load_shared(key).await
    }

    /// Drops `path` and its parent, then tells the other caches on the bus.
    pub fn invalidate(&self, path: &str) {
        let Some(path) = paths::normalize(path) else {
            return;
        };
        self.inner.invalidate_local(&path);
        if let Some((bus, id)) = &self.inner.bus {
            bus.publish(*id, &path);
        }
    }

    /// Same as [`DirectoryCache::invalidate`] without notifying the bus.
    pub fn invalidate_local(&self, path: &str) {
        if let Some(path) = paths::normalize(path) {
            self.inner.invalidate_local(&path);
        }
    }

    /// Writes `node` into every cached listing of its parent. Returns how
    /// many listings changed.
    pub fn upsert_entry(&self, mut node: TreeNode) -> usize {
        let Some(path) = paths::normalize(&node.path) else {
            return 0;
        };
        let Some(parent) = paths::parent(&path) else {
            return 0;
        };
        node.path = path;

        let mut state = self.inner.lock();
        let mut updated = 0;
        for key in CacheKey::both(&parent) {
            if !key.include_hidden && node.is_hidden() {
                continue;
            }
            let Some(entry) = state.entries.get(&key) else {
                continue;
            };
            let mut listing = TreeNode::clone(&entry.data);
            listing.upsert_child(node.clone());
            state.write(key, Arc::new(listing), self.inner.config.max_entries);
            updated += 1;
        }
        debug!(path = %node.path, updated, "upserted entry into cached listings");
        updated
    }

    /// Re-reads one entry's metadata and upserts it.
    pub async fn refresh_entry(&self, path: &str) -> Result<usize, CacheError> {
        let payload = self.inner.transport.stat(path).await?;
        let node = payload
            .into_node()
            .ok_or_else(|| CacheError::InvalidPath(path.to_string()))?;
        Ok(self.upsert_entry(node))
    }

    pub fn peek(&self, path: &str, include_hidden: bool) -> Option<CacheEntry> {
        let key = CacheKey::new(path, include_hidden).ok()?;
        self.peek_key(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn pending_revalidations(&self) -> usize {
        self.inner.lock().revalidating.len()
    }

    /// Snapshots of every load this cache runs, partial ones included.
    pub fn subscribe(&self) -> broadcast::Receiver<LoadEvent> {
        self.inner.events.subscribe()
    }

    fn peek_key(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.lock().entries.get(key).cloned()
    }

    async fn load_shared(&self, key: CacheKey) -> LoadResult {
        let load = {
            let mut state = self.inner.lock();
            let joined = state.in_flight.get(&key).map(|flight| flight.load.clone());
            match joined {
                Some(load) => {
                    debug!(path = %key.path, "joining in-flight fetch");
                    load
                }
                None => {
                    state.next_fetch_id += 1;
                    let id = state.next_fetch_id;
                    let load = self.start_load(key.clone(), id);
                    state.in_flight.insert(
                        key,
                        InFlight {
                            id,
                            load: load.clone(),
                        },
                    );
                    load
                }
            }
        };
        load.await
    }

    fn start_load(&self, key: CacheKey, id: u64) -> SharedLoad {
        let cache = Arc::downgrade(&self.inner);
        let transport = Arc::clone(&self.inner.transport);
        let builder = self.inner.config.builder;
        let events = self.inner.events.clone();
        async move {
            let result = load_tree(transport, key.clone(), builder, events)
                .await
                .map(Arc::new);
            if let Some(inner) = cache.upgrade() {
                inner.finish_fetch(&key, id, &result);
            }
            result
        }
        .boxed()
        .shared()
    }

    fn spawn_revalidation(&self, key: CacheKey, observed: u64) {
        if !self.inner.lock().revalidating.insert(key.clone()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = load_tree(
                Arc::clone(&inner.transport),
                key.clone(),
                inner.config.builder,
                inner.events.clone(),
            )
            .await;
            inner.finish_revalidation(&key, observed, result);
        });
    }
}

/// Streams one listing through a fresh builder and returns the final tree.
async fn load_tree(
    transport: Arc<dyn DirectoryTransport>,
    key: CacheKey,
    builder: BuilderConfig,
    events: broadcast::Sender<LoadEvent>,
) -> Result<TreeNode, CacheError> {
    let publish = |snapshot: Snapshot| {
        let _ = events.send(LoadEvent {
            key: key.clone(),
            snapshot,
        });
    };

    let mut worker = BuilderWorker::spawn(builder)?;
    worker.init(&key.path)?;
    let mut entries = transport.list_directory(&key.path, key.include_hidden);
    while let Some(item) = entries.next().await {
        let payload = match item {
            Ok(payload) => payload,
            Err(err) => {
                let _ = worker.cancel();
                return Err(err.into());
            }
        };
        if !key.include_hidden
            && payload.is_hidden()
            && payload.normalized_path().as_deref() != Some(key.path.as_str())
        {
            continue;
        }
        worker.entry(payload)?;
        while let Some(snapshot) = worker.try_next_snapshot() {
            publish(snapshot);
        }
    }

    let last = worker.finish(&publish).await?;
    let tree = last
        .tree
        .clone()
        .unwrap_or_else(|| TreeNode::placeholder_dir(&key.path));
    publish(last);
    Ok(tree)
}

async fn listen(cache: Weak<CacheInner>, id: CacheId, mut receiver: InvalidationReceiver) {
    loop {
        let message = receiver.recv().await;
        let Some(inner) = cache.upgrade() else {
            break;
        };
        match message {
            Ok(invalidation) if invalidation.origin == id => {}
            Ok(invalidation) => inner.invalidate_local(&invalidation.path),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "invalidation bus lagged; clearing cache");
                inner.clear();
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SnapshotKind;
    use crate::testing::{Script, ScriptedTransport, listing, wait_until};
    use crate::tree::EntryPayload;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    fn cache_with(transport: &Arc<ScriptedTransport>, config: CacheConfig) -> DirectoryCache {
        DirectoryCache::new(transport.clone(), config)
    }

    fn stale_config() -> CacheConfig {
        CacheConfig {
            ttl: Duration::ZERO,
            ..CacheConfig::default()
        }
    }

    fn rev(node: &TreeNode) -> Option<&str> {
        node.attributes.get("rev").and_then(|value| value.as_str())
    }

    #[tokio::test]
    async fn fresh_entry_is_served_without_transport() {
        let transport = ScriptedTransport::new();
        transport.push("/x", Script::listing(listing("/x", "s1", &["a"])));
        let cache = cache_with(&transport, CacheConfig::default());

        let fetched = cache.fetch("/x", false).await.unwrap();
        let read = cache.get("/x", ReadOptions::default()).await.unwrap();

        assert!(Arc::ptr_eq(&fetched, &read));
        assert_eq!(transport.calls(), 1);
        assert_eq!(read.paths(), vec!["/x", "/x/a"]);
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_transport_call() {
        let transport = ScriptedTransport::new();
        let (script, release) = Script::listing(listing("/x", "s1", &["a"])).gated();
        transport.push("/x", script);
        let cache = cache_with(&transport, CacheConfig::default());

        let (first, second, _) = tokio::join!(
            cache.fetch("/x", false),
            cache.fetch("/x", false),
            async {
                tokio::task::yield_now().await;
                let _ = release.send(());
            }
        );

        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn failures_are_shared_but_not_cached() {
        let transport = ScriptedTransport::new();
        let (failing, release) = Script::failure("boom").gated();
        transport.push("/x", failing);
        transport.push("/x", Script::listing(listing("/x", "s2", &[])));
        let cache = cache_with(&transport, CacheConfig::default());

        let (first, second, _) = tokio::join!(
            cache.fetch("/x", false),
            cache.fetch("/x", false),
            async {
                tokio::task::yield_now().await;
                let _ = release.send(());
            }
        );
        let err = first.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(matches!(second, Err(CacheError::Transport(_))));
        assert_eq!(transport.calls(), 1);
        assert!(cache.is_empty());

        let tree = cache.fetch("/x", false).await.unwrap();
        assert_eq!(rev(&tree), Some("s2"));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn invalid_paths_are_rejected() {
        let cache = cache_with(&ScriptedTransport::new(), CacheConfig::default());
        assert!(matches!(
            cache.get("/a/../b", ReadOptions::default()).await,
            Err(CacheError::InvalidPath(_))
        ));
        assert!(matches!(
            cache.fetch("", false).await,
            Err(CacheError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn invalidate_drops_path_and_parent_only() {
        let transport = ScriptedTransport::new();
        let cache = cache_with(&transport, CacheConfig::default());
        for path in ["/", "/a", "/a/b"] {
            cache.fetch(path, false).await.unwrap();
        }
        cache.fetch("/a", true).await.unwrap();

        cache.invalidate("disk:/a/b");

        assert!(cache.peek("/a/b", false).is_none());
        assert!(cache.peek("/a", false).is_none());
        assert!(cache.peek("/a", true).is_none());
        assert!(cache.peek("/", false).is_some());

        cache.get("/a", ReadOptions::default()).await.unwrap();
        assert_eq!(transport.calls_for("/a"), 3);
    }

    #[tokio::test]
    async fn invalidating_root_has_no_parent_to_drop() {
        let transport = ScriptedTransport::new();
        let cache = cache_with(&transport, CacheConfig::default());
        cache.fetch("/", false).await.unwrap();
        cache.fetch("/a", false).await.unwrap();

        cache.invalidate("/");

        assert!(cache.peek("/", false).is_none());
        assert!(cache.peek("/a", false).is_some());
    }

    #[tokio::test]
    async fn stale_read_revalidates_in_background() {
        let transport = ScriptedTransport::new();
        transport.push("/x", Script::listing(listing("/x", "s1", &[])));
        transport.push("/x", Script::listing(listing("/x", "s2", &["new"])));
        let cache = cache_with(&transport, stale_config());

        cache.fetch("/x", false).await.unwrap();
        let stale = cache.get("/x", ReadOptions::default()).await.unwrap();
        assert_eq!(rev(&stale), Some("s1"));

        wait_until(|| cache.pending_revalidations() == 0).await;
        let entry = cache.peek("/x", false).unwrap();
        assert_eq!(rev(&entry.data), Some("s2"));
        assert_eq!(entry.generation, 2);
    }

    #[tokio::test]
    async fn stale_read_starts_one_revalidation_per_key() {
        let transport = ScriptedTransport::new();
        transport.push("/x", Script::listing(listing("/x", "s1", &[])));
        let (script, release) = Script::listing(listing("/x", "s2", &[])).gated();
        transport.push("/x", script);
        let cache = cache_with(&transport, stale_config());

        cache.fetch("/x", false).await.unwrap();
        for _ in 0..3 {
            cache.get("/x", ReadOptions::default()).await.unwrap();
        }
        assert_eq!(cache.pending_revalidations(), 1);

        release.send(()).unwrap();
        wait_until(|| cache.pending_revalidations() == 0).await;
        assert_eq!(transport.calls_for("/x"), 2);
    }

    #[tokio::test]
    async fn revalidation_loses_to_a_newer_fetch() {
        let transport = ScriptedTransport::new();
        transport.push("/x", Script::listing(listing("/x", "s1", &[])));
        let (slow, release) = Script::listing(listing("/x", "r", &[])).gated();
        transport.push("/x", slow);
        transport.push("/x", Script::listing(listing("/x", "s2", &[])));
        let cache = cache_with(&transport, stale_config());

        cache.fetch("/x", false).await.unwrap();
        let stale = cache.get("/x", ReadOptions::default()).await.unwrap();
        assert_eq!(rev(&stale), Some("s1"));
        wait_until(|| transport.calls_for("/x") == 2).await;

        let fresh = cache.fetch("/x", false).await.unwrap();
        assert_eq!(rev(&fresh), Some("s2"));

        release.send(()).unwrap();
        wait_until(|| cache.pending_revalidations() == 0).await;

        let entry = cache.peek("/x", false).unwrap();
        assert_eq!(rev(&entry.data), Some("s2"));
        assert_eq!(entry.generation, 2);
    }

    #[tokio::test]
    async fn failed_revalidation_keeps_stale_entry() {
        let transport = ScriptedTransport::new();
        transport.push("/x", Script::listing(listing("/x", "s1", &[])));
        transport.push("/x", Script::failure("offline"));
        let cache = cache_with(&transport, stale_config());

        cache.fetch("/x", false).await.unwrap();
        cache.get("/x", ReadOptions::default()).await.unwrap();
        wait_until(|| cache.pending_revalidations() == 0).await;

        let entry = cache.peek("/x", false).unwrap();
        assert_eq!(rev(&entry.data), Some("s1"));
        assert_eq!(entry.generation, 1);
    }

    #[tokio::test]
    async fn stale_read_without_revalidate_waits_for_fetch() {
        let transport = ScriptedTransport::new();
        transport.push("/x", Script::listing(listing("/x", "s1", &[])));
        transport.push("/x", Script::listing(listing("/x", "s2", &[])));
        let cache = cache_with(&transport, stale_config());

        cache.fetch("/x", false).await.unwrap();
        let options = ReadOptions {
            stale_while_revalidate: false,
            ..ReadOptions::default()
        };
        let tree = cache.get("/x", options).await.unwrap();

        assert_eq!(rev(&tree), Some("s2"));
        assert_eq!(cache.pending_revalidations(), 0);
    }

    #[tokio::test]
    async fn fetch_after_invalidate_is_not_coalesced() {
        let transport = ScriptedTransport::new();
        let (slow, release) = Script::listing(listing("/x", "old", &[])).gated();
        transport.push("/x", slow);
        transport.push("/x", Script::listing(listing("/x", "new", &[])));
        let cache = cache_with(&transport, CacheConfig::default());

        let detached = tokio::spawn({
            let cache = cache.clone();
            async move { cache.fetch("/x", false).await }
        });
        wait_until(|| transport.calls_for("/x") == 1).await;

        cache.invalidate("/x");
        let fresh = cache.fetch("/x", false).await.unwrap();
        assert_eq!(rev(&fresh), Some("new"));
        assert_eq!(transport.calls_for("/x"), 2);

        release.send(()).unwrap();
        let old = detached.await.unwrap().unwrap();
        assert_eq!(rev(&old), Some("old"));
    }

    #[tokio::test]
    async fn oldest_entry_is_evicted_past_capacity() {
        let transport = ScriptedTransport::new();
        let cache = cache_with(
            &transport,
            CacheConfig {
                max_entries: 2,
                ..CacheConfig::default()
            },
        );

        for path in ["/a", "/b", "/c"] {
            cache.fetch(path, false).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.peek("/a", false).is_none());
        assert!(cache.peek("/b", false).is_some());
        assert!(cache.peek("/c", false).is_some());
    }

    #[tokio::test]
    async fn hidden_entries_depend_on_the_key() {
        let transport = ScriptedTransport::new();
        let entries = listing("/x", "s1", &["a", ".secret"]);
        transport.push("/x", Script::listing(entries.clone()));
        transport.push("/x", Script::listing(entries));
        let cache = cache_with(&transport, CacheConfig::default());

        let visible = cache.fetch("/x", false).await.unwrap();
        let everything = cache.fetch("/x", true).await.unwrap();

        assert_eq!(visible.paths(), vec!["/x", "/x/a"]);
        assert_eq!(everything.paths(), vec!["/x", "/x/a", "/x/.secret"]);
        assert_eq!(transport.calls(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn hidden_directory_itself_can_be_listed() {
        let transport = ScriptedTransport::new();
        transport.push("/.config", Script::listing(listing("/.config", "s1", &["app"])));
        let cache = cache_with(&transport, CacheConfig::default());

        let tree = cache.fetch("/.config", false).await.unwrap();
        assert_eq!(tree.paths(), vec!["/.config", "/.config/app"]);
    }

    #[tokio::test]
    async fn upsert_updates_cached_parent_listings() {
        let transport = ScriptedTransport::new();
        transport.push("/x", Script::listing(listing("/x", "s1", &["a"])));
        transport.push("/x", Script::listing(listing("/x", "s1", &["a"])));
        let cache = cache_with(&transport, CacheConfig::default());
        cache.fetch("/x", false).await.unwrap();
        cache.fetch("/x", true).await.unwrap();
        let before = cache.peek("/x", false).unwrap().generation;

        let replaced = EntryPayload::file("/x/a")
            .with_attribute("size", 9)
            .into_node()
            .unwrap();
        assert_eq!(cache.upsert_entry(replaced), 2);
        let hidden = EntryPayload::file("/x/.env").into_node().unwrap();
        assert_eq!(cache.upsert_entry(hidden), 1);

        let visible = cache.peek("/x", false).unwrap();
        assert!(visible.generation > before);
        assert_eq!(visible.data.children.len(), 1);
        assert_eq!(visible.data.children[0].attributes.get("size"), Some(&json!(9)));
        let everything = cache.peek("/x", true).unwrap();
        assert_eq!(everything.data.paths(), vec!["/x", "/x/a", "/x/.env"]);

        let uncached = EntryPayload::file("/y/z").into_node().unwrap();
        assert_eq!(cache.upsert_entry(uncached), 0);
    }

    #[tokio::test]
    async fn refresh_entry_stats_and_upserts() {
        let transport = ScriptedTransport::new();
        transport.push("/x", Script::listing(listing("/x", "s1", &[])));
        transport.set_stat(
            "/x/new.txt",
            EntryPayload::file("/x/new.txt").with_attribute("size", 1),
        );
        let cache = cache_with(&transport, CacheConfig::default());
        cache.fetch("/x", false).await.unwrap();

        assert_eq!(cache.refresh_entry("/x/new.txt").await.unwrap(), 1);
        assert!(cache.refresh_entry("/x/missing").await.is_err());

        let entry = cache.peek("/x", false).unwrap();
        assert_eq!(entry.data.paths(), vec!["/x", "/x/new.txt"]);
    }

    #[tokio::test]
    async fn loads_publish_snapshots_ending_in_final() {
        let transport = ScriptedTransport::new();
        transport.push("/x", Script::listing(listing("/x", "s1", &["a", "b"])));
        let cache = cache_with(&transport, CacheConfig::default());
        let mut events = cache.subscribe();

        cache.fetch("/x", false).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.key, CacheKey::new("/x", false).unwrap());
            kinds.push(event.snapshot.kind);
        }
        assert_eq!(kinds.first(), Some(&SnapshotKind::Reset));
        assert_eq!(kinds.last(), Some(&SnapshotKind::Final));
    }

    #[tokio::test]
    async fn bus_invalidation_reaches_other_caches() {
        let bus = InvalidationBus::default();
        let transport = ScriptedTransport::new();
        let first = DirectoryCache::with_bus(transport.clone(), CacheConfig::default(), &bus);
        let second = DirectoryCache::with_bus(transport.clone(), CacheConfig::default(), &bus);
        assert_ne!(first.id(), second.id());

        first.fetch("/x", false).await.unwrap();
        second.fetch("/x", false).await.unwrap();
        second.fetch("/y", false).await.unwrap();

        first.invalidate("/x");

        assert!(first.peek("/x", false).is_none());
        wait_until(|| second.peek("/x", false).is_none()).await;
        assert!(second.peek("/y", false).is_some());
    }

    #[tokio::test]
    async fn received_invalidations_are_not_rebroadcast() {
        let bus = InvalidationBus::default();
        let mut observer = bus.subscribe();
        let transport = ScriptedTransport::new();
        let first = DirectoryCache::with_bus(transport.clone(), CacheConfig::default(), &bus);
        let second = DirectoryCache::with_bus(transport.clone(), CacheConfig::default(), &bus);
        second.fetch("/x", false).await.unwrap();

        first.invalidate("/x");
        wait_until(|| second.peek("/x", false).is_none()).await;
        tokio::task::yield_now().await;

        let received = observer.try_recv().unwrap();
        assert_eq!(received.origin, first.id().unwrap());
        assert_eq!(received.path, "/x");
        assert!(matches!(observer.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn lagging_listener_clears_the_cache() {
        let bus = InvalidationBus::new(1);
        let transport = ScriptedTransport::new();
        let cache = DirectoryCache::with_bus(transport, CacheConfig::default(), &bus);
        cache.fetch("/keep", false).await.unwrap();

        let stranger = bus.register();
        for path in ["/u1", "/u2", "/u3"] {
            bus.publish(stranger, path);
        }

        wait_until(|| cache.is_empty()).await;
    }
}
