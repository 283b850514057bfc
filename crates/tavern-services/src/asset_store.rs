//! Content-addressed asset cache.
//!
//! Assets are keyed by the BLAKE3 digest of their bytes. An id and its bytes
//! always agree: `Asset` can only be built by hashing or by verifying. Assets
//! are immutable and never evicted, so a `put` of bytes already present is a
//! no-op that returns the cached copy.
//!
//! With a `DiskAssetCache` attached, new assets are written through to disk
//! and lookups that miss memory fall back to it.
//!
//! Three ways to read:
//!   `get`: local lookup, never waits
//!   `get_async`: callback now if present, else on the next matching `put`
//!   `get_sync` / `fetch`: wait (blocking / async) with a timeout
//!
//! None of these issue network requests; see `SessionContext::request_asset`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tavern_core::config::TransferConfig;
use tavern_core::AssetId;

use crate::asset_cache::DiskAssetCache;

// ── Asset ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    id: AssetId,
    name: String,
    bytes: Bytes,
}

impl Asset {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            id: AssetId::of(&bytes),
            name: name.into(),
            bytes,
        }
    }

    /// Build an asset from a digest computed while the bytes streamed in.
    /// `id` must be the BLAKE3 digest of `bytes`.
    pub(crate) fn digested(id: AssetId, name: impl Into<String>, bytes: Bytes) -> Self {
        debug_assert_eq!(id, AssetId::of(&bytes));
        Self {
            id,
            name: name.into(),
            bytes,
        }
    }

    /// Build an asset whose id must equal `expected`.
    pub fn verified(
        expected: AssetId,
        name: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Result<Self, StoreError> {
        let asset = Self::new(name, bytes);
        if asset.id != expected {
            return Err(StoreError::HashMismatch {
                expected,
                actual: asset.id,
            });
        }
        Ok(asset)
    }

    pub fn id(&self) -> AssetId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("timed out waiting for asset {0}")]
    Timeout(AssetId),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: AssetId, actual: AssetId },

    #[error("transfer of asset {id} failed: {reason}")]
    TransferFailed { id: AssetId, reason: String },

    #[error("wait for asset {0} was cancelled")]
    Cancelled(AssetId),
}

// ── Waiters ───────────────────────────────────────────────────────────────────

type AvailableFn = Box<dyn FnOnce(Arc<Asset>) + Send>;
type OutcomeFn = Box<dyn FnOnce(Result<Arc<Asset>, StoreError>) + Send>;

enum Waiter {
    /// Registered by `get_async`. Only ever fires on success.
    Available(AvailableFn),
    /// Registered by `get_sync` / `fetch`. Fires on success or failure and
    /// can be withdrawn by token on timeout.
    Outcome { token: u64, notify: OutcomeFn },
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Shared handle; clones see the same cache.
#[derive(Clone, Default)]
pub struct AssetStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    assets: DashMap<AssetId, Arc<Asset>>,
    // Held while checking `assets` in the register paths, and while draining
    // in `put`, so a put can never slip between check and registration.
    waiters: Mutex<HashMap<AssetId, Vec<Waiter>>>,
    next_token: AtomicU64,
    persistent: Option<DiskAssetCache>,
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory store backed by `cache`.
    pub fn with_persistent_cache(cache: DiskAssetCache) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                persistent: Some(cache),
                ..Default::default()
            }),
        }
    }

    /// Store configured by `transfer.persistent_cache` / `transfer.cache_dir`.
    pub fn from_config(config: &TransferConfig) -> anyhow::Result<Self> {
        if !config.persistent_cache {
            return Ok(Self::new());
        }
        let cache = DiskAssetCache::new(&config.cache_dir)?;
        tracing::debug!(root = %cache.root().display(), "persistent asset cache enabled");
        Ok(Self::with_persistent_cache(cache))
    }

    pub fn persistent_cache(&self) -> Option<&DiskAssetCache> {
        self.inner.persistent.as_ref()
    }

    /// Hash and store `bytes`. Idempotent.
    pub fn put(&self, name: impl Into<String>, bytes: impl Into<Bytes>) -> Arc<Asset> {
        self.put_asset(Asset::new(name, bytes))
    }

    /// Store an already-built asset and wake everyone waiting on its id.
    pub fn put_asset(&self, asset: Asset) -> Arc<Asset> {
        let id = asset.id();
        let mut inserted = false;
        let stored = self
            .inner
            .assets
            .entry(id)
            .or_insert_with(|| {
                tracing::debug!(asset = %id.short(), name = asset.name(), size = asset.len(), "asset stored");
                inserted = true;
                Arc::new(asset)
            })
            .clone();

        if inserted {
            if let Some(cache) = &self.inner.persistent {
                if let Err(e) = cache.put(&stored) {
                    tracing::warn!(asset = %id.short(), error = %e, "failed to write asset cache");
                }
            }
        }

        let waiters = self.inner.waiters.lock().remove(&id).unwrap_or_default();
        for waiter in waiters {
            match waiter {
                Waiter::Available(cb) => cb(stored.clone()),
                Waiter::Outcome { notify, .. } => notify(Ok(stored.clone())),
            }
        }
        stored
    }

    /// Memory first, then the persistent cache. A disk hit is kept in
    /// memory for later lookups.
    pub fn get(&self, id: &AssetId) -> Option<Arc<Asset>> {
        if let Some(asset) = self.inner.assets.get(id) {
            return Some(asset.clone());
        }
        let cache = self.inner.persistent.as_ref()?;
        match cache.get(id) {
            Ok(Some(asset)) => {
                tracing::trace!(asset = %id.short(), "asset loaded from disk cache");
                Some(self.inner.assets.entry(*id).or_insert_with(|| Arc::new(asset)).clone())
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(asset = %id.short(), error = %e, "failed to read asset cache");
                None
            }
        }
    }

    pub fn contains(&self, id: &AssetId) -> bool {
        self.inner.assets.contains_key(id)
            || self.inner.persistent.as_ref().is_some_and(|c| c.has(id))
    }

    /// Assets held in memory.
    pub fn len(&self) -> usize {
        self.inner.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.assets.is_empty()
    }

    /// Invoke `on_available` now if the asset is cached, otherwise on the
    /// next `put` of matching bytes. Failed transfers do not fire it.
    pub fn get_async<F>(&self, id: AssetId, on_available: F)
    where
        F: FnOnce(Arc<Asset>) + Send + 'static,
    {
        let mut waiters = self.inner.waiters.lock();
        if let Some(asset) = self.get(&id) {
            drop(waiters);
            on_available(asset);
            return;
        }
        waiters
            .entry(id)
            .or_default()
            .push(Waiter::Available(Box::new(on_available)));
    }

    /// Block the calling thread until the asset arrives, its transfer fails,
    /// or `timeout` elapses.
    ///
    /// Must not be called from the task that reads the connection: the put
    /// it waits for would be queued behind it.
    pub fn get_sync(&self, id: AssetId, timeout: Duration) -> Result<Arc<Asset>, StoreError> {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let Some(token) = self.register_outcome(id, move |r| {
            let _ = tx.send(r);
        }) else {
            return self.get(&id).ok_or(StoreError::Cancelled(id));
        };

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => {
                self.withdraw(id, token);
                // A put may have landed between the timeout and the withdraw.
                rx.try_recv()
                    .unwrap_or_else(|_| self.get(&id).ok_or(StoreError::Timeout(id)))
            }
        }
    }

    /// Async counterpart of `get_sync`. Dropping the future withdraws the
    /// registration.
    pub async fn fetch(&self, id: AssetId, timeout: Duration) -> Result<Arc<Asset>, StoreError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let Some(token) = self.register_outcome(id, move |r| {
            let _ = tx.send(r);
        }) else {
            return self.get(&id).ok_or(StoreError::Cancelled(id));
        };

        let guard = WaitGuard {
            store: self,
            id,
            token,
        };
        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StoreError::Cancelled(id)),
            Err(_) => Err(StoreError::Timeout(id)),
        };
        drop(guard);
        result
    }

    /// Wake outcome waiters for `id` with `err`. `get_async` callbacks stay
    /// registered for a later successful put.
    pub fn fail(&self, id: AssetId, err: StoreError) {
        let failed: Vec<OutcomeFn> = {
            let mut waiters = self.inner.waiters.lock();
            let Some(list) = waiters.get_mut(&id) else {
                return;
            };
            let (outcome, keep): (Vec<_>, Vec<_>) = std::mem::take(list)
                .into_iter()
                .partition(|w| matches!(w, Waiter::Outcome { .. }));
            if keep.is_empty() {
                waiters.remove(&id);
            } else {
                *list = keep;
            }
            outcome
                .into_iter()
                .filter_map(|w| match w {
                    Waiter::Outcome { notify, .. } => Some(notify),
                    Waiter::Available(_) => None,
                })
                .collect()
        };

        if !failed.is_empty() {
            tracing::debug!(asset = %id.short(), waiters = failed.len(), error = %err, "failing asset waiters");
        }
        for notify in failed {
            notify(Err(err.clone()));
        }
    }

    /// Number of callbacks and waiters registered for `id`.
    pub fn pending_waiters(&self, id: &AssetId) -> usize {
        self.inner.waiters.lock().get(id).map_or(0, Vec::len)
    }

    /// Register an outcome waiter. Returns `None` if the asset is already
    /// present, in which case nothing was registered.
    fn register_outcome<F>(&self, id: AssetId, notify: F) -> Option<u64>
    where
        F: FnOnce(Result<Arc<Asset>, StoreError>) + Send + 'static,
    {
        let mut waiters = self.inner.waiters.lock();
        if self.contains(&id) {
            return None;
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        waiters.entry(id).or_default().push(Waiter::Outcome {
            token,
            notify: Box::new(notify),
        });
        Some(token)
    }

    fn withdraw(&self, id: AssetId, token: u64) {
        let mut waiters = self.inner.waiters.lock();
        if let Some(list) = waiters.get_mut(&id) {
            list.retain(|w| !matches!(w, Waiter::Outcome { token: t, .. } if *t == token));
            if list.is_empty() {
                waiters.remove(&id);
            }
        }
    }
}

struct WaitGuard<'a> {
    store: &'a AssetStore,
    id: AssetId,
    token: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.store.withdraw(self.id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn put_id_is_hash_of_bytes() {
        let store = AssetStore::new();
        let asset = store.put("hello.txt", Bytes::from_static(b"hello"));
        assert_eq!(asset.id(), AssetId::of(b"hello"));
        let got = store.get(&AssetId::of(b"hello")).unwrap();
        assert_eq!(got.bytes().as_ref(), b"hello");
    }

    #[test]
    fn put_is_idempotent() {
        let store = AssetStore::new();
        let a = store.put("first", Bytes::from_static(b"same"));
        let b = store.put("second", Bytes::from_static(b"same"));
        assert_eq!(store.len(), 1);
        // first name wins
        assert_eq!(b.name(), "first");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn verified_rejects_mismatch() {
        let err = Asset::verified(AssetId::of(b"a"), "x", Bytes::from_static(b"b")).unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
        assert!(Asset::verified(AssetId::of(b"a"), "x", Bytes::from_static(b"a")).is_ok());
    }

    #[test]
    fn get_async_fires_immediately_when_present() {
        let store = AssetStore::new();
        let id = store.put("hello", Bytes::from_static(b"hello")).id();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        store.get_async(id, move |asset| {
            assert_eq!(asset.bytes().as_ref(), b"hello");
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.pending_waiters(&id), 0);
    }

    #[test]
    fn get_async_fires_once_on_later_put() {
        let store = AssetStore::new();
        let id = AssetId::of(b"map");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        store.get_async(id, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        store.put("map", Bytes::from_static(b"map"));
        store.put("map", Bytes::from_static(b"map"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_sync_times_out_and_withdraws() {
        let store = AssetStore::new();
        let id = AssetId::of(b"never");
        let err = store.get_sync(id, Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, StoreError::Timeout(id));
        assert_eq!(store.pending_waiters(&id), 0);
    }

    #[test]
    fn get_sync_wakes_on_put_from_other_thread() {
        let store = AssetStore::new();
        let id = AssetId::of(b"token.png");
        let s = store.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            s.put("token.png", Bytes::from_static(b"token.png"));
        });
        let asset = store.get_sync(id, Duration::from_secs(5)).unwrap();
        assert_eq!(asset.id(), id);
        t.join().unwrap();
    }

    #[test]
    fn fail_wakes_outcome_waiters_but_keeps_callbacks() {
        let store = AssetStore::new();
        let id = AssetId::of(b"broken");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        store.get_async(id, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let s = store.clone();
        let t = std::thread::spawn(move || s.get_sync(id, Duration::from_secs(5)));
        while store.pending_waiters(&id) < 2 {
            std::thread::yield_now();
        }

        store.fail(
            id,
            StoreError::TransferFailed {
                id,
                reason: "hash mismatch".into(),
            },
        );
        assert!(matches!(t.join().unwrap(), Err(StoreError::TransferFailed { .. })));
        assert_eq!(store.pending_waiters(&id), 1);

        store.put("broken", Bytes::from_static(b"broken"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_resolves_on_put() {
        let store = AssetStore::new();
        let id = AssetId::of(b"dungeon");
        let s = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            s.put("dungeon", Bytes::from_static(b"dungeon"));
        });
        let asset = store.fetch(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(asset.name(), "dungeon");
    }

    #[tokio::test]
    async fn fetch_timeout_and_cancel_leave_no_waiters() {
        let store = AssetStore::new();
        let id = AssetId::of(b"missing");
        let err = store.fetch(id, Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, StoreError::Timeout(id));
        assert_eq!(store.pending_waiters(&id), 0);

        let s = store.clone();
        let task = tokio::spawn(async move { s.fetch(id, Duration::from_secs(60)).await });
        while store.pending_waiters(&id) == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;
        assert_eq!(store.pending_waiters(&id), 0);
    }

    fn cache_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("tavern-store-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn persistent_cache_survives_a_new_store() {
        let dir = cache_dir("restart");
        let first = AssetStore::with_persistent_cache(DiskAssetCache::new(&dir).unwrap());
        let id = first.put("castle.png", Bytes::from_static(b"towers")).id();
        drop(first);

        let second = AssetStore::with_persistent_cache(DiskAssetCache::new(&dir).unwrap());
        assert_eq!(second.len(), 0);
        assert!(second.contains(&id));
        let asset = second.get(&id).unwrap();
        assert_eq!(asset.name(), "castle.png");
        assert_eq!(asset.bytes().as_ref(), b"towers");
        assert_eq!(second.len(), 1);

        // Waiting for something already on disk does not wait at all.
        assert_eq!(second.get_sync(id, Duration::ZERO).unwrap().id(), id);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn from_config_honours_the_switch() {
        let mut config = TransferConfig::default();
        config.persistent_cache = false;
        assert!(AssetStore::from_config(&config).unwrap().persistent_cache().is_none());

        config.persistent_cache = true;
        config.cache_dir = cache_dir("config");
        let store = AssetStore::from_config(&config).unwrap();
        store.put("note", Bytes::from_static(b"note"));
        assert_eq!(store.persistent_cache().unwrap().count(), 1);
        let _ = std::fs::remove_dir_all(&config.cache_dir);
    }
}
