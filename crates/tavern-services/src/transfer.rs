//! Asset transfer: splitting assets into chunks and reassembling them.
//!
//! Receiving side: one `AssetConsumer` per transfer id, created by a
//! `startAssetTransfer` header or by the first chunk of an unseen id. Each
//! chunk must extend the consumer exactly (`cumulative == received + len`).
//! The digest is computed as chunks arrive. When `received == size` it is
//! checked against the declared id if there is one, and the bytes are
//! handed to the `AssetStore`. A transfer
//! is finalized exactly once; late chunks for a finalized id are ignored.
//!
//! Sending side: `AssetProducer`s are queued with `add_producer` and served
//! round-robin by `next_chunk`, so several assets in flight to the same
//! peer share the Bulk channel fairly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tavern_core::crypto::Hasher;
use tavern_core::{AssetChunk, AssetHeader, AssetId, TransferId};
use tokio::sync::Notify;

use crate::asset_store::{Asset, AssetStore, StoreError};
use crate::temp_storage::{TempBuffer, TempStorage};

/// How many finalized ids are remembered for discarding late chunks.
const FINALIZED_MEMORY: usize = 1024;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer {0} is already in progress")]
    DuplicateTransfer(TransferId),

    #[error("transfer {transfer_id} corrupted: {reason}")]
    Corrupt {
        transfer_id: TransferId,
        reason: String,
    },

    #[error("transfer {transfer_id}: hash mismatch, expected {expected}, got {actual}")]
    HashMismatch {
        transfer_id: TransferId,
        expected: AssetId,
        actual: AssetId,
    },

    #[error("transfer {transfer_id}: temporary storage failed: {reason}")]
    Storage {
        transfer_id: TransferId,
        reason: String,
    },

    #[error("transfer {0} abandoned")]
    Abandoned(TransferId),
}

// ── Progress / listeners ──────────────────────────────────────────────────────

/// Snapshot of one in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub name: String,
    pub size: u64,
    pub received: u64,
    pub asset_id: Option<AssetId>,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        if self.size == 0 {
            return 100.0;
        }
        (self.received as f64 / self.size as f64) * 100.0
    }
}

/// Emitted once per successfully finalized transfer.
#[derive(Debug, Clone)]
pub struct TransferCompletion {
    pub transfer_id: TransferId,
    pub name: String,
    /// Where the bytes were reassembled (part file path or memory tag).
    pub location: String,
    pub asset: Arc<Asset>,
}

/// Observer for the receiving side. All methods default to no-ops.
pub trait TransferListener: Send + Sync {
    fn added(&self, _progress: &TransferProgress) {}
    fn updated(&self, _progress: &TransferProgress) {}
    fn completed(&self, _completion: &TransferCompletion) {}
    fn failed(&self, _progress: &TransferProgress, _error: &TransferError) {}
}

// ── Consumer ──────────────────────────────────────────────────────────────────

/// Receiving state for one transfer. Owns its temporary buffer; dropping the
/// consumer releases it.
pub struct AssetConsumer {
    transfer_id: TransferId,
    name: String,
    size: u64,
    expected: Option<AssetId>,
    received: u64,
    buffer: Box<dyn TempBuffer>,
    hasher: Hasher,
    last_activity: Instant,
}

impl AssetConsumer {
    fn new(
        transfer_id: TransferId,
        name: String,
        size: u64,
        expected: Option<AssetId>,
        buffer: Box<dyn TempBuffer>,
    ) -> Self {
        Self {
            transfer_id,
            name,
            size,
            expected,
            received: 0,
            buffer,
            hasher: Hasher::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.size
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            transfer_id: self.transfer_id,
            name: self.name.clone(),
            size: self.size,
            received: self.received,
            asset_id: self.expected,
        }
    }

    fn append(&mut self, chunk: &AssetChunk) -> Result<(), TransferError> {
        let corrupt = |reason: String| TransferError::Corrupt {
            transfer_id: self.transfer_id,
            reason,
        };

        if chunk.total_size != self.size {
            return Err(corrupt(format!(
                "declared size changed from {} to {}",
                self.size, chunk.total_size
            )));
        }
        let expected_cumulative = self.received + chunk.data.len() as u64;
        if chunk.cumulative != expected_cumulative {
            return Err(corrupt(format!(
                "cumulative {} does not follow {} + {}",
                chunk.cumulative,
                self.received,
                chunk.data.len()
            )));
        }
        if chunk.cumulative > self.size {
            return Err(corrupt(format!(
                "cumulative {} exceeds size {}",
                chunk.cumulative, self.size
            )));
        }

        self.buffer
            .append(&chunk.data)
            .map_err(|e| TransferError::Storage {
                transfer_id: self.transfer_id,
                reason: format!("{e:#}"),
            })?;
        self.hasher.update(&chunk.data);
        self.received = chunk.cumulative;
        self.last_activity = Instant::now();
        Ok(())
    }
}

// ── Producer ──────────────────────────────────────────────────────────────────

/// Walks an asset's bytes, yielding bounded chunks.
#[derive(Debug, Clone)]
pub struct AssetProducer {
    transfer_id: TransferId,
    asset: Arc<Asset>,
    position: u64,
}

impl AssetProducer {
    pub fn new(transfer_id: TransferId, asset: Arc<Asset>) -> Self {
        Self {
            transfer_id,
            asset,
            position: 0,
        }
    }

    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// Header announcing this transfer to the receiver.
    pub fn header(&self) -> AssetHeader {
        AssetHeader {
            transfer_id: self.transfer_id,
            name: self.asset.name().to_string(),
            size: self.asset.len() as u64,
            asset_id: Some(self.asset.id()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.position >= self.asset.len() as u64
    }

    /// Next chunk of at most `size` bytes, or `None` once everything is sent.
    pub fn next_chunk(&mut self, size: usize) -> Option<AssetChunk> {
        if self.is_complete() {
            return None;
        }
        let start = self.position as usize;
        let end = (start + size.max(1)).min(self.asset.len());
        self.position = end as u64;
        Some(AssetChunk {
            transfer_id: self.transfer_id,
            name: self.asset.name().to_string(),
            cumulative: self.position,
            total_size: self.asset.len() as u64,
            data: self.asset.bytes().slice(start..end),
        })
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ReceiveState {
    consumers: HashMap<TransferId, AssetConsumer>,
    finalized: HashSet<TransferId>,
    finalized_order: VecDeque<TransferId>,
}

impl ReceiveState {
    fn mark_finalized(&mut self, id: TransferId) {
        if self.finalized.insert(id) {
            self.finalized_order.push_back(id);
            if self.finalized_order.len() > FINALIZED_MEMORY {
                if let Some(old) = self.finalized_order.pop_front() {
                    self.finalized.remove(&old);
                }
            }
        }
    }
}

/// Per-connection transfer bookkeeping. Completed assets go to the shared
/// `AssetStore`.
pub struct AssetTransferManager {
    store: AssetStore,
    storage: Arc<dyn TempStorage>,
    receive: Mutex<ReceiveState>,
    producers: Mutex<VecDeque<AssetProducer>>,
    producer_ready: Arc<Notify>,
    listeners: RwLock<Vec<Arc<dyn TransferListener>>>,
    next_transfer_id: AtomicU64,
}

impl AssetTransferManager {
    pub fn new(store: AssetStore, storage: Arc<dyn TempStorage>) -> Self {
        Self {
            store,
            storage,
            receive: Mutex::new(ReceiveState::default()),
            producers: Mutex::new(VecDeque::new()),
            producer_ready: Arc::new(Notify::new()),
            listeners: RwLock::new(Vec::new()),
            next_transfer_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn add_listener(&self, listener: Arc<dyn TransferListener>) {
        self.listeners.write().push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn TransferListener>> {
        self.listeners.read().clone()
    }

    // ── Receiving ─────────────────────────────────────────────────────────

    /// Register a transfer announced by a `startAssetTransfer` header.
    pub fn start_transfer(&self, header: AssetHeader) -> Result<(), TransferError> {
        let id = header.transfer_id;
        let progress = {
            let mut state = self.receive.lock();
            if state.consumers.contains_key(&id) {
                return Err(TransferError::DuplicateTransfer(id));
            }
            // A fresh header makes the id live again.
            if state.finalized.remove(&id) {
                state.finalized_order.retain(|f| *f != id);
            }
            let buffer = self.create_buffer(id)?;
            let consumer = AssetConsumer::new(id, header.name, header.size, header.asset_id, buffer);
            let progress = consumer.progress();
            state.consumers.insert(id, consumer);
            progress
        };

        tracing::debug!(
            transfer = id,
            name = %progress.name,
            size = progress.size,
            "transfer announced"
        );
        for l in self.listeners() {
            l.added(&progress);
        }

        if progress.size == 0 {
            self.finalize(id)?;
        }
        Ok(())
    }

    /// Apply one inbound chunk. Returns the stored asset when this chunk
    /// completed the transfer, and an error when it broke the sequence or
    /// the completed bytes failed verification.
    pub fn update(&self, chunk: AssetChunk) -> Result<Option<Arc<Asset>>, TransferError> {
        let id = chunk.transfer_id;
        let mut added = None;

        let step = {
            let mut state = self.receive.lock();
            if state.finalized.contains(&id) {
                tracing::trace!(transfer = id, "chunk for finalized transfer ignored");
                return Ok(None);
            }
            if !state.consumers.contains_key(&id) {
                let buffer = self.create_buffer(id)?;
                let consumer =
                    AssetConsumer::new(id, chunk.name.clone(), chunk.total_size, None, buffer);
                added = Some(consumer.progress());
                state.consumers.insert(id, consumer);
            }

            let Some(consumer) = state.consumers.get_mut(&id) else {
                return Ok(None);
            };
            match consumer.append(&chunk) {
                Ok(()) => Ok((consumer.progress(), consumer.is_complete())),
                Err(e) => {
                    let progress = consumer.progress();
                    state.consumers.remove(&id);
                    state.mark_finalized(id);
                    Err((progress, e))
                }
            }
        };

        let listeners = self.listeners();
        if let Some(progress) = &added {
            for l in &listeners {
                l.added(progress);
            }
        }

        match step {
            Ok((progress, complete)) => {
                tracing::trace!(transfer = id, received = progress.received, size = progress.size, "chunk applied");
                for l in &listeners {
                    l.updated(&progress);
                }
                if complete {
                    return self.finalize(id);
                }
                Ok(None)
            }
            Err((progress, err)) => {
                self.report_failure(&progress, &err);
                Err(err)
            }
        }
    }

    /// Verify and store a complete consumer. Runs at most once per id;
    /// `Ok(None)` if the id was already finalized.
    fn finalize(&self, id: TransferId) -> Result<Option<Arc<Asset>>, TransferError> {
        let mut consumer = {
            let mut state = self.receive.lock();
            let Some(consumer) = state.consumers.remove(&id) else {
                return Ok(None);
            };
            state.mark_finalized(id);
            consumer
        };
        let progress = consumer.progress();
        let location = consumer.buffer.location();
        let actual = AssetId::from_bytes(consumer.hasher.finalize());

        let checked = match progress.asset_id {
            Some(expected) if expected != actual => Err(TransferError::HashMismatch {
                transfer_id: id,
                expected,
                actual,
            }),
            _ => consumer.buffer.contents().map_err(|e| TransferError::Storage {
                transfer_id: id,
                reason: format!("{e:#}"),
            }),
        };
        drop(consumer);
        let bytes = match checked {
            Ok(bytes) => bytes,
            Err(err) => {
                self.report_failure(&progress, &err);
                return Err(err);
            }
        };

        let stored = self.store.put_asset(Asset::digested(actual, progress.name.clone(), bytes));
        tracing::info!(
            transfer = id,
            asset = %stored.id().short(),
            name = %progress.name,
            bytes = progress.size,
            "asset transfer complete"
        );

        let completion = TransferCompletion {
            transfer_id: id,
            name: progress.name,
            location,
            asset: stored.clone(),
        };
        for l in self.listeners() {
            l.completed(&completion);
        }
        Ok(Some(stored))
    }

    fn report_failure(&self, progress: &TransferProgress, err: &TransferError) {
        tracing::warn!(transfer = progress.transfer_id, name = %progress.name, error = %err, "asset transfer failed");
        if let Some(id) = progress.asset_id {
            self.store.fail(
                id,
                StoreError::TransferFailed {
                    id,
                    reason: err.to_string(),
                },
            );
        }
        for l in self.listeners() {
            l.failed(progress, err);
        }
    }

    fn create_buffer(&self, id: TransferId) -> Result<Box<dyn TempBuffer>, TransferError> {
        self.storage.create(id).map_err(|e| TransferError::Storage {
            transfer_id: id,
            reason: format!("{e:#}"),
        })
    }

    /// In-flight transfers.
    pub fn consumers(&self) -> Vec<TransferProgress> {
        let state = self.receive.lock();
        let mut list: Vec<_> = state.consumers.values().map(AssetConsumer::progress).collect();
        list.sort_by_key(|p| p.transfer_id);
        list
    }

    /// Drop one in-flight transfer and release its storage.
    pub fn abandon(&self, id: TransferId) -> bool {
        let removed = {
            let mut state = self.receive.lock();
            let removed = state.consumers.remove(&id);
            if removed.is_some() {
                state.mark_finalized(id);
            }
            removed
        };
        match removed {
            Some(consumer) => {
                self.report_failure(&consumer.progress(), &TransferError::Abandoned(id));
                true
            }
            None => false,
        }
    }

    /// Abandon every transfer with no chunk for `max_idle`. Returns how many.
    pub fn evict_stale(&self, max_idle: Duration) -> usize {
        let stale: Vec<TransferId> = {
            let state = self.receive.lock();
            state
                .consumers
                .values()
                .filter(|c| c.last_activity.elapsed() > max_idle)
                .map(|c| c.transfer_id)
                .collect()
        };
        stale.into_iter().filter(|id| self.abandon(*id)).count()
    }

    /// Drop all consumers and producers. Called on connection teardown.
    pub fn flush(&self) {
        let ids: Vec<TransferId> = self.receive.lock().consumers.keys().copied().collect();
        for id in ids {
            self.abandon(id);
        }
        self.producers.lock().clear();
    }

    // ── Sending ───────────────────────────────────────────────────────────

    /// New producer with a fresh transfer id for this connection.
    pub fn create_producer(&self, asset: Arc<Asset>) -> AssetProducer {
        let id = self.next_transfer_id.fetch_add(1, Ordering::Relaxed);
        AssetProducer::new(id, asset)
    }

    pub fn add_producer(&self, producer: AssetProducer) {
        tracing::debug!(transfer = producer.transfer_id(), "producer queued");
        self.producers.lock().push_back(producer);
        self.producer_ready.notify_one();
    }

    pub fn has_producers(&self) -> bool {
        !self.producers.lock().is_empty()
    }

    /// Notified whenever a producer is queued.
    pub fn producer_ready(&self) -> Arc<Notify> {
        self.producer_ready.clone()
    }

    /// Next chunk, rotating between queued producers.
    pub fn next_chunk(&self, size: usize) -> Option<AssetChunk> {
        let mut producers = self.producers.lock();
        while let Some(mut producer) = producers.pop_front() {
            if let Some(chunk) = producer.next_chunk(size) {
                if !producer.is_complete() {
                    producers.push_back(producer);
                }
                return Some(chunk);
            }
        }
        None
    }
}
