//! Per-session wiring.
//!
//! A `SessionContext` owns one of each protocol component and is passed
//! explicitly to whoever needs them, so a host and several clients can live
//! in one process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::watch;

use tavern_core::config::TavernConfig;
use tavern_core::{AssetHeader, AssetId, Command, CommandTag, ServerPolicy};

use crate::activity::ActivityMonitor;
use crate::asset_store::{Asset, AssetStore, StoreError};
use crate::coalescer::UpdateCoalescer;
use crate::dispatch::{CommandDispatcher, CommandSink};
use crate::lifecycle::ConnectionState;
use crate::temp_storage::{DiskStorage, MemoryStorage, TempStorage};
use crate::transfer::AssetTransferManager;

#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: TavernConfig,
    store: AssetStore,
    transfers: Arc<AssetTransferManager>,
    dispatcher: Arc<CommandDispatcher>,
    coalescer: UpdateCoalescer,
    activity: ActivityMonitor,
    policy: Arc<RwLock<ServerPolicy>>,
    state: watch::Sender<ConnectionState>,
}

impl SessionContext {
    /// Build a context from config: temporary storage from
    /// `transfer.spool_to_disk`, the disk asset cache from
    /// `transfer.persistent_cache`.
    pub fn new(config: TavernConfig) -> Result<Self> {
        let storage: Arc<dyn TempStorage> = if config.transfer.spool_to_disk {
            Arc::new(
                DiskStorage::new(&config.transfer.temp_dir)
                    .context("failed to prepare transfer temp dir")?,
            )
        } else {
            Arc::new(MemoryStorage)
        };
        let store = AssetStore::from_config(&config.transfer)
            .context("failed to open persistent asset cache")?;
        Ok(Self::with_parts(config, store, storage))
    }

    pub fn with_parts(config: TavernConfig, store: AssetStore, storage: Arc<dyn TempStorage>) -> Self {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let transfers = Arc::new(AssetTransferManager::new(store.clone(), storage));
        let dispatcher = Arc::new(CommandDispatcher::new(state_rx));
        let coalescer = UpdateCoalescer::new(
            dispatcher.clone() as Arc<dyn CommandSink>,
            config.coalescer.interval(),
        );
        let policy = Arc::new(RwLock::new(ServerPolicy::default()));

        register_builtin_handlers(&dispatcher, &transfers, &policy);

        Self {
            inner: Arc::new(ContextInner {
                config,
                store,
                transfers,
                dispatcher,
                coalescer,
                activity: ActivityMonitor::new(),
                policy,
                state,
            }),
        }
    }

    pub fn config(&self) -> &TavernConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &AssetStore {
        &self.inner.store
    }

    pub fn transfers(&self) -> &Arc<AssetTransferManager> {
        &self.inner.transfers
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.inner.dispatcher
    }

    pub fn coalescer(&self) -> &UpdateCoalescer {
        &self.inner.coalescer
    }

    pub fn activity(&self) -> &ActivityMonitor {
        &self.inner.activity
    }

    pub fn policy(&self) -> ServerPolicy {
        self.inner.policy.read().clone()
    }

    pub(crate) fn set_policy(&self, policy: ServerPolicy) {
        *self.inner.policy.write() = policy;
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Move from `from` to `to` atomically. False if the state was not `from`.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = self.inner.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(from = ?from, to = ?to, "connection state changed");
        }
        moved
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "connection state changed");
        }
    }

    /// Shortcut for `dispatcher().send_command`.
    pub fn send(&self, tag: CommandTag, params: Vec<Value>) -> bool {
        self.inner.dispatcher.send_command(&Command::new(tag, params))
    }

    /// Return the asset, asking the host for it if it is not cached.
    pub async fn request_asset(&self, id: AssetId, timeout: Duration) -> Result<Arc<Asset>, StoreError> {
        if let Some(asset) = self.inner.store.get(&id) {
            return Ok(asset);
        }
        tracing::debug!(asset = %id.short(), "requesting asset from host");
        self.send(CommandTag::GetAsset, vec![json!(id)]);
        self.inner.store.fetch(id, timeout).await
    }

    /// Store an asset locally and, while connected, upload it to the host.
    ///
    /// The upload is announced with `putAsset(header)` on the Command
    /// channel; the bytes follow as chunks on the Bulk channel, so a large
    /// asset never delays other commands by more than one chunk.
    pub fn publish_asset(&self, name: &str, bytes: impl Into<Bytes>) -> Arc<Asset> {
        let asset = self.inner.store.put(name, bytes);
        let transfers = &self.inner.transfers;
        let producer = transfers.create_producer(asset.clone());
        if self.send(CommandTag::PutAsset, vec![json!(producer.header())]) {
            tracing::debug!(
                asset = %asset.id().short(),
                transfer = producer.transfer_id(),
                size = asset.len(),
                "uploading asset"
            );
            transfers.add_producer(producer);
        } else {
            tracing::debug!(asset = %asset.id().short(), "not connected, asset kept locally");
        }
        asset
    }
}

/// Handlers every client needs regardless of what it does with the campaign.
fn register_builtin_handlers(
    dispatcher: &CommandDispatcher,
    transfers: &Arc<AssetTransferManager>,
    policy: &Arc<RwLock<ServerPolicy>>,
) {
    let t = transfers.clone();
    dispatcher.register_handler(CommandTag::StartAssetTransfer, move |cmd: &Command| -> Result<()> {
        let header: AssetHeader = cmd.param(0)?;
        t.start_transfer(header)?;
        Ok(())
    });

    let p = policy.clone();
    dispatcher.register_handler(CommandTag::SetServerPolicy, move |cmd: &Command| -> Result<()> {
        let policy: ServerPolicy = cmd.param(0)?;
        tracing::info!(?policy, "server policy updated");
        *p.write() = policy;
        Ok(())
    });
}
