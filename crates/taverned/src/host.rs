//! Host state: the roster of connected players, the campaign snapshot, the
//! server policy and the shared asset store, plus the relay that routes
//! every inbound command.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use tavern_core::config::TavernConfig;
use tavern_core::wire::Channel;
use tavern_core::{
    AssetChunk, AssetHeader, AssetId, Command, CommandTag, HandshakeError, HandshakeRequest,
    HandshakeResponse, Role, ServerPolicy,
};
use tavern_services::connection::{recv_handshake, send_handshake};
use tavern_services::{
    ActivityMonitor, Asset, AssetStore, AssetTransferManager, ChunkPump, CloseReason, Connection,
    ConnectionError, ConnectionHandle, DiskStorage, FrameHandler, MemoryStorage, TempStorage,
    TokenBucket, TransferCompletion, TransferListener,
};

use crate::admission::{check_request, name_key};

static NEXT_PEER: AtomicU64 = AtomicU64::new(1);

struct Peer {
    name: String,
    role: Role,
    handle: ConnectionHandle,
    transfers: Arc<AssetTransferManager>,
    pump_shutdown: broadcast::Sender<()>,
}

pub struct Host {
    config: TavernConfig,
    store: AssetStore,
    storage: Arc<dyn TempStorage>,
    activity: ActivityMonitor,
    peers: DashMap<u64, Peer>,
    names: DashMap<String, u64>,
    // Held while a join or leave updates the roster and announces it, and
    // while the campaign snapshot is replaced and relayed, so every peer sees
    // one consistent sequence of roster and campaign commands.
    roster: Mutex<()>,
    campaign: RwLock<Option<Value>>,
    policy: RwLock<ServerPolicy>,
}

impl Host {
    pub fn new(config: TavernConfig) -> Result<Arc<Self>> {
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
        Ok(Self::with_storage(config, store, storage))
    }

    pub fn with_storage(config: TavernConfig, store: AssetStore, storage: Arc<dyn TempStorage>) -> Arc<Self> {
        let policy = config.server.policy.clone();
        Arc::new(Self {
            config,
            store,
            storage,
            activity: ActivityMonitor::new(),
            peers: DashMap::new(),
            names: DashMap::new(),
            roster: Mutex::new(()),
            campaign: RwLock::new(None),
            policy: RwLock::new(policy),
        })
    }

    pub fn config(&self) -> &TavernConfig {
        &self.config
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn activity(&self) -> &ActivityMonitor {
        &self.activity
    }

    pub fn policy(&self) -> ServerPolicy {
        self.policy.read().clone()
    }

    /// Last campaign snapshot received via `setCampaign`.
    pub fn campaign(&self) -> Option<Value> {
        self.campaign.read().clone()
    }

    /// Connected players, sorted by name.
    pub fn players(&self) -> Vec<(String, Role)> {
        let mut list: Vec<_> = self
            .peers
            .iter()
            .map(|p| (p.name.clone(), p.role))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    // ── Admission ─────────────────────────────────────────────────────────

    /// Run the server half of the handshake on a fresh stream and, if the
    /// request is admitted, start relaying for it.
    pub async fn accept(self: &Arc<Self>, mut stream: TcpStream, addr: SocketAddr) -> Result<(), ConnectionError> {
        let timeout = self.config.network.handshake_timeout();
        let request: HandshakeRequest = match tokio::time::timeout(timeout, recv_handshake(&mut stream)).await {
            Ok(request) => request?,
            Err(_) => return Err(ConnectionError::HandshakeTimeout),
        };

        let admitted = check_request(&self.config.server, &request).and_then(|()| self.reserve_name(&request.name));
        let peer_id = match admitted {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(peer = %addr, name = %request.name, role = %request.role, error = %e, "handshake rejected");
                send_handshake(&mut stream, &HandshakeResponse::reject(&e)).await?;
                let _ = stream.shutdown().await;
                return Err(e.into());
            }
        };

        if let Err(e) = send_handshake(&mut stream, &HandshakeResponse::accept(self.policy())).await {
            self.names.remove(&name_key(&request.name));
            return Err(e);
        }
        self.admit(peer_id, request, stream, addr);
        Ok(())
    }

    fn reserve_name(&self, name: &str) -> Result<u64, HandshakeError> {
        match self.names.entry(name_key(name)) {
            Entry::Occupied(_) => Err(HandshakeError::NameInUse(name.to_string())),
            Entry::Vacant(slot) => {
                let id = NEXT_PEER.fetch_add(1, Ordering::Relaxed);
                slot.insert(id);
                Ok(id)
            }
        }
    }

    fn admit(self: &Arc<Self>, id: u64, request: HandshakeRequest, stream: TcpStream, addr: SocketAddr) {
        let (handle, connection) = Connection::new(stream, addr.to_string(), self.activity.clone());
        let transfers = Arc::new(AssetTransferManager::new(self.store.clone(), self.storage.clone()));
        transfers.add_listener(Arc::new(UploadRelay {
            host: Arc::downgrade(self),
            origin: id,
        }));
        let (pump_shutdown, pump_rx) = broadcast::channel(1);

        let tc = &self.config.transfer;
        let pump = ChunkPump::new(
            transfers.clone(),
            handle.clone(),
            TokenBucket::new(Channel::Bulk, tc.bulk_rate_bytes_per_sec, tc.bulk_burst_bytes),
            tc.effective_chunk_size(),
            tc.stale_after(),
            pump_rx,
        );

        let announce = Command::new(
            CommandTag::PlayerConnected,
            vec![json!(request.name), json!(request.role)],
        );
        {
            let _roster = self.roster.lock();
            for peer in self.peers.iter() {
                send_to(
                    &handle,
                    &Command::new(CommandTag::PlayerConnected, vec![json!(peer.name), json!(peer.role)]),
                );
            }
            self.peers.insert(
                id,
                Peer {
                    name: request.name.clone(),
                    role: request.role,
                    handle: handle.clone(),
                    transfers,
                    pump_shutdown,
                },
            );
            self.broadcast(None, &announce);
            if let Some(snapshot) = self.campaign() {
                send_to(&handle, &Command::new(CommandTag::SetCampaign, vec![snapshot]));
            }
        }

        tokio::spawn(async move {
            if let Err(e) = pump.run().await {
                tracing::warn!(error = %e, "chunk pump failed");
            }
        });
        connection.start(Arc::new(PeerFrames {
            host: self.clone(),
            peer_id: id,
        }));

        tracing::info!(
            peer = %addr,
            name = %request.name,
            role = %request.role,
            players = self.peers.len(),
            "player joined"
        );
    }

    fn leave(&self, id: u64, reason: &CloseReason) {
        let peer = {
            let _roster = self.roster.lock();
            let Some((_, peer)) = self.peers.remove(&id) else {
                return;
            };
            self.names.remove(&name_key(&peer.name));
            self.broadcast(
                None,
                &Command::new(CommandTag::PlayerDisconnected, vec![json!(peer.name)]),
            );
            peer
        };
        let _ = peer.pump_shutdown.send(());
        peer.transfers.flush();
        tracing::info!(name = %peer.name, ?reason, players = self.peers.len(), "player left");
    }

    /// Close every connection. Used on shutdown.
    pub fn close_all(&self) {
        for peer in self.peers.iter() {
            peer.handle.close();
        }
    }

    // ── Relay ─────────────────────────────────────────────────────────────

    fn broadcast(&self, except: Option<u64>, command: &Command) {
        match command.encode() {
            Ok(body) => self.broadcast_bytes(except, &body),
            Err(e) => tracing::warn!(tag = %command.tag, error = %e, "broadcast encode failed"),
        }
    }

    fn broadcast_bytes(&self, except: Option<u64>, body: &[u8]) {
        for peer in self.peers.iter() {
            if Some(*peer.key()) == except {
                continue;
            }
            if let Err(e) = peer.handle.send_command_bytes(body) {
                tracing::debug!(name = %peer.name, error = %e, "relay to peer failed");
            }
        }
    }

    fn route(&self, origin: u64, payload: Bytes) {
        let command = match Command::decode(&payload) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(peer = origin, error = %e, "dropping undecodable command");
                return;
            }
        };
        tracing::trace!(peer = origin, tag = %command.tag, "relaying command");

        let result = match command.tag {
            CommandTag::Heartbeat => Ok(()),
            CommandTag::SetCampaign => self.set_campaign(origin, &command, &payload),
            CommandTag::SetServerPolicy => self.set_policy(origin, &command, &payload),
            CommandTag::GetAsset => self.serve_asset(origin, &command),
            CommandTag::PutAsset => self.accept_upload(origin, &command),
            CommandTag::StartAssetTransfer => Err(anyhow::anyhow!(
                "startAssetTransfer only flows from the host; announce uploads with putAsset"
            )),
            CommandTag::BootPlayer => self.boot_player(origin, &command),
            _ => {
                self.broadcast_bytes(Some(origin), &payload);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(peer = origin, tag = %command.tag, error = %e, "command rejected");
        }
    }

    fn require_gm(&self, origin: u64, tag: CommandTag) -> Result<()> {
        let role = self.peers.get(&origin).map(|p| p.role);
        if role != Some(Role::Gm) {
            anyhow::bail!("{tag} is reserved for the GM");
        }
        Ok(())
    }

    fn set_campaign(&self, origin: u64, command: &Command, payload: &[u8]) -> Result<()> {
        let snapshot: Value = command.param(0)?;
        let _roster = self.roster.lock();
        *self.campaign.write() = Some(snapshot);
        tracing::info!(peer = origin, "campaign snapshot replaced");
        self.broadcast_bytes(Some(origin), payload);
        Ok(())
    }

    fn set_policy(&self, origin: u64, command: &Command, payload: &[u8]) -> Result<()> {
        self.require_gm(origin, command.tag)?;
        let policy: ServerPolicy = command.param(0)?;
        tracing::info!(?policy, "server policy updated");
        *self.policy.write() = policy;
        self.broadcast_bytes(None, payload);
        Ok(())
    }

    fn serve_asset(&self, origin: u64, command: &Command) -> Result<()> {
        let id: AssetId = command.param(0)?;
        let Some(asset) = self.store.get(&id) else {
            tracing::debug!(peer = origin, asset = %id.short(), "requested asset not held, dropped");
            return Ok(());
        };
        let (handle, transfers) = self.peer_link(origin).context("requesting peer is gone")?;
        push_asset(&handle, &transfers, asset)?;
        Ok(())
    }

    /// `putAsset(header)`: a player is about to upload an asset. Its chunks
    /// land in that player's transfer manager; `UploadRelay` takes over once
    /// the asset is complete.
    fn accept_upload(&self, origin: u64, command: &Command) -> Result<()> {
        let header: AssetHeader = command.param(0)?;
        let (_, transfers) = self.peer_link(origin).context("uploading peer is gone")?;
        tracing::debug!(
            peer = origin,
            transfer = header.transfer_id,
            name = %header.name,
            size = header.size,
            "upload announced"
        );
        transfers.start_transfer(header)?;
        Ok(())
    }

    /// Stream a freshly uploaded asset to every peer except the uploader.
    fn share_asset(&self, origin: u64, asset: Arc<Asset>) {
        let links: Vec<_> = self
            .peers
            .iter()
            .filter(|p| *p.key() != origin)
            .map(|p| (p.handle.clone(), p.transfers.clone()))
            .collect();
        tracing::info!(
            peer = origin,
            asset = %asset.id().short(),
            name = %asset.name(),
            recipients = links.len(),
            "sharing uploaded asset"
        );
        for (handle, transfers) in links {
            if let Err(e) = push_asset(&handle, &transfers, asset.clone()) {
                tracing::debug!(peer = %handle.peer(), error = %e, "asset share failed");
            }
        }
    }

    fn peer_link(&self, id: u64) -> Option<(ConnectionHandle, Arc<AssetTransferManager>)> {
        self.peers
            .get(&id)
            .map(|peer| (peer.handle.clone(), peer.transfers.clone()))
    }

    fn boot_player(&self, origin: u64, command: &Command) -> Result<()> {
        self.require_gm(origin, command.tag)?;
        let name: String = command.param(0)?;
        let target = self.names.get(&name_key(&name)).map(|id| *id);
        let Some(target) = target else {
            anyhow::bail!("no player named {name:?}");
        };
        if let Some(peer) = self.peers.get(&target) {
            tracing::info!(name = %peer.name, "booting player");
            peer.handle.close();
        }
        Ok(())
    }

    fn receive_chunk(&self, origin: u64, chunk: AssetChunk) {
        let transfers = match self.peers.get(&origin) {
            Some(peer) => peer.transfers.clone(),
            None => return,
        };
        match transfers.update(chunk) {
            Ok(Some(asset)) => {
                tracing::info!(peer = origin, asset = %asset.id().short(), "asset received from player");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(peer = origin, error = %e, "inbound asset chunk rejected");
            }
        }
    }
}

/// Announce `asset` on the Command channel, then queue its chunks. The
/// header is queued before the producer, so it always precedes the chunks.
fn push_asset(
    handle: &ConnectionHandle,
    transfers: &AssetTransferManager,
    asset: Arc<Asset>,
) -> Result<(), ConnectionError> {
    let producer = transfers.create_producer(asset);
    handle.send_command(&Command::new(
        CommandTag::StartAssetTransfer,
        vec![json!(producer.header())],
    ))?;
    tracing::debug!(
        peer = %handle.peer(),
        transfer = producer.transfer_id(),
        "sending asset"
    );
    transfers.add_producer(producer);
    Ok(())
}

/// Hands assets a player finished uploading back to the host for sharing.
struct UploadRelay {
    host: Weak<Host>,
    origin: u64,
}

impl TransferListener for UploadRelay {
    fn completed(&self, completion: &TransferCompletion) {
        if let Some(host) = self.host.upgrade() {
            host.share_asset(self.origin, completion.asset.clone());
        }
    }
}

fn send_to(handle: &ConnectionHandle, command: &Command) {
    if let Err(e) = handle.send_command(command) {
        tracing::debug!(peer = %handle.peer(), tag = %command.tag, error = %e, "send failed");
    }
}

struct PeerFrames {
    host: Arc<Host>,
    peer_id: u64,
}

impl FrameHandler for PeerFrames {
    fn on_command(&self, payload: Bytes) {
        self.host.route(self.peer_id, payload);
    }

    fn on_chunk(&self, chunk: AssetChunk) {
        self.host.receive_chunk(self.peer_id, chunk);
    }

    fn on_closed(&self, reason: &CloseReason) {
        self.host.leave(self.peer_id, reason);
    }
}
