//! Chunk pump: moves queued asset producers onto the Bulk channel.
//!
//! One pump per connection. It wakes when a producer is queued (or every
//! `IDLE_TICK`), drains chunks round-robin through the token bucket, and
//! on idle ticks evicts stale inbound transfers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use tavern_core::wire::Channel;

use crate::connection::ConnectionHandle;
use crate::qos::TokenBucket;
use crate::transfer::AssetTransferManager;

const IDLE_TICK: Duration = Duration::from_millis(500);

pub struct ChunkPump {
    transfers: Arc<AssetTransferManager>,
    link: ConnectionHandle,
    bucket: TokenBucket,
    chunk_size: usize,
    stale_after: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl ChunkPump {
    pub fn new(
        transfers: Arc<AssetTransferManager>,
        link: ConnectionHandle,
        bucket: TokenBucket,
        chunk_size: usize,
        stale_after: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        debug_assert_eq!(bucket.channel(), Channel::Bulk);
        Self {
            transfers,
            link,
            bucket,
            chunk_size,
            stale_after,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let ready = self.transfers.producer_ready();
        loop {
            while let Some(chunk) = self.transfers.next_chunk(self.chunk_size) {
                let cost = chunk.data.len();
                while !self.bucket.allow(cost) {
                    let wait = self.bucket.wait_time(cost);
                    tokio::select! {
                        _ = self.shutdown.recv() => return Ok(()),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                if self.link.send_chunk(chunk).await.is_err() {
                    tracing::debug!(peer = %self.link.peer(), "connection gone, chunk pump exiting");
                    return Ok(());
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!(peer = %self.link.peer(), "chunk pump shutting down");
                    return Ok(());
                }
                _ = ready.notified() => {}
                _ = tokio::time::sleep(IDLE_TICK) => {
                    if !self.link.is_open() {
                        return Ok(());
                    }
                    let evicted = self.transfers.evict_stale(self.stale_after);
                    if evicted > 0 {
                        tracing::info!(evicted, "stale transfers evicted");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityMonitor;
    use crate::asset_store::{Asset, AssetStore};
    use crate::connection::{CloseReason, Connection, FrameHandler};
    use crate::temp_storage::MemoryStorage;
    use bytes::Bytes;
    use tavern_core::AssetChunk;

    struct Receiver {
        transfers: Arc<AssetTransferManager>,
    }

    impl FrameHandler for Receiver {
        fn on_command(&self, _payload: Bytes) {}
        fn on_chunk(&self, chunk: AssetChunk) {
            self.transfers.update(chunk).unwrap();
        }
        fn on_closed(&self, _reason: &CloseReason) {}
    }

    fn transfers() -> Arc<AssetTransferManager> {
        Arc::new(AssetTransferManager::new(AssetStore::new(), Arc::new(MemoryStorage)))
    }

    #[tokio::test]
    async fn queued_producers_reach_the_peer() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let sender = transfers();
        let receiver = transfers();

        let link = Connection::spawn(
            a,
            "receiver",
            Arc::new(Receiver {
                transfers: transfers(),
            }),
            ActivityMonitor::new(),
        );
        let _peer = Connection::spawn(
            b,
            "sender",
            Arc::new(Receiver {
                transfers: receiver.clone(),
            }),
            ActivityMonitor::new(),
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let pump = ChunkPump::new(
            sender.clone(),
            link,
            TokenBucket::new(Channel::Bulk, 0, 0),
            1000,
            Duration::from_secs(300),
            shutdown_rx,
        );
        let task = tokio::spawn(pump.run());

        let mut ids = Vec::new();
        for i in 0..2u8 {
            let data: Vec<u8> = vec![i; 3500];
            let asset = Arc::new(Asset::new(format!("asset-{i}"), data));
            let producer = sender.create_producer(asset.clone());
            receiver.start_transfer(producer.header()).unwrap();
            sender.add_producer(producer);
            ids.push(asset.id());
        }

        for _ in 0..200 {
            if ids.iter().all(|id| receiver.store().contains(id)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ids.iter().all(|id| receiver.store().contains(id)));
        assert!(!sender.has_producers());

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
