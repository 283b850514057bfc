//! tavern-services: connections, command dispatch, asset storage and
//! chunked transfer for a Tavern session.

pub mod activity;
pub mod asset_cache;
pub mod asset_store;
pub mod coalescer;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod lifecycle;
pub mod pump;
pub mod qos;
pub mod temp_storage;
pub mod transfer;

pub use activity::{ActivityEvent, ActivityMonitor, Direction, Phase};
pub use asset_cache::DiskAssetCache;
pub use asset_store::{Asset, AssetStore, StoreError};
pub use coalescer::UpdateCoalescer;
pub use connection::{CloseReason, Connection, ConnectionError, ConnectionHandle, FrameHandler};
pub use context::SessionContext;
pub use dispatch::{CommandDispatcher, CommandHandler, CommandSink};
pub use lifecycle::{ConnectionLifecycle, ConnectionState, ReplicaHost, SessionMode};
pub use pump::ChunkPump;
pub use qos::TokenBucket;
pub use temp_storage::{DiskStorage, MemoryStorage, TempBuffer, TempStorage};
pub use transfer::{
    AssetProducer, AssetTransferManager, TransferCompletion, TransferError, TransferListener,
    TransferProgress,
};
