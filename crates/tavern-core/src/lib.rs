//! tavern-core: wire format, command model, handshake messages and hashing.
//! All other Tavern crates depend on this one.

pub mod asset;
pub mod command;
pub mod config;
pub mod crypto;
pub mod handshake;
pub mod policy;
pub mod wire;

pub use asset::{AssetChunk, AssetHeader, TransferId};
pub use command::{Command, CommandError, CommandTag};
pub use crypto::AssetId;
pub use handshake::{HandshakeError, HandshakeRequest, HandshakeResponse, Role};
pub use policy::ServerPolicy;
