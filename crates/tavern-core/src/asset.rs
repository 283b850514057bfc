//! Asset transfer messages.
//!
//! A transfer is announced with an `AssetHeader` (carried as the single
//! parameter of a `startAssetTransfer` command) and then streamed as a
//! sequence of `AssetChunk` frames on the Bulk channel.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use zerocopy::byteorder::{U16, U64};
use zerocopy::{AsBytes, FromBytes};

use crate::crypto::AssetId;
use crate::wire::{ChunkPrefix, WireError, CHUNK_PREFIX_SIZE};

/// Sender-assigned transfer identifier.
pub type TransferId = u64;

/// Announces an incoming transfer before its first chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetHeader {
    pub transfer_id: TransferId,
    pub name: String,
    pub size: u64,
    /// Content id the receiver must verify against. `None` means the
    /// receiver adopts whatever the reassembled bytes hash to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<AssetId>,
}

/// One piece of an asset in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetChunk {
    pub transfer_id: TransferId,
    pub name: String,
    /// Bytes delivered so far, including `data`.
    pub cumulative: u64,
    pub total_size: u64,
    pub data: Bytes,
}

impl AssetChunk {
    /// Serialize into an AssetChunk frame payload.
    pub fn encode(&self) -> Bytes {
        let name = wire_name(&self.name).as_bytes();
        let name_len = name.len();
        let prefix = ChunkPrefix {
            transfer_id: U64::new(self.transfer_id),
            cumulative: U64::new(self.cumulative),
            total_size: U64::new(self.total_size),
            name_len: U16::new(name_len as u16),
        };

        let mut buf = BytesMut::with_capacity(CHUNK_PREFIX_SIZE + name_len + self.data.len());
        buf.put_slice(prefix.as_bytes());
        buf.put_slice(name);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Parse an AssetChunk frame payload. The chunk data shares `payload`'s
    /// allocation.
    pub fn decode(payload: Bytes) -> Result<Self, WireError> {
        let prefix = ChunkPrefix::read_from_prefix(&payload[..]).ok_or(WireError::Truncated {
            need: CHUNK_PREFIX_SIZE,
            have: payload.len(),
        })?;

        let name_len = prefix.name_len.get() as usize;
        let data_start = CHUNK_PREFIX_SIZE + name_len;
        if payload.len() < data_start {
            return Err(WireError::Truncated {
                need: data_start,
                have: payload.len(),
            });
        }

        let name = std::str::from_utf8(&payload[CHUNK_PREFIX_SIZE..data_start])
            .map_err(|_| WireError::InvalidName)?
            .to_string();

        Ok(Self {
            transfer_id: prefix.transfer_id.get(),
            name,
            cumulative: prefix.cumulative.get(),
            total_size: prefix.total_size.get(),
            data: payload.slice(data_start..),
        })
    }
}

/// The longest prefix of `name` that fits the u16 length field, cut on a
/// char boundary so it stays valid UTF-8.
fn wire_name(name: &str) -> &str {
    let max = u16::MAX as usize;
    if name.len() <= max {
        return name;
    }
    let end = name
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= max)
        .last()
        .unwrap_or(0);
    &name[..end]
}
