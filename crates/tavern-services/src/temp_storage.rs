//! Scratch space for assets being reassembled.
//!
//! Every in-flight transfer owns one `TempBuffer`. Dropping the buffer
//! releases whatever it holds, so an abandoned, failed or completed transfer
//! never leaks storage.
//!
//! Disk buffers use the same two-level layout as a content cache:
//!   {root}/{key[0..2]}/{key}.part

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use memmap2::Mmap;
use tavern_core::TransferId;

/// Creates scratch buffers for incoming transfers.
pub trait TempStorage: Send + Sync {
    fn create(&self, transfer_id: TransferId) -> Result<Box<dyn TempBuffer>>;
}

/// Append-only scratch buffer.
pub trait TempBuffer: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes written so far.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read back everything written.
    fn contents(&mut self) -> Result<Bytes>;

    /// Human-readable location for logs and completion events.
    fn location(&self) -> String;
}

// ── Memory ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStorage;

impl TempStorage for MemoryStorage {
    fn create(&self, transfer_id: TransferId) -> Result<Box<dyn TempBuffer>> {
        Ok(Box::new(MemoryBuffer {
            transfer_id,
            buf: BytesMut::new(),
        }))
    }
}

struct MemoryBuffer {
    transfer_id: TransferId,
    buf: BytesMut,
}

impl TempBuffer for MemoryBuffer {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn contents(&mut self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(&self.buf))
    }

    fn location(&self) -> String {
        format!("memory:{}", self.transfer_id)
    }
}

// ── Disk ──────────────────────────────────────────────────────────────────────

static NEXT_PART: AtomicU64 = AtomicU64::new(0);

/// Part files under a root directory.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create temp root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn part_path(&self, transfer_id: TransferId) -> PathBuf {
        // Transfer ids are only unique per connection; the sequence number
        // keeps concurrent connections sharing a root apart.
        let seq = NEXT_PART.fetch_add(1, Ordering::Relaxed);
        let key = hex::encode(tavern_core::crypto::hash(
            format!("{}:{}:{}", std::process::id(), seq, transfer_id).as_bytes(),
        ));
        self.root.join(&key[0..2]).join(format!("{key}.part"))
    }
}

impl TempStorage for DiskStorage {
    fn create(&self, transfer_id: TransferId) -> Result<Box<dyn TempBuffer>> {
        let path = self.part_path(transfer_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create part dir: {}", parent.display()))?;
        }
        let file = fs::File::create(&path)
            .with_context(|| format!("failed to create part file: {}", path.display()))?;
        tracing::trace!(transfer = transfer_id, path = %path.display(), "part file created");
        Ok(Box::new(DiskBuffer { path, file, len: 0 }))
    }
}

struct DiskBuffer {
    path: PathBuf,
    file: fs::File,
    len: u64,
}

impl TempBuffer for DiskBuffer {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        self.len += data.len() as u64;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn contents(&mut self) -> Result<Bytes> {
        self.file.flush().context("failed to flush part file")?;
        if self.len == 0 {
            return Ok(Bytes::new());
        }
        let file = fs::File::open(&self.path)
            .with_context(|| format!("failed to open part file: {}", self.path.display()))?;

        // Safety: the part file is private to this buffer and only appended
        // through `self.file`, which is not written while the map is alive.
        let mmap = unsafe {
            Mmap::map(&file)
                .with_context(|| format!("failed to mmap part file: {}", self.path.display()))?
        };
        Ok(Bytes::copy_from_slice(&mmap))
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

impl Drop for DiskBuffer {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "failed to remove part file");
        }
    }
}
