//! Chunk storage: position-keyed blob stores shared by every connection.
//!
//! Two backends:
//!   MemoryStore: DashMap, gone on restart. Tests and throwaway servers.
//!   DiskStore: one file per chunk, grouped into 32×32 region directories:
//!              {root}/r.{cx>>5}.{cz>>5}/c.{cx}.{cz}.bin
//!
//! Storing a position that already exists replaces it. Last upload wins.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use memmap2::Mmap;

use morechunks_core::ChunkPosition;

/// Storage collaborator used by the connection handlers.
///
/// Implementations must tolerate concurrent store/retrieve from many
/// connections. A stored blob must be visible to every later retrieve.
pub trait ChunkStore: Send + Sync {
    fn store(&self, position: ChunkPosition, blob: Bytes) -> Result<(), StoreError>;

    /// `Ok(None)` is a miss.
    fn retrieve(&self, position: ChunkPosition) -> Result<Option<Bytes>, StoreError>;

    /// Number of stored chunks (for status/debugging).
    fn count(&self) -> usize;
}

pub type SharedStore = Arc<dyn ChunkStore>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
}

// ── Memory ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    chunks: DashMap<ChunkPosition, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkStore for MemoryStore {
    fn store(&self, position: ChunkPosition, blob: Bytes) -> Result<(), StoreError> {
        self.chunks.insert(position, blob);
        Ok(())
    }

    fn retrieve(&self, position: ChunkPosition) -> Result<Option<Bytes>, StoreError> {
        Ok(self.chunks.get(&position).map(|b| b.value().clone()))
    }

    fn count(&self) -> usize {
        self.chunks.len()
    }
}

// ── Disk ──────────────────────────────────────────────────────────────────────

const CHUNK_EXT: &str = "bin";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Create a store rooted at the given directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::CreateDir(root.clone(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_path(&self, p: ChunkPosition) -> PathBuf {
        self.root
            .join(format!("r.{}.{}", p.cx >> 5, p.cz >> 5))
            .join(format!("c.{}.{}.{CHUNK_EXT}", p.cx, p.cz))
    }
}

impl ChunkStore for DiskStore {
    /// Writes are atomic: unique temp file, then rename over the old chunk.
    fn store(&self, position: ChunkPosition, blob: Bytes) -> Result<(), StoreError> {
        let path = self.chunk_path(position);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::CreateDir(parent.into(), e))?;
        }

        // Two connections may upload the same position at once.
        let tmp_path = path.with_extension(format!(
            "{CHUNK_EXT}.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        {
            let mut file =
                fs::File::create(&tmp_path).map_err(|e| StoreError::Write(tmp_path.clone(), e))?;
            file.write_all(&blob)
                .map_err(|e| StoreError::Write(tmp_path.clone(), e))?;
            file.sync_all()
                .map_err(|e| StoreError::Write(tmp_path.clone(), e))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StoreError::Write(path.clone(), e)
        })?;

        tracing::trace!(%position, bytes = blob.len(), "chunk stored");
        Ok(())
    }

    fn retrieve(&self, position: ChunkPosition) -> Result<Option<Bytes>, StoreError> {
        let path = self.chunk_path(position);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Read(path, e)),
        };

        let len = file
            .metadata()
            .map_err(|e| StoreError::Read(path.clone(), e))?
            .len();
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }

        // Safety: chunk files are only ever replaced by rename, never
        // modified in place, so the mapping cannot change under us.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| StoreError::Read(path.clone(), e))? };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(regions) = fs::read_dir(&self.root) {
            for region in regions.flatten() {
                if let Ok(chunks) = fs::read_dir(region.path()) {
                    total += chunks
                        .flatten()
                        .filter(|c| c.path().extension().is_some_and(|ext| ext == CHUNK_EXT))
                        .count();
                }
            }
        }
        total
    }
}
