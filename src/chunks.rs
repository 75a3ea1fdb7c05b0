//! Chunk/slice/block data model.
//!
//! A file is partitioned into fixed 64 MiB chunks. Every write lands as a
//! slice inside one chunk; the newest slice covering an offset wins on
//! read. Flushed slices reference immutable blocks in the object store,
//! keyed `{payloadId}/chunk-{c}/block-{b}`.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CHUNK_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024 * 1024;
pub const MIN_BLOCK_SIZE: u32 = 1024 * 1024;
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_SLICES_PER_CHUNK: usize = 16;

/// SHA-256 (or Merkle root) of block content, used when deduplication is
/// enabled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        Self(openssl::sha::sha256(data))
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ContentHash({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Reference to one stored block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub chunk_index: u64,
    pub block_index: u32,
    pub size: u32,
}

/// Metadata of one contiguous write within a chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SliceMeta {
    pub id: Uuid,
    /// Offset relative to the chunk start.
    pub offset: u64,
    pub length: u64,
    pub blocks: Vec<BlockRef>,
    /// Monotonic creation stamp; greater wins on read.
    pub created_at: u64,
}

impl SliceMeta {
    pub fn covers(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.offset + self.length
    }
}

/// Per-chunk slice index, ordered newest-first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u64,
    pub slices: Vec<SliceMeta>,
}

impl ChunkInfo {
    pub fn needs_compaction(&self, threshold: usize) -> bool {
        self.slices.len() > threshold
    }

    /// The slice serving a read at `offset`, i.e. the newest covering one.
    pub fn slice_for(&self, offset: u64) -> Option<&SliceMeta> {
        self.slices
            .iter()
            .filter(|s| s.covers(offset))
            .max_by_key(|s| s.created_at)
    }
}

/// Per-file chunk index. The block size is fixed when the file is created
/// and never changes afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileChunkMeta {
    block_size: u32,
    pub chunks: std::collections::HashMap<u64, ChunkInfo>,
}

impl FileChunkMeta {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            chunks: std::collections::HashMap::new(),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }
}

pub fn chunk_index_for_offset(offset: u64) -> u64 {
    offset / CHUNK_SIZE
}

/// `{payloadId}/chunk-{c}/block-{b}`
pub fn block_key(payload_id: &str, chunk_index: u64, block_index: u32) -> String {
    format!("{}/chunk-{}/block-{}", payload_id, chunk_index, block_index)
}

lazy_static! {
    static ref BLOCK_KEY_RE: Regex = Regex::new(r"^(.+)/chunk-(\d+)/block-(\d+)$").unwrap();
}

/// Parses a block object key back into `(payload_id, chunk, block)`.
pub fn parse_block_key(key: &str) -> Option<(String, u64, u32)> {
    let caps = BLOCK_KEY_RE.captures(key)?;
    let payload = caps.get(1)?.as_str().to_string();
    let chunk = caps.get(2)?.as_str().parse().ok()?;
    let block = caps.get(3)?.as_str().parse().ok()?;
    Some((payload, chunk, block))
}
