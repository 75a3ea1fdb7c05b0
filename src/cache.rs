//! Per-file write cache.
//!
//! Writes land here as slices keyed by `(file, chunk)`; the newest slice
//! covering an offset wins on read. Dirty slices are drained by the
//! transfer manager; flushed slices become evictable under an LRU budget
//! while their block references stay behind in the chunk index.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use uuid::Uuid;

use crate::chunks::{BlockRef, ChunkInfo, SliceMeta, CHUNK_SIZE, DEFAULT_MAX_SLICES_PER_CHUNK};
use crate::error::{ErrorCode, StoreError};
use crate::handle::FileHandle;

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Eviction budget over all cached slice bytes.
    pub max_bytes: u64,
    pub max_slices_per_chunk: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            max_slices_per_chunk: DEFAULT_MAX_SLICES_PER_CHUNK,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DirtySlice {
    pub id: Uuid,
    pub chunk_index: u64,
    pub offset: u64,
    pub length: u64,
    pub data: Bytes,
}

struct CachedSlice {
    id: Uuid,
    offset: u64,
    data: Bytes,
    created_seq: u64,
    last_access: u64,
    flushed: bool,
    blocks: Vec<BlockRef>,
}

impl CachedSlice {
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

#[derive(Default)]
struct ChunkEntry {
    // Newest first.
    slices: Vec<CachedSlice>,
}

#[derive(Default)]
struct FileEntry {
    chunks: HashMap<u64, ChunkEntry>,
}

pub struct SliceCache {
    config: CacheConfig,
    files: RwLock<HashMap<FileHandle, Arc<Mutex<FileEntry>>>>,
    total_bytes: AtomicU64,
    seq: AtomicU64,
}

/// Merges `(start, end)` intervals and returns them sorted.
fn merge_intervals(mut intervals: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    intervals.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for (start, end) in intervals {
        match merged.last_mut() {
            Some((_, last_end)) if start <= *last_end => {
                if end > *last_end {
                    *last_end = end;
                }
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

impl SliceCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            files: RwLock::new(HashMap::new()),
            total_bytes: AtomicU64::new(0),
            seq: AtomicU64::new(1),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    fn file_entry(&self, handle: &FileHandle) -> Arc<Mutex<FileEntry>> {
        if let Some(entry) = self.files.read().unwrap().get(handle) {
            return entry.clone();
        }
        self.files
            .write()
            .unwrap()
            .entry(handle.clone())
            .or_insert_with(|| Arc::new(Mutex::new(FileEntry::default())))
            .clone()
    }

    fn existing_entry(&self, handle: &FileHandle) -> Option<Arc<Mutex<FileEntry>>> {
        self.files.read().unwrap().get(handle).cloned()
    }

    fn insert_slice(
        &self,
        handle: &FileHandle,
        chunk_index: u64,
        data: Bytes,
        offset: u64,
        flushed: bool,
        blocks: Vec<BlockRef>,
    ) -> Result<Uuid, StoreError> {
        if data.is_empty() {
            return Err(StoreError::invalid_argument("empty slice write"));
        }
        if offset + data.len() as u64 > CHUNK_SIZE {
            return Err(StoreError::invalid_argument(format!(
                "slice [{}, len {}] crosses the chunk boundary",
                offset,
                data.len()
            )));
        }

        let id = Uuid::new_v4();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let len = data.len() as u64;
        let entry = self.file_entry(handle);
        {
            let mut entry = entry.lock().unwrap();
            let chunk = entry.chunks.entry(chunk_index).or_default();
            chunk.slices.insert(
                0,
                CachedSlice {
                    id,
                    offset,
                    data,
                    created_seq: seq,
                    last_access: seq,
                    flushed,
                    blocks,
                },
            );
        }
        self.total_bytes.fetch_add(len, Ordering::SeqCst);
        self.maybe_evict();
        Ok(id)
    }

    /// Records a fresh (dirty) write.
    pub fn write_slice(
        &self,
        handle: &FileHandle,
        chunk_index: u64,
        data: Bytes,
        offset: u64,
    ) -> Result<Uuid, StoreError> {
        self.insert_slice(handle, chunk_index, data, offset, false, Vec::new())
    }

    /// Caches data that already lives in the object store, e.g. blocks
    /// fetched on a read miss. Such slices are immediately evictable.
    pub fn write_slice_flushed(
        &self,
        handle: &FileHandle,
        chunk_index: u64,
        data: Bytes,
        offset: u64,
        blocks: Vec<BlockRef>,
    ) -> Result<Uuid, StoreError> {
        self.insert_slice(handle, chunk_index, data, offset, true, blocks)
    }

    /// Newest-wins read. Returns `None` unless the whole range is covered
    /// by cached data.
    pub fn read_slice(
        &self,
        handle: &FileHandle,
        chunk_index: u64,
        offset: u64,
        length: usize,
    ) -> Option<Vec<u8>> {
        if length == 0 {
            return Some(Vec::new());
        }
        let entry = self.existing_entry(handle)?;
        let mut entry = entry.lock().unwrap();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let chunk = entry.chunks.get_mut(&chunk_index)?;

        let end = offset + length as u64;
        let mut buf = vec![0u8; length];
        // Uncovered subranges of the request, shrinking as newer slices
        // claim their bytes.
        let mut holes = vec![(offset, end)];
        for slice in chunk.slices.iter_mut() {
            if holes.is_empty() {
                break;
            }
            let s_start = slice.offset;
            let s_end = slice.end();
            let mut next_holes = Vec::with_capacity(holes.len());
            let mut used = false;
            for (h_start, h_end) in holes {
                let o_start = h_start.max(s_start);
                let o_end = h_end.min(s_end);
                if o_start >= o_end {
                    next_holes.push((h_start, h_end));
                    continue;
                }
                used = true;
                let src = &slice.data[(o_start - s_start) as usize..(o_end - s_start) as usize];
                buf[(o_start - offset) as usize..(o_end - offset) as usize].copy_from_slice(src);
                if h_start < o_start {
                    next_holes.push((h_start, o_start));
                }
                if o_end < h_end {
                    next_holes.push((o_end, h_end));
                }
            }
            if used {
                slice.last_access = seq;
            }
            holes = next_holes;
        }

        if holes.is_empty() {
            Some(buf)
        } else {
            None
        }
    }

    fn coverage(&self, handle: &FileHandle, chunk_index: u64) -> Vec<(u64, u64)> {
        let entry = match self.existing_entry(handle) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        let entry = entry.lock().unwrap();
        let chunk = match entry.chunks.get(&chunk_index) {
            Some(chunk) => chunk,
            None => return Vec::new(),
        };
        merge_intervals(
            chunk
                .slices
                .iter()
                .map(|s| (s.offset, s.end()))
                .collect(),
        )
    }

    /// True when `[offset, offset+length)` is fully backed by cached
    /// data, with no untracked gaps.
    pub fn is_range_covered(
        &self,
        handle: &FileHandle,
        chunk_index: u64,
        offset: u64,
        length: u64,
    ) -> bool {
        if length == 0 {
            return true;
        }
        let end = offset + length;
        self.coverage(handle, chunk_index)
            .iter()
            .any(|&(start, stop)| start <= offset && end <= stop)
    }

    /// Longest covered run starting at `offset`, capped at `max_len`.
    pub fn read_covered_prefix(
        &self,
        handle: &FileHandle,
        chunk_index: u64,
        offset: u64,
        max_len: u64,
    ) -> Option<Vec<u8>> {
        let mut prefix = 0;
        for (start, stop) in self.coverage(handle, chunk_index) {
            if start <= offset && offset < stop {
                prefix = (stop - offset).min(max_len);
                break;
            }
        }
        if prefix == 0 {
            return None;
        }
        self.read_slice(handle, chunk_index, offset, prefix as usize)
    }

    /// End offset of the last covered byte within `[offset, offset+max_len)`,
    /// or `offset` when nothing in that window is cached. Coverage need not
    /// be contiguous.
    pub fn covered_extent(
        &self,
        handle: &FileHandle,
        chunk_index: u64,
        offset: u64,
        max_len: u64,
    ) -> u64 {
        let window_end = offset + max_len;
        let mut extent = offset;
        for (start, stop) in self.coverage(handle, chunk_index) {
            if start >= window_end {
                break;
            }
            if stop > offset {
                extent = extent.max(stop.min(window_end));
            }
        }
        extent
    }

    /// Reads a range, substituting zeros for untracked gaps. Used when a
    /// sparse slice is persisted as a block object.
    pub fn read_zero_filled(
        &self,
        handle: &FileHandle,
        chunk_index: u64,
        offset: u64,
        length: usize,
    ) -> Vec<u8> {
        if length == 0 {
            return Vec::new();
        }
        let mut buf = vec![0u8; length];
        let entry = match self.existing_entry(handle) {
            Some(entry) => entry,
            None => return buf,
        };
        let mut entry = entry.lock().unwrap();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let chunk = match entry.chunks.get_mut(&chunk_index) {
            Some(chunk) => chunk,
            None => return buf,
        };

        let end = offset + length as u64;
        let mut holes = vec![(offset, end)];
        for slice in chunk.slices.iter_mut() {
            if holes.is_empty() {
                break;
            }
            let s_start = slice.offset;
            let s_end = slice.end();
            let mut next_holes = Vec::with_capacity(holes.len());
            let mut used = false;
            for (h_start, h_end) in holes {
                let o_start = h_start.max(s_start);
                let o_end = h_end.min(s_end);
                if o_start >= o_end {
                    next_holes.push((h_start, h_end));
                    continue;
                }
                used = true;
                let src = &slice.data[(o_start - s_start) as usize..(o_end - s_start) as usize];
                buf[(o_start - offset) as usize..(o_end - offset) as usize].copy_from_slice(src);
                if h_start < o_start {
                    next_holes.push((h_start, o_start));
                }
                if o_end < h_end {
                    next_holes.push((o_end, h_end));
                }
            }
            if used {
                slice.last_access = seq;
            }
            holes = next_holes;
        }
        buf
    }

    /// All unflushed slices of a file, oldest first.
    pub fn get_dirty_slices(&self, handle: &FileHandle) -> Vec<DirtySlice> {
        let entry = match self.existing_entry(handle) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        let entry = entry.lock().unwrap();
        let mut dirty: Vec<(u64, DirtySlice)> = Vec::new();
        for (chunk_index, chunk) in &entry.chunks {
            for slice in &chunk.slices {
                if slice.flushed {
                    continue;
                }
                dirty.push((
                    slice.created_seq,
                    DirtySlice {
                        id: slice.id,
                        chunk_index: *chunk_index,
                        offset: slice.offset,
                        length: slice.data.len() as u64,
                        data: slice.data.clone(),
                    },
                ));
            }
        }
        dirty.sort_by_key(|(seq, _)| *seq);
        dirty.into_iter().map(|(_, slice)| slice).collect()
    }

    /// Marks a slice as flushed and records its block references. The
    /// slice may already be gone if it was flushed and evicted earlier;
    /// callers treat that as non-fatal.
    pub fn mark_slice_flushed(
        &self,
        handle: &FileHandle,
        slice_id: &Uuid,
        blocks: Vec<BlockRef>,
    ) -> Result<(), StoreError> {
        if let Some(entry) = self.existing_entry(handle) {
            let mut entry = entry.lock().unwrap();
            for chunk in entry.chunks.values_mut() {
                if let Some(slice) = chunk.slices.iter_mut().find(|s| &s.id == slice_id) {
                    slice.flushed = true;
                    slice.blocks = blocks;
                    return Ok(());
                }
            }
        }
        Err(StoreError::new(
            ErrorCode::NotFound,
            format!("slice {} not found", slice_id),
        ))
    }

    /// Drops every cached slice of a file.
    pub fn invalidate(&self, handle: &FileHandle) {
        let removed = self.files.write().unwrap().remove(handle);
        if let Some(entry) = removed {
            let entry = entry.lock().unwrap();
            let bytes: u64 = entry
                .chunks
                .values()
                .flat_map(|c| c.slices.iter())
                .map(|s| s.data.len() as u64)
                .sum();
            self.total_bytes.fetch_sub(bytes, Ordering::SeqCst);
        }
    }

    /// Slice index of one chunk, newest first, for compaction decisions.
    pub fn chunk_info(&self, handle: &FileHandle, chunk_index: u64) -> Option<ChunkInfo> {
        let entry = self.existing_entry(handle)?;
        let entry = entry.lock().unwrap();
        let chunk = entry.chunks.get(&chunk_index)?;
        Some(ChunkInfo {
            index: chunk_index,
            slices: chunk
                .slices
                .iter()
                .map(|s| SliceMeta {
                    id: s.id,
                    offset: s.offset,
                    length: s.data.len() as u64,
                    blocks: s.blocks.clone(),
                    created_at: s.created_seq,
                })
                .collect(),
        })
    }

    pub fn needs_compaction(&self, handle: &FileHandle, chunk_index: u64) -> bool {
        self.chunk_info(handle, chunk_index)
            .map(|info| info.needs_compaction(self.config.max_slices_per_chunk))
            .unwrap_or(false)
    }

    // Only flushed slices are evictable; dirty data stays until the
    // transfer manager drains it.
    fn maybe_evict(&self) {
        while self.total_bytes.load(Ordering::SeqCst) > self.config.max_bytes {
            let victim = self.find_lru_flushed();
            let (handle, chunk_index, slice_id) = match victim {
                Some(v) => v,
                None => return,
            };
            if let Some(entry) = self.existing_entry(&handle) {
                let mut entry = entry.lock().unwrap();
                if let Some(chunk) = entry.chunks.get_mut(&chunk_index) {
                    if let Some(pos) = chunk.slices.iter().position(|s| s.id == slice_id) {
                        let removed = chunk.slices.remove(pos);
                        self.total_bytes
                            .fetch_sub(removed.data.len() as u64, Ordering::SeqCst);
                        continue;
                    }
                }
            }
            // The victim vanished under us; try again from scratch.
        }
    }

    fn find_lru_flushed(&self) -> Option<(FileHandle, u64, Uuid)> {
        let files = self.files.read().unwrap();
        let mut best: Option<(u64, FileHandle, u64, Uuid)> = None;
        for (handle, entry) in files.iter() {
            let entry = entry.lock().unwrap();
            for (chunk_index, chunk) in &entry.chunks {
                for slice in &chunk.slices {
                    if !slice.flushed {
                        continue;
                    }
                    let better = match &best {
                        Some((access, _, _, _)) => slice.last_access < *access,
                        None => true,
                    };
                    if better {
                        best = Some((slice.last_access, handle.clone(), *chunk_index, slice.id));
                    }
                }
            }
        }
        best.map(|(_, handle, chunk, id)| (handle, chunk, id))
    }
}

impl Default for SliceCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> FileHandle {
        FileHandle::generate_new("share1").unwrap()
    }

    #[test]
    fn write_then_read_subrange() {
        let cache = SliceCache::default();
        let h = handle();
        cache
            .write_slice(&h, 0, Bytes::from_static(b"hello world"), 0)
            .unwrap();
        let data = cache.read_slice(&h, 0, 6, 5).unwrap();
        assert_eq!(&data, b"world");
    }

    #[test]
    fn newest_slice_wins_on_overlap() {
        let cache = SliceCache::default();
        let h = handle();
        cache
            .write_slice(&h, 0, Bytes::from_static(b"aaaaaaaaaa"), 0)
            .unwrap();
        cache
            .write_slice(&h, 0, Bytes::from_static(b"bbb"), 3)
            .unwrap();
        let data = cache.read_slice(&h, 0, 0, 10).unwrap();
        assert_eq!(&data, b"aaabbbaaaa");
    }

    #[test]
    fn uncovered_reads_miss() {
        let cache = SliceCache::default();
        let h = handle();
        cache
            .write_slice(&h, 0, Bytes::from_static(b"abc"), 0)
            .unwrap();
        cache
            .write_slice(&h, 0, Bytes::from_static(b"def"), 10)
            .unwrap();
        assert!(cache.read_slice(&h, 0, 0, 13).is_none());
        assert!(cache.read_slice(&h, 1, 0, 3).is_none());
        assert!(cache.read_slice(&h, 0, 10, 3).is_some());
    }

    #[test]
    fn range_coverage_tracks_gaps() {
        let cache = SliceCache::default();
        let h = handle();
        cache
            .write_slice(&h, 0, Bytes::from_static(b"0123"), 0)
            .unwrap();
        cache
            .write_slice(&h, 0, Bytes::from_static(b"4567"), 4)
            .unwrap();
        cache
            .write_slice(&h, 0, Bytes::from_static(b"x"), 12)
            .unwrap();
        assert!(cache.is_range_covered(&h, 0, 0, 8));
        assert!(cache.is_range_covered(&h, 0, 2, 4));
        assert!(!cache.is_range_covered(&h, 0, 0, 13));
        assert!(!cache.is_range_covered(&h, 0, 8, 1));

        let prefix = cache.read_covered_prefix(&h, 0, 0, 64).unwrap();
        assert_eq!(&prefix, b"01234567");
        assert!(cache.read_covered_prefix(&h, 0, 8, 64).is_none());
    }

    #[test]
    fn zero_filled_reads_span_gaps() {
        let cache = SliceCache::default();
        let h = handle();
        cache
            .write_slice(&h, 0, Bytes::from_static(b"abc"), 2)
            .unwrap();
        cache
            .write_slice(&h, 0, Bytes::from_static(b"z"), 8)
            .unwrap();
        assert_eq!(cache.covered_extent(&h, 0, 0, 64), 9);
        assert_eq!(cache.covered_extent(&h, 0, 0, 4), 4);
        assert_eq!(cache.covered_extent(&h, 0, 20, 64), 20);
        let data = cache.read_zero_filled(&h, 0, 0, 9);
        assert_eq!(&data, b"\0\0abc\0\0\0z");
    }

    #[test]
    fn dirty_slices_drain_oldest_first() {
        let cache = SliceCache::default();
        let h = handle();
        let first = cache
            .write_slice(&h, 0, Bytes::from_static(b"one"), 0)
            .unwrap();
        let second = cache
            .write_slice(&h, 1, Bytes::from_static(b"two"), 7)
            .unwrap();

        let dirty = cache.get_dirty_slices(&h);
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty[0].id, first);
        assert_eq!(dirty[1].id, second);
        assert_eq!(dirty[1].chunk_index, 1);
        assert_eq!(dirty[1].offset, 7);

        cache
            .mark_slice_flushed(
                &h,
                &first,
                vec![BlockRef {
                    chunk_index: 0,
                    block_index: 0,
                    size: 3,
                }],
            )
            .unwrap();
        let dirty = cache.get_dirty_slices(&h);
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].id, second);

        let missing = Uuid::new_v4();
        let err = cache.mark_slice_flushed(&h, &missing, Vec::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn eviction_only_touches_flushed_slices() {
        let cache = SliceCache::new(CacheConfig {
            max_bytes: 8,
            max_slices_per_chunk: 16,
        });
        let h = handle();
        let dirty = cache
            .write_slice(&h, 0, Bytes::from_static(b"dirty!"), 0)
            .unwrap();
        // Over budget, but nothing is flushed: stays put.
        cache
            .write_slice(&h, 0, Bytes::from_static(b"dirty2"), 8)
            .unwrap();
        assert_eq!(cache.total_bytes(), 12);

        cache.mark_slice_flushed(&h, &dirty, Vec::new()).unwrap();
        // The next write triggers eviction of the flushed slice.
        cache
            .write_slice(&h, 0, Bytes::from_static(b"three!"), 16)
            .unwrap();
        assert!(cache.total_bytes() <= 12);
        assert!(cache.read_slice(&h, 0, 0, 6).is_none());
        assert_eq!(cache.read_slice(&h, 0, 8, 6).unwrap(), b"dirty2");
    }

    #[test]
    fn invalidate_clears_accounting() {
        let cache = SliceCache::default();
        let h = handle();
        cache
            .write_slice(&h, 0, Bytes::from_static(b"abcdef"), 0)
            .unwrap();
        assert_eq!(cache.total_bytes(), 6);
        cache.invalidate(&h);
        assert_eq!(cache.total_bytes(), 0);
        assert!(cache.read_slice(&h, 0, 0, 1).is_none());
    }

    #[test]
    fn chunk_info_reports_newest_first() {
        let cache = SliceCache::default();
        let h = handle();
        cache
            .write_slice(&h, 2, Bytes::from_static(b"old"), 0)
            .unwrap();
        cache
            .write_slice(&h, 2, Bytes::from_static(b"new"), 1)
            .unwrap();
        let info = cache.chunk_info(&h, 2).unwrap();
        assert_eq!(info.slices.len(), 2);
        assert!(info.slices[0].created_at > info.slices[1].created_at);
        assert_eq!(info.slices[0].offset, 1);
        assert!(!info.needs_compaction(16));
    }

    #[test]
    fn rejects_chunk_crossing_writes() {
        let cache = SliceCache::default();
        let h = handle();
        let err = cache
            .write_slice(&h, 0, Bytes::from_static(b"xy"), CHUNK_SIZE - 1)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }
}
