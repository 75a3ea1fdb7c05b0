//! Transfer manager: the data path between the slice cache and the block
//! store.
//!
//! Every completed write kicks off eager uploads of the fully-covered
//! blocks it touched, bounded by a per-file semaphore. Flushing drains the
//! remaining dirty slices; reads that miss the cache fetch blocks in
//! parallel and re-seed it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use crate::blockstore::{BlockStore, BoxFut};
use crate::cache::SliceCache;
use crate::chunks::{
    block_key, parse_block_key, BlockRef, CHUNK_SIZE, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE,
    MIN_BLOCK_SIZE,
};
use crate::error::{ErrorCode, StoreError};
use crate::handle::FileHandle;

use super::flusher::{FlushRequest, FlushTarget, Flusher, FlusherConfig};

#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// Fixed per-file block size; bounds checked at construction.
    pub block_size: u32,
    pub parallel_uploads: usize,
    pub parallel_downloads: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            parallel_uploads: 4,
            parallel_downloads: 4,
        }
    }
}

struct FileTransferState {
    semaphore: Arc<Semaphore>,
    /// Blocks uploaded or currently uploading, keyed `(chunk, block)`.
    uploaded: Mutex<HashSet<(u64, u32)>>,
    errors: Mutex<Vec<String>>,
    inflight: AtomicUsize,
    drained: Notify,
}

impl FileTransferState {
    fn new(parallel_uploads: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(parallel_uploads)),
            uploaded: Mutex::new(HashSet::new()),
            errors: Mutex::new(Vec::new()),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    // The notify can fire between the counter check and the await, so the
    // wait is re-armed on a short timeout rather than trusting a single
    // wakeup.
    async fn wait_for_uploads(&self) {
        while self.inflight.load(Ordering::SeqCst) != 0 {
            let _ = tokio::time::timeout(Duration::from_millis(50), self.drained.notified()).await;
        }
    }
}

pub(crate) struct TransferInner {
    config: TransferConfig,
    cache: Arc<SliceCache>,
    store: Arc<dyn BlockStore>,
    files: Mutex<HashMap<FileHandle, Arc<FileTransferState>>>,
    flusher: Mutex<Option<Arc<Flusher>>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<TransferInner>,
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager").finish()
    }
}

/// Copies the requested subrange out of consecutively indexed blocks.
/// The result is truncated to the bytes actually present.
pub fn assemble_blocks(
    blocks: &[Bytes],
    start_idx: u64,
    offset: u64,
    length: usize,
    block_size: u64,
) -> Vec<u8> {
    let mut result = vec![0u8; length];
    let mut written = 0usize;
    let end = offset + length as u64;
    for (i, block) in blocks.iter().enumerate() {
        let block_start = (start_idx + i as u64) * block_size;
        let block_end = block_start + block.len() as u64;
        let copy_start = offset.max(block_start);
        let copy_end = end.min(block_end);
        if copy_start >= copy_end {
            continue;
        }
        let src = &block[(copy_start - block_start) as usize..(copy_end - block_start) as usize];
        let dst = (copy_start - offset) as usize;
        result[dst..dst + src.len()].copy_from_slice(src);
        written = written.max(dst + src.len());
    }
    result.truncate(written);
    result
}

impl TransferManager {
    pub fn new(
        config: TransferConfig,
        cache: Arc<SliceCache>,
        store: Arc<dyn BlockStore>,
    ) -> Result<Self, StoreError> {
        if config.block_size < MIN_BLOCK_SIZE || config.block_size > MAX_BLOCK_SIZE {
            return Err(StoreError::invalid_argument(format!(
                "block size {} outside [{}, {}]",
                config.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if config.parallel_uploads == 0 || config.parallel_downloads == 0 {
            return Err(StoreError::invalid_argument(
                "transfer parallelism must be at least 1",
            ));
        }
        Ok(Self {
            inner: Arc::new(TransferInner {
                config,
                cache,
                store,
                files: Mutex::new(HashMap::new()),
                flusher: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Starts the background flusher queue. Idempotent.
    pub fn start(&self, config: FlusherConfig) {
        let mut guard = self.inner.flusher.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let weak: Weak<dyn FlushTarget> = {
            let target: Arc<dyn FlushTarget> = self.inner.clone();
            Arc::downgrade(&target)
        };
        *guard = Some(Flusher::start(config, weak));
    }

    /// Refuses new work and stops the flusher within its configured grace
    /// (30 seconds by default).
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let flusher = self.inner.flusher.lock().unwrap().take();
        if let Some(flusher) = flusher {
            flusher.stop(flusher.stop_grace()).await;
        }
    }

    pub fn cache(&self) -> &Arc<SliceCache> {
        &self.inner.cache
    }

    pub fn upload_errors(&self, handle: &FileHandle) -> Vec<String> {
        self.inner
            .files
            .lock()
            .unwrap()
            .get(handle)
            .map(|state| state.errors.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Writes into the cache and eagerly uploads every block the write
    /// completed.
    pub async fn write_slice(
        &self,
        share: &str,
        handle: &FileHandle,
        payload_id: &str,
        chunk_index: u64,
        data: Bytes,
        offset: u64,
    ) -> Result<Uuid, StoreError> {
        self.inner.ensure_open()?;
        let len = data.len() as u64;
        let id = self
            .inner
            .cache
            .write_slice(handle, chunk_index, data, offset)?;
        debug!(
            "cached slice {} for {}:{} chunk {} [{}, len {}]",
            id, share, payload_id, chunk_index, offset, len
        );
        self.inner
            .clone()
            .spawn_block_uploads(handle, payload_id, chunk_index, offset, len);
        Ok(id)
    }

    /// Uploads every remaining dirty slice as block objects and marks the
    /// slices flushed. Safe to call repeatedly and concurrently with
    /// enqueued background flushes.
    pub async fn flush_remaining_sync(
        &self,
        share: &str,
        handle: &FileHandle,
        payload_id: &str,
    ) -> Result<(), StoreError> {
        self.inner.ensure_open()?;
        self.inner.flush_sync(share, handle, payload_id).await
    }

    /// Hands the flush to the background queue; falls back to a
    /// synchronous flush when the queue is full or not running.
    pub async fn flush_remaining_async(
        &self,
        share: &str,
        handle: &FileHandle,
        payload_id: &str,
    ) -> Result<(), StoreError> {
        self.inner.ensure_open()?;
        let flusher = self.inner.flusher.lock().unwrap().clone();
        if let Some(flusher) = flusher {
            let enqueued = flusher.enqueue(FlushRequest {
                share: share.to_string(),
                handle: handle.clone(),
                payload_id: payload_id.to_string(),
            });
            if enqueued {
                return Ok(());
            }
            warn!(
                "flusher queue full, flushing {} synchronously",
                payload_id
            );
        }
        self.inner.flush_sync(share, handle, payload_id).await
    }

    /// Serves a read from the cache when the range is fully covered,
    /// falling back to the parallel block fetch otherwise.
    pub async fn read(
        &self,
        share: &str,
        handle: &FileHandle,
        payload_id: &str,
        chunk_index: u64,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, StoreError> {
        self.inner.ensure_open()?;
        if let Some(data) = self
            .inner
            .cache
            .read_slice(handle, chunk_index, offset, length)
        {
            return Ok(data);
        }
        self.read_blocks(share, handle, payload_id, chunk_index, offset, length)
            .await
    }

    /// Cache-miss read: fetches the covering blocks in parallel, re-seeds
    /// the cache and assembles the requested range.
    pub async fn read_blocks(
        &self,
        _share: &str,
        handle: &FileHandle,
        payload_id: &str,
        chunk_index: u64,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, StoreError> {
        self.inner.ensure_open()?;
        if length == 0 {
            return Ok(Vec::new());
        }
        let block_size = self.inner.config.block_size as u64;
        let start_idx = offset / block_size;
        let end_idx = (offset + length as u64 - 1) / block_size;

        let fetches = (start_idx..=end_idx).map(|idx| {
            let store = self.inner.store.clone();
            let key = block_key(payload_id, chunk_index, idx as u32);
            async move {
                match store.read_block(&key).await {
                    Ok(data) => Ok((idx, Some(data))),
                    Err(err) if err.code == ErrorCode::NotFound => Ok((idx, None)),
                    Err(err) => Err(err),
                }
            }
        });
        let results: Vec<Result<(u64, Option<Bytes>), StoreError>> = stream::iter(fetches)
            .buffer_unordered(self.inner.config.parallel_downloads)
            .collect()
            .await;

        let mut by_index: HashMap<u64, Bytes> = HashMap::new();
        for result in results {
            let (idx, data) = result?;
            if let Some(data) = data {
                by_index.insert(idx, data);
            }
        }

        let mut blocks: Vec<Bytes> = Vec::new();
        for idx in start_idx..=end_idx {
            match by_index.remove(&idx) {
                Some(data) => {
                    let cached = self.inner.cache.write_slice_flushed(
                        handle,
                        chunk_index,
                        data.clone(),
                        idx * block_size,
                        vec![BlockRef {
                            chunk_index,
                            block_index: idx as u32,
                            size: data.len() as u32,
                        }],
                    );
                    if let Err(err) = cached {
                        debug!("re-seeding cache for {} failed: {}", payload_id, err);
                    }
                    blocks.push(data);
                }
                None => break,
            }
        }

        Ok(assemble_blocks(&blocks, start_idx, offset, length, block_size))
    }

    /// Probes the stored size from the block listing: all chunks before
    /// the last are full, all blocks before the last are full, and the
    /// last block's actual length closes the sum.
    pub async fn get_file_size(&self, payload_id: &str) -> Result<u64, StoreError> {
        self.inner.ensure_open()?;
        let prefix = format!("{}/", payload_id);
        let keys = self.inner.store.list_by_prefix(&prefix).await?;
        let mut last: Option<(u64, u32)> = None;
        for key in keys {
            if let Some((_, chunk, block)) = parse_block_key(&key) {
                if last.map(|(c, b)| (chunk, block) > (c, b)).unwrap_or(true) {
                    last = Some((chunk, block));
                }
            }
        }
        let (chunk, block) = match last {
            Some(last) => last,
            None => return Ok(0),
        };
        let data = self
            .inner
            .store
            .read_block(&block_key(payload_id, chunk, block))
            .await?;
        let block_size = self.inner.config.block_size as u64;
        Ok(CHUNK_SIZE * chunk + block_size * block as u64 + data.len() as u64)
    }

    pub async fn exists(&self, payload_id: &str) -> Result<bool, StoreError> {
        self.inner.ensure_open()?;
        let prefix = format!("{}/", payload_id);
        Ok(!self.inner.store.list_by_prefix(&prefix).await?.is_empty())
    }

    /// Drops every block beyond the one containing the new end of file.
    pub async fn truncate(&self, payload_id: &str, new_size: u64) -> Result<(), StoreError> {
        self.inner.ensure_open()?;
        let prefix = format!("{}/", payload_id);
        if new_size == 0 {
            return self.inner.store.delete_by_prefix(&prefix).await;
        }
        let last_byte = new_size - 1;
        let keep_chunk = last_byte / CHUNK_SIZE;
        let keep_block = ((last_byte % CHUNK_SIZE) / self.inner.config.block_size as u64) as u32;

        let keys = self.inner.store.list_by_prefix(&prefix).await?;
        for key in keys {
            if let Some((_, chunk, block)) = parse_block_key(&key) {
                if (chunk, block) > (keep_chunk, keep_block) {
                    self.inner.store.delete_block(&key).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn delete(&self, payload_id: &str) -> Result<(), StoreError> {
        self.inner.ensure_open()?;
        let prefix = format!("{}/", payload_id);
        self.inner.store.delete_by_prefix(&prefix).await
    }

    /// Bytes held by the backing store, across all payloads.
    pub async fn store_total_size(&self) -> Result<u64, StoreError> {
        self.inner.ensure_open()?;
        self.inner.store.total_size().await
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.inner.store.health_check().await
    }
}

impl TransferInner {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::io_error("transfer manager closed"))
        } else {
            Ok(())
        }
    }

    fn file_state(&self, handle: &FileHandle) -> Arc<FileTransferState> {
        self.files
            .lock()
            .unwrap()
            .entry(handle.clone())
            .or_insert_with(|| Arc::new(FileTransferState::new(self.config.parallel_uploads)))
            .clone()
    }

    /// Starts async uploads for every block in the written range that is
    /// complete in the cache. Partial trailing blocks wait for flush.
    fn spawn_block_uploads(
        self: Arc<Self>,
        handle: &FileHandle,
        payload_id: &str,
        chunk_index: u64,
        offset: u64,
        len: u64,
    ) {
        if len == 0 {
            return;
        }
        let block_size = self.config.block_size as u64;
        let first = offset / block_size;
        let last = (offset + len - 1) / block_size;
        let state = self.file_state(handle);

        for block in first..=last {
            let block_start = block * block_size;
            if block_start + block_size > CHUNK_SIZE {
                continue;
            }
            if !self
                .cache
                .is_range_covered(handle, chunk_index, block_start, block_size)
            {
                continue;
            }
            {
                let mut uploaded = state.uploaded.lock().unwrap();
                if !uploaded.insert((chunk_index, block as u32)) {
                    continue;
                }
            }
            let data = match self
                .cache
                .read_slice(handle, chunk_index, block_start, block_size as usize)
            {
                Some(data) => Bytes::from(data),
                None => {
                    state
                        .uploaded
                        .lock()
                        .unwrap()
                        .remove(&(chunk_index, block as u32));
                    continue;
                }
            };

            let key = block_key(payload_id, chunk_index, block as u32);
            let inner = self.clone();
            let state = state.clone();
            state.inflight.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let result = match state.semaphore.clone().acquire_owned().await {
                    Ok(_permit) => inner.store.write_block(&key, data).await,
                    Err(_) => Err(StoreError::io_error("upload semaphore closed")),
                };
                if let Err(err) = result {
                    warn!("eager upload of {} failed: {}", key, err);
                    state
                        .uploaded
                        .lock()
                        .unwrap()
                        .remove(&(chunk_index, block as u32));
                    state.errors.lock().unwrap().push(err.to_string());
                }
                if state.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    state.drained.notify_waiters();
                }
            });
        }
    }

    async fn flush_sync(
        &self,
        _share: &str,
        handle: &FileHandle,
        payload_id: &str,
    ) -> Result<(), StoreError> {
        let state = self.file_state(handle);
        state.wait_for_uploads().await;

        let dirty = self.cache.get_dirty_slices(handle);
        if dirty.is_empty() {
            return Ok(());
        }

        let block_size = self.config.block_size as u64;

        // One job per touched block; a block's payload runs from its start
        // to the end of cached coverage, zero-filling untracked gaps.
        let mut sizes: HashMap<(u64, u32), u32> = HashMap::new();
        let mut jobs: Vec<(u64, u32, Bytes)> = Vec::new();
        for slice in &dirty {
            let first = slice.offset / block_size;
            let last = (slice.offset + slice.length - 1) / block_size;
            for block in first..=last {
                let id = (slice.chunk_index, block as u32);
                if sizes.contains_key(&id) {
                    continue;
                }
                let block_start = block * block_size;
                let window = block_size.min(CHUNK_SIZE - block_start);
                let extent = self
                    .cache
                    .covered_extent(handle, slice.chunk_index, block_start, window);
                if extent == block_start {
                    continue;
                }
                let data = self.cache.read_zero_filled(
                    handle,
                    slice.chunk_index,
                    block_start,
                    (extent - block_start) as usize,
                );
                sizes.insert(id, data.len() as u32);
                jobs.push((slice.chunk_index, block as u32, Bytes::from(data)));
            }
        }

        // Blocks already covered by completed eager uploads are skipped.
        let already: HashSet<(u64, u32)> = state.uploaded.lock().unwrap().clone();
        let todo: Vec<(u64, u32, Bytes)> = jobs
            .into_iter()
            .filter(|(chunk, block, _)| !already.contains(&(*chunk, *block)))
            .collect();

        let uploads = todo.into_iter().map(|(chunk, block, data)| {
            let store = self.store.clone();
            let key = block_key(payload_id, chunk, block);
            async move {
                store.write_block(&key, data).await?;
                Ok::<(u64, u32), StoreError>((chunk, block))
            }
        });
        let results: Vec<Result<(u64, u32), StoreError>> = stream::iter(uploads)
            .buffer_unordered(self.config.parallel_uploads)
            .collect()
            .await;

        let mut first_error = None;
        {
            let mut uploaded = state.uploaded.lock().unwrap();
            for result in results {
                match result {
                    Ok(id) => {
                        uploaded.insert(id);
                    }
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
        }
        if let Some(err) = first_error {
            state.errors.lock().unwrap().push(err.to_string());
            return Err(err);
        }

        for slice in dirty {
            let first = slice.offset / block_size;
            let last = (slice.offset + slice.length - 1) / block_size;
            let refs: Vec<BlockRef> = (first..=last)
                .filter_map(|block| {
                    sizes
                        .get(&(slice.chunk_index, block as u32))
                        .map(|size| BlockRef {
                            chunk_index: slice.chunk_index,
                            block_index: block as u32,
                            size: *size,
                        })
                })
                .collect();
            if let Err(err) = self.cache.mark_slice_flushed(handle, &slice.id, refs) {
                // The slice may have been flushed and evicted concurrently.
                debug!("mark_slice_flushed for {}: {}", slice.id, err);
            }
        }

        Ok(())
    }
}

impl FlushTarget for TransferInner {
    fn flush<'a>(&'a self, req: &'a FlushRequest) -> BoxFut<'a, ()> {
        Box::pin(async move { self.flush_sync(&req.share, &req.handle, &req.payload_id).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemoryBlockStore;
    use crate::cache::CacheConfig;

    fn setup() -> (TransferManager, Arc<SliceCache>, Arc<MemoryBlockStore>) {
        let cache = Arc::new(SliceCache::new(CacheConfig::default()));
        let store = Arc::new(MemoryBlockStore::new());
        let manager = TransferManager::new(
            TransferConfig::default(),
            cache.clone(),
            store.clone() as Arc<dyn BlockStore>,
        )
        .unwrap();
        (manager, cache, store)
    }

    fn handle() -> FileHandle {
        FileHandle::generate_new("share1").unwrap()
    }

    #[test]
    fn block_size_bounds_are_enforced() {
        let cache = Arc::new(SliceCache::default());
        let store = Arc::new(MemoryBlockStore::new()) as Arc<dyn BlockStore>;
        for bad in &[MIN_BLOCK_SIZE - 1, MAX_BLOCK_SIZE + 1, 0] {
            let err = TransferManager::new(
                TransferConfig {
                    block_size: *bad,
                    ..Default::default()
                },
                cache.clone(),
                store.clone(),
            )
            .unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn write_flush_stores_single_short_block() {
        let (manager, _cache, store) = setup();
        let h = handle();
        manager
            .write_slice(
                "share1",
                &h,
                "share1/content123",
                0,
                Bytes::from_static(b"hello world"),
                0,
            )
            .await
            .unwrap();
        // Partial trailing block: nothing uploaded eagerly.
        manager
            .flush_remaining_sync("share1", &h, "share1/content123")
            .await
            .unwrap();

        let keys = store.list_by_prefix("share1/content123/").await.unwrap();
        assert_eq!(keys, vec!["share1/content123/chunk-0/block-0".to_string()]);
        let data = store
            .read_block("share1/content123/chunk-0/block-0")
            .await
            .unwrap();
        assert_eq!(data.len(), 11);
        assert_eq!(&data[..], b"hello world");

        // Idempotent: a second flush has nothing to do.
        manager
            .flush_remaining_sync("share1", &h, "share1/content123")
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn eager_upload_fires_for_complete_blocks() {
        let (manager, _cache, store) = setup();
        let h = handle();
        let block = vec![7u8; DEFAULT_BLOCK_SIZE as usize];
        manager
            .write_slice("s", &h, "s/f", 0, Bytes::from(block), 0)
            .await
            .unwrap();
        // Wait out the async upload via flush (which awaits in-flight work).
        manager.flush_remaining_sync("s", &h, "s/f").await.unwrap();
        let keys = store.list_by_prefix("s/f/").await.unwrap();
        assert_eq!(keys, vec!["s/f/chunk-0/block-0".to_string()]);
        assert_eq!(
            store.read_block("s/f/chunk-0/block-0").await.unwrap().len(),
            DEFAULT_BLOCK_SIZE as usize
        );
        assert!(manager.upload_errors(&h).is_empty());
    }

    #[tokio::test]
    async fn read_blocks_assembles_subrange_and_reseeds_cache() {
        let (manager, cache, store) = setup();
        let h = handle();
        let bs = DEFAULT_BLOCK_SIZE as usize;
        let mut block0 = vec![0u8; bs];
        block0[bs - 1] = b'x';
        store
            .write_block("s/f/chunk-0/block-0", Bytes::from(block0))
            .await
            .unwrap();
        store
            .write_block("s/f/chunk-0/block-1", Bytes::from_static(b"yz"))
            .await
            .unwrap();

        let data = manager
            .read_blocks("s", &h, "s/f", 0, bs as u64 - 1, 3)
            .await
            .unwrap();
        assert_eq!(&data, b"xyz");

        // Fetched blocks are cached and immediately readable.
        assert!(cache.is_range_covered(&h, 0, 0, bs as u64));
        let cached = cache.read_slice(&h, 0, bs as u64, 2).unwrap();
        assert_eq!(&cached, b"yz");
    }

    #[tokio::test]
    async fn read_prefers_the_cache() {
        let (manager, _cache, store) = setup();
        let h = handle();
        manager
            .write_slice("s", &h, "s/f", 0, Bytes::from_static(b"cached bytes"), 0)
            .await
            .unwrap();
        // Nothing flushed yet, so the store cannot serve this.
        assert!(store.is_empty() || store.len() == 0);
        let data = manager.read("s", &h, "s/f", 0, 7, 5).await.unwrap();
        assert_eq!(&data, b"bytes");

        // An uncached range falls through to the store.
        store
            .write_block("s/g/chunk-0/block-0", Bytes::from_static(b"stored"))
            .await
            .unwrap();
        let g = handle();
        let data = manager.read("s", &g, "s/g", 0, 0, 6).await.unwrap();
        assert_eq!(&data, b"stored");

        manager.health_check().await.unwrap();
        assert!(manager.store_total_size().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn read_past_last_block_truncates() {
        let (manager, _cache, store) = setup();
        let h = handle();
        store
            .write_block("s/f/chunk-0/block-0", Bytes::from_static(b"abcde"))
            .await
            .unwrap();
        let data = manager.read_blocks("s", &h, "s/f", 0, 3, 100).await.unwrap();
        assert_eq!(&data, b"de");
    }

    #[tokio::test]
    async fn size_probe_uses_last_block() {
        let (manager, _cache, store) = setup();
        let bs = DEFAULT_BLOCK_SIZE as u64;
        store
            .write_block(
                "s/f/chunk-0/block-0",
                Bytes::from(vec![0u8; bs as usize]),
            )
            .await
            .unwrap();
        store
            .write_block("s/f/chunk-0/block-1", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(manager.get_file_size("s/f").await.unwrap(), bs + 3);
        assert_eq!(manager.get_file_size("s/missing").await.unwrap(), 0);
        assert!(manager.exists("s/f").await.unwrap());
        assert!(!manager.exists("s/missing").await.unwrap());
    }

    #[tokio::test]
    async fn truncate_drops_trailing_blocks() {
        let (manager, _cache, store) = setup();
        let bs = DEFAULT_BLOCK_SIZE as u64;
        for block in 0..3u32 {
            store
                .write_block(
                    &block_key("s/f", 0, block),
                    Bytes::from(vec![1u8; bs as usize]),
                )
                .await
                .unwrap();
        }
        manager.truncate("s/f", bs + 1).await.unwrap();
        let keys = store.list_by_prefix("s/f/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "s/f/chunk-0/block-0".to_string(),
                "s/f/chunk-0/block-1".to_string(),
            ]
        );

        manager.truncate("s/f", 0).await.unwrap();
        assert!(store.list_by_prefix("s/f/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_rejects_new_work() {
        let (manager, _cache, _store) = setup();
        manager.close().await;
        let err = manager
            .write_slice(
                "s",
                &handle(),
                "s/f",
                0,
                Bytes::from_static(b"late"),
                0,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::IOError);
    }

    #[tokio::test]
    async fn background_flush_via_queue() {
        let (manager, _cache, store) = setup();
        manager.start(FlusherConfig::default());
        let h = handle();
        manager
            .write_slice("s", &h, "s/bg", 0, Bytes::from_static(b"queued"), 0)
            .await
            .unwrap();
        manager
            .flush_remaining_async("s", &h, "s/bg")
            .await
            .unwrap();
        // close() drains the queue before returning.
        manager.close().await;
        let data = store.read_block("s/bg/chunk-0/block-0").await.unwrap();
        assert_eq!(&data[..], b"queued");
    }

    #[test]
    fn assembly_truncates_to_written_bytes() {
        let bs = 4u64;
        let blocks = vec![Bytes::from_static(b"0123"), Bytes::from_static(b"45")];
        assert_eq!(assemble_blocks(&blocks, 0, 0, 6, bs), b"012345");
        assert_eq!(assemble_blocks(&blocks, 0, 2, 3, bs), b"234");
        // Requests running past the stored data come back short.
        assert_eq!(assemble_blocks(&blocks, 0, 4, 10, bs), b"45");
        assert_eq!(assemble_blocks(&blocks, 0, 7, 4, bs), b"");
        // Blocks indexed from a non-zero start.
        let tail = vec![Bytes::from_static(b"abcd")];
        assert_eq!(assemble_blocks(&tail, 2, 9, 2, bs), b"bc");
    }
}
