//! Object store contract for immutable blocks.
//!
//! Keys follow the `{payloadId}/chunk-{c}/block-{b}` grammar and the
//! backend must support lexicographic prefix listing. Real deployments
//! plug in S3 or filesystem clients; the in-memory implementation here
//! backs tests and development.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use bytes::Bytes;

use crate::error::StoreError;

pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

pub trait BlockStore: Send + Sync {
    /// Stores a block. Blocks are immutable; writing the same key twice
    /// must produce the same content.
    fn write_block<'a>(&'a self, key: &'a str, data: Bytes) -> BoxFut<'a, ()>;

    fn read_block<'a>(&'a self, key: &'a str) -> BoxFut<'a, Bytes>;

    fn delete_block<'a>(&'a self, key: &'a str) -> BoxFut<'a, ()>;

    /// Keys starting with `prefix`, in lexicographic order.
    fn list_by_prefix<'a>(&'a self, prefix: &'a str) -> BoxFut<'a, Vec<String>>;

    fn delete_by_prefix<'a>(&'a self, prefix: &'a str) -> BoxFut<'a, ()>;

    fn total_size<'a>(&'a self) -> BoxFut<'a, u64>;

    fn health_check<'a>(&'a self) -> BoxFut<'a, ()>;
}

/// Process-local block store.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemoryBlockStore {
    fn write_block<'a>(&'a self, key: &'a str, data: Bytes) -> BoxFut<'a, ()> {
        Box::pin(async move {
            self.blocks.write().unwrap().insert(key.to_string(), data);
            Ok(())
        })
    }

    fn read_block<'a>(&'a self, key: &'a str) -> BoxFut<'a, Bytes> {
        Box::pin(async move {
            self.blocks
                .read()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::not_found(key))
        })
    }

    fn delete_block<'a>(&'a self, key: &'a str) -> BoxFut<'a, ()> {
        Box::pin(async move {
            self.blocks.write().unwrap().remove(key);
            Ok(())
        })
    }

    fn list_by_prefix<'a>(&'a self, prefix: &'a str) -> BoxFut<'a, Vec<String>> {
        Box::pin(async move {
            let blocks = self.blocks.read().unwrap();
            Ok(blocks
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect())
        })
    }

    fn delete_by_prefix<'a>(&'a self, prefix: &'a str) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let mut blocks = self.blocks.write().unwrap();
            let doomed: Vec<String> = blocks
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                blocks.remove(&key);
            }
            Ok(())
        })
    }

    fn total_size<'a>(&'a self) -> BoxFut<'a, u64> {
        Box::pin(async move {
            let blocks = self.blocks.read().unwrap();
            Ok(blocks.values().map(|b| b.len() as u64).sum())
        })
    }

    fn health_check<'a>(&'a self) -> BoxFut<'a, ()> {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_listing_is_lexicographic() {
        let store = MemoryBlockStore::new();
        for key in &[
            "a/chunk-0/block-0",
            "a/chunk-0/block-1",
            "a/chunk-1/block-0",
            "b/chunk-0/block-0",
        ] {
            store
                .write_block(key, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let keys = store.list_by_prefix("a/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "a/chunk-0/block-0".to_string(),
                "a/chunk-0/block-1".to_string(),
                "a/chunk-1/block-0".to_string(),
            ]
        );

        store.delete_by_prefix("a/chunk-0/").await.unwrap();
        let keys = store.list_by_prefix("a/").await.unwrap();
        assert_eq!(keys, vec!["a/chunk-1/block-0".to_string()]);
        assert_eq!(store.total_size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn read_missing_block_is_not_found() {
        let store = MemoryBlockStore::new();
        let err = store.read_block("nope").await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::NotFound);
        store.health_check().await.unwrap();
    }
}
