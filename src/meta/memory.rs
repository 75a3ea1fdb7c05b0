//! In-memory metadata store.
//!
//! Reference backend for tests and single-process development. Handles are
//! UUID-based; transactions copy the tables and swap them back in on
//! success, which gives real atomicity at toy scale.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::thread::ThreadId;

use crate::access::ShareOptions;
use crate::error::{ErrorCode, StoreError};
use crate::handle::FileHandle;

use super::file::{File, FileAttr, FileType};
use super::store::{MetadataRead, MetadataStore, MetadataTxn};

#[derive(Clone, Default)]
struct Tables {
    files: HashMap<FileHandle, File>,
    children: HashMap<FileHandle, BTreeMap<String, FileHandle>>,
    parents: HashMap<FileHandle, FileHandle>,
    nlinks: HashMap<FileHandle, u32>,
}

impl Tables {
    fn get_file(&self, handle: &FileHandle) -> Result<File, StoreError> {
        self.files
            .get(handle)
            .cloned()
            .ok_or_else(|| StoreError::new(ErrorCode::StaleHandle, format!("stale handle {}", handle)))
    }

    fn get_child(&self, dir: &FileHandle, name: &str) -> Result<FileHandle, StoreError> {
        self.children
            .get(dir)
            .and_then(|m| m.get(name))
            .cloned()
            .ok_or_else(|| StoreError::not_found(name))
    }

    fn get_parent(&self, file: &FileHandle) -> Result<FileHandle, StoreError> {
        self.parents
            .get(file)
            .cloned()
            .ok_or_else(|| StoreError::new(ErrorCode::NotFound, "no parent recorded"))
    }

    fn get_link_count(&self, file: &FileHandle) -> Result<u32, StoreError> {
        Ok(self.nlinks.get(file).cloned().unwrap_or(0))
    }

    fn list_children(
        &self,
        dir: &FileHandle,
        token: &str,
        limit: usize,
    ) -> Result<(Vec<(String, FileHandle)>, String), StoreError> {
        let map = match self.children.get(dir) {
            Some(map) => map,
            None => return Ok((Vec::new(), String::new())),
        };
        let mut entries = Vec::new();
        let mut next_token = String::new();
        let mut iter = if token.is_empty() {
            map.range::<String, _>(..)
        } else {
            use std::ops::Bound;
            map.range::<String, _>((Bound::Excluded(token.to_string()), Bound::Unbounded))
        };
        loop {
            match iter.next() {
                Some((name, handle)) => {
                    if entries.len() == limit {
                        next_token = entries
                            .last()
                            .map(|(n, _): &(String, FileHandle)| n.clone())
                            .unwrap_or_default();
                        break;
                    }
                    entries.push((name.clone(), handle.clone()));
                }
                None => break,
            }
        }
        Ok((entries, next_token))
    }
}

pub struct MemoryMetaStore {
    share: String,
    options: Mutex<ShareOptions>,
    tables: Mutex<Tables>,
    txn_owner: Mutex<Option<ThreadId>>,
}

impl MemoryMetaStore {
    pub fn new<S: Into<String>>(share: S) -> Result<Self, StoreError> {
        let store = Self {
            share: share.into(),
            options: Mutex::new(ShareOptions::default()),
            tables: Mutex::new(Tables::default()),
            txn_owner: Mutex::new(None),
        };
        store.init_root()?;
        Ok(store)
    }

    pub fn with_options<S: Into<String>>(
        share: S,
        options: ShareOptions,
    ) -> Result<Self, StoreError> {
        let store = Self::new(share)?;
        *store.options.lock().unwrap() = options;
        Ok(store)
    }

    pub fn set_options(&self, options: ShareOptions) {
        *self.options.lock().unwrap() = options;
    }

    pub fn share_name(&self) -> &str {
        &self.share
    }

    /// Handle of the share root directory.
    pub fn root(&self) -> FileHandle {
        let tables = self.tables.lock().unwrap();
        tables
            .files
            .values()
            .find(|f| f.path == "/")
            .and_then(|f| f.handle().ok())
            .expect("store was initialized with a root directory")
    }

    fn init_root(&self) -> Result<(), StoreError> {
        let handle = FileHandle::generate_new(&self.share)?;
        let (share, id) = handle.decode()?;
        let mut attr = FileAttr::new(FileType::Directory, 0o755);
        attr.nlink = 2;
        let root = File {
            id,
            share_name: share,
            path: "/".to_string(),
            attr,
        };
        let mut tables = self.tables.lock().unwrap();
        tables.nlinks.insert(handle.clone(), 2);
        tables.children.insert(handle.clone(), BTreeMap::new());
        tables.files.insert(handle, root);
        Ok(())
    }

    fn lock_tables(&self) -> MutexGuard<Tables> {
        self.tables.lock().unwrap()
    }
}

impl MetadataRead for MemoryMetaStore {
    fn get_file(&self, handle: &FileHandle) -> Result<File, StoreError> {
        self.lock_tables().get_file(handle)
    }

    fn get_child(&self, dir: &FileHandle, name: &str) -> Result<FileHandle, StoreError> {
        self.lock_tables().get_child(dir, name)
    }

    fn get_parent(&self, file: &FileHandle) -> Result<FileHandle, StoreError> {
        self.lock_tables().get_parent(file)
    }

    fn get_link_count(&self, file: &FileHandle) -> Result<u32, StoreError> {
        self.lock_tables().get_link_count(file)
    }

    fn list_children(
        &self,
        dir: &FileHandle,
        token: &str,
        limit: usize,
    ) -> Result<(Vec<(String, FileHandle)>, String), StoreError> {
        self.lock_tables().list_children(dir, token, limit)
    }
}

struct MemoryTxn {
    tables: Tables,
}

impl MetadataRead for MemoryTxn {
    fn get_file(&self, handle: &FileHandle) -> Result<File, StoreError> {
        self.tables.get_file(handle)
    }

    fn get_child(&self, dir: &FileHandle, name: &str) -> Result<FileHandle, StoreError> {
        self.tables.get_child(dir, name)
    }

    fn get_parent(&self, file: &FileHandle) -> Result<FileHandle, StoreError> {
        self.tables.get_parent(file)
    }

    fn get_link_count(&self, file: &FileHandle) -> Result<u32, StoreError> {
        self.tables.get_link_count(file)
    }

    fn list_children(
        &self,
        dir: &FileHandle,
        token: &str,
        limit: usize,
    ) -> Result<(Vec<(String, FileHandle)>, String), StoreError> {
        self.tables.list_children(dir, token, limit)
    }
}

impl MetadataTxn for MemoryTxn {
    fn put_file(&mut self, file: &File) -> Result<(), StoreError> {
        let handle = file.handle()?;
        self.tables.files.insert(handle.clone(), file.clone());
        if file.attr.is_directory() {
            self.tables.children.entry(handle).or_default();
        }
        Ok(())
    }

    fn delete_file(&mut self, handle: &FileHandle) -> Result<(), StoreError> {
        self.tables.files.remove(handle);
        self.tables.children.remove(handle);
        self.tables.parents.remove(handle);
        self.tables.nlinks.remove(handle);
        Ok(())
    }

    fn set_child(
        &mut self,
        dir: &FileHandle,
        name: &str,
        child: &FileHandle,
    ) -> Result<(), StoreError> {
        self.tables
            .children
            .entry(dir.clone())
            .or_default()
            .insert(name.to_string(), child.clone());
        Ok(())
    }

    fn delete_child(&mut self, dir: &FileHandle, name: &str) -> Result<(), StoreError> {
        if let Some(map) = self.tables.children.get_mut(dir) {
            map.remove(name);
        }
        Ok(())
    }

    fn set_parent(&mut self, file: &FileHandle, parent: &FileHandle) -> Result<(), StoreError> {
        self.tables.parents.insert(file.clone(), parent.clone());
        Ok(())
    }

    fn set_link_count(&mut self, file: &FileHandle, count: u32) -> Result<(), StoreError> {
        self.tables.nlinks.insert(file.clone(), count);
        Ok(())
    }
}

impl MetadataStore for MemoryMetaStore {
    fn get_share_options(&self) -> Result<ShareOptions, StoreError> {
        Ok(self.options.lock().unwrap().clone())
    }

    fn generate_handle(&self, share: &str, _path: &str) -> Result<FileHandle, StoreError> {
        FileHandle::generate_new(share)
    }

    fn with_transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn MetadataTxn) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let current = std::thread::current().id();
        if *self.txn_owner.lock().unwrap() == Some(current) {
            return Err(StoreError::invalid_argument(
                "nested transactions are not supported",
            ));
        }

        let mut tables = self.tables.lock().unwrap();
        *self.txn_owner.lock().unwrap() = Some(current);
        let mut txn = MemoryTxn {
            tables: tables.clone(),
        };
        let result = match body(&mut txn) {
            Ok(()) => {
                *tables = txn.tables;
                Ok(())
            }
            Err(err) => Err(err),
        };
        *self.txn_owner.lock().unwrap() = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn new_file(store: &MemoryMetaStore, path: &str) -> (FileHandle, File) {
        let handle = store.generate_handle(store.share_name(), path).unwrap();
        let (share, id) = handle.decode().unwrap();
        let file = File {
            id,
            share_name: share,
            path: path.to_string(),
            attr: FileAttr::new_regular(0o644),
        };
        (handle, file)
    }

    #[test]
    fn transaction_commits_all_or_nothing() {
        let store = MemoryMetaStore::new("export").unwrap();
        let root = store.root();
        let (handle, file) = new_file(&store, "/a.txt");

        store
            .with_transaction(&mut |txn| {
                txn.put_file(&file)?;
                txn.set_link_count(&handle, 1)?;
                txn.set_parent(&handle, &root)?;
                txn.set_child(&root, "a.txt", &handle)
            })
            .unwrap();
        assert_eq!(store.get_child(&root, "a.txt").unwrap(), handle);

        // A failing body leaves no trace.
        let (h2, f2) = new_file(&store, "/b.txt");
        let err = store
            .with_transaction(&mut |txn| {
                txn.put_file(&f2)?;
                txn.set_child(&root, "b.txt", &h2)?;
                Err(StoreError::io_error("forced abort"))
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::IOError);
        assert!(store.get_child(&root, "b.txt").is_err());
        assert!(store.get_file(&h2).is_err());
    }

    #[test]
    fn nested_transactions_are_rejected() {
        let store = MemoryMetaStore::new("export").unwrap();
        let err = store
            .with_transaction(&mut |_txn| {
                store.with_transaction(&mut |_t| Ok(())).map(|_| ())
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn listing_pages_in_name_order() {
        let store = MemoryMetaStore::new("export").unwrap();
        let root = store.root();
        for name in &["c", "a", "b", "e", "d"] {
            let (handle, mut file) = new_file(&store, &format!("/{}", name));
            file.path = format!("/{}", name);
            store
                .with_transaction(&mut |txn| {
                    txn.put_file(&file)?;
                    txn.set_child(&root, name, &handle)
                })
                .unwrap();
        }

        let (page, token) = store.list_children(&root, "", 2).unwrap();
        assert_eq!(
            page.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(token, "b");

        let (page, token) = store.list_children(&root, &token, 2).unwrap();
        assert_eq!(
            page.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["c", "d"]
        );
        let (page, token) = store.list_children(&root, &token, 2).unwrap();
        assert_eq!(
            page.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["e"]
        );
        assert!(token.is_empty());
    }

    #[test]
    fn stale_handles_are_reported() {
        let store = MemoryMetaStore::new("export").unwrap();
        let bogus = FileHandle::encode("export", &Uuid::new_v4()).unwrap();
        assert_eq!(store.get_file(&bogus).unwrap_err().code, ErrorCode::StaleHandle);
    }
}
