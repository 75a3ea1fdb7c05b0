//! Metadata store contract.
//!
//! One store instance serves one share. Implementations must provide
//! transactional atomicity across the mutation set used by a single
//! operation; snapshot isolation is not required. Nested transactions are
//! rejected.

use crate::access::ShareOptions;
use crate::error::StoreError;
use crate::handle::FileHandle;

use super::file::File;

/// Read-side store operations, shared by the store and its transactions.
pub trait MetadataRead {
    fn get_file(&self, handle: &FileHandle) -> Result<File, StoreError>;
    fn get_child(&self, dir: &FileHandle, name: &str) -> Result<FileHandle, StoreError>;
    fn get_parent(&self, file: &FileHandle) -> Result<FileHandle, StoreError>;
    fn get_link_count(&self, file: &FileHandle) -> Result<u32, StoreError>;

    /// Pages through a directory. `token` is the last name of the previous
    /// page (empty for the first). Returns the page plus the next token,
    /// empty when exhausted.
    fn list_children(
        &self,
        dir: &FileHandle,
        token: &str,
        limit: usize,
    ) -> Result<(Vec<(String, FileHandle)>, String), StoreError>;
}

/// Mutations available inside a transaction.
pub trait MetadataTxn: MetadataRead {
    fn put_file(&mut self, file: &File) -> Result<(), StoreError>;
    fn delete_file(&mut self, handle: &FileHandle) -> Result<(), StoreError>;
    fn set_child(
        &mut self,
        dir: &FileHandle,
        name: &str,
        child: &FileHandle,
    ) -> Result<(), StoreError>;
    fn delete_child(&mut self, dir: &FileHandle, name: &str) -> Result<(), StoreError>;
    fn set_parent(&mut self, file: &FileHandle, parent: &FileHandle) -> Result<(), StoreError>;
    fn set_link_count(&mut self, file: &FileHandle, count: u32) -> Result<(), StoreError>;
}

pub trait MetadataStore: MetadataRead + Send + Sync {
    fn get_share_options(&self) -> Result<ShareOptions, StoreError>;

    /// Mints a fresh handle for a new entry at `path`.
    fn generate_handle(&self, share: &str, path: &str) -> Result<FileHandle, StoreError>;

    /// Runs `body` atomically. The body's first error aborts and is
    /// returned; implementations must reject nested invocations.
    fn with_transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn MetadataTxn) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
}
