//! DittoFS core engine.
//!
//! This crate is the metadata and data-path engine that sits between the
//! protocol adapters (NFS, SMB, NLM) and the storage backends. It owns:
//!
//! * the chunk/slice/block data model that turns random POSIX writes into
//!   immutable, content-addressable blocks,
//! * the unified lock manager covering byte-range locks and SMB
//!   oplocks/leases across protocols,
//! * the permission engine (share access, identity squashing, Unix modes,
//!   NFSv4 ACLs),
//! * the POSIX metadata operations, and
//! * the cache ↔ block-store transfer pipeline with its background
//!   flusher.
//!
//! Wire-level protocol codecs, the CLI, share administration and the
//! concrete store backends live outside this crate; they plug in through
//! the [`meta::MetadataStore`], [`blockstore::BlockStore`] and
//! [`locking::LockStore`] contracts.

pub mod access;
pub mod blockstore;
pub mod cache;
pub mod chunks;
pub mod error;
pub mod handle;
pub mod locking;
pub mod meta;
pub mod mfsymlink;
pub mod shares;
pub mod tools;
pub mod transfer;

pub use error::{ErrorCode, LockConflictInfo, StoreError};
pub use handle::FileHandle;
