//! Lock persistence.
//!
//! Backends that can survive restarts implement `LockStore`; the manager
//! mirrors every lock and lease into it together with the server epoch.
//! After a restart the epoch is bumped and records from older epochs are
//! only good for reclaim during the grace period.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::handle::FileHandle;

use super::lock::{
    Lease, LeaseState, LockOwner, LockType, ShareReservation, UnifiedLock,
};

/// Serializable projection of a unified lock. `lease_key` present iff the
/// record is a lease.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedLock {
    pub id: Uuid,
    pub share_name: String,
    pub file_id: String,
    pub owner_id: String,
    pub client_id: String,
    /// 0 = shared, 1 = exclusive.
    pub lock_type: u8,
    pub offset: u64,
    pub length: u64,
    /// 0..=3, see [`ShareReservation`].
    pub share_reservation: u8,
    pub acquired_at: i64,
    pub server_epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_key: Option<[u8; 16]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_state: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_epoch: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_to_state: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaking: Option<bool>,
}

impl PersistedLock {
    pub fn is_lease(&self) -> bool {
        self.lease_key.is_some()
    }

    pub fn from_lock(lock: &UnifiedLock, server_epoch: u64) -> Self {
        Self {
            id: lock.id,
            share_name: lock.owner.share_name.clone(),
            file_id: lock.file.to_string(),
            owner_id: lock.owner.owner_id.clone(),
            client_id: lock.owner.client_id.clone(),
            lock_type: match lock.lock_type {
                LockType::Shared => 0,
                LockType::Exclusive => 1,
            },
            offset: lock.offset,
            length: lock.length,
            share_reservation: lock.share_reservation.as_u8(),
            acquired_at: lock.acquired_at,
            server_epoch,
            lease_key: lock.lease.as_ref().map(|l| l.key),
            lease_state: lock.lease.as_ref().map(|l| l.state.bits()),
            lease_epoch: lock.lease.as_ref().map(|l| l.epoch),
            break_to_state: lock
                .lease
                .as_ref()
                .and_then(|l| l.break_to.map(|s| s.bits())),
            breaking: lock.lease.as_ref().map(|l| l.breaking),
        }
    }

    pub fn into_lock(self) -> UnifiedLock {
        let lease = self.lease_key.map(|key| Lease {
            key,
            state: LeaseState::from_bits_truncate(self.lease_state.unwrap_or(0)),
            epoch: self.lease_epoch.unwrap_or(0),
            break_to: self.break_to_state.map(LeaseState::from_bits_truncate),
            breaking: self.breaking.unwrap_or(false),
        });
        UnifiedLock {
            id: self.id,
            file: FileHandle::from_bytes(self.file_id.into_bytes()),
            owner: LockOwner::new(self.owner_id, self.client_id, self.share_name),
            lock_type: if self.lock_type == 1 {
                LockType::Exclusive
            } else {
                LockType::Shared
            },
            offset: self.offset,
            length: self.length,
            share_reservation: ShareReservation::from_u8(self.share_reservation),
            lease,
            acquired_at: self.acquired_at,
        }
    }
}

/// Durable lock storage contract, implemented by backends that support
/// restart recovery.
pub trait LockStore: Send + Sync {
    fn save_lock(&self, lock: &PersistedLock) -> Result<(), StoreError>;
    fn delete_lock(&self, id: &Uuid) -> Result<(), StoreError>;
    fn load_locks(&self) -> Result<Vec<PersistedLock>, StoreError>;
    fn delete_locks_by_client(&self, client_id: &str) -> Result<(), StoreError>;
    fn delete_locks_by_file(&self, file_id: &str) -> Result<(), StoreError>;
    fn server_epoch(&self) -> Result<u64, StoreError>;
    fn set_server_epoch(&self, epoch: u64) -> Result<(), StoreError>;
}

/// In-memory lock store. Records round-trip through their JSON encoding
/// so the schema stays honest.
#[derive(Default)]
pub struct MemoryLockStore {
    records: std::sync::Mutex<std::collections::HashMap<Uuid, String>>,
    epoch: std::sync::atomic::AtomicU64,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for MemoryLockStore {
    fn save_lock(&self, lock: &PersistedLock) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(lock)
            .map_err(|err| StoreError::io_error(format!("encode lock: {}", err)))?;
        self.records.lock().unwrap().insert(lock.id, encoded);
        Ok(())
    }

    fn delete_lock(&self, id: &Uuid) -> Result<(), StoreError> {
        self.records.lock().unwrap().remove(id);
        Ok(())
    }

    fn load_locks(&self) -> Result<Vec<PersistedLock>, StoreError> {
        let records = self.records.lock().unwrap();
        let mut locks = Vec::with_capacity(records.len());
        for encoded in records.values() {
            let lock: PersistedLock = serde_json::from_str(encoded)
                .map_err(|err| StoreError::io_error(format!("decode lock: {}", err)))?;
            locks.push(lock);
        }
        Ok(locks)
    }

    fn delete_locks_by_client(&self, client_id: &str) -> Result<(), StoreError> {
        let locks = self.load_locks()?;
        let mut records = self.records.lock().unwrap();
        for lock in locks {
            if lock.client_id == client_id {
                records.remove(&lock.id);
            }
        }
        Ok(())
    }

    fn delete_locks_by_file(&self, file_id: &str) -> Result<(), StoreError> {
        let locks = self.load_locks()?;
        let mut records = self.records.lock().unwrap();
        for lock in locks {
            if lock.file_id == file_id {
                records.remove(&lock.id);
            }
        }
        Ok(())
    }

    fn server_epoch(&self) -> Result<u64, StoreError> {
        Ok(self.epoch.load(std::sync::atomic::Ordering::SeqCst))
    }

    fn set_server_epoch(&self, epoch: u64) -> Result<(), StoreError> {
        self.epoch.store(epoch, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
