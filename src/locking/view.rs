//! Cross-protocol lock queries.
//!
//! NFS handlers use this to see SMB leases and vice versa; everything is
//! a read-only projection over the per-share lock manager.

use std::sync::Arc;

use crate::handle::FileHandle;

use super::lock::{LeaseState, LockOwner, LockType, UnifiedLock};
use super::manager::LockManager;

/// Locks on one file, partitioned by kind.
#[derive(Clone, Debug, Default)]
pub struct LockPartition {
    pub byte_range_locks: Vec<UnifiedLock>,
    pub leases: Vec<UnifiedLock>,
}

#[derive(Clone)]
pub struct UnifiedLockView {
    manager: Arc<LockManager>,
}

impl UnifiedLockView {
    pub fn new(manager: Arc<LockManager>) -> Self {
        Self { manager }
    }

    pub fn get_all_locks_on_file(&self, file: &FileHandle) -> LockPartition {
        let mut partition = LockPartition::default();
        for lock in self.manager.get_unified_locks(file) {
            if lock.is_lease() {
                partition.leases.push(lock);
            } else {
                partition.byte_range_locks.push(lock);
            }
        }
        partition
    }

    /// Would a whole-file lock of `lock_type` conflict with anything held?
    /// The probe carries an empty owner id, so it never matches a holder.
    pub fn has_conflicting_locks(&self, file: &FileHandle, lock_type: LockType) -> bool {
        let probe = UnifiedLock::byte_range(
            file.clone(),
            LockOwner::new("", "", self.manager.share_name()),
            lock_type,
            0,
            0,
        );
        self.manager.test_unified_lock(&probe).is_some()
    }

    pub fn get_lease_by_key(&self, file: &FileHandle, key: &[u8; 16]) -> Option<UnifiedLock> {
        self.manager
            .get_unified_locks(file)
            .into_iter()
            .find(|l| l.lease.as_ref().map(|lease| &lease.key == key).unwrap_or(false))
    }

    pub fn get_write_leases(&self, file: &FileHandle) -> Vec<UnifiedLock> {
        self.leases_with(file, LeaseState::WRITE)
    }

    pub fn get_handle_leases(&self, file: &FileHandle) -> Vec<UnifiedLock> {
        self.leases_with(file, LeaseState::HANDLE)
    }

    fn leases_with(&self, file: &FileHandle, state: LeaseState) -> Vec<UnifiedLock> {
        self.manager
            .get_unified_locks(file)
            .into_iter()
            .filter(|l| {
                l.lease
                    .as_ref()
                    .map(|lease| lease.state.contains(state))
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::{Lease, LockLimits, LockTimeouts};

    fn setup() -> (Arc<LockManager>, UnifiedLockView, FileHandle) {
        let manager = Arc::new(LockManager::new(
            "share1",
            LockTimeouts::default(),
            LockLimits::default(),
        ));
        let view = UnifiedLockView::new(manager.clone());
        let file = FileHandle::generate_new("share1").unwrap();
        (manager, view, file)
    }

    #[test]
    fn partitions_byte_ranges_and_leases() {
        let (manager, view, file) = setup();
        manager
            .add_unified_lock(
                UnifiedLock::byte_range(
                    file.clone(),
                    LockOwner::new("nlm:a:1", "client-a", "share1"),
                    LockType::Shared,
                    0,
                    100,
                ),
                false,
            )
            .unwrap();
        manager
            .add_unified_lock(
                UnifiedLock::lease(
                    file.clone(),
                    LockOwner::new("smb:b:1", "client-b", "share1"),
                    Lease::new([1u8; 16], LeaseState::READ | LeaseState::HANDLE),
                ),
                false,
            )
            .unwrap();

        let partition = view.get_all_locks_on_file(&file);
        assert_eq!(partition.byte_range_locks.len(), 1);
        assert_eq!(partition.leases.len(), 1);

        assert!(view.get_lease_by_key(&file, &[1u8; 16]).is_some());
        assert!(view.get_lease_by_key(&file, &[2u8; 16]).is_none());
        assert_eq!(view.get_handle_leases(&file).len(), 1);
        assert!(view.get_write_leases(&file).is_empty());
    }

    #[test]
    fn conflict_probe_sees_other_protocols() {
        let (manager, view, file) = setup();
        assert!(!view.has_conflicting_locks(&file, LockType::Shared));

        manager
            .add_unified_lock(
                UnifiedLock::byte_range(
                    file.clone(),
                    LockOwner::new("nlm:a:1", "client-a", "share1"),
                    LockType::Exclusive,
                    10,
                    10,
                ),
                false,
            )
            .unwrap();
        // An exclusive byte-range lock conflicts with both probe types.
        assert!(view.has_conflicting_locks(&file, LockType::Shared));
        assert!(view.has_conflicting_locks(&file, LockType::Exclusive));
    }

    #[test]
    fn shared_locks_allow_shared_probe() {
        let (manager, view, file) = setup();
        manager
            .add_unified_lock(
                UnifiedLock::byte_range(
                    file.clone(),
                    LockOwner::new("nlm:a:1", "client-a", "share1"),
                    LockType::Shared,
                    0,
                    0,
                ),
                false,
            )
            .unwrap();
        assert!(!view.has_conflicting_locks(&file, LockType::Shared));
        assert!(view.has_conflicting_locks(&file, LockType::Exclusive));
    }
}
