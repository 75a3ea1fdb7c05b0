//! Lock types and conflict predicates.
//!
//! Byte ranges use `length == 0` to mean "to end of file". A unified lock
//! is a lease iff it carries lease state; leases are always whole-file.

use bitflags::bitflags;
use uuid::Uuid;

use crate::handle::FileHandle;
use crate::tools::epoch_now;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
}

/// SMB share reservation attached to an open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShareReservation {
    None,
    DenyRead,
    DenyWrite,
    DenyAll,
}

impl ShareReservation {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ShareReservation::DenyRead,
            2 => ShareReservation::DenyWrite,
            3 => ShareReservation::DenyAll,
            _ => ShareReservation::None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ShareReservation::None => 0,
            ShareReservation::DenyRead => 1,
            ShareReservation::DenyWrite => 2,
            ShareReservation::DenyAll => 3,
        }
    }

    fn denies(self, requested: LockType) -> bool {
        match self {
            ShareReservation::None => false,
            ShareReservation::DenyRead => requested == LockType::Shared,
            ShareReservation::DenyWrite => requested == LockType::Exclusive,
            ShareReservation::DenyAll => true,
        }
    }
}

bitflags! {
    /// SMB2 lease caching state.
    pub struct LeaseState: u8 {
        const READ   = 0x01;
        const HANDLE = 0x02;
        const WRITE  = 0x04;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub key: [u8; 16],
    pub state: LeaseState,
    pub epoch: u16,
    pub break_to: Option<LeaseState>,
    pub breaking: bool,
}

impl Lease {
    pub fn new(key: [u8; 16], state: LeaseState) -> Self {
        Self {
            key,
            state,
            epoch: 0,
            break_to: None,
            breaking: false,
        }
    }
}

/// Protocol-independent lock owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockOwner {
    /// Opaque, e.g. `nlm:{host}:{pid}` or `smb:{session}:{open}`.
    /// Different protocols never collide, so string equality doubles as
    /// cross-protocol conflict detection.
    pub owner_id: String,
    pub client_id: String,
    pub share_name: String,
}

impl LockOwner {
    pub fn new<A: Into<String>, B: Into<String>, C: Into<String>>(
        owner_id: A,
        client_id: B,
        share_name: C,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            client_id: client_id.into(),
            share_name: share_name.into(),
        }
    }
}

/// Legacy byte-range lock keyed by protocol session.
#[derive(Clone, Debug)]
pub struct FileLock {
    pub id: Uuid,
    pub session_id: String,
    pub offset: u64,
    /// 0 = to end of file.
    pub length: u64,
    pub exclusive: bool,
    pub acquired_at: i64,
    pub client_addr: Option<String>,
}

impl FileLock {
    pub fn new(session_id: &str, offset: u64, length: u64, exclusive: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            offset,
            length,
            exclusive,
            acquired_at: epoch_now(),
            client_addr: None,
        }
    }
}

/// Cross-protocol lock record: a byte-range lock, or a whole-file lease
/// when `lease` is set.
#[derive(Clone, Debug)]
pub struct UnifiedLock {
    pub id: Uuid,
    pub file: FileHandle,
    pub owner: LockOwner,
    pub lock_type: LockType,
    pub offset: u64,
    /// 0 = to end of file.
    pub length: u64,
    pub share_reservation: ShareReservation,
    pub lease: Option<Lease>,
    pub acquired_at: i64,
}

impl UnifiedLock {
    pub fn byte_range(
        file: FileHandle,
        owner: LockOwner,
        lock_type: LockType,
        offset: u64,
        length: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            file,
            owner,
            lock_type,
            offset,
            length,
            share_reservation: ShareReservation::None,
            lease: None,
            acquired_at: epoch_now(),
        }
    }

    pub fn lease(file: FileHandle, owner: LockOwner, lease: Lease) -> Self {
        Self {
            id: Uuid::new_v4(),
            file,
            owner,
            lock_type: if lease.state.contains(LeaseState::WRITE) {
                LockType::Exclusive
            } else {
                LockType::Shared
            },
            offset: 0,
            length: 0,
            share_reservation: ShareReservation::None,
            lease: Some(lease),
            acquired_at: epoch_now(),
        }
    }

    pub fn is_lease(&self) -> bool {
        self.lease.is_some()
    }

    /// True when this lock's range fully contains `[offset, length)`.
    pub fn covers(&self, offset: u64, length: u64) -> bool {
        if self.offset > offset {
            return false;
        }
        match (self.length, length) {
            (0, _) => true,
            (_, 0) => false,
            (have, want) => self.offset + have >= offset + want,
        }
    }

    pub fn conflicts_with(&self, other: &UnifiedLock) -> bool {
        if self.owner.owner_id == other.owner.owner_id {
            return false;
        }
        if self.share_reservation.denies(other.lock_type)
            || other.share_reservation.denies(self.lock_type)
        {
            return true;
        }
        match (&self.lease, &other.lease) {
            // Two caching grants only collide when one of them may buffer
            // writes.
            (Some(a), Some(b)) => {
                a.state.contains(LeaseState::WRITE) || b.state.contains(LeaseState::WRITE)
            }
            (Some(lease), None) => lease_conflicts_with_range(lease, other.lock_type),
            (None, Some(lease)) => lease_conflicts_with_range(lease, self.lock_type),
            (None, None) => {
                if self.lock_type == LockType::Shared && other.lock_type == LockType::Shared {
                    false
                } else {
                    ranges_overlap(self.offset, self.length, other.offset, other.length)
                }
            }
        }
    }
}

fn lease_conflicts_with_range(lease: &Lease, requested: LockType) -> bool {
    lease.state.contains(LeaseState::WRITE)
        || (lease.state.contains(LeaseState::READ) && requested == LockType::Exclusive)
}

/// Overlap with `length == 0` meaning unbounded: two unbounded ranges
/// always overlap, and a bounded range touches an unbounded one iff they
/// share a byte.
pub fn ranges_overlap(offset1: u64, length1: u64, offset2: u64, length2: u64) -> bool {
    match (length1, length2) {
        (0, 0) => true,
        (0, len2) => offset2 + len2 > offset1,
        (len1, 0) => offset1 + len1 > offset2,
        (len1, len2) => offset1 < offset2 + len2 && offset2 < offset1 + len1,
    }
}

/// Byte-range conflict between two legacy locks.
pub fn is_lock_conflicting(existing: &FileLock, requested: &FileLock) -> bool {
    if existing.session_id == requested.session_id {
        return false;
    }
    if !ranges_overlap(
        existing.offset,
        existing.length,
        requested.offset,
        requested.length,
    ) {
        return false;
    }
    existing.exclusive || requested.exclusive
}

/// SMB2 I/O-versus-lock semantics. Same-session reads never block; a
/// same-session write needs the holder to own an exclusive lock (a shared
/// lock is read-only for everyone, holder included). Cross-session writes
/// are blocked by any overlapping lock, reads only by exclusive ones.
pub fn check_io_conflict(
    existing: &FileLock,
    session_id: &str,
    offset: u64,
    length: u64,
    is_write: bool,
) -> bool {
    if !ranges_overlap(existing.offset, existing.length, offset, length) {
        return false;
    }
    if existing.session_id == session_id {
        is_write && !existing.exclusive
    } else if is_write {
        true
    } else {
        existing.exclusive
    }
}

/// POSIX unlock splitting: removing `[offset, length)` from a held lock
/// leaves zero, one or two residual locks.
pub fn split_lock(lock: &FileLock, offset: u64, length: u64) -> Vec<FileLock> {
    if !ranges_overlap(lock.offset, lock.length, offset, length) {
        return vec![lock.clone()];
    }
    let mut residuals = Vec::new();
    if lock.offset < offset {
        let mut left = lock.clone();
        left.id = Uuid::new_v4();
        left.length = offset - lock.offset;
        residuals.push(left);
    }
    if length != 0 {
        let unlock_end = offset + length;
        let keep_right = match lock.length {
            0 => true,
            len => lock.offset + len > unlock_end,
        };
        if keep_right {
            let mut right = lock.clone();
            right.id = Uuid::new_v4();
            right.offset = unlock_end;
            right.length = match lock.length {
                0 => 0,
                len => lock.offset + len - unlock_end,
            };
            residuals.push(right);
        }
    }
    residuals
}

/// Splitting for unified byte-range locks; leases are never split.
pub fn split_unified_lock(lock: &UnifiedLock, offset: u64, length: u64) -> Vec<UnifiedLock> {
    if lock.is_lease() || !ranges_overlap(lock.offset, lock.length, offset, length) {
        return vec![lock.clone()];
    }
    let mut residuals = Vec::new();
    if lock.offset < offset {
        let mut left = lock.clone();
        left.id = Uuid::new_v4();
        left.length = offset - lock.offset;
        residuals.push(left);
    }
    if length != 0 {
        let unlock_end = offset + length;
        let keep_right = match lock.length {
            0 => true,
            len => lock.offset + len > unlock_end,
        };
        if keep_right {
            let mut right = lock.clone();
            right.id = Uuid::new_v4();
            right.offset = unlock_end;
            right.length = match lock.length {
                0 => 0,
                len => lock.offset + len - unlock_end,
            };
            residuals.push(right);
        }
    }
    residuals
}

/// Coalesces adjacent or overlapping byte-range locks per
/// `(owner, type)`. Unbounded ranges absorb everything at or after their
/// offset. Leases pass through untouched.
pub fn merge_locks(locks: Vec<UnifiedLock>) -> Vec<UnifiedLock> {
    use std::collections::HashMap;

    let mut result = Vec::new();
    let mut groups: HashMap<(String, u8), Vec<UnifiedLock>> = HashMap::new();
    for lock in locks {
        if lock.is_lease() {
            result.push(lock);
            continue;
        }
        let type_tag = match lock.lock_type {
            LockType::Shared => 0,
            LockType::Exclusive => 1,
        };
        groups
            .entry((lock.owner.owner_id.clone(), type_tag))
            .or_default()
            .push(lock);
    }

    for (_, mut group) in groups {
        group.sort_by_key(|l| l.offset);
        let mut iter = group.into_iter();
        let mut current = match iter.next() {
            Some(first) => first,
            None => continue,
        };
        for next in iter {
            let absorbed = if current.length == 0 {
                next.offset >= current.offset
            } else {
                next.offset <= current.offset + current.length
            };
            if absorbed {
                if current.length != 0 {
                    if next.length == 0 {
                        current.length = 0;
                    } else {
                        let end = (current.offset + current.length).max(next.offset + next.length);
                        current.length = end - current.offset;
                    }
                }
            } else {
                result.push(current);
                current = next;
            }
        }
        result.push(current);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> FileHandle {
        FileHandle::generate_new("s").unwrap()
    }

    fn owner(id: &str) -> LockOwner {
        LockOwner::new(id, "client-1", "s")
    }

    #[test]
    fn range_overlap_is_symmetric_and_reflexive() {
        let ranges = [(0u64, 10u64), (5, 10), (20, 0), (0, 0), (15, 5), (10, 10)];
        for &(o1, l1) in &ranges {
            if l1 >= 1 || l1 == 0 {
                assert!(ranges_overlap(o1, l1, o1, l1), "({}, {})", o1, l1);
            }
            for &(o2, l2) in &ranges {
                assert_eq!(
                    ranges_overlap(o1, l1, o2, l2),
                    ranges_overlap(o2, l2, o1, l1)
                );
            }
        }
        assert!(!ranges_overlap(0, 10, 10, 5));
        assert!(ranges_overlap(0, 11, 10, 5));
        assert!(ranges_overlap(0, 0, 1000, 1));
        assert!(!ranges_overlap(5, 0, 0, 5));
        assert!(ranges_overlap(5, 0, 0, 6));
    }

    #[test]
    fn legacy_conflicts() {
        let held = FileLock::new("sess-a", 0, 100, true);
        assert!(is_lock_conflicting(&held, &FileLock::new("sess-b", 50, 10, false)));
        assert!(!is_lock_conflicting(&held, &FileLock::new("sess-a", 50, 10, true)));
        assert!(!is_lock_conflicting(&held, &FileLock::new("sess-b", 100, 10, true)));
        let shared = FileLock::new("sess-a", 0, 100, false);
        assert!(!is_lock_conflicting(&shared, &FileLock::new("sess-b", 0, 100, false)));
        assert!(is_lock_conflicting(&shared, &FileLock::new("sess-b", 0, 100, true)));
    }

    #[test]
    fn io_conflict_smb_semantics() {
        let shared = FileLock::new("sess-a", 0, 100, false);
        // Same session: reads pass, writes are blocked by own shared lock.
        assert!(!check_io_conflict(&shared, "sess-a", 0, 10, false));
        assert!(check_io_conflict(&shared, "sess-a", 0, 10, true));
        let exclusive = FileLock::new("sess-a", 0, 100, true);
        assert!(!check_io_conflict(&exclusive, "sess-a", 0, 10, true));
        // Cross session: writes blocked by anything, reads by exclusive.
        assert!(check_io_conflict(&shared, "sess-b", 0, 10, true));
        assert!(!check_io_conflict(&shared, "sess-b", 0, 10, false));
        assert!(check_io_conflict(&exclusive, "sess-b", 0, 10, false));
        // Disjoint ranges never conflict.
        assert!(!check_io_conflict(&exclusive, "sess-b", 200, 10, true));
    }

    #[test]
    fn split_produces_zero_one_or_two_residuals() {
        let lock = FileLock::new("s", 10, 20, true);

        let gone = split_lock(&lock, 10, 20);
        assert!(gone.is_empty());
        let gone = split_lock(&lock, 0, 100);
        assert!(gone.is_empty());

        let left = split_lock(&lock, 20, 10);
        assert_eq!(left.len(), 1);
        assert_eq!((left[0].offset, left[0].length), (10, 10));

        let right = split_lock(&lock, 10, 10);
        assert_eq!(right.len(), 1);
        assert_eq!((right[0].offset, right[0].length), (20, 10));

        let both = split_lock(&lock, 15, 5);
        assert_eq!(both.len(), 2);
        assert_eq!((both[0].offset, both[0].length), (10, 5));
        assert_eq!((both[1].offset, both[1].length), (20, 10));

        // Residual bytes equal the original range minus the unlocked one.
        let covered: u64 = both.iter().map(|l| l.length).sum();
        assert_eq!(covered, 20 - 5);

        // Unbounded locks keep an unbounded right residual.
        let eof = FileLock::new("s", 0, 0, true);
        let parts = split_lock(&eof, 10, 5);
        assert_eq!(parts.len(), 2);
        assert_eq!((parts[0].offset, parts[0].length), (0, 10));
        assert_eq!((parts[1].offset, parts[1].length), (15, 0));

        // Unbounded unlock swallows the tail.
        let parts = split_lock(&lock, 15, 0);
        assert_eq!(parts.len(), 1);
        assert_eq!((parts[0].offset, parts[0].length), (10, 5));
    }

    #[test]
    fn unified_conflicts_cross_owner() {
        let f = file();
        let exclusive =
            UnifiedLock::byte_range(f.clone(), owner("nlm:a:1"), LockType::Exclusive, 0, 100);
        let shared =
            UnifiedLock::byte_range(f.clone(), owner("smb:b:1"), LockType::Shared, 50, 10);
        assert!(exclusive.conflicts_with(&shared));
        assert!(shared.conflicts_with(&exclusive));

        let same_owner =
            UnifiedLock::byte_range(f.clone(), owner("nlm:a:1"), LockType::Exclusive, 0, 100);
        assert!(!exclusive.conflicts_with(&same_owner));

        let both_shared =
            UnifiedLock::byte_range(f.clone(), owner("smb:c:1"), LockType::Shared, 0, 0);
        assert!(!shared.conflicts_with(&both_shared));
    }

    #[test]
    fn lease_conflict_matrix() {
        let f = file();
        let read_lease = UnifiedLock::lease(
            f.clone(),
            owner("smb:a:1"),
            Lease::new([1; 16], LeaseState::READ | LeaseState::HANDLE),
        );
        let write_lease = UnifiedLock::lease(
            f.clone(),
            owner("smb:b:1"),
            Lease::new([2; 16], LeaseState::READ | LeaseState::WRITE),
        );
        let other_read = UnifiedLock::lease(
            f.clone(),
            owner("smb:c:1"),
            Lease::new([3; 16], LeaseState::READ),
        );

        assert!(read_lease.conflicts_with(&write_lease));
        assert!(!read_lease.conflicts_with(&other_read));

        let shared_range =
            UnifiedLock::byte_range(f.clone(), owner("nlm:x:1"), LockType::Shared, 0, 10);
        let exclusive_range =
            UnifiedLock::byte_range(f.clone(), owner("nlm:y:1"), LockType::Exclusive, 0, 10);
        assert!(write_lease.conflicts_with(&shared_range));
        assert!(!read_lease.conflicts_with(&shared_range));
        assert!(read_lease.conflicts_with(&exclusive_range));
    }

    #[test]
    fn share_reservations_deny_by_type() {
        let f = file();
        let mut deny_all =
            UnifiedLock::byte_range(f.clone(), owner("smb:a:1"), LockType::Shared, 0, 0);
        deny_all.share_reservation = ShareReservation::DenyAll;
        let reader = UnifiedLock::byte_range(f.clone(), owner("smb:b:1"), LockType::Shared, 0, 10);
        let writer =
            UnifiedLock::byte_range(f.clone(), owner("smb:c:1"), LockType::Exclusive, 0, 10);
        assert!(deny_all.conflicts_with(&reader));
        assert!(deny_all.conflicts_with(&writer));

        let mut deny_write =
            UnifiedLock::byte_range(f.clone(), owner("smb:a:1"), LockType::Shared, 0, 0);
        deny_write.share_reservation = ShareReservation::DenyWrite;
        assert!(!deny_write.conflicts_with(&reader));
        assert!(deny_write.conflicts_with(&writer));
    }

    #[test]
    fn merge_coalesces_per_owner_and_type() {
        let f = file();
        let mk = |owner_id: &str, ty, offset, length| {
            UnifiedLock::byte_range(f.clone(), owner(owner_id), ty, offset, length)
        };
        let merged = merge_locks(vec![
            mk("a", LockType::Shared, 0, 10),
            mk("a", LockType::Shared, 10, 10),
            mk("a", LockType::Shared, 25, 5),
            mk("a", LockType::Exclusive, 5, 10),
            mk("b", LockType::Shared, 0, 10),
        ]);
        let mut shared_a: Vec<(u64, u64)> = merged
            .iter()
            .filter(|l| l.owner.owner_id == "a" && l.lock_type == LockType::Shared)
            .map(|l| (l.offset, l.length))
            .collect();
        shared_a.sort_unstable();
        assert_eq!(shared_a, vec![(0, 20), (25, 5)]);
        assert_eq!(
            merged
                .iter()
                .filter(|l| l.owner.owner_id == "a" && l.lock_type == LockType::Exclusive)
                .count(),
            1
        );
        assert_eq!(merged.iter().filter(|l| l.owner.owner_id == "b").count(), 1);

        // An unbounded range swallows later bounded ones.
        let merged = merge_locks(vec![
            mk("a", LockType::Shared, 5, 0),
            mk("a", LockType::Shared, 100, 50),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!((merged[0].offset, merged[0].length), (5, 0));
    }

    #[test]
    fn covers_handles_unbounded_ranges() {
        let f = file();
        let bounded = UnifiedLock::byte_range(f.clone(), owner("a"), LockType::Shared, 10, 20);
        assert!(bounded.covers(10, 20));
        assert!(bounded.covers(15, 5));
        assert!(!bounded.covers(5, 10));
        assert!(!bounded.covers(25, 10));
        assert!(!bounded.covers(10, 0));
        let unbounded = UnifiedLock::byte_range(f, owner("a"), LockType::Shared, 10, 0);
        assert!(unbounded.covers(10, 0));
        assert!(unbounded.covers(1000, 50));
        assert!(!unbounded.covers(5, 10));
    }
}
