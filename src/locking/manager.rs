//! Per-share lock manager.
//!
//! One manager instance per registered share. A single reader-writer lock
//! guards both lock tables and the break-callback list; blocking waiters
//! park on per-`(file, owner)` condvars and are woken through the wait-for
//! graph on release. Persistence, when configured, is write-through.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, LockConflictInfo, StoreError};
use crate::handle::FileHandle;
use crate::tools::epoch_now;

use super::grace::{GracePeriod, DEFAULT_GRACE_PERIOD};
use super::limits::{LockCounters, LockLimits};
use super::lock::{
    check_io_conflict, is_lock_conflicting, ranges_overlap, split_unified_lock, FileLock,
    LeaseState, LockType, UnifiedLock,
};
use super::persist::{LockStore, PersistedLock};

#[derive(Clone, Copy, Debug)]
pub struct LockTimeouts {
    pub blocking_wait: Duration,
    pub lease_break: Duration,
    pub scanner_interval: Duration,
    pub grace_period: Duration,
}

impl Default for LockTimeouts {
    fn default() -> Self {
        Self {
            blocking_wait: Duration::from_secs(60),
            lease_break: Duration::from_secs(35),
            scanner_interval: Duration::from_secs(1),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// What kind of I/O is about to break caching grants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakReason {
    Write,
    Read,
    Delete,
}

/// One listener per protocol adapter; dispatched in registration order.
pub trait BreakCallback: Send + Sync {
    fn on_break(&self, file: &FileHandle, lock: &UnifiedLock, break_to: LeaseState);
}

struct LockState {
    legacy: HashMap<FileHandle, Vec<FileLock>>,
    unified: HashMap<FileHandle, Vec<UnifiedLock>>,
    callbacks: Vec<Arc<dyn BreakCallback>>,
    graph: super::waitgraph::WaitForGraph,
    counters: LockCounters,
}

struct Park {
    woken: Mutex<bool>,
    cv: Condvar,
}

pub struct LockManager {
    share_name: String,
    timeouts: LockTimeouts,
    limits: LockLimits,
    state: RwLock<LockState>,
    grace: GracePeriod,
    persistence: Option<Arc<dyn LockStore>>,
    server_epoch: AtomicU64,
    parks: Mutex<HashMap<(FileHandle, String), Arc<Park>>>,
}

fn conflict_error_from_legacy(existing: &FileLock) -> StoreError {
    let mut err = StoreError::new(
        ErrorCode::Locked,
        format!(
            "range [{}, len {}] is locked by session {}",
            existing.offset, existing.length, existing.session_id
        ),
    );
    err.conflict = Some(LockConflictInfo {
        offset: existing.offset,
        length: existing.length,
        exclusive: existing.exclusive,
        owner_session_id: existing.session_id.clone(),
    });
    err
}

fn conflict_error_from_unified(existing: &UnifiedLock) -> StoreError {
    StoreError::lock_conflict(LockConflictInfo {
        offset: existing.offset,
        length: existing.length,
        exclusive: existing.lock_type == LockType::Exclusive,
        owner_session_id: existing.owner.owner_id.clone(),
    })
}

impl LockManager {
    pub fn new(share_name: &str, timeouts: LockTimeouts, limits: LockLimits) -> Self {
        Self {
            share_name: share_name.to_string(),
            timeouts,
            limits,
            state: RwLock::new(LockState {
                legacy: HashMap::new(),
                unified: HashMap::new(),
                callbacks: Vec::new(),
                graph: super::waitgraph::WaitForGraph::new(),
                counters: LockCounters::new(),
            }),
            grace: GracePeriod::new(),
            persistence: None,
            server_epoch: AtomicU64::new(0),
            parks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_persistence(mut self, store: Arc<dyn LockStore>) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn share_name(&self) -> &str {
        &self.share_name
    }

    pub fn timeouts(&self) -> &LockTimeouts {
        &self.timeouts
    }

    pub fn server_epoch(&self) -> u64 {
        self.server_epoch.load(Ordering::SeqCst)
    }

    pub fn register_break_callback(&self, callback: Arc<dyn BreakCallback>) {
        self.state.write().unwrap().callbacks.push(callback);
    }

    // ---- grace period ----------------------------------------------------

    pub fn grace(&self) -> &GracePeriod {
        &self.grace
    }

    pub fn enter_grace_period(&self, expected_clients: &[String]) {
        self.grace.enter(expected_clients, self.timeouts.grace_period);
    }

    pub fn mark_reclaimed(&self, client_id: &str) {
        self.grace.mark_reclaimed(client_id);
    }

    /// Stops timers without firing callbacks; the manager is unusable for
    /// new grace periods afterwards only in the sense that none is active.
    pub fn close(&self) {
        self.grace.close();
    }

    // ---- legacy byte-range locks ----------------------------------------

    pub fn lock(
        &self,
        file: &FileHandle,
        request: FileLock,
        reclaim: bool,
    ) -> Result<FileLock, StoreError> {
        self.grace.check_request(reclaim, false)?;
        let mut state = self.state.write().unwrap();

        if let Some(locks) = state.legacy.get_mut(file) {
            // A same-session re-lock of the exact range flips the type in
            // place, which is what atomic up/downgrades rely on.
            if let Some(existing) = locks.iter_mut().find(|l| {
                l.session_id == request.session_id
                    && l.offset == request.offset
                    && l.length == request.length
            }) {
                existing.exclusive = request.exclusive;
                return Ok(existing.clone());
            }
            if let Some(conflicting) = locks.iter().find(|l| is_lock_conflicting(l, &request)) {
                return Err(conflict_error_from_legacy(conflicting));
            }
        }

        state
            .counters
            .check(&self.limits, file, &request.session_id)?;
        let session = request.session_id.clone();
        state
            .legacy
            .entry(file.clone())
            .or_default()
            .push(request.clone());
        state.counters.increment(file, &session, 1);
        Ok(request)
    }

    /// Exact-match unlock.
    pub fn unlock(
        &self,
        file: &FileHandle,
        session_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap();
        let locks = match state.legacy.get_mut(file) {
            Some(locks) => locks,
            None => {
                return Err(StoreError::new(
                    ErrorCode::LockNotFound,
                    "no locks held on file",
                ))
            }
        };
        let position = locks.iter().position(|l| {
            l.session_id == session_id && l.offset == offset && l.length == length
        });
        match position {
            Some(index) => {
                locks.remove(index);
                if locks.is_empty() {
                    state.legacy.remove(file);
                }
                state.counters.decrement(file, session_id, 1);
                drop(state);
                self.wake_waiters(file, session_id);
                Ok(())
            }
            None => Err(StoreError::new(
                ErrorCode::LockNotFound,
                format!("no lock at [{}, len {}] for {}", offset, length, session_id),
            )),
        }
    }

    /// NLM TEST: first lock that would conflict with the probe.
    pub fn test_lock(&self, file: &FileHandle, probe: &FileLock) -> Option<FileLock> {
        let state = self.state.read().unwrap();
        state
            .legacy
            .get(file)?
            .iter()
            .find(|l| is_lock_conflicting(l, probe))
            .cloned()
    }

    pub fn get_locks(&self, file: &FileHandle) -> Vec<FileLock> {
        self.state
            .read()
            .unwrap()
            .legacy
            .get(file)
            .cloned()
            .unwrap_or_default()
    }

    /// First lock that blocks the given I/O, if any.
    pub fn check_io(
        &self,
        file: &FileHandle,
        session_id: &str,
        offset: u64,
        length: u64,
        is_write: bool,
    ) -> Option<FileLock> {
        let state = self.state.read().unwrap();
        state
            .legacy
            .get(file)?
            .iter()
            .find(|l| check_io_conflict(l, session_id, offset, length, is_write))
            .cloned()
    }

    /// Blocking acquisition with deadlock avoidance. Parks the caller
    /// until the conflicting owners release, the timeout expires, or the
    /// wait-for graph reports a cycle.
    pub fn lock_wait(
        &self,
        file: &FileHandle,
        request: FileLock,
        reclaim: bool,
        timeout: Option<Duration>,
    ) -> Result<FileLock, StoreError> {
        let deadline = Instant::now() + timeout.unwrap_or(self.timeouts.blocking_wait);
        let waiter = request.session_id.clone();
        loop {
            let blocked_on = match self.lock(file, request.clone(), reclaim) {
                Ok(lock) => {
                    self.state.write().unwrap().graph.remove_waiter(&waiter);
                    return Ok(lock);
                }
                Err(err) if err.code == ErrorCode::Locked => {
                    let state = self.state.read().unwrap();
                    let owners: Vec<String> = state
                        .legacy
                        .get(file)
                        .map(|locks| {
                            locks
                                .iter()
                                .filter(|l| is_lock_conflicting(l, &request))
                                .map(|l| l.session_id.clone())
                                .collect()
                        })
                        .unwrap_or_default();
                    if owners.is_empty() {
                        continue;
                    }
                    owners
                }
                Err(err) => {
                    self.state.write().unwrap().graph.remove_waiter(&waiter);
                    return Err(err);
                }
            };

            {
                let mut state = self.state.write().unwrap();
                if state.graph.would_cause_cycle(&waiter, &blocked_on) {
                    state.graph.remove_waiter(&waiter);
                    return Err(StoreError::new(
                        ErrorCode::Deadlock,
                        "blocking on this lock would deadlock",
                    ));
                }
                state.graph.add_waiter(&waiter, &blocked_on);
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(left) if left > Duration::from_millis(0) => left,
                _ => {
                    self.state.write().unwrap().graph.remove_waiter(&waiter);
                    return Err(StoreError::new(
                        ErrorCode::Locked,
                        "timed out waiting for a conflicting lock",
                    ));
                }
            };
            self.park(file, &waiter, remaining);
            self.state.write().unwrap().graph.remove_waiter(&waiter);
        }
    }

    fn park(&self, file: &FileHandle, owner: &str, timeout: Duration) {
        let park = {
            let mut parks = self.parks.lock().unwrap();
            parks
                .entry((file.clone(), owner.to_string()))
                .or_insert_with(|| {
                    Arc::new(Park {
                        woken: Mutex::new(false),
                        cv: Condvar::new(),
                    })
                })
                .clone()
        };
        {
            let mut woken = park.woken.lock().unwrap();
            *woken = false;
            let deadline = Instant::now() + timeout;
            while !*woken {
                let left = match deadline.checked_duration_since(Instant::now()) {
                    Some(left) => left,
                    None => break,
                };
                let (guard, result) = park.cv.wait_timeout(woken, left).unwrap();
                woken = guard;
                if result.timed_out() {
                    break;
                }
            }
        }
        self.parks
            .lock()
            .unwrap()
            .remove(&(file.clone(), owner.to_string()));
    }

    /// Wakes every parked waiter reachable from the released owner.
    fn wake_waiters(&self, file: &FileHandle, owner: &str) {
        let waiting = self.state.read().unwrap().graph.waiters_for(owner);
        if waiting.is_empty() {
            return;
        }
        let parks = self.parks.lock().unwrap();
        for waiter in waiting {
            if let Some(park) = parks.get(&(file.clone(), waiter)) {
                *park.woken.lock().unwrap() = true;
                park.cv.notify_all();
            }
        }
    }

    /// Session teardown: drops every legacy lock of the session.
    pub fn release_session(&self, session_id: &str) {
        let mut touched = Vec::new();
        {
            let mut state = self.state.write().unwrap();
            let files: Vec<FileHandle> = state.legacy.keys().cloned().collect();
            for file in files {
                if let Some(locks) = state.legacy.get_mut(&file) {
                    let before = locks.len();
                    locks.retain(|l| l.session_id != session_id);
                    let removed = before - locks.len();
                    if locks.is_empty() {
                        state.legacy.remove(&file);
                    }
                    if removed > 0 {
                        state.counters.decrement(&file, session_id, removed);
                        touched.push(file.clone());
                    }
                }
            }
            state.graph.remove_owner(session_id);
        }
        for file in touched {
            self.wake_waiters(&file, session_id);
        }
    }

    // ---- unified locks and leases ---------------------------------------

    pub fn add_unified_lock(&self, lock: UnifiedLock, reclaim: bool) -> Result<(), StoreError> {
        self.grace.check_request(reclaim, false)?;
        let mut state = self.state.write().unwrap();
        if let Some(locks) = state.unified.get(&lock.file) {
            if let Some(conflicting) = locks.iter().find(|l| l.conflicts_with(&lock)) {
                return Err(conflict_error_from_unified(conflicting));
            }
        }
        state
            .counters
            .check(&self.limits, &lock.file, &lock.owner.client_id)?;

        if let Some(store) = &self.persistence {
            store.save_lock(&PersistedLock::from_lock(
                &lock,
                self.server_epoch.load(Ordering::SeqCst),
            ))?;
        }

        let file = lock.file.clone();
        let client = lock.owner.client_id.clone();
        state.unified.entry(file.clone()).or_default().push(lock);
        state.counters.increment(&file, &client, 1);
        Ok(())
    }

    /// Unlocks `[offset, length)` for the owner, splitting partially
    /// covered byte-range locks. Leases overlapping the range are dropped
    /// whole.
    pub fn remove_unified_lock(
        &self,
        file: &FileHandle,
        owner_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<(), StoreError> {
        let mut removed_ids: Vec<Uuid> = Vec::new();
        let mut added: Vec<UnifiedLock> = Vec::new();
        {
            let mut state = self.state.write().unwrap();
            let locks = match state.unified.get_mut(file) {
                Some(locks) => locks,
                None => {
                    return Err(StoreError::new(
                        ErrorCode::LockNotFound,
                        "no locks held on file",
                    ))
                }
            };

            let mut kept: Vec<UnifiedLock> = Vec::with_capacity(locks.len());
            let mut removed_count = 0usize;
            let mut client = String::new();
            for lock in locks.drain(..) {
                let owned = lock.owner.owner_id == owner_id;
                let overlaps = ranges_overlap(lock.offset, lock.length, offset, length);
                if !owned || !overlaps {
                    kept.push(lock);
                    continue;
                }
                removed_count += 1;
                removed_ids.push(lock.id);
                client = lock.owner.client_id.clone();
                if !lock.is_lease() {
                    for residual in split_unified_lock(&lock, offset, length) {
                        added.push(residual);
                    }
                }
            }
            if removed_count == 0 {
                *locks = kept;
                return Err(StoreError::new(
                    ErrorCode::LockNotFound,
                    format!("{} holds no lock at [{}, len {}]", owner_id, offset, length),
                ));
            }
            kept.extend(added.iter().cloned());
            let empty = kept.is_empty();
            *locks = kept;
            if empty {
                state.unified.remove(file);
            }
            state.counters.decrement(file, &client, removed_count);
            state.counters.increment(file, &client, added.len());

            let owner_still_holds = state
                .unified
                .values()
                .flatten()
                .any(|l| l.owner.owner_id == owner_id);
            if !owner_still_holds {
                state.graph.remove_owner(owner_id);
            }
        }

        if let Some(store) = &self.persistence {
            let epoch = self.server_epoch.load(Ordering::SeqCst);
            for id in &removed_ids {
                if let Err(err) = store.delete_lock(id) {
                    warn!("lock store delete of {} failed: {}", id, err);
                }
            }
            for lock in &added {
                if let Err(err) = store.save_lock(&PersistedLock::from_lock(lock, epoch)) {
                    warn!("lock store save of {} failed: {}", lock.id, err);
                }
            }
        }

        self.wake_waiters(file, owner_id);
        Ok(())
    }

    /// Atomically turns the caller's shared lock covering the range into
    /// an exclusive one.
    pub fn upgrade_lock(
        &self,
        file: &FileHandle,
        owner_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap();
        let locks = match state.unified.get_mut(file) {
            Some(locks) => locks,
            None => {
                return Err(StoreError::new(
                    ErrorCode::LockNotFound,
                    "no locks held on file",
                ))
            }
        };

        if locks.iter().any(|l| {
            l.owner.owner_id == owner_id
                && l.lock_type == LockType::Exclusive
                && l.covers(offset, length)
        }) {
            return Ok(());
        }

        let position = locks.iter().position(|l| {
            l.owner.owner_id == owner_id
                && l.lock_type == LockType::Shared
                && l.covers(offset, length)
        });
        let position = match position {
            Some(position) => position,
            None => {
                return Err(StoreError::new(
                    ErrorCode::LockNotFound,
                    "no shared lock covers the requested range",
                ))
            }
        };

        if let Some(other) = locks.iter().find(|l| {
            l.owner.owner_id != owner_id && ranges_overlap(l.offset, l.length, offset, length)
        }) {
            return Err(conflict_error_from_unified(other));
        }

        locks[position].lock_type = LockType::Exclusive;
        let updated = locks[position].clone();
        drop(state);

        if let Some(store) = &self.persistence {
            let epoch = self.server_epoch.load(Ordering::SeqCst);
            if let Err(err) = store.save_lock(&PersistedLock::from_lock(&updated, epoch)) {
                warn!("lock store save of upgraded {} failed: {}", updated.id, err);
            }
        }
        Ok(())
    }

    pub fn get_unified_locks(&self, file: &FileHandle) -> Vec<UnifiedLock> {
        self.state
            .read()
            .unwrap()
            .unified
            .get(file)
            .cloned()
            .unwrap_or_default()
    }

    /// First unified lock conflicting with the probe, if any. Admitted
    /// during the grace period (test operations always are).
    pub fn test_unified_lock(&self, probe: &UnifiedLock) -> Option<UnifiedLock> {
        let state = self.state.read().unwrap();
        state
            .unified
            .get(&probe.file)?
            .iter()
            .find(|l| l.conflicts_with(probe))
            .cloned()
    }

    // ---- oplock / lease breaks ------------------------------------------

    pub fn check_and_break_oplocks_for_write(
        &self,
        file: &FileHandle,
        exclude_owner: Option<&str>,
    ) -> usize {
        self.break_leases(file, exclude_owner, BreakReason::Write)
    }

    pub fn check_and_break_oplocks_for_read(
        &self,
        file: &FileHandle,
        exclude_owner: Option<&str>,
    ) -> usize {
        self.break_leases(file, exclude_owner, BreakReason::Read)
    }

    pub fn check_and_break_oplocks_for_delete(
        &self,
        file: &FileHandle,
        exclude_owner: Option<&str>,
    ) -> usize {
        self.break_leases(file, exclude_owner, BreakReason::Delete)
    }

    /// Marks the affected leases as breaking and dispatches every
    /// registered callback. Returns the number of breaks initiated.
    fn break_leases(
        &self,
        file: &FileHandle,
        exclude_owner: Option<&str>,
        reason: BreakReason,
    ) -> usize {
        let now = epoch_now();
        let mut broken: Vec<(UnifiedLock, LeaseState)> = Vec::new();
        let callbacks;
        {
            let mut state = self.state.write().unwrap();
            callbacks = state.callbacks.clone();
            if let Some(locks) = state.unified.get_mut(file) {
                for lock in locks.iter_mut() {
                    if Some(lock.owner.owner_id.as_str()) == exclude_owner {
                        continue;
                    }
                    let lease = match lock.lease.as_mut() {
                        Some(lease) => lease,
                        None => continue,
                    };
                    if lease.breaking {
                        continue;
                    }
                    let target = match reason {
                        BreakReason::Write => {
                            if lease
                                .state
                                .intersects(LeaseState::READ | LeaseState::WRITE)
                            {
                                Some(LeaseState::empty())
                            } else {
                                None
                            }
                        }
                        BreakReason::Read => {
                            if lease.state.contains(LeaseState::WRITE) {
                                Some(LeaseState::READ)
                            } else {
                                None
                            }
                        }
                        BreakReason::Delete => {
                            if lease.state.is_empty() {
                                None
                            } else {
                                Some(LeaseState::empty())
                            }
                        }
                    };
                    if let Some(target) = target {
                        lease.breaking = true;
                        lease.break_to = Some(target);
                        lease.epoch = lease.epoch.wrapping_add(1);
                        // The break timer counts from here.
                        lock.acquired_at = now;
                        broken.push((lock.clone(), target));
                    }
                }
            }
        }

        if let Some(store) = &self.persistence {
            let epoch = self.server_epoch.load(Ordering::SeqCst);
            for (lock, _) in &broken {
                if let Err(err) = store.save_lock(&PersistedLock::from_lock(lock, epoch)) {
                    warn!("lock store save of breaking {} failed: {}", lock.id, err);
                }
            }
        }

        for (lock, target) in &broken {
            for callback in &callbacks {
                callback.on_break(file, lock, *target);
            }
        }
        broken.len()
    }

    /// Acknowledges a break: applies the pending downgrade. A lease broken
    /// to no caching state is removed entirely.
    pub fn acknowledge_break(
        &self,
        file: &FileHandle,
        key: &[u8; 16],
    ) -> Result<(), StoreError> {
        let mut removed: Option<UnifiedLock> = None;
        let mut updated: Option<UnifiedLock> = None;
        {
            let mut state = self.state.write().unwrap();
            let locks = match state.unified.get_mut(file) {
                Some(locks) => locks,
                None => {
                    return Err(StoreError::new(
                        ErrorCode::LockNotFound,
                        "no leases held on file",
                    ))
                }
            };
            let position = locks
                .iter()
                .position(|l| l.lease.as_ref().map(|lease| &lease.key == key).unwrap_or(false));
            let position = match position {
                Some(position) => position,
                None => {
                    return Err(StoreError::new(
                        ErrorCode::LockNotFound,
                        "no lease with that key",
                    ))
                }
            };
            let lock = &mut locks[position];
            let lease = lock.lease.as_mut().expect("position found by lease key");
            if !lease.breaking {
                return Err(StoreError::invalid_argument("lease is not breaking"));
            }
            let target = lease.break_to.take().unwrap_or_else(LeaseState::empty);
            lease.breaking = false;
            lease.state = target;
            if target.is_empty() {
                let lock = locks.remove(position);
                let client = lock.owner.client_id.clone();
                state.counters.decrement(file, &client, 1);
                if state
                    .unified
                    .get(file)
                    .map(|locks| locks.is_empty())
                    .unwrap_or(false)
                {
                    state.unified.remove(file);
                }
                removed = Some(lock);
            } else {
                updated = Some(lock.clone());
            }
        }

        if let Some(store) = &self.persistence {
            let epoch = self.server_epoch.load(Ordering::SeqCst);
            if let Some(lock) = &removed {
                if let Err(err) = store.delete_lock(&lock.id) {
                    warn!("lock store delete of {} failed: {}", lock.id, err);
                }
            }
            if let Some(lock) = &updated {
                if let Err(err) = store.save_lock(&PersistedLock::from_lock(lock, epoch)) {
                    warn!("lock store save of {} failed: {}", lock.id, err);
                }
            }
        }
        if let Some(lock) = &removed {
            self.wake_waiters(file, &lock.owner.owner_id);
        }
        Ok(())
    }

    /// Force-revokes every lease whose break has been pending longer than
    /// the lease-break timeout. Called by the scanner.
    pub fn force_revoke_expired_breaks(&self) -> usize {
        let cutoff = epoch_now() - self.timeouts.lease_break.as_secs() as i64;
        let mut revoked: Vec<(FileHandle, UnifiedLock)> = Vec::new();
        let callbacks;
        {
            let mut state = self.state.write().unwrap();
            callbacks = state.callbacks.clone();
            let files: Vec<FileHandle> = state.unified.keys().cloned().collect();
            for file in files {
                let mut expired: Vec<UnifiedLock> = Vec::new();
                if let Some(locks) = state.unified.get_mut(&file) {
                    locks.retain(|lock| {
                        let dead = lock
                            .lease
                            .as_ref()
                            .map(|lease| lease.breaking && lock.acquired_at <= cutoff)
                            .unwrap_or(false);
                        if dead {
                            expired.push(lock.clone());
                        }
                        !dead
                    });
                    if locks.is_empty() {
                        state.unified.remove(&file);
                    }
                }
                for lock in expired {
                    state
                        .counters
                        .decrement(&file, &lock.owner.client_id, 1);
                    revoked.push((file.clone(), lock));
                }
            }
        }

        if revoked.is_empty() {
            return 0;
        }
        if let Some(store) = &self.persistence {
            for (_, lock) in &revoked {
                if let Err(err) = store.delete_lock(&lock.id) {
                    warn!("lock store delete of {} failed: {}", lock.id, err);
                }
            }
        }
        for (file, lock) in &revoked {
            let target = lock
                .lease
                .as_ref()
                .and_then(|lease| lease.break_to)
                .unwrap_or_else(LeaseState::empty);
            warn!(
                "force revoking lease {} on {} after break timeout",
                lock.id, file
            );
            for callback in &callbacks {
                callback.on_break(file, lock, target);
            }
            self.wake_waiters(file, &lock.owner.owner_id);
        }
        revoked.len()
    }

    // ---- teardown helpers ------------------------------------------------

    /// Client disconnect: removes every unified lock of the client.
    pub fn delete_locks_by_client(&self, client_id: &str) -> Result<(), StoreError> {
        let mut owners: Vec<(FileHandle, String)> = Vec::new();
        {
            let mut state = self.state.write().unwrap();
            let files: Vec<FileHandle> = state.unified.keys().cloned().collect();
            for file in files {
                if let Some(locks) = state.unified.get_mut(&file) {
                    let mut removed = 0usize;
                    locks.retain(|l| {
                        if l.owner.client_id == client_id {
                            owners.push((file.clone(), l.owner.owner_id.clone()));
                            removed += 1;
                            false
                        } else {
                            true
                        }
                    });
                    if locks.is_empty() {
                        state.unified.remove(&file);
                    }
                    state.counters.decrement(&file, client_id, removed);
                }
            }
            for (_, owner) in &owners {
                state.graph.remove_owner(owner);
            }
        }
        if let Some(store) = &self.persistence {
            store.delete_locks_by_client(client_id)?;
        }
        for (file, owner) in owners {
            self.wake_waiters(&file, &owner);
        }
        Ok(())
    }

    /// File deletion: every lock and lease on the file goes away.
    pub fn delete_locks_by_file(&self, file: &FileHandle) -> Result<(), StoreError> {
        let mut owners: Vec<String> = Vec::new();
        {
            let mut state = self.state.write().unwrap();
            if let Some(locks) = state.unified.remove(file) {
                for lock in locks {
                    state.counters.decrement(file, &lock.owner.client_id, 1);
                    owners.push(lock.owner.owner_id);
                }
            }
            if let Some(locks) = state.legacy.remove(file) {
                for lock in locks {
                    state.counters.decrement(file, &lock.session_id, 1);
                    owners.push(lock.session_id);
                }
            }
        }
        if let Some(store) = &self.persistence {
            store.delete_locks_by_file(&file.to_string())?;
        }
        for owner in owners {
            self.wake_waiters(file, &owner);
        }
        Ok(())
    }

    // ---- restart recovery ------------------------------------------------

    /// Bumps the server epoch and drains stale records from the store.
    /// Returns the stale records so the caller can derive the set of
    /// clients expected to reclaim, then enters the grace period.
    pub fn recover(&self) -> Result<Vec<PersistedLock>, StoreError> {
        let store = match &self.persistence {
            Some(store) => store,
            None => return Ok(Vec::new()),
        };
        let epoch = store.server_epoch()? + 1;
        store.set_server_epoch(epoch)?;
        self.server_epoch.store(epoch, Ordering::SeqCst);

        let records = store.load_locks()?;
        let mut stale = Vec::new();
        for record in records {
            if record.server_epoch < epoch {
                if let Err(err) = store.delete_lock(&record.id) {
                    warn!("purging stale lock {} failed: {}", record.id, err);
                }
                stale.push(record);
            }
        }
        if !stale.is_empty() {
            let mut clients: Vec<String> =
                stale.iter().map(|r| r.client_id.clone()).collect();
            clients.sort();
            clients.dedup();
            debug!(
                "recovered {} stale locks from {} client(s)",
                stale.len(),
                clients.len()
            );
            self.enter_grace_period(&clients);
        }
        Ok(stale)
    }
}
