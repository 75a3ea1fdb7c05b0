//! Lock count ceilings.

use std::collections::HashMap;

use crate::error::{ErrorCode, StoreError};
use crate::handle::FileHandle;

/// Configurable ceilings; 0 disables the respective limit.
#[derive(Clone, Copy, Debug)]
pub struct LockLimits {
    pub per_file: usize,
    pub per_client: usize,
    pub total: usize,
}

impl Default for LockLimits {
    fn default() -> Self {
        Self {
            per_file: 1000,
            per_client: 10_000,
            total: 100_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct LockCounters {
    per_file: HashMap<FileHandle, usize>,
    per_client: HashMap<String, usize>,
    total: usize,
}

impl LockCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn check(
        &self,
        limits: &LockLimits,
        file: &FileHandle,
        client: &str,
    ) -> Result<(), StoreError> {
        if limits.total != 0 && self.total >= limits.total {
            return Err(StoreError::new(
                ErrorCode::LockLimitExceeded,
                format!("server lock limit of {} reached", limits.total),
            ));
        }
        if limits.per_file != 0
            && self.per_file.get(file).copied().unwrap_or(0) >= limits.per_file
        {
            return Err(StoreError::new(
                ErrorCode::LockLimitExceeded,
                format!("per-file lock limit of {} reached", limits.per_file),
            ));
        }
        if limits.per_client != 0
            && self.per_client.get(client).copied().unwrap_or(0) >= limits.per_client
        {
            return Err(StoreError::new(
                ErrorCode::LockLimitExceeded,
                format!("per-client lock limit of {} reached", limits.per_client),
            ));
        }
        Ok(())
    }

    pub fn increment(&mut self, file: &FileHandle, client: &str, n: usize) {
        if n == 0 {
            return;
        }
        *self.per_file.entry(file.clone()).or_insert(0) += n;
        *self.per_client.entry(client.to_string()).or_insert(0) += n;
        self.total += n;
    }

    /// Saturating decrement; zeroed entries are dropped.
    pub fn decrement(&mut self, file: &FileHandle, client: &str, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(count) = self.per_file.get_mut(file) {
            *count = count.saturating_sub(n);
            if *count == 0 {
                self.per_file.remove(file);
            }
        }
        if let Some(count) = self.per_client.get_mut(client) {
            *count = count.saturating_sub(n);
            if *count == 0 {
                self.per_client.remove(client);
            }
        }
        self.total = self.total.saturating_sub(n);
    }
}
