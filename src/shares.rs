//! Per-share runtime registry.
//!
//! Lock managers and cookie managers are per-share instances owned here,
//! never process globals. A share's runtime comes alive when the share is
//! registered and dies when it is removed or the server shuts down.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{ErrorCode, StoreError};
use crate::locking::{LockLimits, LockManager, LockStore, LockTimeouts};
use crate::meta::CookieManager;

pub struct ShareRuntime {
    name: String,
    lock_manager: Arc<LockManager>,
    cookies: Arc<CookieManager>,
}

impl std::fmt::Debug for ShareRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareRuntime")
            .field("name", &self.name)
            .finish()
    }
}

impl ShareRuntime {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn cookies(&self) -> &Arc<CookieManager> {
        &self.cookies
    }
}

#[derive(Default)]
pub struct ShareRegistry {
    shares: RwLock<HashMap<String, Arc<ShareRuntime>>>,
}

impl ShareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        timeouts: LockTimeouts,
        limits: LockLimits,
        lock_store: Option<Arc<dyn LockStore>>,
    ) -> Result<Arc<ShareRuntime>, StoreError> {
        let mut shares = self.shares.write().unwrap();
        if shares.contains_key(name) {
            return Err(StoreError::new(
                ErrorCode::AlreadyExists,
                format!("share {} is already registered", name),
            ));
        }
        let mut manager = LockManager::new(name, timeouts, limits);
        if let Some(store) = lock_store {
            manager = manager.with_persistence(store);
        }
        let runtime = Arc::new(ShareRuntime {
            name: name.to_string(),
            lock_manager: Arc::new(manager),
            cookies: Arc::new(CookieManager::new()),
        });
        shares.insert(name.to_string(), runtime.clone());
        Ok(runtime)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ShareRuntime>> {
        self.shares.read().unwrap().get(name).cloned()
    }

    /// Removes the share and shuts its lock manager down.
    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let runtime = self.shares.write().unwrap().remove(name);
        match runtime {
            Some(runtime) => {
                runtime.lock_manager.close();
                Ok(())
            }
            None => Err(StoreError::not_found(name)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shares.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Shuts every share down, e.g. at server exit.
    pub fn close_all(&self) {
        let shares: Vec<Arc<ShareRuntime>> =
            self.shares.write().unwrap().drain().map(|(_, s)| s).collect();
        for share in shares {
            share.lock_manager.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove() {
        let registry = ShareRegistry::new();
        let runtime = registry
            .register(
                "export",
                LockTimeouts::default(),
                LockLimits::default(),
                None,
            )
            .unwrap();
        assert_eq!(runtime.name(), "export");
        assert_eq!(runtime.lock_manager().share_name(), "export");

        let err = registry
            .register(
                "export",
                LockTimeouts::default(),
                LockLimits::default(),
                None,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);

        assert!(registry.get("export").is_some());
        assert_eq!(registry.names(), vec!["export".to_string()]);

        registry.remove("export").unwrap();
        assert!(registry.get("export").is_none());
        assert_eq!(
            registry.remove("export").unwrap_err().code,
            ErrorCode::NotFound
        );
    }

    #[test]
    fn shares_have_independent_runtimes() {
        let registry = ShareRegistry::new();
        let a = registry
            .register("a", LockTimeouts::default(), LockLimits::default(), None)
            .unwrap();
        let b = registry
            .register("b", LockTimeouts::default(), LockLimits::default(), None)
            .unwrap();
        assert!(!Arc::ptr_eq(a.lock_manager(), b.lock_manager()));
        registry.close_all();
        assert!(registry.names().is_empty());
    }
}
