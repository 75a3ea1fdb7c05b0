//! Wait-for graph for deadlock avoidance.
//!
//! Nodes are owner ids, edges mean "is waiting for". Before parking on a
//! conflicting lock the manager asks whether the new edge set would make
//! the waiter reachable from any of the owners it waits on.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: HashMap<String, HashSet<String>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// DFS from each owner: if `waiter` is reachable, blocking on these
    /// owners would close a cycle.
    pub fn would_cause_cycle(&self, waiter: &str, owners: &[String]) -> bool {
        for owner in owners {
            if owner == waiter {
                return true;
            }
            let mut stack = vec![owner.as_str()];
            let mut seen = HashSet::new();
            while let Some(node) = stack.pop() {
                if !seen.insert(node) {
                    continue;
                }
                if let Some(next) = self.edges.get(node) {
                    for target in next {
                        if target == waiter {
                            return true;
                        }
                        stack.push(target.as_str());
                    }
                }
            }
        }
        false
    }

    pub fn add_waiter(&mut self, waiter: &str, owners: &[String]) {
        let entry = self.edges.entry(waiter.to_string()).or_default();
        for owner in owners {
            entry.insert(owner.clone());
        }
    }

    pub fn remove_waiter(&mut self, waiter: &str) {
        self.edges.remove(waiter);
    }

    /// Purges a released owner both as waiter and as wait target.
    pub fn remove_owner(&mut self, owner: &str) {
        self.edges.remove(owner);
        for targets in self.edges.values_mut() {
            targets.remove(owner);
        }
        self.edges.retain(|_, targets| !targets.is_empty());
    }

    /// Everyone currently waiting on `owner`, to be woken on release.
    pub fn waiters_for(&self, owner: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, targets)| targets.contains(owner))
            .map(|(waiter, _)| waiter.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}
