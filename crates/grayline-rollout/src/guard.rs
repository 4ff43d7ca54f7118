//! Per-node in-flight guards.
//!
//! A guard is taken when a node starts an execution and released (on drop)
//! once the execution callback has been applied. Acquisition never blocks.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use grayline_state::{DeploymentId, NodeId};

type Key = (DeploymentId, NodeId);

#[derive(Debug, Clone, Default)]
pub struct NodeGuards {
    held: Arc<Mutex<HashSet<Key>>>,
}

impl NodeGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard for a node, or `None` if it is already held.
    pub fn try_acquire(&self, deployment_id: &str, node_id: &str) -> Option<NodeGuard> {
        let key = (deployment_id.to_string(), node_id.to_string());
        if !self.lock().insert(key.clone()) {
            return None;
        }
        Some(NodeGuard {
            held: Arc::clone(&self.held),
            key,
        })
    }

    pub fn is_held(&self, deployment_id: &str, node_id: &str) -> bool {
        self.lock()
            .contains(&(deployment_id.to_string(), node_id.to_string()))
    }

    pub fn held_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Key>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases its node when dropped.
#[derive(Debug)]
pub struct NodeGuard {
    held: Arc<Mutex<HashSet<Key>>>,
    key: Key,
}

impl NodeGuard {
    pub fn node_id(&self) -> &str {
        &self.key.1
    }
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
    }
}
