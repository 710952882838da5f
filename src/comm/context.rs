//! Per-workflow shared context: versioned key-value state with advisory locks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shared key-value state for one workflow.
///
/// The version counter increases by exactly one per successful update,
/// regardless of updater. Locks are advisory: the structure records which
/// lock names are held and by whom, but does not stop a caller that never
/// acquires from mutating anyway — multi-step read-modify-write safety
/// depends on callers honoring acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedContext {
    /// Workflow this context belongs to.
    pub workflow_id: Uuid,
    /// The shared key-value data.
    pub data: HashMap<String, serde_json::Value>,
    /// Held advisory locks: lock name → holding agent.
    pub locks: HashMap<String, String>,
    /// Monotonically increasing update counter.
    pub version: u64,
    /// When the last successful update happened.
    pub last_updated: DateTime<Utc>,
    /// Agent that performed the last update.
    pub updated_by: Option<String>,
}

impl SharedContext {
    pub fn new(workflow_id: Uuid) -> Self {
        Self {
            workflow_id,
            data: HashMap::new(),
            locks: HashMap::new(),
            version: 0,
            last_updated: Utc::now(),
            updated_by: None,
        }
    }

    /// Apply an update: merge into or replace the data map, bump the
    /// version by exactly one, record updater and timestamp.
    pub fn apply_update(
        &mut self,
        agent: &str,
        updates: HashMap<String, serde_json::Value>,
        merge: bool,
    ) {
        if merge {
            self.data.extend(updates);
        } else {
            self.data = updates;
        }
        self.version += 1;
        self.last_updated = Utc::now();
        self.updated_by = Some(agent.to_string());
    }

    /// Try to take an advisory lock. Returns true if acquired or already
    /// held by the same agent; false if another agent holds it.
    pub fn try_lock(&mut self, agent: &str, lock_name: &str) -> bool {
        match self.locks.get(lock_name) {
            Some(holder) => holder == agent,
            None => {
                self.locks.insert(lock_name.to_string(), agent.to_string());
                true
            }
        }
    }

    /// Release an advisory lock. Only the holder may release; releasing an
    /// unheld lock is a no-op returning false.
    pub fn unlock(&mut self, agent: &str, lock_name: &str) -> bool {
        match self.locks.get(lock_name) {
            Some(holder) if holder == agent => {
                self.locks.remove(lock_name);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SharedContext {
        SharedContext::new(Uuid::new_v4())
    }

    #[test]
    fn update_merges_and_bumps_version() {
        let mut c = ctx();
        c.apply_update(
            "a1",
            HashMap::from([("k1".to_string(), serde_json::json!(1))]),
            true,
        );
        c.apply_update(
            "a2",
            HashMap::from([("k2".to_string(), serde_json::json!(2))]),
            true,
        );

        assert_eq!(c.version, 2);
        assert_eq!(c.data.len(), 2);
        assert_eq!(c.updated_by.as_deref(), Some("a2"));
    }

    #[test]
    fn update_replace_drops_old_keys() {
        let mut c = ctx();
        c.apply_update(
            "a1",
            HashMap::from([("old".to_string(), serde_json::json!(1))]),
            true,
        );
        c.apply_update(
            "a1",
            HashMap::from([("new".to_string(), serde_json::json!(2))]),
            false,
        );

        assert!(!c.data.contains_key("old"));
        assert!(c.data.contains_key("new"));
        assert_eq!(c.version, 2);
    }

    #[test]
    fn lock_is_exclusive_per_name() {
        let mut c = ctx();
        assert!(c.try_lock("a1", "budget"));
        assert!(c.try_lock("a1", "budget")); // re-entrant for the holder
        assert!(!c.try_lock("a2", "budget"));
        assert!(c.try_lock("a2", "other"));

        assert!(!c.unlock("a2", "budget")); // not the holder
        assert!(c.unlock("a1", "budget"));
        assert!(c.try_lock("a2", "budget"));
    }
}
