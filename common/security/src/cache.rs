//! `role_id -> fully expanded permission set` cache with bounded TTL and a reverse
//! index for descendant invalidation.
//!
//! Grounded on `original_source/.../servicios.py::ServicioJerarquiaRoles` (which
//! permissions change must propagate to which descendants) and, structurally, on
//! `auth-service`'s own `FastCache` pattern (see `auth_service::cache`) for the
//! get/set/invalidate trait shape. This cache is process-local by design: the spec
//! (§4.5) only requires bounded TTL and coherent invalidation, not cross-node
//! replication, and RBAC already degrades to a repository read on a miss.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use uuid::Uuid;

const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry {
    permissions: HashSet<String>,
    expires_at: Instant,
}

/// Thread-safe, process-local permission cache. One instance is shared (behind an
/// `Arc`) across all request tasks.
pub struct PermissionCache {
    ttl: Duration,
    entries: RwLock<HashMap<Uuid, Entry>>,
}

impl Default for PermissionCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl PermissionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, role_id: Uuid) -> Option<HashSet<String>> {
        let entries = self.entries.read().expect("permission cache poisoned");
        entries.get(&role_id).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.permissions.clone())
            } else {
                None
            }
        })
    }

    pub fn set(&self, role_id: Uuid, permissions: HashSet<String>) {
        let mut entries = self.entries.write().expect("permission cache poisoned");
        entries.insert(
            role_id,
            Entry {
                permissions,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, role_id: Uuid) {
        let mut entries = self.entries.write().expect("permission cache poisoned");
        entries.remove(&role_id);
    }

    /// Invalidate `role_id` plus every descendant, given the caller already knows
    /// the descendant set (computed via `graph::descendants_of`). Must be called
    /// whenever a role's own permission or parent assignment changes.
    pub fn invalidate_with_descendants(&self, role_id: Uuid, descendants: &HashSet<Uuid>) {
        let mut entries = self.entries.write().expect("permission cache poisoned");
        entries.remove(&role_id);
        for id in descendants {
            entries.remove(id);
        }
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write().expect("permission cache poisoned");
        entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        let role = Uuid::new_v4();
        assert!(cache.get(role).is_none());
        let mut perms = HashSet::new();
        perms.insert("users:read".to_string());
        cache.set(role, perms.clone());
        assert_eq!(cache.get(role), Some(perms));
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = PermissionCache::new(Duration::from_millis(1));
        let role = Uuid::new_v4();
        cache.set(role, HashSet::new());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(role).is_none());
    }

    #[test]
    fn invalidate_with_descendants_clears_whole_subtree() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        let parent = Uuid::new_v4();
        let child = Uuid::new_v4();
        cache.set(parent, HashSet::new());
        cache.set(child, HashSet::new());
        let mut descendants = HashSet::new();
        descendants.insert(child);
        cache.invalidate_with_descendants(parent, &descendants);
        assert!(cache.get(parent).is_none());
        assert!(cache.get(child).is_none());
    }
}
