//! Tool catalog sync cache
//!
//! Remembers a fingerprint of the tool names last synced for each downstream
//! server, so a reconnect that reports the same tools does not rewrite the
//! catalog.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use metagate_shared::ServerId;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 of the sorted names joined with `|`
pub fn hash_tools<S: AsRef<str>>(tool_names: &[S]) -> String {
    let mut names: Vec<&str> = tool_names.iter().map(AsRef::as_ref).collect();
    names.sort_unstable();
    hex::encode(Sha256::digest(names.join("|").as_bytes()))
}

/// Cache statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncCacheStats {
    pub size: usize,
    pub servers: Vec<ServerId>,
}

#[derive(Default)]
pub struct ToolsSyncCache {
    hashes: RwLock<HashMap<ServerId, String>>,
}

impl ToolsSyncCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the names differ from the last recorded set (or none was recorded)
    pub fn has_changed<S: AsRef<str>>(&self, server_uuid: ServerId, tool_names: &[S]) -> bool {
        let hash = hash_tools(tool_names);
        let hashes = self.hashes.read().unwrap_or_else(PoisonError::into_inner);
        hashes.get(&server_uuid) != Some(&hash)
    }

    pub fn update<S: AsRef<str>>(&self, server_uuid: ServerId, tool_names: &[S]) {
        let hash = hash_tools(tool_names);
        let mut hashes = self.hashes.write().unwrap_or_else(PoisonError::into_inner);
        hashes.insert(server_uuid, hash);
    }

    /// Check and record in one step. Returns true when a sync is needed.
    pub fn should_sync<S: AsRef<str>>(&self, server_uuid: ServerId, tool_names: &[S]) -> bool {
        let hash = hash_tools(tool_names);
        let mut hashes = self.hashes.write().unwrap_or_else(PoisonError::into_inner);
        if hashes.get(&server_uuid) == Some(&hash) {
            return false;
        }
        hashes.insert(server_uuid, hash);
        true
    }

    /// Forget one server, or everything
    pub fn clear(&self, server_uuid: Option<ServerId>) {
        let mut hashes = self.hashes.write().unwrap_or_else(PoisonError::into_inner);
        match server_uuid {
            Some(uuid) => {
                hashes.remove(&uuid);
            }
            None => hashes.clear(),
        }
    }

    pub fn stats(&self) -> SyncCacheStats {
        let hashes = self.hashes.read().unwrap_or_else(PoisonError::into_inner);
        SyncCacheStats {
            size: hashes.len(),
            servers: hashes.keys().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_order_independent() {
        assert_eq!(hash_tools(&["a", "b", "c"]), hash_tools(&["c", "a", "b"]));
        assert_ne!(hash_tools(&["a", "b"]), hash_tools(&["a", "b", "c"]));
        assert_eq!(hash_tools::<&str>(&[]).len(), 64);
    }

    #[test]
    fn test_should_sync_sequence() {
        let cache = ToolsSyncCache::new();
        let server = ServerId::new();

        assert!(cache.should_sync(server, &["a", "b"]));
        assert!(!cache.should_sync(server, &["b", "a"]));
        assert!(cache.should_sync(server, &["a", "b", "c"]));
    }

    #[test]
    fn test_has_changed_does_not_record() {
        let cache = ToolsSyncCache::new();
        let server = ServerId::new();

        assert!(cache.has_changed(server, &["a"]));
        assert!(cache.has_changed(server, &["a"]));
        cache.update(server, &["a"]);
        assert!(!cache.has_changed(server, &["a"]));
    }

    #[test]
    fn test_clear() {
        let cache = ToolsSyncCache::new();
        let a = ServerId::new();
        let b = ServerId::new();
        cache.update(a, &["x"]);
        cache.update(b, &["y"]);

        cache.clear(Some(a));
        assert!(cache.has_changed(a, &["x"]));
        assert!(!cache.has_changed(b, &["y"]));

        cache.clear(None);
        assert_eq!(cache.stats().size, 0);
    }
}
