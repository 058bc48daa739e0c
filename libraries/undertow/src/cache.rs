//! Local persisted cache: one `{value, ts}` entry per stream name, read once
//! at startup so the last known value can paint before the remote snapshot
//! arrives. Overwritten on every fold; losing it costs nothing but the warm
//! start.

use crate::data_model::CacheEntry;

pub trait LocalCache {
    fn get(&self, name: &str) -> Option<CacheEntry>;
    fn set(&self, name: &str, entry: &CacheEntry);
}

/// In-memory cache, used in tests and on non-browser targets.
#[derive(Default)]
pub struct MemoryCache {
    entries: std::cell::RefCell<std::collections::HashMap<String, CacheEntry>>,
}

impl LocalCache for MemoryCache {
    fn get(&self, name: &str) -> Option<CacheEntry> {
        self.entries.borrow().get(name).cloned()
    }

    fn set(&self, name: &str, entry: &CacheEntry) {
        self.entries
            .borrow_mut()
            .insert(name.to_string(), entry.clone());
    }
}

/// Browser cache backed by `localStorage`, under the key `cache-<name>`.
#[cfg(all(target_arch = "wasm32", feature = "webstorage"))]
#[derive(Default)]
pub struct WebStorageCache;

#[cfg(all(target_arch = "wasm32", feature = "webstorage"))]
impl WebStorageCache {
    fn storage() -> Option<web_sys::Storage> {
        web_sys::window()?.local_storage().ok().flatten()
    }
}

#[cfg(all(target_arch = "wasm32", feature = "webstorage"))]
impl LocalCache for WebStorageCache {
    fn get(&self, name: &str) -> Option<CacheEntry> {
        let raw = Self::storage()?.get_item(&format!("cache-{name}")).ok()??;
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                // a stale or truncated entry is only a lost warm start
                log::warn!("Ignoring unreadable cache entry for {name}: {e}");
                None
            }
        }
    }

    fn set(&self, name: &str, entry: &CacheEntry) {
        let Some(storage) = Self::storage() else {
            return;
        };
        match serde_json::to_string(entry) {
            Ok(raw) => {
                if let Err(e) = storage.set_item(&format!("cache-{name}"), &raw) {
                    log::warn!("Failed to cache value for {name}: {e:?}");
                }
            }
            Err(e) => log::warn!("Failed to serialize cache entry for {name}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_cache_roundtrips_and_overwrites() {
        let cache = MemoryCache::default();
        assert!(cache.get("conduit-users-1").is_none());

        cache.set(
            "conduit-users-1",
            &CacheEntry {
                value: serde_json::json!(["alice"]),
                ts: None,
            },
        );
        cache.set(
            "conduit-users-1",
            &CacheEntry {
                value: serde_json::json!(["alice", "bob"]),
                ts: None,
            },
        );

        let entry = cache.get("conduit-users-1").unwrap();
        assert_eq!(entry.value, serde_json::json!(["alice", "bob"]));
    }
}
