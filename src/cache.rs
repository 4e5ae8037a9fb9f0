//! # Read-mostly cache
//!
//! String to string map behind the crate's [RwLock]:
//! gets share the lock, puts and removes take it exclusively.
//! A put waiting for the lock holds back new gets, so readers can't starve it.

use std::{collections::HashMap, thread::scope};

use tracing::{debug, info};

use crate::locks::RwLock;

#[derive(Default)]
pub struct RwCache {
    map: RwLock<HashMap<String, String>>,
}

impl RwCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A missing key is a normal outcome, hence the Option.
    pub fn get(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    /// returns the value the key had before, if any
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        debug!(%key, %value, "cache put");
        self.map.write().insert(key, value)
    }

    /// Writes all the entries under one write lock, no reader sees a part of them.
    pub fn put_all<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = self.map.write();
        for (key, value) in entries {
            map.insert(key.into(), value.into());
        }
    }

    /// A copy of all the entries, taken under one read lock.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.map.read().clone()
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.map.write().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 1 writer and 10 readers hitting "key0"
pub fn run() {
    let cache = RwCache::new();
    scope(|s| {
        s.spawn(|| {
            for i in 0..5 {
                cache.put(format!("key{i}"), format!("value{i}"));
            }
        });
        for reader in 0..10 {
            let cache = &cache;
            s.spawn(move || {
                for _ in 0..5 {
                    if let Some(value) = cache.get("key0") {
                        info!(reader, %value, "read");
                    }
                }
            });
        }
    });
    info!(entries = cache.len(), "concurrent readers, exclusive writer");
}

#[cfg(test)]
mod test {
    use std::sync::Barrier;

    use super::*;

    #[test]
    fn test_put_get_remove() {
        let cache = RwCache::new();
        assert!(cache.is_empty());
        assert_eq!(None, cache.get("k"));

        assert_eq!(None, cache.put("k", "v1"));
        assert_eq!(Some("v1".to_string()), cache.put("k", "v2"));
        assert_eq!(Some("v2".to_string()), cache.get("k"));
        assert!(cache.contains_key("k"));
        assert_eq!(1, cache.len());

        assert_eq!(Some("v2".to_string()), cache.remove("k"));
        assert_eq!(None, cache.remove("k"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_no_snapshot_overlaps_a_write() {
        let cache = RwCache::new();
        cache.put_all([("a", "0"), ("b", "0"), ("c", "0")]);
        let barrier = Barrier::new(5);

        scope(|s| {
            s.spawn(|| {
                barrier.wait();
                for i in 1..=300 {
                    let v = i.to_string();
                    cache.put_all([("a", v.clone()), ("b", v.clone()), ("c", v)]);
                }
            });
            for _ in 0..4 {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..300 {
                        let snapshot = cache.snapshot();
                        // a read overlapping a write would see a mix of rounds
                        assert_eq!(snapshot["a"], snapshot["b"]);
                        assert_eq!(snapshot["b"], snapshot["c"]);
                    }
                });
            }
        });

        assert_eq!(Some("300".to_string()), cache.get("c"));
        assert_eq!(3, cache.snapshot().len());
    }

    #[test]
    fn test_readers_see_whole_writes() {
        let cache = RwCache::new();
        cache.put("key", "0-0");
        let barrier = Barrier::new(11);

        scope(|s| {
            s.spawn(|| {
                barrier.wait();
                for i in 1..=200 {
                    cache.put("key", format!("{i}-{i}"));
                }
            });
            for _ in 0..10 {
                s.spawn(|| {
                    barrier.wait();
                    let mut last = 0;
                    for _ in 0..500 {
                        let v = cache.get("key").unwrap();
                        let (a, b) = v.split_once('-').unwrap();
                        assert_eq!(a, b);
                        // values only move forward
                        let n: u32 = a.parse().unwrap();
                        assert!(n >= last);
                        last = n;
                    }
                });
            }
        });

        assert_eq!(Some("200-200".to_string()), cache.get("key"));
    }
}
