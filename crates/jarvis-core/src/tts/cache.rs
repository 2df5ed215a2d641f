//! Two-tier TTS cache: in-memory LRU backed by a per-engine disk mirror.
//!
//! Lookup order for `(engine, text)` is memory → disk → miss. A disk hit
//! promotes into memory. Misses are synthesized by the caller and written
//! back here fire-and-forget. Grounded on the workspace's existing
//! atomic-write idiom (`config::loader::save_config`'s tmp-then-rename) for
//! the disk side, and on the `lru` crate already in the dependency stack.

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    sync::Mutex,
};

use lru::LruCache;
use sha2::{Digest, Sha256};

/// `sha256(engine ":" normalize(text))`. The engine prefix makes
/// cross-engine collisions impossible by construction (I4).
pub fn cache_key(engine: &str, text: &str) -> String {
    let normalized = normalize(text);
    let mut hasher = Sha256::new();
    hasher.update(engine.as_bytes());
    hasher.update(b":");
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Trim, lowercase, collapse internal whitespace. Idempotent:
/// `normalize(normalize(s)) == normalize(s)`.
pub fn normalize(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct TwoTierCache {
    memory: Mutex<LruCache<String, Vec<u8>>>,
    disk_root: PathBuf,
    disk_max_per_engine: usize,
}

impl TwoTierCache {
    pub fn new(disk_root: impl Into<PathBuf>, memory_max: usize, disk_max_per_engine: usize) -> Self {
        let capacity = NonZeroUsize::new(memory_max.max(1)).expect("memory_max must be nonzero");
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            disk_root: disk_root.into(),
            disk_max_per_engine,
        }
    }

    fn disk_path(&self, engine: &str, key: &str) -> PathBuf {
        self.disk_root.join(engine).join(format!("{key}.wav"))
    }

    /// Memory hit, else disk hit (promoted into memory), else `None`.
    pub fn get(&self, engine: &str, key: &str) -> Option<Vec<u8>> {
        if let Some(hit) = self.memory.lock().expect("tts cache lock poisoned").get(key) {
            return Some(hit.clone());
        }

        let path = self.disk_path(engine, key);
        let bytes = std::fs::read(&path).ok()?;
        self.memory
            .lock()
            .expect("tts cache lock poisoned")
            .put(key.to_owned(), bytes.clone());
        Some(bytes)
    }

    /// Insert into memory and fire-and-forget write to disk, enforcing the
    /// per-engine disk cap by oldest-mtime eviction afterward.
    pub fn put(&self, engine: &str, key: &str, bytes: Vec<u8>) {
        self.memory
            .lock()
            .expect("tts cache lock poisoned")
            .put(key.to_owned(), bytes.clone());

        let dir = self.disk_root.join(engine);
        if std::fs::create_dir_all(&dir).is_err() {
            return;
        }
        let path = self.disk_path(engine, key);
        let tmp = path.with_extension("wav.tmp");
        if std::fs::write(&tmp, &bytes).is_ok() {
            let _ = std::fs::rename(&tmp, &path);
        }
        self.evict_disk(&dir);
    }

    fn evict_disk(&self, dir: &PathBuf) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                let modified = meta.modified().ok()?;
                Some((modified, e.path()))
            })
            .collect();

        if files.len() <= self.disk_max_per_engine {
            return;
        }
        files.sort_by_key(|(mtime, _)| *mtime);
        let excess = files.len() - self.disk_max_per_engine;
        for (_, path) in files.into_iter().take(excess) {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let s = "  Hello   WORLD  ";
        let once = normalize(s);
        let twice = normalize(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "hello world");
    }

    #[test]
    fn cache_key_distinguishes_engines() {
        let a = cache_key("primary", "hello");
        let b = cache_key("fallback", "hello");
        assert_ne!(a, b);
    }

    #[test]
    fn cache_key_same_for_equivalent_text() {
        let a = cache_key("primary", "Hello World");
        let b = cache_key("primary", "  hello   world ");
        assert_eq!(a, b);
    }

    #[test]
    fn memory_then_disk_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TwoTierCache::new(dir.path(), 10, 10);
        let key = cache_key("primary", "hi");
        assert!(cache.get("primary", &key).is_none());

        cache.put("primary", &key, vec![1, 2, 3]);
        assert_eq!(cache.get("primary", &key), Some(vec![1, 2, 3]));
    }

    #[test]
    fn disk_eviction_enforces_cap() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TwoTierCache::new(dir.path(), 1, 2);
        cache.put("primary", "a", vec![1]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.put("primary", "b", vec![2]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.put("primary", "c", vec![3]);

        let remaining = std::fs::read_dir(dir.path().join("primary")).unwrap().count();
        assert_eq!(remaining, 2, "oldest entry should have been evicted");
    }
}
