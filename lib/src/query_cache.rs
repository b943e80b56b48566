// Copyright 2025 The Antler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Disk persistence for query result sets.
//!
//! One cache file per repository maps query ids to `(age, results)`. A
//! query whose paths are no newer than the persisted age can reuse the
//! result set without re-evaluating its predicate. Flushes are age-gated
//! and rewrite the file atomically; the host drives the cadence through
//! [`QueryCache::flush_due`].

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

use crate::doc_path::DocPath;
use crate::file_util::PathError;
use crate::file_util::persist_atomically;
use crate::query::Query;

/// Default flush cadence.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

const CACHE_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub age: u64,
    pub results: Vec<DocPath>,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    queries: HashMap<String, CacheEntry>,
}

/// The query cache of one repository.
pub struct QueryCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
    registered: Mutex<HashMap<String, Weak<Query>>>,
    last_flush: Mutex<Instant>,
    flush_requested: AtomicBool,
}

impl QueryCache {
    /// Loads the cache file, treating unreadable or incompatible contents
    /// as empty.
    pub fn load(path: &Path) -> Arc<Self> {
        let entries = std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<CacheFile>(&bytes).ok())
            .filter(|file| file.version == CACHE_VERSION)
            .map(|file| file.queries)
            .unwrap_or_default();
        Arc::new(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
            registered: Mutex::new(HashMap::new()),
            last_flush: Mutex::new(Instant::now()),
            flush_requested: AtomicBool::new(false),
        })
    }

    pub fn entry(&self, id: &str) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(id).cloned()
    }

    /// Registers a query for age-gated flushing.
    pub fn register(&self, query: &Arc<Query>) {
        self.registered
            .lock()
            .unwrap()
            .insert(query.id().to_owned(), Arc::downgrade(query));
    }

    pub fn unregister(&self, id: &str) {
        self.registered.lock().unwrap().remove(id);
    }

    pub fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::SeqCst);
    }

    /// Flushes when requested or when the cadence interval has elapsed.
    pub fn flush_due(&self) -> Result<bool, PathError> {
        let elapsed = self.last_flush.lock().unwrap().elapsed();
        if !self.flush_requested.load(Ordering::SeqCst) && elapsed < FLUSH_INTERVAL {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Serializes every registered query whose age moved past the
    /// persisted one, then rewrites the file atomically.
    pub fn flush(&self) -> Result<(), PathError> {
        let mut dirty = false;
        {
            let mut registered = self.registered.lock().unwrap();
            let mut entries = self.entries.lock().unwrap();
            registered.retain(|id, weak| {
                let Some(query) = weak.upgrade() else {
                    return false;
                };
                let age = query.age();
                let persisted_age = entries.get(id).map(|entry| entry.age).unwrap_or(0);
                if age > persisted_age || !entries.contains_key(id) {
                    entries.insert(
                        id.clone(),
                        CacheEntry {
                            age,
                            results: query.paths(),
                        },
                    );
                    dirty = true;
                }
                true
            });
        }
        if dirty {
            let file = CacheFile {
                version: CACHE_VERSION,
                queries: self.entries.lock().unwrap().clone(),
            };
            let bytes = serde_json::to_vec(&file).unwrap();
            persist_atomically(&self.path, &bytes)?;
            tracing::debug!(path = %self.path.display(), "flushed query cache");
        }
        *self.last_flush.lock().unwrap() = Instant::now();
        self.flush_requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Drains pending flushes and discards the in-memory cache.
    pub fn close(&self) -> Result<(), PathError> {
        self.flush()?;
        self.registered.lock().unwrap().clear();
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("path", &self.path)
            .field("entries", &self.entries.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_load_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let cache = QueryCache::load(&temp_dir.path().join("q.query-cache.json"));
        assert!(cache.entry("anything").is_none());
    }

    #[test]
    fn test_wrong_version_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.query-cache.json");
        std::fs::write(&path, r#"{"version": 99, "queries": {"a": {"age": 1, "results": []}}}"#)
            .unwrap();
        let cache = QueryCache::load(&path);
        assert!(cache.entry("a").is_none());
    }

    #[test]
    fn test_entries_survive_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.query-cache.json");
        let cache = QueryCache::load(&path);
        cache.entries.lock().unwrap().insert(
            "q1".to_owned(),
            CacheEntry {
                age: 7,
                results: vec![DocPath::parse("/data/t/x").unwrap()],
            },
        );
        let file = CacheFile {
            version: CACHE_VERSION,
            queries: cache.entries.lock().unwrap().clone(),
        };
        persist_atomically(&path, &serde_json::to_vec(&file).unwrap()).unwrap();

        let reloaded = QueryCache::load(&path);
        let entry = reloaded.entry("q1").unwrap();
        assert_eq!(entry.age, 7);
        assert_eq!(entry.results[0].as_str(), "/data/t/x");
    }
}
