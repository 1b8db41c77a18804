//! In-memory content store.
//!
//! Useful for embedding the runtime without a filesystem and for tests:
//! the read counter makes cache behavior observable (a cache-first listing
//! must not touch the store on its second call).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{is_excluded, matches_pattern, ContentStore, StoreError, StoreScope};

#[derive(Default)]
pub struct MemoryContentStore {
    files: Mutex<HashMap<(StoreScope, String), String>>,
    reads: AtomicUsize,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a file. `path` is relative to the scope root and includes the
    /// category directory, e.g. `actions/say-hello.lua`.
    pub fn put(&self, scope: StoreScope, path: &str, content: &str) {
        self.files
            .lock()
            .expect("store lock")
            .insert((scope, path.to_string()), content.to_string());
    }

    pub fn remove(&self, scope: StoreScope, path: &str) {
        self.files
            .lock()
            .expect("store lock")
            .remove(&(scope, path.to_string()));
    }

    /// Number of store operations served since construction. Listing and
    /// reading each count as one.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn directory_listing(
        &self,
        scope: &StoreScope,
        root: &str,
        pattern: &str,
        excludes: &[&str],
    ) -> Result<Vec<String>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let prefix = format!("{root}/");
        let mut files: Vec<String> = self
            .files
            .lock()
            .expect("store lock")
            .iter()
            .filter(|((s, _), _)| s == scope)
            .filter_map(|((_, path), _)| path.strip_prefix(&prefix).map(str::to_string))
            .filter(|rel| matches_pattern(rel, pattern) && !is_excluded(rel, excludes))
            .collect();
        files.sort();
        Ok(files)
    }

    async fn read_file_as_string(
        &self,
        scope: &StoreScope,
        root: &str,
        file: &str,
    ) -> Result<String, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let key = (scope.clone(), format!("{root}/{file}"));
        self.files
            .lock()
            .expect("store lock")
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{scope}/{root}/{file}")))
    }
}
