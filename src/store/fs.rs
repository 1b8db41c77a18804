//! Filesystem-backed content store.
//!
//! Layout:
//!   {base_path}/global/actions/...          — actions shared by all bots
//!   {base_path}/bots/{bot_id}/actions/...   — per-bot actions

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use super::{is_excluded, matches_pattern, ContentStore, StoreError, StoreScope};

pub struct FileContentStore {
    base_path: PathBuf,
}

impl FileContentStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(path)?;
        info!("Content store opened at {}", path.display());
        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    fn scope_dir(&self, scope: &StoreScope) -> PathBuf {
        match scope {
            StoreScope::Global => self.base_path.join("global"),
            StoreScope::Bot(id) => self.base_path.join("bots").join(id),
        }
    }

    fn collect(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<(), StoreError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            if entry.file_type()?.is_dir() {
                Self::collect(&entry.path(), &rel, out)?;
            } else {
                out.push(rel);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for FileContentStore {
    async fn directory_listing(
        &self,
        scope: &StoreScope,
        root: &str,
        pattern: &str,
        excludes: &[&str],
    ) -> Result<Vec<String>, StoreError> {
        let dir = self.scope_dir(scope).join(root);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        Self::collect(&dir, "", &mut files)?;
        files.retain(|f| matches_pattern(f, pattern) && !is_excluded(f, excludes));
        // Deterministic enumeration order regardless of the underlying fs
        files.sort();
        Ok(files)
    }

    async fn read_file_as_string(
        &self,
        scope: &StoreScope,
        root: &str,
        file: &str,
    ) -> Result<String, StoreError> {
        let path = self.scope_dir(scope).join(root).join(file);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("{scope}/{root}/{file}")))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store_root: &Path, rel: &str, content: &str) {
        let path = store_root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    #[tokio::test]
    async fn lists_matching_files_recursively() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileContentStore::open(dir.path()).expect("open");
        seed(dir.path(), "bots/b1/actions/say-hello.lua", "-- hi");
        seed(dir.path(), "bots/b1/actions/billing/charge.lua", "-- charge");
        seed(dir.path(), "bots/b1/actions/readme.md", "nope");

        let files = store
            .directory_listing(&StoreScope::Bot("b1".into()), "actions", "*.lua", &[])
            .await
            .expect("listing");
        assert_eq!(files, vec!["billing/charge.lua", "say-hello.lua"]);
    }

    #[tokio::test]
    async fn listing_skips_vendored_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileContentStore::open(dir.path()).expect("open");
        seed(dir.path(), "global/actions/nlu/detect.lua", "-- d");
        seed(dir.path(), "global/actions/lua_modules/inspect.lua", "-- v");

        let files = store
            .directory_listing(&StoreScope::Global, "actions", "*.lua", &["lua_modules"])
            .await
            .expect("listing");
        assert_eq!(files, vec!["nlu/detect.lua"]);
    }

    #[tokio::test]
    async fn missing_root_is_an_empty_listing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileContentStore::open(dir.path()).expect("open");
        let files = store
            .directory_listing(&StoreScope::Bot("ghost".into()), "actions", "*.lua", &[])
            .await
            .expect("listing");
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn read_returns_not_found_for_absent_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileContentStore::open(dir.path()).expect("open");
        let err = store
            .read_file_as_string(&StoreScope::Global, "actions", "nope.lua")
            .await
            .expect_err("should fail");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn read_round_trips_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileContentStore::open(dir.path()).expect("open");
        seed(dir.path(), "bots/b1/actions/say-hello.lua", "print('hi')");
        let text = store
            .read_file_as_string(&StoreScope::Bot("b1".into()), "actions", "say-hello.lua")
            .await
            .expect("read");
        assert_eq!(text, "print('hi')");
    }
}
