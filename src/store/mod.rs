//! Content Store boundary.
//!
//! The store is the source of truth for script text: versioned, hierarchical
//! file storage per bot plus a global scope. The runtime only consumes two
//! operations — directory listing with pattern/exclude filters, and string
//! file reads — so that is the whole trait surface.

pub mod fs;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use fs::FileContentStore;
pub use memory::MemoryContentStore;

/// Which tree of the store a read addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreScope {
    /// Content shared across all bots.
    Global,
    /// Content belonging to exactly one bot.
    Bot(String),
}

impl fmt::Display for StoreScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreScope::Global => write!(f, "global"),
            StoreScope::Bot(id) => write!(f, "bots/{id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Lists files under `root` within `scope`, relative paths, filtered by
    /// `pattern` (e.g. `*.lua`) and skipping any path containing one of the
    /// `excludes` directory names. A missing `root` directory is an empty
    /// listing, not an error.
    async fn directory_listing(
        &self,
        scope: &StoreScope,
        root: &str,
        pattern: &str,
        excludes: &[&str],
    ) -> Result<Vec<String>, StoreError>;

    /// Reads one file as UTF-8 text. Fails with [`StoreError::NotFound`]
    /// if the file is absent.
    async fn read_file_as_string(
        &self,
        scope: &StoreScope,
        root: &str,
        file: &str,
    ) -> Result<String, StoreError>;
}

/// Matches a relative path against a `*.suffix` pattern. Only the trailing
/// wildcard form is supported — it is the only shape the runtime uses.
pub(crate) fn matches_pattern(path: &str, pattern: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => path.ends_with(suffix),
        None => path == pattern,
    }
}

/// True if any path component names an excluded directory.
pub(crate) fn is_excluded(path: &str, excludes: &[&str]) -> bool {
    path.split('/').any(|segment| excludes.contains(&segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matches_extension() {
        assert!(matches_pattern("billing/charge.lua", "*.lua"));
        assert!(!matches_pattern("billing/charge.txt", "*.lua"));
    }

    #[test]
    fn pattern_without_wildcard_is_exact() {
        assert!(matches_pattern("bot.config.json", "bot.config.json"));
        assert!(!matches_pattern("other.json", "bot.config.json"));
    }

    #[test]
    fn excluded_directories_are_detected_anywhere_in_the_path() {
        assert!(is_excluded("lua_modules/inspect.lua", &["lua_modules"]));
        assert!(is_excluded("deep/lua_modules/x.lua", &["lua_modules"]));
        assert!(!is_excluded("billing/charge.lua", &["lua_modules"]));
    }

    #[test]
    fn scope_display_forms_store_paths() {
        assert_eq!(StoreScope::Global.to_string(), "global");
        assert_eq!(StoreScope::Bot("b1".into()).to_string(), "bots/b1");
    }
}
