//! Workspace Resolver boundary.
//!
//! Maps a bot identifier to its owning workspace identifier. Delegation
//! tokens are scoped to a workspace, so the resolver sits on the remote
//! execution path (memoized per bot by the scope).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

#[async_trait]
pub trait WorkspaceResolver: Send + Sync {
    async fn workspace_of(&self, bot_id: &str) -> Result<String>;
}

/// Map-backed resolver with an optional fallback workspace.
pub struct StaticWorkspaceResolver {
    workspaces: HashMap<String, String>,
    fallback: Option<String>,
    resolutions: AtomicUsize,
}

impl StaticWorkspaceResolver {
    pub fn new(workspaces: HashMap<String, String>) -> Self {
        Self {
            workspaces,
            fallback: None,
            resolutions: AtomicUsize::new(0),
        }
    }

    /// Every bot resolves to the same workspace.
    pub fn single(workspace: &str) -> Self {
        Self {
            workspaces: HashMap::new(),
            fallback: Some(workspace.to_string()),
            resolutions: AtomicUsize::new(0),
        }
    }

    /// Number of resolutions served; lets callers assert memoization.
    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceResolver for StaticWorkspaceResolver {
    async fn workspace_of(&self, bot_id: &str) -> Result<String> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        self.workspaces
            .get(bot_id)
            .cloned()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| anyhow!("no workspace mapped for bot {bot_id}"))
    }
}
