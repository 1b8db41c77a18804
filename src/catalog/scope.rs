//! Per-bot scoped state.
//!
//! Each bot gets one `ScopedActionService` owning every cache the runtime
//! keeps for it: the two catalog caches, raw script text, the
//! validated-requires set and the bot→workspace memo. Scopes are created
//! lazily by the registry and live for the process lifetime; invalidation
//! clears them in full, never selectively.
//!
//! Every cache sits behind its own `std::sync::Mutex` and no lock is held
//! across an await. Two callers racing an empty cache may both enumerate
//! the store and both populate it — idempotent, last writer wins.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::store::{ContentStore, StoreError, StoreScope};
use crate::workspace::WorkspaceResolver;

use super::{ActionDefinition, ActionLocation, ACTION_FILE_PATTERN, VENDOR_DIRS};

/// Canonical compound cache key for script text. Lookup and population use
/// the same key, so a legacy and a non-legacy action sharing a name can
/// never poison each other's entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptKey {
    pub name: String,
    pub legacy: bool,
    pub location: ActionLocation,
}

impl ScriptKey {
    pub fn of(def: &ActionDefinition) -> Self {
        Self {
            name: def.name.clone(),
            legacy: def.legacy,
            location: def.location,
        }
    }
}

pub struct ScopedActionService {
    bot_id: String,
    store: Arc<dyn ContentStore>,
    global_actions: Mutex<Option<Vec<ActionDefinition>>>,
    local_actions: Mutex<Option<Vec<ActionDefinition>>>,
    scripts: Mutex<HashMap<ScriptKey, String>>,
    validated_requires: Mutex<HashSet<String>>,
    workspace: Mutex<Option<String>>,
}

impl ScopedActionService {
    pub fn new(bot_id: &str, store: Arc<dyn ContentStore>) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            store,
            global_actions: Mutex::new(None),
            local_actions: Mutex::new(None),
            scripts: Mutex::new(HashMap::new()),
            validated_requires: Mutex::new(HashSet::new()),
            workspace: Mutex::new(None),
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    fn store_scope(&self, location: ActionLocation) -> StoreScope {
        match location {
            ActionLocation::Global => StoreScope::Global,
            ActionLocation::Local => StoreScope::Bot(self.bot_id.clone()),
        }
    }

    fn catalog_cache(&self, location: ActionLocation) -> &Mutex<Option<Vec<ActionDefinition>>> {
        match location {
            ActionLocation::Global => &self.global_actions,
            ActionLocation::Local => &self.local_actions,
        }
    }

    /// All actions visible to this bot: global first, then local, each
    /// group in enumeration order. Same-name collisions across scopes are
    /// kept — callers resolve by position.
    pub async fn list_actions(&self) -> Result<Vec<ActionDefinition>, StoreError> {
        let mut actions = self.list_location(ActionLocation::Global).await?;
        actions.extend(self.list_location(ActionLocation::Local).await?);
        Ok(actions)
    }

    /// Cache-first listing of one scope. On a miss, enumerates script files
    /// from the content store, drops disabled entries, and derives a
    /// definition (with header metadata) per remaining file.
    pub async fn list_location(
        &self,
        location: ActionLocation,
    ) -> Result<Vec<ActionDefinition>, StoreError> {
        if let Some(cached) = self.catalog_cache(location).lock().expect("catalog lock").clone() {
            return Ok(cached);
        }

        let scope = self.store_scope(location);
        let files = self
            .store
            .directory_listing(&scope, "actions", ACTION_FILE_PATTERN, VENDOR_DIRS)
            .await?;

        let mut actions = Vec::with_capacity(files.len());
        for file in files {
            if super::is_disabled(&file) {
                continue;
            }
            let source = match self.store.read_file_as_string(&scope, "actions", &file).await {
                Ok(source) => source,
                Err(StoreError::NotFound(_)) => {
                    // Listing raced a delete; the entry is simply gone
                    warn!("Action file {file} vanished during listing for bot {}", self.bot_id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(def) = ActionDefinition::from_file(&file, location, &source) {
                actions.push(def);
            }
        }

        debug!(
            "Catalog populated for bot {}: {} {location} actions",
            self.bot_id,
            actions.len()
        );
        *self.catalog_cache(location).lock().expect("catalog lock") = Some(actions.clone());
        Ok(actions)
    }

    /// First definition matching `name`, by position (global before local).
    pub async fn find_action(&self, name: &str) -> Result<Option<ActionDefinition>, StoreError> {
        Ok(self
            .list_actions()
            .await?
            .into_iter()
            .find(|def| def.name == name))
    }

    pub async fn has_action(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.find_action(name).await?.is_some())
    }

    /// Raw script text for an action, cache-first under the compound key.
    pub async fn action_script(&self, def: &ActionDefinition) -> Result<String, StoreError> {
        let key = ScriptKey::of(def);
        if let Some(cached) = self.scripts.lock().expect("script lock").get(&key).cloned() {
            return Ok(cached);
        }

        let scope = self.store_scope(def.location);
        let text = self
            .store
            .read_file_as_string(&scope, "actions", &def.script_file())
            .await?;
        self.scripts
            .lock()
            .expect("script lock")
            .insert(key, text.clone());
        Ok(text)
    }

    /// Uncached read of an arbitrary file under the scope's `actions/`
    /// tree. Used by the require resolver for dependent local modules.
    pub async fn read_action_file(
        &self,
        location: ActionLocation,
        file: &str,
    ) -> Result<String, StoreError> {
        self.store
            .read_file_as_string(&self.store_scope(location), "actions", file)
            .await
    }

    pub fn is_require_validated(&self, action_name: &str) -> bool {
        self.validated_requires
            .lock()
            .expect("requires lock")
            .contains(action_name)
    }

    pub fn mark_require_validated(&self, action_name: &str) {
        self.validated_requires
            .lock()
            .expect("requires lock")
            .insert(action_name.to_string());
    }

    /// Workspace owning this bot, memoized after the first resolution.
    pub async fn workspace(&self, resolver: &dyn WorkspaceResolver) -> anyhow::Result<String> {
        if let Some(cached) = self.workspace.lock().expect("workspace lock").clone() {
            return Ok(cached);
        }
        let workspace = resolver.workspace_of(&self.bot_id).await?;
        *self.workspace.lock().expect("workspace lock") = Some(workspace.clone());
        Ok(workspace)
    }

    /// Drops every cache this scope owns. Called by the invalidation
    /// listener; any read after this point is guaranteed fresh.
    pub fn clear(&self) {
        *self.global_actions.lock().expect("catalog lock") = None;
        *self.local_actions.lock().expect("catalog lock") = None;
        self.scripts.lock().expect("script lock").clear();
        self.validated_requires.lock().expect("requires lock").clear();
        *self.workspace.lock().expect("workspace lock") = None;
    }
}
