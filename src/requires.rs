//! Require-graph validation.
//!
//! Before an action executes, every string literal it passes to `require`
//! must stay inside the permitted lookup roots: the fixed capability table
//! or a dependent file within the scope's actions tree. Path traversal is
//! rejected before the target is ever read. Dependent files are validated
//! recursively, then actually loaded and evaluated (require-from-string)
//! so broken modules fail here instead of mid-conversation.
//!
//! Validation results are memoized in the per-bot validated set and only
//! expire on a full scope clear.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, error, warn};

use crate::catalog::{ActionDefinition, ActionLocation, ScopedActionService};
use crate::sandbox::{self, resolve_module_path, CAPABILITY_MODULES, SANDBOX_TIMEOUT};

fn require_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"require\s*\(?\s*["']([^"']+)["']"#).expect("require regex")
    })
}

/// String literals passed to require-like calls, in source order.
pub fn extract_requires(source: &str) -> Vec<String> {
    require_regex()
        .captures_iter(source)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Validates the full require graph of an action. Returns `false` when any
/// required module escapes the lookup roots or fails to load — execution
/// must not proceed in that case.
pub async fn check_requires(scope: &ScopedActionService, def: &ActionDefinition) -> bool {
    if scope.is_require_validated(&def.name) {
        return true;
    }

    let script = match scope.action_script(def).await {
        Ok(script) => script,
        Err(e) => {
            error!(
                "Cannot validate requires of {} for bot {}: {e}",
                def.name,
                scope.bot_id()
            );
            return false;
        }
    };

    let mut walker = Walker {
        scope,
        location: def.location,
        seen: HashMap::new(),
    };
    let ok = walker.validate_source(script, def.base_dir().to_string()).await;
    if ok {
        scope.mark_require_validated(&def.name);
        debug!("Require graph of {} validated for bot {}", def.name, scope.bot_id());
    }
    ok
}

/// Best-effort collection of the local module sources an action's require
/// graph reaches, keyed by normalized path. Unresolvable entries are
/// skipped here — the runtime proxy reports them if the script actually
/// requires one.
pub async fn collect_local_modules(
    scope: &ScopedActionService,
    def: &ActionDefinition,
    script: &str,
) -> HashMap<String, String> {
    let mut modules = HashMap::new();
    let mut queue = vec![(def.base_dir().to_string(), script.to_string())];

    while let Some((dir, source)) = queue.pop() {
        for literal in extract_requires(&source) {
            if CAPABILITY_MODULES.contains(&literal.as_str()) {
                continue;
            }
            let Some(path) = resolve_module_path(&dir, &literal) else {
                continue;
            };
            if modules.contains_key(&path) {
                continue;
            }
            match scope
                .read_action_file(def.location, &format!("{path}.lua"))
                .await
            {
                Ok(text) => {
                    queue.push((parent_dir(&path), text.clone()));
                    modules.insert(path, text);
                }
                Err(e) => debug!("Skipping unresolvable require '{literal}': {e}"),
            }
        }
    }
    modules
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

struct Walker<'a> {
    scope: &'a ScopedActionService,
    location: ActionLocation,
    /// Module text by normalized path. A module is registered before its
    /// own requires are walked, so this doubles as the in-progress set and
    /// mutually-referential pairs terminate as valid.
    seen: HashMap<String, String>,
}

impl Walker<'_> {
    fn validate_source(
        &mut self,
        source: String,
        dir: String,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            for literal in extract_requires(&source) {
                if CAPABILITY_MODULES.contains(&literal.as_str()) {
                    continue;
                }
                let Some(path) = resolve_module_path(&dir, &literal) else {
                    // Rejected before the target is read
                    error!(
                        "Require '{literal}' escapes the permitted lookup roots (bot {})",
                        self.scope.bot_id()
                    );
                    return false;
                };
                if !self.validate_module(path).await {
                    return false;
                }
            }
            true
        })
    }

    fn validate_module(
        &mut self,
        path: String,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            if self.seen.contains_key(&path) {
                return true;
            }

            let text = match self
                .scope
                .read_action_file(self.location, &format!("{path}.lua"))
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    error!(
                        "Cannot load required file '{path}' for bot {}: {e}",
                        self.scope.bot_id()
                    );
                    return false;
                }
            };
            self.seen.insert(path.clone(), text.clone());

            // Dependencies first, so the require-from-string below can
            // resolve them
            if !self.validate_source(text.clone(), parent_dir(&path)).await {
                return false;
            }

            match sandbox::eval_module_exports(
                text,
                parent_dir(&path),
                self.seen.clone(),
                SANDBOX_TIMEOUT,
            )
            .await
            {
                Ok(true) => true,
                Ok(false) => {
                    warn!("Required file '{path}' may be missing export statements");
                    true
                }
                Err(e) => {
                    error!(
                        "Required file '{path}' failed to load for bot {}: {e}",
                        self.scope.bot_id()
                    );
                    false
                }
            }
        })
    }
}
