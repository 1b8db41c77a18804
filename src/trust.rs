//! Trust classification.
//!
//! An action is trusted iff its top-level namespace belongs to the fixed
//! set of built-in module namespaces **and** it comes from the global
//! catalog. Bot-authored (local) actions are never trusted, even when they
//! shadow a built-in name. The classification gates which in-process
//! execution strategy runs the script: trusted actions skip the sandbox.

use crate::catalog::{ActionDefinition, ActionLocation};

/// Built-in module namespaces shipping with the platform.
pub const TRUSTED_NAMESPACES: &[&str] = &["analytics", "basic-skills", "builtin", "nlu", "qna"];

/// Namespace prefixes covering the channel integration family.
pub const TRUSTED_NAMESPACE_PREFIXES: &[&str] = &["channel-"];

pub fn is_trusted(def: &ActionDefinition) -> bool {
    if def.location != ActionLocation::Global {
        return false;
    }
    let namespace = def.name.split('/').next().unwrap_or(&def.name);
    TRUSTED_NAMESPACES.contains(&namespace)
        || TRUSTED_NAMESPACE_PREFIXES
            .iter()
            .any(|prefix| namespace.starts_with(prefix))
}
