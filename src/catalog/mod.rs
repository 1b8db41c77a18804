//! Action catalog types and script-file conventions.
//!
//! An action is a Lua chunk stored under `actions/` in either the global
//! scope (shared by all bots) or a bot's local scope. The file name carries
//! two facts: the action name (path with the script extension stripped) and
//! the legacy flag (`<name>.lua` is legacy, `<name>.http.lua` is not).

pub mod scope;

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

pub use scope::{ScopedActionService, ScriptKey};

/// Enumeration pattern for action files.
pub const ACTION_FILE_PATTERN: &str = "*.lua";

/// Script extension of legacy actions.
pub const ACTION_EXTENSION: &str = ".lua";

/// Script extension of non-legacy (remote-capable) actions.
pub const HTTP_ACTION_EXTENSION: &str = ".http.lua";

/// Vendored dependency directories excluded from enumeration.
pub const VENDOR_DIRS: &[&str] = &["lua_modules"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionLocation {
    Global,
    Local,
}

impl fmt::Display for ActionLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionLocation::Global => write!(f, "global"),
            ActionLocation::Local => write!(f, "local"),
        }
    }
}

/// Identity of a loadable action. `(name, location)` is unique within a
/// bot's visible set; same-name collisions across scopes are resolved by
/// position (global first), never deduplicated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    pub name: String,
    pub location: ActionLocation,
    pub legacy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ActionMetadata>,
}

impl ActionDefinition {
    /// Builds a definition from a listing entry, extracting metadata from
    /// the source text. Returns `None` for disabled files.
    pub fn from_file(file: &str, location: ActionLocation, source: &str) -> Option<Self> {
        if is_disabled(file) {
            return None;
        }
        let (name, legacy) = action_name_from_file(file)?;
        Some(Self {
            name,
            location,
            legacy,
            metadata: extract_metadata(source),
        })
    }

    /// Directory part of the action name, used as the base for resolving
    /// relative requires. Empty for top-level actions.
    pub fn base_dir(&self) -> &str {
        match self.name.rfind('/') {
            Some(idx) => &self.name[..idx],
            None => "",
        }
    }

    /// File name the script loads from, relative to `actions/`.
    pub fn script_file(&self) -> String {
        // Global actions always resolve to the plain extension
        if self.location == ActionLocation::Global || self.legacy {
            format!("{}{ACTION_EXTENSION}", self.name)
        } else {
            format!("{}{HTTP_ACTION_EXTENSION}", self.name)
        }
    }
}

/// Structured data extracted by static inspection of the script header.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub params: Vec<ActionParam>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionParam {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    pub description: String,
}

/// A leading dot on the file name marks the action as disabled.
pub fn is_disabled(file: &str) -> bool {
    file.rsplit('/').next().is_some_and(|base| base.starts_with('.'))
}

/// Derives `(name, legacy)` from a listing entry. `None` if the file does
/// not carry a recognized script extension.
pub fn action_name_from_file(file: &str) -> Option<(String, bool)> {
    if let Some(name) = file.strip_suffix(HTTP_ACTION_EXTENSION) {
        Some((name.to_string(), false))
    } else {
        file.strip_suffix(ACTION_EXTENSION)
            .map(|name| (name.to_string(), true))
    }
}

fn param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // -- @param {string} [name=default] description
    RE.get_or_init(|| {
        Regex::new(r"^@param\s+\{(\w+)\}\s+(\[)?([A-Za-z_][\w.]*)(?:=([^\]\s]+))?\]?\s*(.*)$")
            .expect("param regex")
    })
}

/// Parses the leading `--` comment block of a script. Inspection stops at
/// the first non-comment line; scripts without a header yield `None`.
pub fn extract_metadata(source: &str) -> Option<ActionMetadata> {
    let mut meta = ActionMetadata::default();
    let mut saw_header = false;

    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some(comment) = trimmed.strip_prefix("--") else {
            break;
        };
        saw_header = true;
        let body = comment.trim_start_matches('-').trim();
        if let Some(title) = body.strip_prefix("@title") {
            meta.title = Some(title.trim().to_string());
        } else if let Some(desc) = body.strip_prefix("@description") {
            meta.description = Some(desc.trim().to_string());
        } else if let Some(caps) = param_regex().captures(body) {
            meta.params.push(ActionParam {
                name: caps[3].to_string(),
                param_type: caps[1].to_string(),
                required: caps.get(2).is_none(),
                default: caps.get(4).map(|m| m.as_str().to_string()),
                description: caps[5].trim().to_string(),
            });
        }
    }

    saw_header.then_some(meta)
}
