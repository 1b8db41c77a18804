//! Error types for action execution.

use thiserror::Error;

use crate::store::StoreError;

/// Internal failure taxonomy. Every variant is caught exactly once at the
/// router boundary and normalized into [`ActionExecutionError`] before it
/// reaches a caller.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Requested action absent from the merged catalog.
    #[error("action not found: {0}")]
    NotFound(String),

    /// A required file failed the resolver's security check.
    #[error("require validation failed for action: {0}")]
    RequireValidation(String),

    /// Sandboxed execution exceeded its wall-clock deadline.
    #[error("action timed out after {0} ms")]
    SandboxTimeout(u64),

    /// The script itself raised or failed to compile.
    #[error("script error: {message}")]
    Script {
        message: String,
        stack: Option<String>,
    },

    /// Connection-level failure reaching a remote action server.
    #[error("transport error: {0}")]
    Transport(String),

    /// Content store failure (missing file, IO).
    #[error("content store error: {0}")]
    Store(#[from] StoreError),

    /// Anything the collaborators report through anyhow.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ActionError {
    /// Stack/traceback detail when the failure carries one.
    pub fn stack(&self) -> Option<&str> {
        match self {
            ActionError::Script { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

/// The single error shape callers of `run_action` see, regardless of which
/// stage failed. The original failure is logged with full context before
/// normalization.
#[derive(Debug, Error)]
#[error("action '{action_name}' failed: {message}")]
pub struct ActionExecutionError {
    pub message: String,
    pub action_name: String,
    pub stack: Option<String>,
}

impl ActionExecutionError {
    pub fn new(action_name: &str, err: &ActionError) -> Self {
        Self {
            message: err.to_string(),
            action_name: action_name.to_string(),
            stack: err.stack().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_error_keeps_action_name_and_message() {
        let err = ActionError::NotFound("billing/charge".to_string());
        let norm = ActionExecutionError::new("billing/charge", &err);
        assert_eq!(norm.action_name, "billing/charge");
        assert!(norm.message.contains("action not found"));
        assert!(norm.stack.is_none());
    }

    #[test]
    fn script_error_carries_stack_through_normalization() {
        let err = ActionError::Script {
            message: "attempt to index a nil value".to_string(),
            stack: Some("stack traceback:\n\t[string \"action\"]:3".to_string()),
        };
        let norm = ActionExecutionError::new("say-hello", &err);
        assert!(norm.stack.as_deref().unwrap().contains("traceback"));
    }

    #[test]
    fn timeout_error_names_the_deadline() {
        let err = ActionError::SandboxTimeout(5000);
        assert!(err.to_string().contains("5000 ms"));
    }
}
