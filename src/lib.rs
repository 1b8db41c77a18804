//! Action execution runtime for conversational bots.
//!
//! Loads user-authored Lua "actions" attached to a bot, decides under
//! which trust regime each one may run, executes it, and reports the
//! outcome. Three execution strategies: trusted in-process (built-in
//! global namespaces), sandboxed (everything bot-authored), and remote
//! delegation to an action server over HTTP with short-lived signed
//! tokens.
//!
//! ```no_run
//! use std::sync::Arc;
//! use action_runtime::{
//!     ActionService, Event, FileContentStore, JsonlAuditStore, RunActionArgs,
//!     RuntimeConfig, StaticWorkspaceResolver,
//! };
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = RuntimeConfig::load("config/actions.toml")?;
//! let store = Arc::new(FileContentStore::open("./data".as_ref())?);
//! let audit = Arc::new(JsonlAuditStore::open("./data/audit/tasks.jsonl".as_ref())?);
//! let workspaces = Arc::new(StaticWorkspaceResolver::single("default"));
//! let service = ActionService::new(config, store, audit, workspaces);
//!
//! let mut event = Event::new("my-bot");
//! service
//!     .run_action(RunActionArgs {
//!         bot_id: "my-bot",
//!         action_name: "greet",
//!         action_args: serde_json::json!({ "name": "ada" }),
//!         action_server: None,
//!         incoming_event: &mut event,
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod invalidation;
pub mod remote;
pub mod requires;
pub mod sandbox;
pub mod service;
pub mod store;
pub mod trust;
pub mod workspace;

pub use audit::{AuditRepository, ExecutionTask, JsonlAuditStore, MemoryAuditStore, TaskStatus};
pub use catalog::{ActionDefinition, ActionLocation, ActionMetadata, ScopedActionService};
pub use config::RuntimeConfig;
pub use error::{ActionError, ActionExecutionError};
pub use event::{Event, EventState};
pub use invalidation::{Debounce, InvalidationListener};
pub use remote::{ActionServer, RemoteDelegate};
pub use service::{ActionService, RunActionArgs};
pub use store::{ContentStore, FileContentStore, MemoryContentStore, StoreError, StoreScope};
pub use workspace::{StaticWorkspaceResolver, WorkspaceResolver};
