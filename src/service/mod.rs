//! Action service: per-bot scope registry and execution router.
//!
//! The registry is process-wide singleton state: it owns the map from bot
//! id to scoped state, creates scopes lazily (guarded, so racers reuse the
//! first one) and never tears them down except on process exit.
//!
//! Routing, evaluated in order: a supplied action-server target wins
//! regardless of trust; otherwise trusted actions run in-process without
//! isolation and everything else goes through the sandbox. Whatever stage
//! fails, the error is caught once here, logged with bot and action, and
//! re-raised as the normalized `ActionExecutionError`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, error};

use crate::audit::AuditRepository;
use crate::catalog::{ActionDefinition, ScopedActionService};
use crate::config::RuntimeConfig;
use crate::error::{ActionError, ActionExecutionError};
use crate::event::Event;
use crate::remote::{ActionServer, RemoteDelegate};
use crate::requires;
use crate::sandbox::{self, ExecutionBundle, ExecutionRequest, SandboxError, SANDBOX_TIMEOUT};
use crate::store::ContentStore;
use crate::trust;
use crate::workspace::WorkspaceResolver;

/// Execution entry point arguments. The event is mutated in place on
/// success.
pub struct RunActionArgs<'a> {
    pub bot_id: &'a str,
    pub action_name: &'a str,
    pub action_args: Value,
    pub action_server: Option<ActionServer>,
    pub incoming_event: &'a mut Event,
}

pub struct ActionService {
    config: RuntimeConfig,
    store: Arc<dyn ContentStore>,
    workspaces: Arc<dyn WorkspaceResolver>,
    delegate: RemoteDelegate,
    scopes: Mutex<HashMap<String, Arc<ScopedActionService>>>,
}

impl ActionService {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn ContentStore>,
        audit: Arc<dyn AuditRepository>,
        workspaces: Arc<dyn WorkspaceResolver>,
    ) -> Self {
        let delegate = RemoteDelegate::new(&config.token_secret, &config.token_audience, audit);
        Self {
            config,
            store,
            workspaces,
            delegate,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// Scoped state for one bot, created lazily. Creation is guarded by
    /// the registry lock, so two callers racing an unseen bot share one
    /// scope.
    pub fn scope(&self, bot_id: &str) -> Arc<ScopedActionService> {
        self.scopes
            .lock()
            .expect("scopes lock")
            .entry(bot_id.to_string())
            .or_insert_with(|| Arc::new(ScopedActionService::new(bot_id, self.store.clone())))
            .clone()
    }

    /// Drops every cache of every known scope. Called by the invalidation
    /// listener.
    pub fn clear_all_scopes(&self) {
        let scopes = self.scopes.lock().expect("scopes lock");
        for scope in scopes.values() {
            scope.clear();
        }
        debug!("Cleared action caches for {} bot scope(s)", scopes.len());
    }

    pub async fn list_actions(&self, bot_id: &str) -> anyhow::Result<Vec<ActionDefinition>> {
        Ok(self.scope(bot_id).list_actions().await?)
    }

    pub async fn has_action(&self, bot_id: &str, action_name: &str) -> anyhow::Result<bool> {
        Ok(self.scope(bot_id).has_action(action_name).await?)
    }

    /// Runs one action against the event. Fails with the normalized error
    /// shape; the original failure is logged here with full context first.
    pub async fn run_action(&self, args: RunActionArgs<'_>) -> Result<(), ActionExecutionError> {
        let RunActionArgs {
            bot_id,
            action_name,
            action_args,
            action_server,
            incoming_event,
        } = args;

        match self
            .dispatch(
                bot_id,
                action_name,
                &action_args,
                action_server.as_ref(),
                incoming_event,
            )
            .await
        {
            Ok(event) => {
                *incoming_event = event;
                Ok(())
            }
            Err(err) => {
                match err.stack() {
                    Some(stack) => error!(
                        "Action {action_name} failed for bot {bot_id}: {err}\n{stack}"
                    ),
                    None => error!("Action {action_name} failed for bot {bot_id}: {err}"),
                }
                Err(ActionExecutionError::new(action_name, &err))
            }
        }
    }

    async fn dispatch(
        &self,
        bot_id: &str,
        action_name: &str,
        action_args: &Value,
        action_server: Option<&ActionServer>,
        incoming_event: &Event,
    ) -> Result<Event, ActionError> {
        let scope = self.scope(bot_id);

        // A remote target wins regardless of trust
        if let Some(server) = action_server {
            let workspace = scope.workspace(self.workspaces.as_ref()).await?;
            return self
                .delegate
                .run(
                    &workspace,
                    bot_id,
                    action_name,
                    action_args,
                    incoming_event,
                    server,
                )
                .await;
        }

        let def = scope
            .find_action(action_name)
            .await?
            .ok_or_else(|| ActionError::NotFound(action_name.to_string()))?;

        let trusted = trust::is_trusted(&def);
        if self.config.strict_require_checks && !requires::check_requires(&scope, &def).await {
            return Err(ActionError::RequireValidation(action_name.to_string()));
        }

        let script = scope.action_script(&def).await?;
        let modules = requires::collect_local_modules(&scope, &def, &script).await;
        let process_env = self
            .config
            .exposed_env
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();

        let request = ExecutionRequest {
            script,
            chunk_name: def.name.clone(),
            base_dir: def.base_dir().to_string(),
            modules,
            bundle: ExecutionBundle {
                event: serde_json::to_value(incoming_event).map_err(anyhow::Error::from)?,
                args: action_args.clone(),
                process_env,
            },
        };

        let outcome = if trusted {
            debug!("Running trusted action {} for bot {bot_id}", def.name);
            sandbox::run_trusted(request).await
        } else {
            debug!("Running sandboxed action {} for bot {bot_id}", def.name);
            sandbox::run_sandboxed(request, SANDBOX_TIMEOUT).await
        };

        let event = outcome.map_err(map_sandbox_error)?;
        serde_json::from_value(event).map_err(|e| ActionError::Script {
            message: format!("action returned an invalid event: {e}"),
            stack: None,
        })
    }
}

fn map_sandbox_error(err: SandboxError) -> ActionError {
    match err {
        SandboxError::Timeout(ms) => ActionError::SandboxTimeout(ms),
        SandboxError::Script { message, stack } => ActionError::Script { message, stack },
        SandboxError::Internal(message) => ActionError::Script {
            message,
            stack: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditStore;
    use crate::invalidation::InvalidationListener;
    use crate::store::{MemoryContentStore, StoreScope};
    use crate::workspace::StaticWorkspaceResolver;
    use serde_json::json;
    use tokio::sync::broadcast;

    fn service_with(store: Arc<MemoryContentStore>, config: RuntimeConfig) -> ActionService {
        ActionService::new(
            config,
            store,
            Arc::new(MemoryAuditStore::new()),
            Arc::new(StaticWorkspaceResolver::single("ws-test")),
        )
    }

    fn service(store: Arc<MemoryContentStore>) -> ActionService {
        service_with(store, RuntimeConfig::new("s3cret"))
    }

    #[tokio::test]
    async fn trusted_global_action_mutates_the_event() {
        let store = Arc::new(MemoryContentStore::new());
        store.put(
            StoreScope::Global,
            "actions/nlu/mark.lua",
            "event.state.temp.x = 1",
        );
        let service = service(store);

        let mut event = Event::new("b1");
        service
            .run_action(RunActionArgs {
                bot_id: "b1",
                action_name: "nlu/mark",
                action_args: json!({}),
                action_server: None,
                incoming_event: &mut event,
            })
            .await
            .expect("run");
        assert_eq!(event.state.temp["x"], json!(1));
    }

    #[tokio::test]
    async fn local_action_runs_sandboxed() {
        let store = Arc::new(MemoryContentStore::new());
        store.put(
            StoreScope::Bot("b1".into()),
            "actions/greet.lua",
            "temp.greeting = 'hello ' .. args.name",
        );
        store.put(
            StoreScope::Bot("b1".into()),
            "actions/peek.lua",
            "temp.t = os.time()",
        );
        let service = service(store);

        let mut event = Event::new("b1");
        service
            .run_action(RunActionArgs {
                bot_id: "b1",
                action_name: "greet",
                action_args: json!({"name": "ada"}),
                action_server: None,
                incoming_event: &mut event,
            })
            .await
            .expect("run");
        assert_eq!(event.state.temp["greeting"], json!("hello ada"));

        // The same bot's code has no ambient os access
        let err = service
            .run_action(RunActionArgs {
                bot_id: "b1",
                action_name: "peek",
                action_args: json!({}),
                action_server: None,
                incoming_event: &mut event,
            })
            .await
            .expect_err("os must be absent in the sandbox");
        assert_eq!(err.action_name, "peek");
    }

    #[tokio::test]
    async fn unknown_action_is_a_normalized_not_found() {
        let store = Arc::new(MemoryContentStore::new());
        let service = service(store);

        let mut event = Event::new("b1");
        let err = service
            .run_action(RunActionArgs {
                bot_id: "b1",
                action_name: "ghost",
                action_args: json!({}),
                action_server: None,
                incoming_event: &mut event,
            })
            .await
            .expect_err("must fail");
        assert_eq!(err.action_name, "ghost");
        assert!(err.message.contains("action not found"));
    }

    #[tokio::test]
    async fn strict_mode_rejects_traversal_before_execution() {
        let store = Arc::new(MemoryContentStore::new());
        store.put(
            StoreScope::Bot("b1".into()),
            "actions/dormant.lua",
            "if false then require('../../../etc/hosts') end\ntemp.ran = true",
        );

        let mut config = RuntimeConfig::new("s3cret");
        config.strict_require_checks = true;
        let strict = service_with(store.clone(), config);

        let mut event = Event::new("b1");
        let err = strict
            .run_action(RunActionArgs {
                bot_id: "b1",
                action_name: "dormant",
                action_args: json!({}),
                action_server: None,
                incoming_event: &mut event,
            })
            .await
            .expect_err("strict mode must reject");
        assert!(err.message.contains("require validation failed"));

        // Without strict mode the dead branch never executes the require
        let lax = service(store);
        let mut event = Event::new("b1");
        lax.run_action(RunActionArgs {
            bot_id: "b1",
            action_name: "dormant",
            action_args: json!({}),
            action_server: None,
            incoming_event: &mut event,
        })
        .await
        .expect("lax mode runs the script");
        assert_eq!(event.state.temp["ran"], json!(true));
    }

    #[tokio::test]
    async fn looping_sandboxed_action_times_out() {
        let store = Arc::new(MemoryContentStore::new());
        store.put(
            StoreScope::Bot("b1".into()),
            "actions/spin.lua",
            "while true do end",
        );
        let service = service(store);

        let started = std::time::Instant::now();
        let mut event = Event::new("b1");
        let err = service
            .run_action(RunActionArgs {
                bot_id: "b1",
                action_name: "spin",
                action_args: json!({}),
                action_server: None,
                incoming_event: &mut event,
            })
            .await
            .expect_err("must time out");
        assert!(err.message.contains("timed out"));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn remote_target_wins_before_catalog_lookup() {
        // Nothing listens on this port and the catalog is empty: a failed
        // delegation (not a NotFound) proves the remote branch runs first
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let store = Arc::new(MemoryContentStore::new());
        let audit = Arc::new(MemoryAuditStore::new());
        let service = ActionService::new(
            RuntimeConfig::new("s3cret"),
            store,
            audit.clone(),
            Arc::new(StaticWorkspaceResolver::single("ws-test")),
        );

        let mut event = Event::new("b1");
        let err = service
            .run_action(RunActionArgs {
                bot_id: "b1",
                action_name: "not-in-catalog",
                action_args: json!({}),
                action_server: Some(
                    ActionServer::new("as-1", &format!("http://{addr}")).expect("server"),
                ),
                incoming_event: &mut event,
            })
            .await
            .expect_err("must fail in transport");
        assert!(err.message.contains("transport error"));
        assert_eq!(audit.tasks().len(), 1);
    }

    #[tokio::test]
    async fn scope_creation_is_idempotent() {
        let store = Arc::new(MemoryContentStore::new());
        let service = service(store);
        let first = service.scope("b1");
        let second = service.scope("b1");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn invalidation_event_forces_fresh_listings() {
        let store = Arc::new(MemoryContentStore::new());
        store.put(StoreScope::Bot("b1".into()), "actions/greet.lua", "temp.x = 1");
        let service = Arc::new(service(store.clone()));

        let (tx, rx) = broadcast::channel(16);
        let _listener = InvalidationListener::spawn(service.clone(), rx);

        let _ = service.list_actions("b1").await.expect("list");
        let reads_before = store.read_count();
        let _ = service.list_actions("b1").await.expect("list");
        assert_eq!(store.read_count(), reads_before);

        tx.send("object::data/bots/b1/actions/greet.lua".to_string())
            .expect("send");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let _ = service.list_actions("b1").await.expect("list");
        assert!(store.read_count() > reads_before);
    }
}
