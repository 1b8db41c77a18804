//! Script execution strategies.
//!
//! Two in-process runners share one machinery: a fresh Lua VM per call, the
//! execution bundle injected as globals, and a `require` proxy that only
//! resolves the fixed capability table plus pre-collected local modules —
//! never the host's loader.
//!
//! The trusted runner hands the script the full standard library and no
//! deadline. The sandboxed runner uses a whitelist-only environment (no
//! `os`, `io`, `debug`, `load`, `loadfile`, `dofile`, `package`) and an
//! instruction-count hook that aborts once the wall-clock deadline passes.

pub mod convert;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua, MultiValue, Table, Value, VmState};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

/// Wall-clock deadline for sandboxed execution.
pub const SANDBOX_TIMEOUT: Duration = Duration::from_millis(5000);

/// Instructions executed between deadline checks.
const INSTRUCTION_CHECK_INTERVAL: u32 = 10_000;

/// Module names scripts may require besides validated local files.
pub const CAPABILITY_MODULES: &[&str] = &["json"];

/// Marker threaded through the Lua error chain by the deadline hook.
const TIMEOUT_SENTINEL: &str = "action deadline exceeded";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("execution timed out after {0} ms")]
    Timeout(u64),

    #[error("{message}")]
    Script {
        message: String,
        stack: Option<String>,
    },

    #[error("runner failure: {0}")]
    Internal(String),
}

/// Values injected into the script environment.
pub struct ExecutionBundle {
    /// The incoming event as JSON; read back mutated after execution.
    pub event: JsonValue,
    /// Caller-supplied action arguments.
    pub args: JsonValue,
    /// Allow-listed environment variables for the restricted `process`
    /// view.
    pub process_env: Vec<(String, String)>,
}

/// Everything a runner needs, owned so it can cross into spawn_blocking.
pub struct ExecutionRequest {
    pub script: String,
    /// Label used in tracebacks and log lines, e.g. the action name.
    pub chunk_name: String,
    /// Directory of the entry script within the actions tree; relative
    /// requires resolve against it.
    pub base_dir: String,
    /// Pre-collected local module sources, keyed by normalized path.
    pub modules: HashMap<String, String>,
    pub bundle: ExecutionBundle,
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Trusted,
    Sandboxed,
}

/// Runs a maintainer-authored script with no isolation boundary and no
/// timeout. Returns the mutated event.
pub async fn run_trusted(request: ExecutionRequest) -> Result<JsonValue, SandboxError> {
    run_blocking(request, Mode::Trusted, None).await
}

/// Runs untrusted code in a whitelist environment under a wall-clock
/// deadline. Returns the mutated event.
pub async fn run_sandboxed(
    request: ExecutionRequest,
    timeout: Duration,
) -> Result<JsonValue, SandboxError> {
    run_blocking(request, Mode::Sandboxed, Some(timeout)).await
}

/// Evaluates a dependent module's top-level chunk in the sandbox
/// environment (require-from-string). Returns whether the module produced
/// any exports.
pub async fn eval_module_exports(
    source: String,
    base_dir: String,
    modules: HashMap<String, String>,
    timeout: Duration,
) -> Result<bool, SandboxError> {
    tokio::task::spawn_blocking(move || {
        let lua = Lua::new();
        let exports = (|| -> mlua::Result<Value> {
            let env = build_sandbox_env(&lua)?;
            install_require(&lua, &env, &base_dir, modules)?;
            arm_deadline(&lua, Instant::now() + timeout);
            let result = lua
                .load(&source)
                .set_name("=module")
                .set_environment(env)
                .eval::<Value>();
            lua.remove_hook();
            result
        })()
        .map_err(|e| map_lua_error(&e, Some(timeout)))?;

        Ok(match exports {
            Value::Nil => false,
            Value::Table(table) => table.clone().pairs::<Value, Value>().next().is_some(),
            _ => true,
        })
    })
    .await
    .map_err(|e| SandboxError::Internal(format!("execution task failed: {e}")))?
}

async fn run_blocking(
    request: ExecutionRequest,
    mode: Mode,
    timeout: Option<Duration>,
) -> Result<JsonValue, SandboxError> {
    tokio::task::spawn_blocking(move || execute(&request, mode, timeout))
        .await
        .map_err(|e| SandboxError::Internal(format!("execution task failed: {e}")))?
}

fn execute(
    request: &ExecutionRequest,
    mode: Mode,
    timeout: Option<Duration>,
) -> Result<JsonValue, SandboxError> {
    let lua = Lua::new();

    let env = match mode {
        Mode::Trusted => lua.globals(),
        Mode::Sandboxed => build_sandbox_env(&lua).map_err(|e| map_lua_error(&e, timeout))?,
    };

    inject_bundle(&lua, &env, request).map_err(|e| map_lua_error(&e, timeout))?;
    install_require(&lua, &env, &request.base_dir, request.modules.clone())
        .map_err(|e| map_lua_error(&e, timeout))?;

    if let Some(timeout) = timeout {
        arm_deadline(&lua, Instant::now() + timeout);
    }

    let result = lua
        .load(&request.script)
        .set_name(format!("={}", request.chunk_name))
        .set_environment(env.clone())
        .exec();
    lua.remove_hook();
    result.map_err(|e| map_lua_error(&e, timeout))?;

    let event: Value = env.get("event").map_err(|e| map_lua_error(&e, timeout))?;
    convert::lua_to_json(&event).map_err(|e| map_lua_error(&e, timeout))
}

/// Whitelist-only environment for untrusted code. Dangerous globals
/// (`os`, `io`, `debug`, `require`, `load`, `loadfile`, `dofile`,
/// `package`) are simply not present.
fn build_sandbox_env(lua: &Lua) -> mlua::Result<Table> {
    let env = lua.create_table()?;
    let globals = lua.globals();

    for name in [
        "tostring",
        "tonumber",
        "type",
        "pairs",
        "ipairs",
        "next",
        "select",
        "error",
        "pcall",
        "xpcall",
        "assert",
        "rawget",
        "rawset",
        "rawlen",
        "rawequal",
        "setmetatable",
        "getmetatable",
        "unpack",
    ] {
        let value: Value = globals.get(name)?;
        if !matches!(value, Value::Nil) {
            env.set(name, value)?;
        }
    }

    for lib in ["math", "string", "table"] {
        let value: Value = globals.get(lib)?;
        if !matches!(value, Value::Nil) {
            env.set(lib, value)?;
        }
    }

    Ok(env)
}

/// Injects the execution-argument bundle: `event`, `args`, the state
/// aliases `user`/`temp`/`session`, the per-call `api` handle, the
/// restricted `process` view, `print` and `print_object`.
fn inject_bundle(lua: &Lua, env: &Table, request: &ExecutionRequest) -> mlua::Result<()> {
    let event = match convert::json_to_lua(lua, &request.bundle.event)? {
        Value::Table(table) => table,
        _ => {
            return Err(mlua::Error::RuntimeError(
                "incoming event must be an object".to_string(),
            ))
        }
    };

    // user/temp/session alias the tables inside event.state, so mutation
    // through either is visible in the returned event
    let state: Table = match event.get::<Value>("state")? {
        Value::Table(table) => table,
        _ => {
            let table = lua.create_table()?;
            event.set("state", table.clone())?;
            table
        }
    };
    for key in ["temp", "user", "session"] {
        let bag: Table = match state.get::<Value>(key)? {
            Value::Table(table) => table,
            _ => {
                let table = lua.create_table()?;
                state.set(key, table.clone())?;
                table
            }
        };
        env.set(key, bag)?;
    }

    env.set("event", event.clone())?;
    env.set("args", convert::json_to_lua(lua, &request.bundle.args)?)?;

    // Capability handle, created fresh per call
    let api = lua.create_table()?;
    let chunk = request.chunk_name.clone();
    api.set(
        "log_info",
        lua.create_function(move |_, msg: String| {
            tracing::info!(target: "action", "[{chunk}] {msg}");
            Ok(())
        })?,
    )?;
    let chunk = request.chunk_name.clone();
    api.set(
        "log_warn",
        lua.create_function(move |_, msg: String| {
            tracing::warn!(target: "action", "[{chunk}] {msg}");
            Ok(())
        })?,
    )?;
    let chunk = request.chunk_name.clone();
    api.set(
        "log_error",
        lua.create_function(move |_, msg: String| {
            tracing::error!(target: "action", "[{chunk}] {msg}");
            Ok(())
        })?,
    )?;
    env.set("api", api)?;

    // Restricted view of process-level globals
    let process = lua.create_table()?;
    let process_env = lua.create_table()?;
    for (key, value) in &request.bundle.process_env {
        process_env.set(key.as_str(), value.as_str())?;
    }
    process.set("env", process_env)?;
    process.set("version", env!("CARGO_PKG_VERSION"))?;
    env.set("process", process)?;

    let chunk = request.chunk_name.clone();
    env.set(
        "print",
        lua.create_function(move |_, args: MultiValue| {
            let line = args.iter().map(lua_display).collect::<Vec<_>>().join("\t");
            debug!(target: "action", "[{chunk}] {line}");
            Ok(())
        })?,
    )?;

    let chunk = request.chunk_name.clone();
    env.set(
        "print_object",
        lua.create_function(move |_, value: Value| {
            let json = convert::lua_to_json(&value)?;
            debug!(
                target: "action",
                "[{chunk}] {}",
                serde_json::to_string_pretty(&json).unwrap_or_default()
            );
            Ok(())
        })?,
    )?;

    Ok(())
}

/// Installs the `require` proxy: a fixed capability table plus the
/// pre-collected local modules, resolved relative to the requiring file.
/// Nothing here touches the host module loader or the filesystem.
fn install_require(
    lua: &Lua,
    env: &Table,
    base_dir: &str,
    modules: HashMap<String, String>,
) -> mlua::Result<()> {
    let loaded = lua.create_table()?;
    let dir_stack = Rc::new(RefCell::new(vec![base_dir.to_string()]));
    let module_env = env.clone();

    let require = lua.create_function(move |lua, name: String| {
        if CAPABILITY_MODULES.contains(&name.as_str()) {
            return capability_module(lua, &name);
        }

        let current = dir_stack.borrow().last().cloned().unwrap_or_default();
        let Some(path) = resolve_module_path(&current, &name) else {
            return Err(mlua::Error::RuntimeError(format!(
                "module '{name}' is outside the permitted lookup roots"
            )));
        };

        let cached: Value = loaded.get(path.as_str())?;
        if !matches!(cached, Value::Nil) {
            return Ok(cached);
        }

        let Some(source) = modules.get(&path) else {
            return Err(mlua::Error::RuntimeError(format!(
                "module '{name}' could not be resolved"
            )));
        };

        // In-progress marker so a require cycle terminates
        loaded.set(path.as_str(), true)?;
        let dir = match path.rfind('/') {
            Some(idx) => path[..idx].to_string(),
            None => String::new(),
        };
        dir_stack.borrow_mut().push(dir);
        let result = lua
            .load(source)
            .set_name(format!("={path}"))
            .set_environment(module_env.clone())
            .eval::<Value>();
        dir_stack.borrow_mut().pop();

        let exports = result?;
        loaded.set(path.as_str(), exports.clone())?;
        Ok(exports)
    })?;

    env.set("require", require)
}

/// Resolves a require literal against the current directory, staying
/// inside the actions tree. `None` marks a path-traversal attempt or an
/// absolute path — both rejected before any file is consulted.
pub fn resolve_module_path(current_dir: &str, name: &str) -> Option<String> {
    if name.starts_with('/') || name.contains('\\') {
        return None;
    }
    let mut parts: Vec<&str> = if name.starts_with('.') {
        current_dir.split('/').filter(|s| !s.is_empty()).collect()
    } else {
        // Bare names resolve from the tree root
        Vec::new()
    };
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn capability_module(lua: &Lua, name: &str) -> mlua::Result<Value> {
    match name {
        "json" => {
            let module = lua.create_table()?;
            module.set(
                "encode",
                lua.create_function(|_, value: Value| {
                    let json = convert::lua_to_json(&value)?;
                    serde_json::to_string(&json)
                        .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
                })?,
            )?;
            module.set(
                "decode",
                lua.create_function(|lua, text: String| {
                    let json: JsonValue = serde_json::from_str(&text)
                        .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                    convert::json_to_lua(lua, &json)
                })?,
            )?;
            Ok(Value::Table(module))
        }
        _ => Err(mlua::Error::RuntimeError(format!(
            "unknown capability module '{name}'"
        ))),
    }
}

fn arm_deadline(lua: &Lua, deadline: Instant) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(INSTRUCTION_CHECK_INTERVAL),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError(TIMEOUT_SENTINEL.to_string()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );
}

fn map_lua_error(err: &mlua::Error, timeout: Option<Duration>) -> SandboxError {
    let message = format_lua_error(err);
    if message.contains(TIMEOUT_SENTINEL) {
        return SandboxError::Timeout(timeout.map_or(0, |t| t.as_millis() as u64));
    }
    SandboxError::Script {
        message,
        stack: Some(err.to_string()),
    }
}

/// Unwraps mlua's error nesting into the message a script author wants.
fn format_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("compile error: {message}"),
        _ => format!("{err}"),
    }
}

fn lua_display(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => format!("{n}"),
        Value::String(s) => s
            .to_str()
            .map_or_else(|_| "<invalid utf8>".into(), |s| s.to_string()),
        other => format!("{other:?}"),
    }
}
