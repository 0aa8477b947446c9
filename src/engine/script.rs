/// Script node execution using embedded Lua
///
/// Runs a stored user transform against the current payload inside a
/// restricted mlua instance. The guard rails are deliberate and documented:
/// a coarse substring denylist (not a semantic sandbox), nil-ed host-escape
/// globals, an in-VM instruction hook that aborts past the deadline, and a
/// host-side watchdog around the blocking worker as backup.

use crate::engine::error::ScriptError;
use crate::flow::store::EntityStore;
use crate::flow::types::FlowNode;
use crate::history::records::NodeRunStatus;
use crate::history::store::HistoryStore;
use mlua::{Lua, LuaSerdeExt};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Substrings rejected before execution
///
/// SECURITY: coarse lexical filter, not semantic analysis. Covers dynamic
/// evaluation, host/global escape hatches, and the obvious unbounded loops.
const DENYLIST: &[&str] = &[
    "eval(",
    "load(",
    "loadstring",
    "loadfile",
    "dofile",
    "require",
    "os.",
    "io.",
    "debug.",
    "package.",
    "_G",
    "_ENV",
    "rawget",
    "rawset",
    "getmetatable",
    "setmetatable",
    "coroutine.",
    "collectgarbage",
    "while true",
    "repeat until false",
];

/// Globals removed from the Lua instance before user code loads
const BLOCKED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "debug",
    "package",
    "require",
    "dofile",
    "loadfile",
    "load",
    "loadstring",
    "collectgarbage",
];

/// Conventional transform entry points, checked in priority order
const CONVENTIONAL_NAMES: &[&str] = &["decodeUplink", "processData", "decoder", "process"];

/// Instruction interval between deadline checks inside the VM
const HOOK_INSTRUCTION_INTERVAL: u32 = 9999;

/// Conversion depth cap; cyclic and absurdly nested results degrade to a
/// string fallback instead of overflowing the stack
const MAX_CONVERSION_DEPTH: usize = 32;

/// Extra wall-clock grace given to the host watchdog over the script budget
const WATCHDOG_GRACE: Duration = Duration::from_secs(1);

/// Outcome of one script-node execution
#[derive(Debug)]
pub struct ScriptNodeOutcome {
    /// Normalized modified payload, or the typed failure
    pub result: Result<Value, ScriptError>,
    /// History record id, when one could be written
    pub record_id: Option<i64>,
    /// Wall-clock execution time
    pub execution_time_ms: i64,
}

/// Executes function nodes and records their history
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    store: Arc<EntityStore>,
    history: Arc<HistoryStore>,
    /// Wall-clock budget per script execution
    timeout: Duration,
}

impl ScriptExecutor {
    pub fn new(store: Arc<EntityStore>, history: Arc<HistoryStore>, timeout: Duration) -> Self {
        Self {
            store,
            history,
            timeout,
        }
    }

    /// Execute a function node against the current payload
    ///
    /// Always writes exactly one ScriptExecutionRecord for an existing
    /// function, including denylist rejections and timeouts. A node whose
    /// attributes cannot be resolved to a stored function produces an error
    /// result without a record.
    pub async fn execute_function_node(
        &self,
        node: &FlowNode,
        payload: &Value,
        flow_id: Option<i64>,
    ) -> ScriptNodeOutcome {
        tracing::debug!("🧠 Executing function node: {}", node.id);

        let function_id = match node.entity_id("functionId") {
            Some(id) => id,
            None => {
                tracing::error!("❌ Function node {} has no usable function id", node.id);
                return ScriptNodeOutcome {
                    result: Err(ScriptError::MissingFunctionId),
                    record_id: None,
                    execution_time_ms: 0,
                };
            }
        };

        let function = match self.store.get_function(function_id).await {
            Ok(Some(function)) => function,
            Ok(None) => {
                tracing::error!("❌ Function with ID {} not found", function_id);
                return ScriptNodeOutcome {
                    result: Err(ScriptError::FunctionNotFound(function_id)),
                    record_id: None,
                    execution_time_ms: 0,
                };
            }
            Err(e) => {
                tracing::error!("❌ Function lookup failed for ID {}: {}", function_id, e);
                return ScriptNodeOutcome {
                    result: Err(ScriptError::FunctionNotFound(function_id)),
                    record_id: None,
                    execution_time_ms: 0,
                };
            }
        };

        let code = match function.code.as_deref() {
            Some(code) if !code.trim().is_empty() => code.to_string(),
            _ => {
                tracing::error!("❌ Function {} has no code", function_id);
                return ScriptNodeOutcome {
                    result: Err(ScriptError::FunctionNotFound(function_id)),
                    record_id: None,
                    execution_time_ms: 0,
                };
            }
        };

        let record_id = self
            .history
            .begin_function_run(function_id, flow_id, payload)
            .await;

        let start = Instant::now();
        let result = self.run_script(&code, payload).await;
        let execution_time_ms = start.elapsed().as_millis() as i64;

        match &result {
            Ok(output) => {
                tracing::info!(
                    "✅ Function {} ({}) executed successfully in {}ms",
                    function.name,
                    function_id,
                    execution_time_ms
                );
                if let Some(id) = record_id {
                    self.history
                        .finish_function_run(id, NodeRunStatus::Success, Some(output), None, execution_time_ms)
                        .await;
                }
            }
            Err(e) => {
                tracing::error!(
                    "❌ Function {} ({}) failed in {}ms: {}",
                    function.name,
                    function_id,
                    execution_time_ms,
                    e
                );
                if let Some(id) = record_id {
                    self.history
                        .finish_function_run(
                            id,
                            NodeRunStatus::Error,
                            None,
                            Some(&e.to_string()),
                            execution_time_ms,
                        )
                        .await;
                }
            }
        }

        // Last-write-wins status on the owning function entity
        let entity_status = if result.is_ok() { "success" } else { "error" };
        if let Err(e) = self.store.update_function_status(function_id, entity_status).await {
            tracing::warn!("⚠️ Could not update function {} status: {}", function_id, e);
        }

        ScriptNodeOutcome {
            result,
            record_id,
            execution_time_ms,
        }
    }

    /// Run a script source against a payload with the configured budget
    ///
    /// The VM work runs on a blocking worker; the instruction hook aborts it
    /// once the deadline passes, and the tokio timeout around the join handle
    /// is the backstop if the VM never reaches a check point.
    pub async fn run_script(&self, code: &str, payload: &Value) -> Result<Value, ScriptError> {
        if let Some(pattern) = DENYLIST.iter().find(|pattern| code.contains(*pattern)) {
            tracing::warn!("🚨 Blocked denylisted script pattern: {}", pattern);
            return Err(ScriptError::Denylisted(pattern.to_string()));
        }

        let budget = self.timeout;
        let code = code.to_string();
        let input = payload.clone();
        let started = Instant::now();

        let worker = tokio::task::spawn_blocking(move || run_lua(&code, &input, budget));

        match tokio::time::timeout(budget + WATCHDOG_GRACE, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ScriptError::Runtime(join_error.to_string())),
            Err(_) => Err(ScriptError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as i64,
            }),
        }
    }
}

/// Synchronous Lua execution, called on a blocking worker
fn run_lua(code: &str, input: &Value, budget: Duration) -> Result<Value, ScriptError> {
    let lua = Lua::new();
    let globals = lua.globals();

    for name in BLOCKED_GLOBALS {
        let _ = globals.set(*name, mlua::Nil);
    }

    // In-VM deadline check, fired every few thousand instructions
    let started = Instant::now();
    let timed_out = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&timed_out);
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_, _| {
            if started.elapsed() > budget {
                flag.store(true, Ordering::SeqCst);
                return Err(mlua::Error::RuntimeError(
                    "execution deadline exceeded".to_string(),
                ));
            }
            Ok(mlua::VmState::Continue)
        },
    );

    let classify = |e: mlua::Error| -> ScriptError {
        if timed_out.load(Ordering::SeqCst) {
            ScriptError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as i64,
            }
        } else {
            ScriptError::Runtime(e.to_string())
        }
    };

    let lua_input = lua
        .to_value(input)
        .map_err(|e| ScriptError::Runtime(e.to_string()))?;
    globals
        .set("input", lua_input.clone())
        .map_err(|e| ScriptError::Runtime(e.to_string()))?;

    // Names present before the user chunk runs, so the fallback search below
    // only considers functions the user actually defined
    let baseline: HashSet<String> = globals
        .clone()
        .pairs::<String, mlua::Value>()
        .filter_map(|pair| pair.ok().map(|(name, _)| name))
        .collect();

    lua.load(code).exec().map_err(&classify)?;

    let mut callable: Option<mlua::Function> = None;
    for name in CONVENTIONAL_NAMES {
        if let Ok(function) = globals.get::<mlua::Function>(*name) {
            callable = Some(function);
            break;
        }
    }
    if callable.is_none() {
        for pair in globals.clone().pairs::<String, mlua::Value>() {
            let Ok((name, value)) = pair else { continue };
            if baseline.contains(&name) {
                continue;
            }
            if let mlua::Value::Function(function) = value {
                callable = Some(function);
                break;
            }
        }
    }

    let raw = match callable {
        Some(function) => function.call::<mlua::Value>(lua_input).map_err(&classify)?,
        // No callable at all: the payload passes through unchanged
        None => return Ok(normalize_output(input.clone())),
    };

    let mut truncated = false;
    let converted = lua_to_json(&raw, 0, &mut truncated);
    if truncated {
        // Cyclic or bottomless structure: keep the record, degrade the data
        return Ok(json!({
            "error": "Non-serializable result",
            "data": crate::history::store::truncate_chars(&converted.to_string(), 500),
        }));
    }

    Ok(normalize_output(converted))
}

/// Convert a Lua value to JSON
///
/// Tables with contiguous 1..n integer keys become arrays, everything else
/// becomes an object. Non-finite floats become null. Values with no JSON
/// counterpart are replaced by a tagged string. Recursion past the depth cap
/// (cyclic tables reference themselves forever) sets the truncated flag.
fn lua_to_json(value: &mlua::Value, depth: usize, truncated: &mut bool) -> Value {
    if depth >= MAX_CONVERSION_DEPTH {
        *truncated = true;
        return Value::Null;
    }
    match value {
        mlua::Value::Nil => Value::Null,
        mlua::Value::Boolean(b) => Value::Bool(*b),
        mlua::Value::Integer(i) => json!(*i),
        mlua::Value::Number(f) => match serde_json::Number::from_f64(*f) {
            Some(n) => Value::Number(n),
            None => Value::Null,
        },
        mlua::Value::String(s) => match s.to_str() {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::String(String::from_utf8_lossy(&s.as_bytes()).to_string()),
        },
        mlua::Value::Table(table) => {
            let mut is_array = true;
            let mut max_index = 0usize;
            let mut count = 0usize;

            for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
                let Ok((key, _)) = pair else {
                    is_array = false;
                    break;
                };
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => {
                        max_index = max_index.max(i as usize);
                    }
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut array = Vec::with_capacity(count);
                for i in 1..=max_index {
                    let item: mlua::Value = table.get(i).unwrap_or(mlua::Value::Nil);
                    array.push(lua_to_json(&item, depth + 1, truncated));
                }
                Value::Array(array)
            } else {
                let mut object = Map::new();
                for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
                    let Ok((key, item)) = pair else { continue };
                    let key = match key {
                        mlua::Value::String(s) => match s.to_str() {
                            Ok(text) => text.to_string(),
                            Err(_) => continue,
                        },
                        mlua::Value::Integer(i) => i.to_string(),
                        mlua::Value::Number(f) => f.to_string(),
                        _ => continue,
                    };
                    object.insert(key, lua_to_json(&item, depth + 1, truncated));
                }
                Value::Object(object)
            }
        }
        // The JSON-null sentinel used by the serde bridge
        mlua::Value::LightUserData(_) => Value::Null,
        other => Value::String(format!("<{}>", other.type_name())),
    }
}

/// Coerce a transform result into the persisted payload shape
///
/// Structured maps pass through; everything else is wrapped under a `data`
/// key. A result that still fails serialization is replaced by an
/// error-shaped fallback rather than dropped.
fn normalize_output(result: Value) -> Value {
    let shaped = match result {
        Value::Object(map) => Value::Object(map),
        other => json!({ "data": other }),
    };

    match serde_json::to_string(&shaped) {
        Ok(_) => shaped,
        Err(e) => json!({
            "error": "Non-serializable result",
            "data": crate::history::store::truncate_chars(&format!("{:?}", e), 500),
        }),
    }
}
