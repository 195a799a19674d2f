//! Sandboxed Lua lifecycle runner.
//!
//! One `Lua` state per smoke run, created on the runner thread. Only the
//! table, string, math and utf8 libraries are opened; each module chunk runs
//! in its own environment table that falls back to a curated base subset.
//! `load`, `dofile`, `loadfile`, `require`, `io`, `os` and `debug` are never
//! reachable.
//!
//! The state is bounded by a memory limit and by a deadline checked from an
//! instruction hook, so a module stuck in a Lua loop is aborted where it runs.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mlua::prelude::*;
use mlua::{DeserializeOptions, HookTriggers, LuaOptions, StdLib, VmState};
use serde_json::Value;
use tracing::debug;

use super::{SmokeLogLine, SmokePhase};
use crate::error::AssemblyError;
use crate::manifest::normalize_relative;

/// Base functions visible to module code.
const SANDBOX_GLOBALS: &[&str] = &[
    "assert",
    "error",
    "getmetatable",
    "ipairs",
    "math",
    "next",
    "pairs",
    "pcall",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "select",
    "setmetatable",
    "string",
    "table",
    "tonumber",
    "tostring",
    "type",
    "utf8",
    "xpcall",
];

pub const LIFECYCLE: [&str; 5] = ["init", "start", "tick", "stop", "dispose"];

/// Lua instructions executed between deadline checks.
const DEADLINE_CHECK_INTERVAL: u32 = 4096;

/// Resource bounds of one smoke run.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub memory_bytes: usize,
    pub timeout: Duration,
}

/// A cached module ready to run.
#[derive(Debug, Clone)]
pub struct RuntimeModule {
    pub id: String,
    pub dir: PathBuf,
    pub entry_path: String,
    pub declared: HashSet<String>,
}

/// What the runner thread hands back.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub logs: Vec<SmokeLogLine>,
    pub state_snapshot: Value,
    pub loaded_modules: Vec<String>,
    pub ticks: u32,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct LogSink {
    phase: Option<SmokePhase>,
    lines: Vec<SmokeLogLine>,
}

impl LogSink {
    fn push(&mut self, module: Option<&str>, message: String) {
        self.lines.push(SmokeLogLine {
            seq: self.lines.len() as u64 + 1,
            phase: self.phase.unwrap_or(SmokePhase::Load),
            module: module.map(str::to_string),
            message,
        });
    }
}

struct Instance {
    runtime_id: String,
    exports: LuaTable,
    ctx: LuaTable,
}

enum RunError {
    Lua(LuaError),
    Fatal(String),
}

impl From<LuaError> for RunError {
    fn from(e: LuaError) -> Self {
        Self::Lua(e)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lua(e) => write!(f, "{}", e),
            Self::Fatal(msg) => write!(f, "{}", msg),
        }
    }
}

struct Session {
    lua: Lua,
    sandbox: LuaTable,
    state: LuaTable,
    sink: Rc<RefCell<LogSink>>,
}

impl Session {
    fn new(limits: RunLimits) -> LuaResult<Self> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )?;
        lua.set_memory_limit(limits.memory_bytes)?;

        let deadline = Instant::now() + limits.timeout;
        let timeout_ms = limits.timeout.as_millis();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(DEADLINE_CHECK_INTERVAL),
            move |_, _| {
                if Instant::now() >= deadline {
                    Err(LuaError::runtime(format!("smoke run exceeded {} ms", timeout_ms)))
                } else {
                    Ok(VmState::Continue)
                }
            },
        )?;

        let globals = lua.globals();
        let sandbox = lua.create_table()?;
        for name in SANDBOX_GLOBALS {
            let value: LuaValue = globals.get(*name)?;
            sandbox.set(*name, value)?;
        }
        let state = lua.create_table()?;

        Ok(Self {
            lua,
            sandbox,
            state,
            sink: Rc::new(RefCell::new(LogSink::default())),
        })
    }

    fn set_phase(&self, phase: SmokePhase) {
        self.sink.borrow_mut().phase = Some(phase);
    }

    fn log_fn(&self, module: String) -> LuaResult<LuaFunction> {
        let sink = Rc::clone(&self.sink);
        self.lua.create_function(move |_, message: String| {
            sink.borrow_mut().push(Some(&module), message);
            Ok(())
        })
    }

    fn emit_fn(&self, module: String) -> LuaResult<LuaFunction> {
        let sink = Rc::clone(&self.sink);
        self.lua
            .create_function(move |lua, (event, payload): (String, LuaValue)| {
                let options = DeserializeOptions::new().deny_unsupported_types(false);
                let payload = match lua.from_value_with::<Value>(payload, options) {
                    Ok(value) => value.to_string(),
                    Err(e) => {
                        debug!(module = %module, event = %event, error = %e, "Emit payload is not convertible");
                        format!("<unserializable: {}>", e)
                    }
                };
                sink.borrow_mut()
                    .push(Some(&module), format!("emit {} {}", event, payload));
                Ok(())
            })
    }

    /// `import(path)` evaluates a declared file of the same module, once.
    fn import_fn(&self, module: &RuntimeModule, env: LuaTable) -> LuaResult<LuaFunction> {
        let dir = module.dir.clone();
        let declared = module.declared.clone();
        let loaded = self.lua.create_table()?;
        self.lua.create_function(move |lua, path: String| {
            let normalized = normalize_relative(&path)
                .filter(|p| declared.contains(p))
                .ok_or_else(|| LuaError::external(format!("import of undeclared file '{}'", path)))?;
            let cached: LuaValue = loaded.get(normalized.as_str())?;
            if !cached.is_nil() {
                return Ok(cached);
            }
            let source = fs::read_to_string(dir.join(&normalized))
                .map_err(|e| LuaError::external(format!("cannot read '{}': {}", normalized, e)))?;
            let value: LuaValue = lua
                .load(&source)
                .set_name(format!("@{}", normalized))
                .set_environment(env.clone())
                .eval()?;
            loaded.set(normalized.as_str(), value.clone())?;
            Ok(value)
        })
    }

    fn module_env(&self, module: &RuntimeModule) -> LuaResult<LuaTable> {
        let env = self.lua.create_table()?;
        let meta = self.lua.create_table()?;
        meta.set("__index", self.sandbox.clone())?;
        env.set_metatable(Some(meta))?;
        env.set("print", self.log_fn(module.id.clone())?)?;
        env.set("import", self.import_fn(module, env.clone())?)?;
        Ok(env)
    }

    fn instantiate(&self, module: &RuntimeModule) -> Result<Instance, RunError> {
        let env = self.module_env(module)?;
        let source = fs::read_to_string(module.dir.join(&module.entry_path)).map_err(|e| {
            RunError::Fatal(format!("{}: cannot read entry '{}': {}", module.id, module.entry_path, e))
        })?;
        let value: LuaValue = self
            .lua
            .load(&source)
            .set_name(format!("@{}/{}", module.id, module.entry_path))
            .set_environment(env)
            .eval()?;

        let invalid = |missing: Vec<&str>| {
            RunError::Fatal(
                AssemblyError::InvalidRuntimeModule {
                    module: module.id.clone(),
                    missing: missing.join(", "),
                }
                .to_string(),
            )
        };
        let exports = match value {
            LuaValue::Table(t) => t,
            _ => return Err(invalid(LIFECYCLE.to_vec())),
        };
        let mut missing = vec![];
        for op in LIFECYCLE {
            if !matches!(exports.get::<LuaValue>(op)?, LuaValue::Function(_)) {
                missing.push(op);
            }
        }
        if !missing.is_empty() {
            return Err(invalid(missing));
        }

        let runtime_id = match exports.get::<LuaValue>("id")? {
            LuaValue::String(s) => s.to_str()?.to_string(),
            _ => module.id.clone(),
        };

        let ctx = self.lua.create_table()?;
        ctx.set("id", runtime_id.as_str())?;
        ctx.set("state", self.state.clone())?;
        ctx.set("log", self.log_fn(runtime_id.clone())?)?;
        ctx.set("emit", self.emit_fn(runtime_id.clone())?)?;

        Ok(Instance {
            runtime_id,
            exports,
            ctx,
        })
    }

    fn call(&self, instance: &Instance, phase: SmokePhase, tick: Option<u32>) -> Result<(), RunError> {
        let op: LuaFunction = instance.exports.get(phase.as_str())?;
        let result = match tick {
            Some(n) => op.call::<()>((instance.ctx.clone(), n)),
            None => op.call::<()>(instance.ctx.clone()),
        };
        result.map_err(|e| {
            RunError::Fatal(format!("{} failed in {}: {}", instance.runtime_id, phase.as_str(), e))
        })
    }

    fn snapshot(&self) -> LuaResult<Value> {
        self.lua.from_value_with(
            LuaValue::Table(self.state.clone()),
            DeserializeOptions::new().deny_unsupported_types(false),
        )
    }
}

/// Load every module, then drive the lifecycle across all of them in order.
pub fn run_lifecycle(modules: &[RuntimeModule], ticks: u32, limits: RunLimits) -> RunOutcome {
    let session = match Session::new(limits) {
        Ok(s) => s,
        Err(e) => return RunOutcome::failed(format!("cannot create Lua runtime: {}", e)),
    };

    let mut outcome = RunOutcome::default();
    let result = drive(&session, modules, ticks, &mut outcome);
    outcome.error = result.err().map(|e| e.to_string());
    outcome.state_snapshot = match session.snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            debug!(error = %e, "State snapshot is not convertible");
            session
                .sink
                .borrow_mut()
                .push(None, format!("state snapshot unavailable: {}", e));
            Value::Null
        }
    };
    outcome.logs = std::mem::take(&mut session.sink.borrow_mut().lines);
    outcome
}

fn drive(
    session: &Session,
    modules: &[RuntimeModule],
    ticks: u32,
    outcome: &mut RunOutcome,
) -> Result<(), RunError> {
    session.set_phase(SmokePhase::Load);
    let mut instances = Vec::with_capacity(modules.len());
    for module in modules {
        let instance = session.instantiate(module)?;
        outcome.loaded_modules.push(instance.runtime_id.clone());
        instances.push(instance);
    }

    for phase in [SmokePhase::Init, SmokePhase::Start] {
        session.set_phase(phase);
        for instance in &instances {
            session.call(instance, phase, None)?;
        }
    }

    session.set_phase(SmokePhase::Tick);
    for n in 1..=ticks {
        for instance in &instances {
            session.call(instance, SmokePhase::Tick, Some(n))?;
        }
        outcome.ticks = n;
    }

    for phase in [SmokePhase::Stop, SmokePhase::Dispose] {
        session.set_phase(phase);
        for instance in &instances {
            session.call(instance, phase, None)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const LIFECYCLE_MODULE: &str = r#"
local M = { id = "combat-runtime" }
function M.init(ctx) ctx.state.hits = 0 end
function M.start(ctx) ctx.log("started") end
function M.tick(ctx, n) ctx.state.hits = ctx.state.hits + n end
function M.stop(ctx) ctx.emit("combat.done", { hits = ctx.state.hits }) end
function M.dispose(ctx) end
return M
"#;

    fn limits() -> RunLimits {
        RunLimits {
            memory_bytes: 16 * 1024 * 1024,
            timeout: Duration::from_secs(10),
        }
    }

    fn module(dir: &Path, id: &str, files: &[(&str, &str)]) -> RuntimeModule {
        let root = dir.join(id);
        for (path, content) in files {
            let target = root.join(path);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(target, content).unwrap();
        }
        RuntimeModule {
            id: id.to_string(),
            dir: root,
            entry_path: "main.lua".to_string(),
            declared: files.iter().map(|(p, _)| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let m = module(dir.path(), "combat", &[("main.lua", LIFECYCLE_MODULE)]);
        let outcome = run_lifecycle(&[m], 5, limits());
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.ticks, 5);
        assert_eq!(outcome.loaded_modules, vec!["combat-runtime"]);
        assert_eq!(outcome.state_snapshot["hits"], serde_json::json!(15));
        assert_eq!(outcome.logs[0].message, "started");
        assert_eq!(outcome.logs[0].phase, SmokePhase::Start);
        assert!(outcome.logs[1].message.starts_with("emit combat.done"));
    }

    #[test]
    fn test_missing_operations_named() {
        let dir = tempfile::tempdir().unwrap();
        let m = module(
            dir.path(),
            "combat",
            &[("main.lua", "return { init = function() end, tick = function() end }")],
        );
        let outcome = run_lifecycle(&[m], 1, limits());
        let error = outcome.error.unwrap();
        assert!(error.contains("start, stop, dispose"), "{}", error);
    }

    #[test]
    fn test_sandbox_hides_dangerous_globals() {
        let dir = tempfile::tempdir().unwrap();
        let inspector = r#"
local M = {}
function M.init(ctx)
  ctx.state.os = type(os)
  ctx.state.io = type(io)
  ctx.state.loader = type(dofile)
end
function M.start() end
function M.tick() end
function M.stop() end
function M.dispose() end
return M
"#;
        let m = module(dir.path(), "inspector", &[("main.lua", inspector)]);
        let outcome = run_lifecycle(&[m], 1, limits());
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.state_snapshot["os"], "nil");
        assert_eq!(outcome.state_snapshot["io"], "nil");
        assert_eq!(outcome.state_snapshot["loader"], "nil");
    }

    #[test]
    fn test_import_restricted_to_declared_files() {
        let dir = tempfile::tempdir().unwrap();
        let entry = r#"
local util = import("lib/util.lua")
local M = {}
function M.init(ctx) ctx.state.answer = util.answer end
function M.start() end
function M.tick() end
function M.stop() end
function M.dispose() end
return M
"#;
        let m = module(
            dir.path(),
            "combat",
            &[("main.lua", entry), ("lib/util.lua", "return { answer = 42 }")],
        );
        let outcome = run_lifecycle(&[m], 1, limits());
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.state_snapshot["answer"], serde_json::json!(42));

        let sneaky = module(dir.path(), "sneaky", &[("main.lua", "return import('../combat/main.lua')")]);
        let outcome = run_lifecycle(&[sneaky], 1, limits());
        assert!(outcome.error.unwrap().contains("undeclared"));
    }

    #[test]
    fn test_runtime_error_reports_phase() {
        let dir = tempfile::tempdir().unwrap();
        let entry = r#"
local M = {}
function M.init() end
function M.start() end
function M.tick(ctx, n) if n == 2 then error("boom") end end
function M.stop() end
function M.dispose() end
return M
"#;
        let m = module(dir.path(), "combat", &[("main.lua", entry)]);
        let outcome = run_lifecycle(&[m], 5, limits());
        assert_eq!(outcome.ticks, 1);
        let error = outcome.error.unwrap();
        assert!(error.contains("combat failed in tick"));
        assert!(error.contains("boom"));
    }

    #[test]
    fn test_deadline_aborts_running_loop() {
        let dir = tempfile::tempdir().unwrap();
        let entry = r#"
local M = {}
function M.init() end
function M.start() while true do end end
function M.tick() end
function M.stop() end
function M.dispose() end
return M
"#;
        let m = module(dir.path(), "spinner", &[("main.lua", entry)]);
        let started = Instant::now();
        let outcome = run_lifecycle(
            &[m],
            1,
            RunLimits {
                timeout: Duration::from_millis(200),
                ..limits()
            },
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.ticks, 0);
        let error = outcome.error.unwrap();
        assert!(error.contains("spinner failed in start"), "{}", error);
        assert!(error.contains("exceeded 200 ms"), "{}", error);
    }

    #[test]
    fn test_memory_limit_fails_growing_module() {
        let dir = tempfile::tempdir().unwrap();
        let entry = r#"
local M = {}
function M.init(ctx)
  local hoard = {}
  for i = 1, 10000000 do hoard[i] = string.rep("x", 64) .. i end
  ctx.state.size = #hoard
end
function M.start() end
function M.tick() end
function M.stop() end
function M.dispose() end
return M
"#;
        let m = module(dir.path(), "hoarder", &[("main.lua", entry)]);
        let outcome = run_lifecycle(
            &[m],
            1,
            RunLimits {
                memory_bytes: 4 * 1024 * 1024,
                ..limits()
            },
        );
        let error = outcome.error.unwrap();
        assert!(error.contains("hoarder failed in init"), "{}", error);
        assert!(error.contains("memory"), "{}", error);
        assert_eq!(outcome.state_snapshot.get("size"), None);
    }

    #[test]
    fn test_unconvertible_values_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let entry = r#"
local M = {}
function M.init(ctx) ctx.state.me = ctx.state end
function M.start() end
function M.tick() end
function M.stop(ctx)
  local loop = {}
  loop.again = loop
  ctx.emit("loop.made", loop)
end
function M.dispose() end
return M
"#;
        let m = module(dir.path(), "cyclic", &[("main.lua", entry)]);
        let outcome = run_lifecycle(&[m], 1, limits());
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.state_snapshot, Value::Null);

        let emitted = &outcome.logs[0];
        assert_eq!(emitted.phase, SmokePhase::Stop);
        assert!(emitted.message.starts_with("emit loop.made <unserializable: "), "{}", emitted.message);

        let last = outcome.logs.last().unwrap();
        assert_eq!(last.module, None);
        assert!(last.message.starts_with("state snapshot unavailable: "), "{}", last.message);
    }
}
