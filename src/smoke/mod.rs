//! Runtime Smoke Harness
//!
//! Caches each module's declared files, then loads every entry point into a
//! sandboxed Lua runtime and drives init, start, tick, stop and dispose.
//! Execution happens on a dedicated thread. The Lua state aborts itself once
//! the configured timeout passes; if the runner still does not answer within
//! a grace period after that, the run is failed and the thread abandoned.

pub mod cache;
pub mod lua;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use self::lua::RunLimits;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SmokeConfig;
use crate::error::Result;
use crate::hashing::sha256_hex;

pub use cache::{CacheEntry, ModuleCache};

/// How long past its timeout a runner may take to report before it is abandoned.
const RUNNER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SmokePhase {
    Load,
    Init,
    Start,
    Tick,
    Stop,
    Dispose,
}

impl SmokePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Init => "init",
            Self::Start => "start",
            Self::Tick => "tick",
            Self::Stop => "stop",
            Self::Dispose => "dispose",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmokeLogLine {
    pub seq: u64,
    pub phase: SmokePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmokeResult {
    pub ok: bool,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ticks: u32,
    pub logs: Vec<SmokeLogLine>,
    pub state_snapshot: Value,
    pub loaded_modules: Vec<String>,
    pub cache: Vec<CacheEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SmokeResult {
    /// The harness did not run.
    pub fn skipped(reason: &str) -> Self {
        let now = Utc::now();
        Self {
            ok: false,
            skipped: true,
            reason: Some(reason.to_string()),
            error: None,
            ticks: 0,
            logs: vec![],
            state_snapshot: Value::Null,
            loaded_modules: vec![],
            cache: vec![],
            started_at: now,
            finished_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmokeFile {
    pub path: String,
    pub content_hash: String,
    pub content: Vec<u8>,
}

impl SmokeFile {
    pub fn new(path: &str, content: Vec<u8>) -> Self {
        Self {
            path: path.to_string(),
            content_hash: sha256_hex(&content),
            content,
        }
    }
}

/// A module as handed to the harness, in integration order.
#[derive(Debug, Clone)]
pub struct SmokeModule {
    pub id: String,
    pub entry_path: String,
    pub files: Vec<SmokeFile>,
}

pub struct SmokeHarness {
    cache: ModuleCache,
    ticks: u32,
    timeout: Duration,
    memory_limit: usize,
}

impl SmokeHarness {
    pub fn new(cache_root: impl Into<PathBuf>, config: &SmokeConfig) -> Self {
        Self {
            cache: ModuleCache::new(cache_root),
            ticks: config.ticks,
            timeout: Duration::from_millis(config.timeout_ms),
            memory_limit: config.memory_limit_bytes,
        }
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    /// Cache failures are errors; anything the modules do wrong is a failed result.
    pub fn run(&self, modules: &[SmokeModule]) -> Result<SmokeResult> {
        let started_at = Utc::now();

        let mut cache = Vec::with_capacity(modules.len());
        let mut runtime = Vec::with_capacity(modules.len());
        for module in modules {
            let (entry, dir) = self.cache.ensure(module)?;
            runtime.push(lua::RuntimeModule {
                id: module.id.clone(),
                dir,
                entry_path: module.entry_path.clone(),
                declared: module.files.iter().map(|f| f.path.clone()).collect::<HashSet<_>>(),
            });
            cache.push(entry);
        }
        debug!(modules = runtime.len(), reused = cache.iter().filter(|c| c.reused).count(), "Smoke cache ready");

        let (tx, rx) = mpsc::channel();
        let ticks = self.ticks;
        let limits = RunLimits {
            memory_bytes: self.memory_limit,
            timeout: self.timeout,
        };
        let runner = thread::Builder::new()
            .name("smoke-runner".to_string())
            .spawn(move || {
                let _ = tx.send(lua::run_lifecycle(&runtime, ticks, limits));
            })?;

        let outcome = match rx.recv_timeout(self.timeout + RUNNER_GRACE) {
            Ok(outcome) => {
                if runner.join().is_err() {
                    warn!("Smoke runner panicked after reporting");
                }
                outcome
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Smoke runner unresponsive, abandoned");
                lua::RunOutcome::failed(format!(
                    "smoke runner unresponsive {} ms after its deadline",
                    RUNNER_GRACE.as_millis()
                ))
            }
            Err(RecvTimeoutError::Disconnected) => lua::RunOutcome::failed("smoke runner terminated unexpectedly"),
        };

        let ok = outcome.error.is_none();
        match &outcome.error {
            None => info!(modules = modules.len(), ticks = outcome.ticks, "Smoke run passed"),
            Some(error) => warn!(error = %error, "Smoke run failed"),
        }

        Ok(SmokeResult {
            ok,
            skipped: false,
            reason: None,
            error: outcome.error,
            ticks: outcome.ticks,
            logs: outcome.logs,
            state_snapshot: outcome.state_snapshot,
            loaded_modules: outcome.loaded_modules,
            cache,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(id: &str, source: &str) -> SmokeModule {
        SmokeModule {
            id: id.to_string(),
            entry_path: "main.lua".to_string(),
            files: vec![SmokeFile::new("main.lua", source.as_bytes().to_vec())],
        }
    }

    const COUNTER: &str = r#"
local M = {}
function M.init(ctx) ctx.state.count = 0 end
function M.start() end
function M.tick(ctx) ctx.state.count = ctx.state.count + 1 end
function M.stop() end
function M.dispose() end
return M
"#;

    #[test]
    fn test_run_and_cache_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let harness = SmokeHarness::new(dir.path(), &SmokeConfig::default());

        let first = harness.run(&[module("counter", COUNTER)]).unwrap();
        assert!(first.ok, "{:?}", first.error);
        assert_eq!(first.ticks, 5);
        assert_eq!(first.state_snapshot["count"], serde_json::json!(5));
        assert!(!first.cache[0].reused);

        let second = harness.run(&[module("counter", COUNTER)]).unwrap();
        assert!(second.cache[0].reused);
        assert_eq!(first.cache[0].cache_key, second.cache[0].cache_key);
    }

    #[test]
    fn test_timeout_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = SmokeConfig {
            timeout_ms: 200,
            ..SmokeConfig::default()
        };
        let harness = SmokeHarness::new(dir.path(), &config);
        let spinning = COUNTER.replace(
            "function M.start() end",
            "function M.start() while true do end end",
        );
        let started = std::time::Instant::now();
        let result = harness.run(&[module("spinner", &spinning)]).unwrap();
        assert!(started.elapsed() < Duration::from_millis(200) + RUNNER_GRACE);
        assert!(!result.ok);
        let error = result.error.unwrap();
        // aborted inside the module, not left spinning behind the grace period
        assert!(error.contains("spinner failed in start"), "{}", error);
        assert!(error.contains("exceeded 200 ms"), "{}", error);
        assert_eq!(result.ticks, 0);
    }

    #[test]
    fn test_memory_limit_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = SmokeConfig {
            memory_limit_bytes: 4 * 1024 * 1024,
            ..SmokeConfig::default()
        };
        let harness = SmokeHarness::new(dir.path(), &config);
        let growing = COUNTER.replace(
            "function M.tick(ctx) ctx.state.count = ctx.state.count + 1 end",
            "function M.tick(ctx)\n  ctx.state.hoard = ctx.state.hoard or {}\n  for i = 1, 10000000 do ctx.state.hoard[#ctx.state.hoard + 1] = string.rep(\"y\", 64) .. i end\nend",
        );
        let result = harness.run(&[module("hoarder", &growing)]).unwrap();
        assert!(!result.ok);
        let error = result.error.unwrap();
        assert!(error.contains("hoarder failed in tick"), "{}", error);
        assert!(error.contains("memory"), "{}", error);
    }

    #[test]
    fn test_skipped_shape() {
        let result = SmokeResult::skipped("missing-modules");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["skipped"], true);
        assert_eq!(json["reason"], "missing-modules");
    }
}
