//! Assembler Configuration
//!
//! Loaded from TOML. Every field has a default so an empty file is valid.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AssemblyError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    /// Directory holding one workspace per build id.
    pub workspace_root: PathBuf,
    /// Directory holding one sub-directory per module.
    pub modules_root: PathBuf,
    /// Template registry document.
    pub registry_path: PathBuf,
    /// Smoke harness module cache, shared across builds.
    pub cache_root: PathBuf,
    pub build_id_prefix: String,
    pub manifest_file_name: String,
    /// Namespace root inside the assembly tree (`<namespace>/<moduleId>/...`).
    pub module_namespace: String,
    pub capabilities: CapabilityAllowlist,
    pub smoke: SmokeConfig,
    pub security: SecurityConfig,
    pub export: ExportConfig,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("builds"),
            modules_root: PathBuf::from("modules"),
            registry_path: PathBuf::from("templates/registry.json"),
            cache_root: PathBuf::from(".cache/smoke"),
            build_id_prefix: "build".to_string(),
            manifest_file_name: "module.json".to_string(),
            module_namespace: "modules".to_string(),
            capabilities: CapabilityAllowlist::default(),
            smoke: SmokeConfig::default(),
            security: SecurityConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl AssemblerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AssemblyError::ConfigInvalid(e.to_string()))
    }

    /// Point every directory at a single root (tests and one-off runs).
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            workspace_root: root.join("builds"),
            modules_root: root.join("modules"),
            registry_path: root.join("templates/registry.json"),
            cache_root: root.join(".cache/smoke"),
            ..Self::default()
        }
    }
}

/// Capabilities that need no explicit provider (core/system-provided).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityAllowlist {
    pub implicit_prefixes: Vec<String>,
}

impl Default for CapabilityAllowlist {
    fn default() -> Self {
        Self {
            implicit_prefixes: vec!["core.".to_string(), "system.".to_string()],
        }
    }
}

impl CapabilityAllowlist {
    pub fn none() -> Self {
        Self { implicit_prefixes: vec![] }
    }

    pub fn allows(&self, name: &str) -> bool {
        self.implicit_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmokeConfig {
    pub ticks: u32,
    pub timeout_ms: u64,
    pub memory_limit_bytes: usize,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            ticks: 5,
            timeout_ms: 10_000,
            memory_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// File extensions (without dot) that are scanned.
    pub extensions: Vec<String>,
    pub rules: Vec<SecurityRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRuleConfig {
    pub id: String,
    pub pattern: String,
    pub message: String,
}

impl SecurityRuleConfig {
    fn new(id: &str, pattern: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            message: message.to_string(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            extensions: ["lua", "js", "mjs", "ts"].iter().map(|s| s.to_string()).collect(),
            rules: vec![
                SecurityRuleConfig::new(
                    "dynamic-eval",
                    r"\b(load|loadstring|eval)\s*\(",
                    "dynamic code evaluation is forbidden",
                ),
                SecurityRuleConfig::new(
                    "dynamic-function",
                    r"\bnew\s+Function\s*\(",
                    "dynamic code evaluation is forbidden",
                ),
                SecurityRuleConfig::new(
                    "file-loader",
                    r"\b(dofile|loadfile|require)\b",
                    "ambient module loading is forbidden, use import()",
                ),
                SecurityRuleConfig::new(
                    "process-escape",
                    r"\bos\.(execute|remove|rename|exit|getenv|tmpname)\b|\bchild_process\b",
                    "process and environment access is forbidden",
                ),
                SecurityRuleConfig::new(
                    "filesystem-escape",
                    r"\bio\.(open|popen|lines|read|write|output|input)\b|\bfs\.(readFile|writeFile|unlink)",
                    "filesystem access is forbidden",
                ),
                SecurityRuleConfig::new(
                    "network-escape",
                    r"\b(fetch|XMLHttpRequest|WebSocket)\s*\(|\bsocket\.",
                    "network access is forbidden",
                ),
                SecurityRuleConfig::new(
                    "debug-library",
                    r"\bdebug\.[a-z]+",
                    "debug library access is forbidden",
                ),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Report file names copied into `export/reports/`.
    pub reports: Vec<String>,
    pub assets_dir: Option<PathBuf>,
    pub runtime_dir: Option<PathBuf>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            reports: [
                "validation-report.json",
                "dependency-graph.json",
                "integration-report.json",
                "security-report.json",
                "module-selection.json",
                "assembly-plan.json",
                "assembly-report.json",
                "runtime-smoke.json",
                "build-manifest.json",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            assets_dir: None,
            runtime_dir: None,
        }
    }
}
