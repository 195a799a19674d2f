//! Build Workspaces
//!
//! One directory per build id. A workspace is only trusted once its terminal
//! report exists; an abandoned build is discarded by deleting the directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub const ARTIFACTS_DIR: &str = "artifacts";
pub const REPORTS_DIR: &str = "reports";
pub const ASSEMBLY_DIR: &str = "assembly";
pub const EXPORT_DIR: &str = "export";
pub const DIST_DIR: &str = "dist";

pub const VALIDATION_REPORT: &str = "validation-report.json";
pub const DEPENDENCY_GRAPH_REPORT: &str = "dependency-graph.json";
pub const INTEGRATION_REPORT: &str = "integration-report.json";
pub const SECURITY_REPORT: &str = "security-report.json";
pub const MODULE_SELECTION_REPORT: &str = "module-selection.json";
pub const ASSEMBLY_PLAN_REPORT: &str = "assembly-plan.json";
pub const ASSEMBLY_REPORT: &str = "assembly-report.json";
pub const RUNTIME_SMOKE_REPORT: &str = "runtime-smoke.json";
pub const BUILD_MANIFEST_REPORT: &str = "build-manifest.json";

pub const SPEC_NORMALIZED_ARTIFACT: &str = "spec.normalized.json";
pub const SPEC_HASH_ARTIFACT: &str = "spec.sha256";

#[derive(Debug, Clone)]
pub struct Workspace {
    build_id: String,
    root: PathBuf,
}

impl Workspace {
    /// Open the workspace for `build_id` without touching its contents.
    pub fn open(workspace_root: &Path, build_id: &str) -> Self {
        Self {
            build_id: build_id.to_string(),
            root: workspace_root.join(build_id),
        }
    }

    /// Open the workspace and clear every output of any earlier attempt with the
    /// same build id, exports and archives included. A new attempt has to pass
    /// and be exported again before anything ships.
    pub fn prepare(workspace_root: &Path, build_id: &str) -> Result<Self> {
        let ws = Self::open(workspace_root, build_id);
        for dir in [ARTIFACTS_DIR, REPORTS_DIR, ASSEMBLY_DIR, EXPORT_DIR, DIST_DIR] {
            let path = ws.root.join(dir);
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
        }
        fs::create_dir_all(ws.artifacts_dir())?;
        fs::create_dir_all(ws.reports_dir())?;
        Ok(ws)
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join(REPORTS_DIR)
    }

    pub fn assembly_dir(&self) -> PathBuf {
        self.root.join(ASSEMBLY_DIR)
    }

    pub fn export_dir(&self) -> PathBuf {
        self.root.join(EXPORT_DIR)
    }

    pub fn dist_dir(&self) -> PathBuf {
        self.root.join(DIST_DIR)
    }

    pub fn report_path(&self, name: &str) -> PathBuf {
        self.reports_dir().join(name)
    }

    /// Write a report as pretty JSON; returns its workspace-relative path.
    pub fn write_report<T: Serialize>(&self, name: &str, value: &T) -> Result<String> {
        write_json(&self.report_path(name), value)?;
        Ok(format!("{}/{}", REPORTS_DIR, name))
    }

    pub fn read_report<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.report_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write an artifact under `artifacts/`; returns its workspace-relative path.
    pub fn write_artifact(&self, relative: &str, bytes: &[u8]) -> Result<String> {
        let path = self.artifacts_dir().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        Ok(format!("{}/{}", ARTIFACTS_DIR, relative))
    }

    pub fn read_artifact(&self, relative: &str) -> Result<Option<String>> {
        let path = self.artifacts_dir().join(relative);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut content = serde_json::to_string_pretty(value)?;
    content.push('\n');
    fs::write(path, content)?;
    Ok(())
}
