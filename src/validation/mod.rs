//! Validation System - Fail-Fast Stage Pipeline
//!
//! Stages produce error lists; the pipeline turns them into steps.
//! The report builder seals itself on the first blocked step, so a report can
//! never carry a step that ran after a block.
//!
//! CRITICAL: every stage persists its artifacts before evaluating, and the
//! report is always written, blocked or not.

pub mod graph;
pub mod rules;
pub mod scope;
pub mod security;

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AssemblerConfig;
use crate::error::Result;
use crate::manifest::ModuleManifest;
use crate::spec::{Spec, SpecContract};
use crate::workspace::{Workspace, VALIDATION_REPORT};

pub use graph::{DependencyEdge, DependencyGraph, DependencyReport, MissingCapability};
pub use scope::{IntegrationReport, ScopeViolation, WriteIntent};
pub use security::{SecurityFinding, SecurityReport, SecurityScanner};

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static PIPELINE_RUN_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_pipeline_run_count() -> u32 {
    PIPELINE_RUN_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_pipeline_run_count() {
    PIPELINE_RUN_COUNT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum StepId {
    SpecSchema,
    SpecIntegrity,
    ManifestSchema,
    ManifestIntegrity,
    DependencyGraph,
    Integration,
    Security,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: StepId,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Step {
    pub fn from_errors(id: StepId, errors: Vec<String>) -> Self {
        let status = if errors.is_empty() {
            StepStatus::Ok
        } else {
            StepStatus::Blocked
        };
        Self { id, status, errors }
    }

    pub fn is_blocked(&self) -> bool {
        self.status == StepStatus::Blocked
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub ok: bool,
    pub build_id: String,
    pub steps: Vec<Step>,
    pub artifacts: BTreeMap<String, String>,
}

impl ValidationReport {
    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Errors of the blocked step, if any.
    pub fn errors(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.is_blocked())
            .flat_map(|s| s.errors.iter().cloned())
            .collect()
    }
}

/// Accumulates steps for one pipeline run. `push` seals the report on the
/// first blocked step.
#[derive(Debug)]
pub struct ReportBuilder {
    build_id: String,
    steps: Vec<Step>,
}

impl ReportBuilder {
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            steps: vec![],
        }
    }

    pub fn push(mut self, step: Step) -> ControlFlow<ValidationReport, Self> {
        let blocked = step.is_blocked();
        self.steps.push(step);
        if blocked {
            ControlFlow::Break(self.seal(false))
        } else {
            ControlFlow::Continue(self)
        }
    }

    pub fn finish(self) -> ValidationReport {
        self.seal(true)
    }

    fn seal(self, ok: bool) -> ValidationReport {
        ValidationReport {
            ok,
            build_id: self.build_id,
            steps: self.steps,
            artifacts: BTreeMap::new(),
        }
    }
}

/// A source file belonging to a module, as loaded from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFile {
    pub module_id: String,
    /// Path relative to the module directory.
    pub path: String,
    pub content: Vec<u8>,
}

/// Everything one pipeline run looks at.
#[derive(Debug, Clone, Copy)]
pub struct PipelineInput<'a> {
    pub spec: &'a Spec,
    pub manifests: &'a [Value],
    pub writes: Option<&'a [WriteIntent]>,
    pub files: &'a [ModuleFile],
}

/// Mutable state threaded through the stages of one run.
pub struct StageContext<'a> {
    pub input: PipelineInput<'a>,
    pub workspace: &'a Workspace,
    /// Filled by the manifest schema stage.
    pub manifests: Vec<ModuleManifest>,
    pub artifacts: BTreeMap<String, String>,
}

impl StageContext<'_> {
    pub fn record_artifact(&mut self, name: impl Into<String>, relative_path: String) {
        self.artifacts.insert(name.into(), relative_path);
    }
}

/// Validation stage trait - produces errors, never throws for bad input
pub trait ValidationStage: Send + Sync {
    fn id(&self) -> StepId;

    /// Preconditions; a stage that does not apply is skipped without a step.
    fn applies(&self, _input: &PipelineInput<'_>) -> bool {
        true
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Vec<String>>;
}

/// The fixed-order pipeline.
pub struct ValidationPipeline {
    stages: Vec<Box<dyn ValidationStage>>,
}

impl ValidationPipeline {
    pub fn new(contract: Arc<dyn SpecContract>, config: &AssemblerConfig) -> Result<Self> {
        let scanner = SecurityScanner::new(&config.security, &config.module_namespace)?;
        Ok(Self {
            stages: vec![
                Box::new(rules::SpecSchemaStage::new(contract.clone())),
                Box::new(rules::SpecIntegrityStage::new(contract)),
                Box::new(rules::ManifestSchemaStage),
                Box::new(rules::ManifestIntegrityStage),
                Box::new(graph::DependencyGraphStage::new(config.capabilities.clone())),
                Box::new(scope::WriteScopeStage::new(config.module_namespace.clone())),
                Box::new(security::SecurityScanStage::new(scanner)),
            ],
        })
    }

    pub fn run(&self, input: PipelineInput<'_>, workspace: &Workspace) -> Result<ValidationReport> {
        #[cfg(feature = "test-hooks")]
        PIPELINE_RUN_COUNT.fetch_add(1, Ordering::SeqCst);

        let mut ctx = StageContext {
            input,
            workspace,
            manifests: vec![],
            artifacts: BTreeMap::new(),
        };
        let mut builder = ReportBuilder::new(workspace.build_id());

        for stage in &self.stages {
            if !stage.applies(&input) {
                debug!(stage = ?stage.id(), "Skipping stage, preconditions not met");
                continue;
            }
            let errors = stage.run(&mut ctx)?;
            let step = Step::from_errors(stage.id(), errors);
            if step.is_blocked() {
                warn!(stage = ?step.id, errors = step.errors.len(), "Validation stage blocked");
            } else {
                debug!(stage = ?step.id, "Validation stage ok");
            }
            builder = match builder.push(step) {
                ControlFlow::Continue(builder) => builder,
                ControlFlow::Break(report) => return persist(report, ctx.artifacts, workspace),
            };
        }

        persist(builder.finish(), ctx.artifacts, workspace)
    }
}

fn persist(
    mut report: ValidationReport,
    artifacts: BTreeMap<String, String>,
    workspace: &Workspace,
) -> Result<ValidationReport> {
    report.artifacts = artifacts;
    report
        .artifacts
        .insert("validationReport".to_string(), format!("reports/{}", VALIDATION_REPORT));
    workspace.write_report(VALIDATION_REPORT, &report)?;
    info!(build_id = %report.build_id, ok = report.ok, steps = report.steps.len(), "Validation finished");
    Ok(report)
}
