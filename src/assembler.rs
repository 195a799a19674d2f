//! Assembler - Single Entry Point for Builds
//!
//! CRITICAL: every build goes through the validation pipeline. Nothing is
//! materialized or executed unless every module loaded and validation passed.
//!
//! A fatal error still leaves a FAIL assembly report in the workspace.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::AssemblerConfig;
use crate::error::{AssemblyError, Result};
use crate::export::write_build_manifest;
use crate::hashing::{build_id, compute_hash};
use crate::manifest::{
    is_safe_relative_path, load_manifest, normalize_relative, LoadedManifest, ManifestLoad, ModuleManifest,
    Unavailable,
};
use crate::smoke::{SmokeFile, SmokeHarness, SmokeModule, SmokeResult};
use crate::spec::{DefaultSpecContract, Spec, SpecContract};
use crate::templates::{ModuleSelection, TemplateRegistry};
use crate::validation::{
    DependencyGraph, ModuleFile, PipelineInput, ValidationPipeline, ValidationReport, WriteIntent,
};
use crate::workspace::{
    Workspace, ASSEMBLY_PLAN_REPORT, ASSEMBLY_REPORT, MODULE_SELECTION_REPORT, RUNTIME_SMOKE_REPORT,
};

pub const PLAN_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssemblyStatus {
    Pass,
    Fail,
}

impl std::fmt::Display for AssemblyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyReport {
    pub status: AssemblyStatus,
    pub build_id: String,
    pub errors: Vec<String>,
    pub validation_ok: bool,
    pub smoke_ok: bool,
    pub missing_modules: Vec<String>,
}

impl AssemblyReport {
    fn fatal(build_id: &str, error: &AssemblyError) -> Self {
        Self {
            status: AssemblyStatus::Fail,
            build_id: build_id.to_string(),
            errors: vec![error.to_string()],
            validation_ok: false,
            smoke_ok: false,
            missing_modules: vec![],
        }
    }

    pub fn passed(&self) -> bool {
        self.status == AssemblyStatus::Pass
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlannedModule {
    pub id: String,
    /// Relative to the modules root.
    pub manifest_path: String,
    pub manifest_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyPlan {
    pub version: String,
    pub spec_hash: String,
    pub modules: Vec<PlannedModule>,
    pub integration_order: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AssembleOptions {
    /// Writes beyond the modules' own declared files.
    pub extra_writes: Vec<WriteIntent>,
}

#[derive(Debug, Clone)]
pub struct AssemblyOutcome {
    pub workspace: Workspace,
    pub selection: ModuleSelection,
    pub plan: AssemblyPlan,
    pub validation: ValidationReport,
    pub smoke: SmokeResult,
    pub report: AssemblyReport,
}

impl AssemblyOutcome {
    pub fn build_id(&self) -> &str {
        self.workspace.build_id()
    }

    pub fn passed(&self) -> bool {
        self.report.passed()
    }
}

/// One distinct build of an `assemble_many` batch.
#[derive(Debug)]
pub struct BatchItem {
    pub build_id: String,
    pub outcome: Result<AssemblyOutcome>,
}

/// A module whose manifest and declared files were read from disk.
struct LoadedModule {
    loaded: LoadedManifest,
    /// `None` when the manifest does not parse; validation reports why.
    manifest: Option<ModuleManifest>,
    files: Vec<ModuleFile>,
}

pub struct Assembler {
    config: AssemblerConfig,
    registry: TemplateRegistry,
    pipeline: ValidationPipeline,
    harness: SmokeHarness,
}

impl Assembler {
    pub fn new(config: AssemblerConfig, registry: TemplateRegistry) -> Result<Self> {
        Self::with_contract(config, registry, Arc::new(DefaultSpecContract))
    }

    /// Use a domain-specific spec contract for the two spec stages.
    pub fn with_contract(
        config: AssemblerConfig,
        registry: TemplateRegistry,
        contract: Arc<dyn SpecContract>,
    ) -> Result<Self> {
        let pipeline = ValidationPipeline::new(contract, &config)?;
        let harness = SmokeHarness::new(config.cache_root.clone(), &config.smoke);
        Ok(Self {
            config,
            registry,
            pipeline,
            harness,
        })
    }

    /// Load the registry named by the configuration.
    pub fn from_config(config: AssemblerConfig) -> Result<Self> {
        let registry = TemplateRegistry::load_from_file(&config.registry_path)?;
        Self::new(config, registry)
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    pub fn build_id(&self, spec: &Spec) -> Result<String> {
        Ok(build_id(&self.config.build_id_prefix, spec)?)
    }

    pub fn workspace(&self, build_id: &str) -> Workspace {
        Workspace::open(&self.config.workspace_root, build_id)
    }

    pub fn assemble(&self, spec: &Spec, options: &AssembleOptions) -> Result<AssemblyOutcome> {
        let build_id = self.build_id(spec)?;
        let workspace = Workspace::prepare(&self.config.workspace_root, &build_id)?;
        info!(build_id = %build_id, "Assembly started");

        match self.run(spec, options, &workspace) {
            Ok(outcome) => {
                info!(build_id = %build_id, status = %outcome.report.status, "Assembly finished");
                Ok(outcome)
            }
            Err(e) => {
                error!(build_id = %build_id, error = %e, "Assembly aborted");
                if let Err(write_error) = workspace.write_report(ASSEMBLY_REPORT, &AssemblyReport::fatal(&build_id, &e)) {
                    warn!(build_id = %build_id, error = %write_error, "Could not record failed assembly");
                }
                Err(e)
            }
        }
    }

    /// Assemble independent specs in parallel. Specs sharing a build id are
    /// assembled once; items come back in first-occurrence order.
    pub fn assemble_many(&self, specs: &[Spec]) -> Result<Vec<BatchItem>> {
        let mut distinct: Vec<(String, &Spec)> = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = self.build_id(spec)?;
            if distinct.iter().all(|(seen, _)| seen != &id) {
                distinct.push((id, spec));
            }
        }
        let options = AssembleOptions::default();
        Ok(distinct
            .into_par_iter()
            .map(|(build_id, spec)| BatchItem {
                build_id,
                outcome: self.assemble(spec, &options),
            })
            .collect())
    }

    fn run(&self, spec: &Spec, options: &AssembleOptions, workspace: &Workspace) -> Result<AssemblyOutcome> {
        let selection = self.registry.resolve(spec)?;
        workspace.write_report(MODULE_SELECTION_REPORT, &selection)?;

        let (modules, missing) = self.load_modules(&selection.modules)?;
        for unavailable in &missing {
            warn!(module = %unavailable.id, reason = %unavailable.reason, "Required module unavailable");
        }

        let plan = self.plan(spec, &modules)?;
        workspace.write_report(ASSEMBLY_PLAN_REPORT, &plan)?;

        let raw_manifests: Vec<Value> = modules.iter().map(|m| m.loaded.raw.clone()).collect();
        let files: Vec<ModuleFile> = modules.iter().flat_map(|m| m.files.iter().cloned()).collect();
        let mut writes = self.declared_writes(&modules);
        writes.extend(options.extra_writes.iter().cloned());

        let validation = self.pipeline.run(
            PipelineInput {
                spec,
                manifests: &raw_manifests,
                writes: Some(&writes),
                files: &files,
            },
            workspace,
        )?;

        let smoke = if !missing.is_empty() {
            SmokeResult::skipped("missing-modules")
        } else if !validation.ok {
            SmokeResult::skipped("validation-failed")
        } else {
            self.materialize(workspace, &modules)?;
            self.harness.run(&smoke_modules(&modules, &plan.integration_order))?
        };
        workspace.write_report(RUNTIME_SMOKE_REPORT, &smoke)?;

        let mut errors: Vec<String> = missing
            .iter()
            .map(|u| AssemblyError::ModuleMissing(u.id.clone()).to_string())
            .collect();
        errors.extend(validation.errors());
        errors.extend(smoke.error.iter().cloned());

        let passed = missing.is_empty() && validation.ok && smoke.ok;
        let report = AssemblyReport {
            status: if passed { AssemblyStatus::Pass } else { AssemblyStatus::Fail },
            build_id: workspace.build_id().to_string(),
            errors,
            validation_ok: validation.ok,
            smoke_ok: smoke.ok,
            missing_modules: missing.into_iter().map(|u| u.id).collect(),
        };
        workspace.write_report(ASSEMBLY_REPORT, &report)?;
        write_build_manifest(workspace, &self.config.export)?;

        Ok(AssemblyOutcome {
            workspace: workspace.clone(),
            selection,
            plan,
            validation,
            smoke,
            report,
        })
    }

    fn load_modules(&self, ids: &[String]) -> Result<(Vec<LoadedModule>, Vec<Unavailable>)> {
        let mut modules = vec![];
        let mut missing = vec![];
        for id in ids {
            let loaded = match load_manifest(&self.config.modules_root, id, &self.config.manifest_file_name)? {
                ManifestLoad::Loaded(loaded) => loaded,
                ManifestLoad::Missing(unavailable) => {
                    missing.push(unavailable);
                    continue;
                }
            };
            let manifest: Option<ModuleManifest> = serde_json::from_value(loaded.raw.clone()).ok();
            match manifest.as_ref().map(|m| read_declared_files(&loaded.dir, m)) {
                Some(Err(reason)) => missing.push(Unavailable {
                    id: id.clone(),
                    reason,
                }),
                Some(Ok(files)) => modules.push(LoadedModule {
                    loaded,
                    manifest,
                    files,
                }),
                None => modules.push(LoadedModule {
                    loaded,
                    manifest: None,
                    files: vec![],
                }),
            }
        }
        Ok((modules, missing))
    }

    fn plan(&self, spec: &Spec, modules: &[LoadedModule]) -> Result<AssemblyPlan> {
        let planned = modules
            .iter()
            .map(|m| -> Result<PlannedModule> {
                Ok(PlannedModule {
                    id: m.loaded.id.clone(),
                    manifest_path: format!("{}/{}", m.loaded.id, self.config.manifest_file_name),
                    manifest_hash: compute_hash(&m.loaded.raw)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let parsed: Vec<ModuleManifest> = modules.iter().filter_map(|m| m.manifest.clone()).collect();
        let mut integration_order = DependencyGraph::build(&parsed, &self.config.capabilities).integration_order();
        for module in modules.iter().filter(|m| m.manifest.is_none()) {
            integration_order.push(module.loaded.id.clone());
        }

        Ok(AssemblyPlan {
            version: PLAN_VERSION.to_string(),
            spec_hash: compute_hash(spec)?,
            modules: planned,
            integration_order,
        })
    }

    /// Every declared file and asset lands at `<namespace>/<id>/<path>`.
    fn declared_writes(&self, modules: &[LoadedModule]) -> Vec<WriteIntent> {
        let namespace = &self.config.module_namespace;
        modules
            .iter()
            .filter_map(|m| m.manifest.as_ref())
            .flat_map(|manifest| {
                manifest.declared_paths().map(move |(path, _)| {
                    WriteIntent::new(&manifest.id, &format!("{}/{}/{}", namespace, manifest.id, path))
                })
            })
            .collect()
    }

    fn materialize(&self, workspace: &Workspace, modules: &[LoadedModule]) -> Result<()> {
        let root = workspace.assembly_dir();
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        let namespace = self.config.module_namespace.as_str();
        modules
            .par_iter()
            .try_for_each(|module| materialize_module(&root, namespace, &module.files))?;
        debug!(build_id = %workspace.build_id(), modules = modules.len(), "Assembly tree materialized");
        Ok(())
    }
}

/// Read every safely-named declared path. Unsafe paths are left for
/// validation to report.
fn read_declared_files(dir: &Path, manifest: &ModuleManifest) -> std::result::Result<Vec<ModuleFile>, String> {
    let mut files = vec![];
    for (path, _) in manifest.declared_paths() {
        if !is_safe_relative_path(path) {
            continue;
        }
        let content = fs::read(dir.join(path)).map_err(|e| format!("declared file '{}' unreadable: {}", path, e))?;
        files.push(ModuleFile {
            module_id: manifest.id.clone(),
            path: path.to_string(),
            content,
        });
    }
    Ok(files)
}

/// Lexically resolve `relative` under `root`.
fn contained_path(root: &Path, relative: &str) -> Result<PathBuf> {
    match normalize_relative(relative) {
        Some(p) if !p.is_empty() => Ok(root.join(p)),
        _ => Err(AssemblyError::PathEscapesRoot {
            path: relative.to_string(),
        }),
    }
}

fn materialize_module(root: &Path, namespace: &str, files: &[ModuleFile]) -> Result<()> {
    let targets = files
        .iter()
        .map(|f| contained_path(root, &format!("{}/{}/{}", namespace, f.module_id, f.path)))
        .collect::<Result<Vec<_>>>()?;
    for target in &targets {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
    }
    for (target, file) in targets.iter().zip(files) {
        fs::write(target, &file.content)?;
    }
    Ok(())
}

/// Runtime view of the loaded modules, in integration order. Assets are not
/// executable and stay out of the runtime.
fn smoke_modules(modules: &[LoadedModule], order: &[String]) -> Vec<SmokeModule> {
    order
        .iter()
        .filter_map(|id| modules.iter().find(|m| &m.loaded.id == id))
        .filter_map(|m| {
            let manifest = m.manifest.as_ref()?;
            let files = manifest
                .files
                .iter()
                .filter_map(|declared| {
                    m.files.iter().find(|f| f.path == declared.path).map(|f| SmokeFile {
                        path: f.path.clone(),
                        content_hash: declared.content_hash.clone(),
                        content: f.content.clone(),
                    })
                })
                .collect();
            Some(SmokeModule {
                id: manifest.id.clone(),
                entry_path: manifest.entry_path.clone(),
                files,
            })
        })
        .collect()
}
