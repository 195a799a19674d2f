//! Exporter - Packaging of Passing Builds
//!
//! CRITICAL: only a build whose assembly report says PASS can be exported.
//! The check happens before anything is written.
//!
//! Export layout:
//! ```text
//! export/build/{assembly,assets,runtime}
//! export/reports/*.json
//! export/metadata/{build.json,README}
//! export/checksums.sha256
//! dist/<buildId>.zip
//! dist/<buildId>.zip.sha256
//! ```

pub mod archive;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::assembler::AssemblyReport;
use crate::config::ExportConfig;
use crate::error::{AssemblyError, Result};
use crate::hashing::{hash_file_set, hash_tree, list_tree, relative_slash_path, sha256_hex};
use crate::manifest::is_safe_relative_path;
use crate::templates::ModuleSelection;
use crate::workspace::{
    write_json, Workspace, ASSEMBLY_REPORT, BUILD_MANIFEST_REPORT, MODULE_SELECTION_REPORT, SPEC_HASH_ARTIFACT,
};
use crate::ENGINE_VERSION;

pub use archive::{build_archive, digest_file, read_entries, ArchiveEntry};

pub const CHECKSUMS_FILE: &str = "checksums.sha256";
pub const CREATED_FROM: &str = "spec";

const README: &str = "This bundle was produced by modforge.\n\
\n\
build/      assembled module tree and optional shared trees\n\
reports/    validation, assembly and smoke reports\n\
metadata/   build.json identifies the build\n\
\n\
checksums.sha256 lists the sha256 of every other file in this bundle.\n";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildHashes {
    pub assembly: String,
    pub reports: String,
}

/// Durable identity record of a build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildManifest {
    pub build_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_version_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
    pub created_from: String,
    pub engine_version: String,
    pub hashes: BuildHashes,
}

/// Hash over the allowlisted reports present in the workspace. The build
/// manifest is excluded since it records this hash.
fn reports_hash(workspace: &Workspace, config: &ExportConfig) -> Result<String> {
    let mut entries = vec![];
    for name in config.reports.iter().filter(|n| n.as_str() != BUILD_MANIFEST_REPORT) {
        let path = workspace.report_path(name);
        if path.is_file() {
            entries.push((name.clone(), sha256_hex(&fs::read(&path)?)));
        }
    }
    Ok(hash_file_set(entries.iter().map(|(p, h)| (p.as_str(), h.as_str()))))
}

/// Write `reports/build-manifest.json`. Template and spec identity come from
/// the previous manifest when present, otherwise from the module selection
/// report and the spec hash artifact. Hashes are always recomputed.
pub fn write_build_manifest(workspace: &Workspace, config: &ExportConfig) -> Result<BuildManifest> {
    let previous: Option<BuildManifest> = workspace.read_report(BUILD_MANIFEST_REPORT)?;
    let selection: Option<ModuleSelection> = match previous.as_ref() {
        Some(p) if p.template_id.is_some() => None,
        _ => workspace.read_report(MODULE_SELECTION_REPORT)?,
    };

    let template_id = previous
        .as_ref()
        .and_then(|p| p.template_id.clone())
        .or_else(|| selection.as_ref().map(|s| s.template_id.clone()));
    let template_version_used = previous
        .as_ref()
        .and_then(|p| p.template_version_used.clone())
        .or_else(|| selection.as_ref().map(|s| s.version_used.clone()));
    let spec_hash = match previous.as_ref().and_then(|p| p.spec_hash.clone()) {
        Some(hash) => Some(hash),
        None => workspace
            .read_artifact(SPEC_HASH_ARTIFACT)?
            .map(|h| h.trim().to_string()),
    };

    let manifest = BuildManifest {
        build_id: workspace.build_id().to_string(),
        template_id,
        template_version_used,
        spec_hash,
        created_from: CREATED_FROM.to_string(),
        engine_version: ENGINE_VERSION.to_string(),
        hashes: BuildHashes {
            assembly: hash_tree(&workspace.assembly_dir())?,
            reports: reports_hash(workspace, config)?,
        },
    };
    workspace.write_report(BUILD_MANIFEST_REPORT, &manifest)?;
    Ok(manifest)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub build_id: String,
    pub export_root: PathBuf,
    pub files: usize,
    /// sha256 of `checksums.sha256` itself.
    pub checksums_digest: String,
    pub archive_path: PathBuf,
    pub archive_digest: String,
    pub manifest: BuildManifest,
}

pub struct Exporter {
    config: ExportConfig,
}

impl Exporter {
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }

    pub fn export(&self, workspace: &Workspace) -> Result<ExportResult> {
        let report: Option<AssemblyReport> = workspace.read_report(ASSEMBLY_REPORT)?;
        match &report {
            Some(r) if r.passed() => {}
            Some(r) => {
                return Err(AssemblyError::BuildNotPassing {
                    build_id: workspace.build_id().to_string(),
                    status: r.status.to_string(),
                })
            }
            None => {
                return Err(AssemblyError::BuildNotPassing {
                    build_id: workspace.build_id().to_string(),
                    status: "missing".to_string(),
                })
            }
        }

        let root = workspace.export_dir();
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        let build_dir = root.join("build");
        copy_tree(&workspace.assembly_dir(), &build_dir.join("assembly"))?;
        if let Some(assets) = &self.config.assets_dir {
            copy_tree(assets, &build_dir.join("assets"))?;
        }
        if let Some(runtime) = &self.config.runtime_dir {
            copy_tree(runtime, &build_dir.join("runtime"))?;
        }

        let manifest = write_build_manifest(workspace, &self.config)?;

        let reports_dir = root.join("reports");
        fs::create_dir_all(&reports_dir)?;
        for name in &self.config.reports {
            let source = workspace.report_path(name);
            if source.is_file() {
                fs::copy(&source, reports_dir.join(name))?;
            }
        }

        let metadata_dir = root.join("metadata");
        write_json(&metadata_dir.join("build.json"), &manifest)?;
        fs::write(metadata_dir.join("README"), README)?;

        let (files, checksums_digest) = write_checksums(&root)?;
        debug!(build_id = %workspace.build_id(), files, "Checksums written");

        let archive_name = format!("{}.zip", workspace.build_id());
        let archive_path = workspace.dist_dir().join(&archive_name);
        let archive_digest = archive::write_archive(&root, &archive_path)?;
        fs::write(
            workspace.dist_dir().join(format!("{}.sha256", archive_name)),
            format!("{}  {}\n", archive_digest, archive_name),
        )?;

        info!(
            build_id = %workspace.build_id(),
            files,
            archive = %archive_path.display(),
            digest = %archive_digest,
            "Build exported"
        );

        Ok(ExportResult {
            build_id: workspace.build_id().to_string(),
            export_root: root,
            files,
            checksums_digest,
            archive_path,
            archive_digest,
            manifest,
        })
    }
}

/// Copy every regular file under `from` into `to`. A missing source creates nothing.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    if !from.exists() {
        debug!(source = %from.display(), "Optional tree absent, skipped");
        return Ok(());
    }
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(|e| AssemblyError::Io(e.into()))?;
        let rel = relative_slash_path(from, entry.path())?;
        if entry.file_type().is_dir() {
            fs::create_dir_all(to.join(&rel))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), to.join(&rel))?;
        }
    }
    Ok(())
}

/// Write `checksums.sha256` for every other file under `root`.
/// Returns the number of files listed and the checksums file's own digest.
pub fn write_checksums(root: &Path) -> Result<(usize, String)> {
    let listing: Vec<(String, String)> = list_tree(root)?
        .into_iter()
        .filter(|(path, _)| path != CHECKSUMS_FILE)
        .collect();
    let content: String = listing
        .iter()
        .map(|(path, hash)| format!("{}  {}\n", hash, path))
        .collect();
    fs::write(root.join(CHECKSUMS_FILE), &content)?;
    Ok((listing.len(), sha256_hex(content.as_bytes())))
}

/// Re-hash the bundle and compare it with `checksums.sha256`. Every listed
/// path must be a safe relative path whose file still matches, and every file
/// present must be listed. Returns how many were verified.
pub fn verify_checksums(export_root: &Path) -> Result<usize> {
    let content = fs::read_to_string(export_root.join(CHECKSUMS_FILE))?;
    let mut present: BTreeMap<String, String> = list_tree(export_root)?
        .into_iter()
        .filter(|(path, _)| path != CHECKSUMS_FILE)
        .collect();
    let mut verified = 0;
    for line in content.lines().filter(|l| !l.is_empty()) {
        let (expected, path) = line
            .split_once("  ")
            .ok_or_else(|| AssemblyError::ArchiveMalformed(format!("bad checksum line: {}", line)))?;
        if !is_safe_relative_path(path) {
            return Err(AssemblyError::ArchiveMalformed(format!("unsafe checksum path: {}", path)));
        }
        let actual = present.remove(path).unwrap_or_else(|| "missing".to_string());
        if actual != expected {
            return Err(AssemblyError::ChecksumMismatch {
                path: path.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        verified += 1;
    }
    if let Some((path, actual)) = present.into_iter().next() {
        return Err(AssemblyError::ChecksumMismatch {
            path,
            expected: "unlisted".to_string(),
            actual,
        });
    }
    Ok(verified)
}

/// Check an archive against an expected digest, or against its `.sha256`
/// sidecar when none is given, and make sure it parses. Returns the digest.
pub fn verify_archive(path: &Path, expected: Option<&str>) -> Result<String> {
    let actual = digest_file(path)?;
    let expected = match expected {
        Some(e) => e.to_string(),
        None => {
            let mut sidecar = path.as_os_str().to_owned();
            sidecar.push(".sha256");
            let recorded = fs::read_to_string(PathBuf::from(sidecar))?;
            recorded.split_whitespace().next().unwrap_or_default().to_string()
        }
    };
    if actual != expected {
        return Err(AssemblyError::ChecksumMismatch {
            path: path.display().to_string(),
            expected,
            actual,
        });
    }
    read_entries(&fs::read(path)?)?;
    Ok(actual)
}
