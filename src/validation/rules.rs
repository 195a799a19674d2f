//! Spec and manifest stages.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};

use super::{StageContext, StepId, ValidationStage};
use crate::error::Result;
use crate::hashing::{canonical_json, compute_hash, sha256_hex};
use crate::manifest::{is_safe_relative_path, CapabilityKind, ModuleManifest, SHARED_TEMPLATE};
use crate::spec::SpecContract;
use crate::workspace::{SPEC_HASH_ARTIFACT, SPEC_NORMALIZED_ARTIFACT};

pub struct SpecSchemaStage {
    contract: Arc<dyn SpecContract>,
}

impl SpecSchemaStage {
    pub fn new(contract: Arc<dyn SpecContract>) -> Self {
        Self { contract }
    }
}

impl ValidationStage for SpecSchemaStage {
    fn id(&self) -> StepId {
        StepId::SpecSchema
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Vec<String>> {
        let spec = ctx.input.spec;
        let canonical = canonical_json(spec)?;
        let path = ctx
            .workspace
            .write_artifact(SPEC_NORMALIZED_ARTIFACT, canonical.as_bytes())?;
        ctx.record_artifact("specNormalized", path);
        let hash = sha256_hex(canonical.as_bytes());
        let path = ctx.workspace.write_artifact(SPEC_HASH_ARTIFACT, hash.as_bytes())?;
        ctx.record_artifact("specHash", path);

        Ok(self.contract.check_schema(spec))
    }
}

pub struct SpecIntegrityStage {
    contract: Arc<dyn SpecContract>,
}

impl SpecIntegrityStage {
    pub fn new(contract: Arc<dyn SpecContract>) -> Self {
        Self { contract }
    }
}

impl ValidationStage for SpecIntegrityStage {
    fn id(&self) -> StepId {
        StepId::SpecIntegrity
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Vec<String>> {
        Ok(self.contract.check_integrity(ctx.input.spec))
    }
}

/// Parses manifests in input order; the first invalid one blocks.
pub struct ManifestSchemaStage;

impl ValidationStage for ManifestSchemaStage {
    fn id(&self) -> StepId {
        StepId::ManifestSchema
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Vec<String>> {
        let raw_manifests = ctx.input.manifests;

        let mut index = BTreeMap::new();
        for (i, raw) in raw_manifests.iter().enumerate() {
            let canonical = canonical_json(raw)?;
            let hash = sha256_hex(canonical.as_bytes());
            ctx.workspace
                .write_artifact(&format!("manifests/{}.normalized.json", i), canonical.as_bytes())?;
            ctx.workspace
                .write_artifact(&format!("manifests/{}.sha256", i), hash.as_bytes())?;
            index.insert(
                i.to_string(),
                json!({"id": raw.get("id").cloned().unwrap_or(Value::Null), "hash": hash}),
            );
        }
        let path = ctx
            .workspace
            .write_artifact("manifests/index.json", serde_json::to_string_pretty(&index)?.as_bytes())?;
        ctx.record_artifact("manifestIndex", path);

        let mut parsed = Vec::with_capacity(raw_manifests.len());
        for (i, raw) in raw_manifests.iter().enumerate() {
            let label = match raw.get("id").and_then(Value::as_str) {
                Some(id) => format!("manifest[{}] ({})", i, id),
                None => format!("manifest[{}]", i),
            };
            let manifest: ModuleManifest = match serde_json::from_value(raw.clone()) {
                Ok(m) => m,
                Err(e) => return Ok(vec![format!("{}: {}", label, e)]),
            };
            let errors = manifest.schema_errors();
            if !errors.is_empty() {
                return Ok(errors.into_iter().map(|e| format!("{}: {}", label, e)).collect());
            }
            parsed.push(manifest);
        }
        ctx.manifests = parsed;
        Ok(vec![])
    }
}

/// Cross-manifest integrity: unique ids, safe paths, content hashes, template
/// membership and capability names. Writes the provided-capability union.
pub struct ManifestIntegrityStage;

impl ValidationStage for ManifestIntegrityStage {
    fn id(&self) -> StepId {
        StepId::ManifestIntegrity
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Vec<String>> {
        let mut errors = vec![];

        let mut provided: BTreeMap<CapabilityKind, BTreeSet<&str>> = BTreeMap::new();
        for manifest in &ctx.manifests {
            for (kind, name) in manifest.provides.iter() {
                provided.entry(kind).or_default().insert(name);
            }
        }
        let union = json!({
            "events": provided.get(&CapabilityKind::Event).cloned().unwrap_or_default(),
            "state": provided.get(&CapabilityKind::State).cloned().unwrap_or_default(),
            "commands": provided.get(&CapabilityKind::Command).cloned().unwrap_or_default(),
        });
        let capabilities_hash = compute_hash(&union)?;
        let path = ctx.workspace.write_artifact(
            "capabilities.json",
            serde_json::to_string_pretty(&json!({"provided": union, "hash": capabilities_hash}))?.as_bytes(),
        )?;

        let template = ctx
            .input
            .spec
            .template_id()
            .ok()
            .map(|t| t.split('@').next().unwrap_or(t).to_string());

        let supplied: HashMap<(&str, &str), &[u8]> = ctx
            .input
            .files
            .iter()
            .map(|f| ((f.module_id.as_str(), f.path.as_str()), f.content.as_slice()))
            .collect();

        let mut ids = HashSet::new();
        for manifest in &ctx.manifests {
            let id = manifest.id.as_str();
            if !ids.insert(id) {
                errors.push(format!("duplicate module id '{}'", id));
            }

            if let Some(template) = &template {
                if manifest.template_id != SHARED_TEMPLATE && &manifest.template_id != template {
                    errors.push(format!(
                        "{}: belongs to template '{}', build uses '{}'",
                        id, manifest.template_id, template
                    ));
                }
            }

            if !is_safe_relative_path(&manifest.entry_path) {
                errors.push(format!("{}: unsafe entryPath '{}'", id, manifest.entry_path));
            }
            let mut paths = HashSet::new();
            for (path, declared_hash) in manifest.declared_paths() {
                if !is_safe_relative_path(path) {
                    errors.push(format!("{}: unsafe path '{}'", id, path));
                    continue;
                }
                if !paths.insert(path) {
                    errors.push(format!("{}: path '{}' declared twice", id, path));
                }
                if let Some(content) = supplied.get(&(id, path)) {
                    let actual = sha256_hex(content);
                    if actual != declared_hash {
                        errors.push(format!(
                            "{}: content hash mismatch for '{}' (declared {}, actual {})",
                            id, path, declared_hash, actual
                        ));
                    }
                }
            }

            for (kind, name) in manifest.provides.iter().chain(manifest.consumes.iter()) {
                if name.is_empty() || name.chars().any(char::is_whitespace) {
                    errors.push(format!("{}: malformed {} capability name '{}'", id, kind, name));
                }
            }
        }

        ctx.record_artifact("capabilities", path);
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssemblerConfig;
    use crate::spec::{DefaultSpecContract, Spec};
    use crate::validation::{ModuleFile, PipelineInput, ValidationPipeline};
    use crate::workspace::Workspace;

    fn manifest(id: &str, content: &[u8]) -> Value {
        json!({
            "id": id,
            "kind": "system",
            "entryPath": "main.lua",
            "templateId": "idle-rpg-base",
            "files": [{"path": "main.lua", "role": "entry", "contentHash": sha256_hex(content)}]
        })
    }

    fn run(manifests: &[Value], files: &[ModuleFile]) -> crate::validation::ValidationReport {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::prepare(dir.path(), "build-test").unwrap();
        let pipeline =
            ValidationPipeline::new(Arc::new(DefaultSpecContract), &AssemblerConfig::default()).unwrap();
        let spec = Spec::new(json!({"templateId": "idle-rpg-base"}));
        pipeline
            .run(
                PipelineInput {
                    spec: &spec,
                    manifests,
                    writes: None,
                    files,
                },
                &ws,
            )
            .unwrap()
    }

    #[test]
    fn test_first_invalid_manifest_blocks_with_index() {
        let mut bad = manifest("combat", b"x");
        bad.as_object_mut().unwrap().remove("kind");
        let report = run(&[manifest("idle-loop", b"x"), bad], &[]);
        assert!(!report.ok);
        let step = report.steps.last().unwrap();
        assert_eq!(step.id, StepId::ManifestSchema);
        assert!(step.errors[0].starts_with("manifest[1] (combat)"));
    }

    #[test]
    fn test_duplicate_ids_and_hash_mismatch() {
        let files = vec![ModuleFile {
            module_id: "combat".to_string(),
            path: "main.lua".to_string(),
            content: b"changed".to_vec(),
        }];
        let report = run(&[manifest("combat", b"original"), manifest("combat", b"original")], &files);
        let step = report.step(StepId::ManifestIntegrity).unwrap();
        assert!(step.is_blocked());
        assert!(step.errors.iter().any(|e| e.contains("duplicate module id 'combat'")));
        assert!(step.errors.iter().any(|e| e.contains("content hash mismatch")));
    }

    #[test]
    fn test_unsafe_paths_and_foreign_template() {
        let mut m = manifest("combat", b"x");
        m["templateId"] = json!("space-shooter");
        m["files"]
            .as_array_mut()
            .unwrap()
            .push(json!({"path": "../idle-loop/main.lua", "role": "lib", "contentHash": sha256_hex(b"x")}));
        let report = run(&[m], &[]);
        let step = report.step(StepId::ManifestIntegrity).unwrap();
        assert!(step.errors.iter().any(|e| e.contains("unsafe path '../idle-loop/main.lua'")));
        assert!(step.errors.iter().any(|e| e.contains("space-shooter")));
    }

    #[test]
    fn test_shared_template_accepted() {
        let mut m = manifest("core-ui", b"x");
        m["templateId"] = json!("*");
        let report = run(&[m], &[]);
        assert!(report.step(StepId::ManifestIntegrity).unwrap().errors.is_empty());
    }
}
