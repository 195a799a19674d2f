//! Write-scope enforcement: a module may only write inside its own namespace.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{PipelineInput, StageContext, StepId, ValidationStage};
use crate::error::Result;
use crate::manifest::normalize_relative;
use crate::workspace::INTEGRATION_REPORT;

/// A write a module intends to perform during integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WriteIntent {
    #[serde(default)]
    pub module_id: Option<String>,
    pub path: String,
}

impl WriteIntent {
    pub fn new(module_id: &str, path: &str) -> Self {
        Self {
            module_id: Some(module_id.to_string()),
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScopeViolation {
    pub module_id: Option<String>,
    pub path: String,
    pub reason: String,
}

impl ScopeViolation {
    pub fn message(&self) -> String {
        match &self.module_id {
            Some(id) => format!("{}: write to '{}' rejected: {}", id, self.path, self.reason),
            None => format!("write to '{}' rejected: {}", self.path, self.reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationReport {
    pub ok: bool,
    pub checked: usize,
    pub violations: Vec<ScopeViolation>,
}

/// Resolve a write against the writer's namespace. Paths already rooted at
/// `<namespace>/` are taken as-is; anything else is relative to the module.
pub fn check_write(
    intent: &WriteIntent,
    known_modules: &HashSet<&str>,
    namespace: &str,
) -> Option<ScopeViolation> {
    let violation = |reason: String| {
        Some(ScopeViolation {
            module_id: intent.module_id.clone(),
            path: intent.path.clone(),
            reason,
        })
    };

    let id = match intent.module_id.as_deref() {
        Some(id) => id,
        None => return violation("write intent has no module id".to_string()),
    };
    if !known_modules.contains(id) {
        return violation(format!("module '{}' is not part of this build", id));
    }

    let normalized = match normalize_relative(&intent.path) {
        Some(p) => p,
        None => return violation("path escapes the assembly root".to_string()),
    };
    if normalized.is_empty() {
        return violation("path resolves to the assembly root".to_string());
    }

    let namespace_root = format!("{}/", namespace);
    let own_prefix = format!("{}{}/", namespace_root, id);
    let target = if normalized.starts_with(&namespace_root) {
        normalized
    } else {
        match normalize_relative(&format!("{}{}", own_prefix, intent.path)) {
            Some(p) => p,
            None => return violation("path escapes the assembly root".to_string()),
        }
    };

    if target.starts_with(&own_prefix) && target.len() > own_prefix.len() {
        None
    } else {
        violation(format!(
            "'{}' is outside the module namespace '{}'",
            target, own_prefix
        ))
    }
}

pub struct WriteScopeStage {
    namespace: String,
}

impl WriteScopeStage {
    pub fn new(namespace: String) -> Self {
        Self { namespace }
    }

    pub fn check(&self, writes: &[WriteIntent], known_modules: &HashSet<&str>) -> IntegrationReport {
        let violations: Vec<ScopeViolation> = writes
            .iter()
            .filter_map(|w| check_write(w, known_modules, &self.namespace))
            .collect();
        IntegrationReport {
            ok: violations.is_empty(),
            checked: writes.len(),
            violations,
        }
    }
}

impl ValidationStage for WriteScopeStage {
    fn id(&self) -> StepId {
        StepId::Integration
    }

    fn applies(&self, input: &PipelineInput<'_>) -> bool {
        !input.manifests.is_empty() && input.writes.is_some()
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Vec<String>> {
        let writes = ctx.input.writes.unwrap_or_default();
        let known: HashSet<&str> = ctx.manifests.iter().map(|m| m.id.as_str()).collect();
        let report = self.check(writes, &known);
        let path = ctx.workspace.write_report(INTEGRATION_REPORT, &report)?;
        ctx.record_artifact("integrationReport", path);
        Ok(report.violations.iter().map(ScopeViolation::message).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> HashSet<&'static str> {
        ["combat", "idle-loop"].into_iter().collect()
    }

    #[test]
    fn test_own_namespace_allowed() {
        let stage = WriteScopeStage::new("modules".to_string());
        let report = stage.check(
            &[
                WriteIntent::new("combat", "state.lua"),
                WriteIntent::new("combat", "modules/combat/data/x.json"),
                WriteIntent::new("combat", "a/../b.lua"),
            ],
            &known(),
        );
        assert!(report.ok);
        assert_eq!(report.checked, 3);
    }

    #[test]
    fn test_sibling_namespace_rejected_with_exact_path() {
        let violation =
            check_write(&WriteIntent::new("combat", "modules/other/escape.ts"), &known(), "modules")
                .unwrap();
        assert_eq!(violation.path, "modules/other/escape.ts");
        assert!(violation.message().contains("modules/other/escape.ts"));
    }

    #[test]
    fn test_prefix_lookalike_rejected() {
        assert!(check_write(
            &WriteIntent::new("combat", "modules/combat-extra/x.lua"),
            &known(),
            "modules"
        )
        .is_some());
    }

    #[test]
    fn test_escape_and_unknown_writer_rejected() {
        assert!(check_write(&WriteIntent::new("combat", "../../etc/passwd"), &known(), "modules").is_some());
        assert!(check_write(&WriteIntent::new("combat", "../idle-loop/x.lua"), &known(), "modules").is_some());
        assert!(check_write(&WriteIntent::new("ghost", "x.lua"), &known(), "modules").is_some());
        let anonymous = WriteIntent {
            module_id: None,
            path: "x.lua".to_string(),
        };
        assert!(check_write(&anonymous, &known(), "modules").is_some());
    }

    #[test]
    fn test_namespace_root_itself_rejected() {
        assert!(check_write(&WriteIntent::new("combat", "modules/combat"), &known(), "modules").is_some());
        assert!(check_write(&WriteIntent::new("combat", "."), &known(), "modules").is_some());
    }
}
