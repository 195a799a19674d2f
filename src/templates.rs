//! Template System - Registry and Module Resolution
//!
//! A template id (optionally `@major.minor`) selects a registry entry; the
//! entry's base modules plus every conditional group whose condition holds
//! against the spec form the module selection.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{AssemblyError, Result};
use crate::spec::Spec;

pub type TemplateId = String;

/// Version reported for unversioned registry entries.
pub const IMPLICIT_VERSION: &str = "1.0";

static TEMPLATE_REF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9-]+(@\d+\.\d+)?$").expect("template ref pattern is valid")
});

/// A parsed `id` or `id@major.minor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    pub id: TemplateId,
    pub version: Option<String>,
}

impl FromStr for TemplateRef {
    type Err = AssemblyError;

    fn from_str(s: &str) -> Result<Self> {
        if !TEMPLATE_REF_PATTERN.is_match(s) {
            return Err(AssemblyError::TemplateIdInvalid(s.to_string()));
        }
        Ok(match s.split_once('@') {
            Some((id, version)) => Self {
                id: id.to_string(),
                version: Some(version.to_string()),
            },
            None => Self {
                id: s.to_string(),
                version: None,
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegistryEntry {
    Versioned(VersionedEntry),
    Single(TemplateEntry),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedEntry {
    pub latest: String,
    pub versions: BTreeMap<String, TemplateEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateEntry {
    pub base_modules: Vec<String>,
    #[serde(default)]
    pub conditional_modules: Vec<ConditionalModules>,
}

/// `when` stays raw JSON so that a malformed condition is recorded in the
/// selection trace instead of rejecting the whole registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalModules {
    pub when: Value,
    pub add: Vec<String>,
}

/// Template registry - maps template ids to entries
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    entries: BTreeMap<TemplateId, RegistryEntry>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a registry document: `{ "<templateId>": entry, ... }`.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let entries: BTreeMap<TemplateId, RegistryEntry> = serde_json::from_str(content)
            .map_err(|e| AssemblyError::RegistryInvalid(e.to_string()))?;
        Ok(Self { entries })
    }

    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn list(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn register(&mut self, id: impl Into<TemplateId>, entry: RegistryEntry) {
        self.entries.insert(id.into(), entry);
    }

    /// Resolve a spec into its module selection. Pure: no I/O, same input
    /// always gives the same selection.
    pub fn resolve(&self, spec: &Spec) -> Result<ModuleSelection> {
        let raw_id = spec
            .template_id()
            .map_err(|_| AssemblyError::TemplateIdInvalid(String::new()))?;
        let template: TemplateRef = raw_id.parse()?;

        let entry = self
            .entries
            .get(&template.id)
            .ok_or_else(|| AssemblyError::TemplateNotRegistered(template.id.clone()))?;

        let (version_used, version_latest, entry) = match entry {
            RegistryEntry::Versioned(versioned) => {
                let used = template.version.clone().unwrap_or_else(|| versioned.latest.clone());
                let resolved = match versioned.versions.get(&used) {
                    Some(e) => e,
                    None if template.version.is_some() => {
                        return Err(AssemblyError::TemplateVersionNotRegistered {
                            template: template.id.clone(),
                            version: used,
                        })
                    }
                    None => {
                        return Err(AssemblyError::TemplateRegistryCorrupt {
                            template: template.id.clone(),
                            latest: versioned.latest.clone(),
                        })
                    }
                };
                (used, versioned.latest.clone(), resolved)
            }
            RegistryEntry::Single(single) => {
                if let Some(requested) = &template.version {
                    if requested != IMPLICIT_VERSION {
                        return Err(AssemblyError::TemplateVersionNotRegistered {
                            template: template.id.clone(),
                            version: requested.clone(),
                        });
                    }
                }
                (IMPLICIT_VERSION.to_string(), IMPLICIT_VERSION.to_string(), single)
            }
        };

        let mut trace = Vec::with_capacity(entry.conditional_modules.len());
        let mut additions: Vec<&str> = vec![];
        for conditional in &entry.conditional_modules {
            let evaluation = Condition::parse(&conditional.when).and_then(|c| c.evaluate(spec));
            let (result, error) = match evaluation {
                Ok(result) => (result, None),
                Err(message) => (false, Some(message)),
            };
            if result {
                additions.extend(conditional.add.iter().map(String::as_str));
            }
            trace.push(ConditionTrace {
                condition: conditional.when.clone(),
                result,
                applied: result,
                error,
            });
        }

        let mut seen = HashSet::new();
        let modules: Vec<String> = entry
            .base_modules
            .iter()
            .map(String::as_str)
            .chain(additions)
            .filter(|id| seen.insert(*id))
            .map(str::to_string)
            .collect();

        let conditions_applied = trace.iter().filter(|t| t.applied).count();
        debug!(
            template = %template.id,
            version = %version_used,
            modules = modules.len(),
            conditions_applied,
            "Resolved module selection"
        );

        Ok(ModuleSelection {
            template_id: template.id,
            version_used,
            version_latest,
            base_modules: entry.base_modules.clone(),
            conditions_evaluated: trace,
            conditions_applied,
            modules,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSelection {
    pub template_id: TemplateId,
    pub version_used: String,
    pub version_latest: String,
    pub base_modules: Vec<String>,
    pub conditions_evaluated: Vec<ConditionTrace>,
    pub conditions_applied: usize,
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionTrace {
    pub condition: Value,
    pub result: bool,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Leaf(ConditionLeaf),
    All(Vec<ConditionLeaf>),
    Any(Vec<ConditionLeaf>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionLeaf {
    pub path: String,
    pub equals: Option<Value>,
    pub exists: Option<bool>,
    pub one_of: Option<Vec<Value>>,
    pub gte: Option<f64>,
    pub lte: Option<f64>,
}

impl Condition {
    pub fn parse(raw: &Value) -> std::result::Result<Self, String> {
        let Some(map) = raw.as_object() else {
            return Err("condition must be an object".to_string());
        };
        if let Some(members) = map.get("and") {
            return Ok(Self::All(parse_members("and", members)?));
        }
        if let Some(members) = map.get("or") {
            return Ok(Self::Any(parse_members("or", members)?));
        }
        ConditionLeaf::parse(raw).map(Self::Leaf)
    }

    pub fn evaluate(&self, spec: &Spec) -> std::result::Result<bool, String> {
        match self {
            Self::Leaf(leaf) => leaf.evaluate(spec),
            Self::All(leaves) => {
                let results = leaves
                    .iter()
                    .map(|l| l.evaluate(spec))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(results.into_iter().all(|r| r))
            }
            Self::Any(leaves) => {
                let results = leaves
                    .iter()
                    .map(|l| l.evaluate(spec))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(results.into_iter().any(|r| r))
            }
        }
    }
}

fn parse_members(group: &str, members: &Value) -> std::result::Result<Vec<ConditionLeaf>, String> {
    let Some(items) = members.as_array() else {
        return Err(format!("'{}' must be an array of conditions", group));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| ConditionLeaf::parse(item).map_err(|e| format!("{}[{}]: {}", group, i, e)))
        .collect()
}

impl ConditionLeaf {
    pub fn parse(raw: &Value) -> std::result::Result<Self, String> {
        let Some(map) = raw.as_object() else {
            return Err("condition must be an object".to_string());
        };
        let path = map
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| "condition requires a string 'path'".to_string())?
            .to_string();

        let exists = match map.get("exists") {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => return Err(format!("condition on '{}': 'exists' must be a boolean", path)),
        };
        let one_of = match map.get("in") {
            None => None,
            Some(Value::Array(items)) => Some(items.clone()),
            Some(_) => return Err(format!("condition on '{}': 'in' must be an array", path)),
        };
        let bound = |key: &str| match map.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| format!("condition on '{}': '{}' must be a number", path, key)),
        };
        let gte = bound("gte")?;
        let lte = bound("lte")?;

        Ok(Self {
            equals: map.get("equals").cloned(),
            path,
            exists,
            one_of,
            gte,
            lte,
        })
    }

    fn has_value_operator(&self) -> bool {
        self.equals.is_some() || self.one_of.is_some() || self.gte.is_some() || self.lte.is_some()
    }

    pub fn evaluate(&self, spec: &Spec) -> std::result::Result<bool, String> {
        if self.exists.is_none() && !self.has_value_operator() {
            return Err(format!("condition on '{}' declares no operator", self.path));
        }
        let value = spec.lookup(&self.path);
        if let Some(expected) = self.exists {
            if value.is_some() != expected {
                return Ok(false);
            }
            if !self.has_value_operator() {
                return Ok(true);
            }
        }
        let Some(value) = value else {
            return Ok(false);
        };

        let equals_ok = self.equals.as_ref().map_or(true, |e| json_equals(value, e));
        let in_ok = self
            .one_of
            .as_ref()
            .map_or(true, |items| items.iter().any(|e| json_equals(value, e)));
        let gte_ok = self.gte.map_or(true, |b| value.as_f64().is_some_and(|v| v >= b));
        let lte_ok = self.lte.map_or(true, |b| value.as_f64().is_some_and(|v| v <= b));
        Ok(equals_ok && in_ok && gte_ok && lte_ok)
    }
}

/// JSON equality where numbers compare by value (`1 == 1.0`).
fn json_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> TemplateRegistry {
        TemplateRegistry::from_json(
            &json!({
                "idle-rpg-base": {
                    "latest": "1.1",
                    "versions": {
                        "1.0": {"baseModules": ["idle-loop"]},
                        "1.1": {
                            "baseModules": ["idle-loop", "combat"],
                            "conditionalModules": [
                                {"when": {"path": "features.inventory", "equals": true}, "add": ["inventory"]},
                                {"when": {"path": "progression.maxLevel", "gte": 2}, "add": ["progression", "combat"]}
                            ]
                        }
                    }
                },
                "clicker": {"baseModules": ["clicker-core"]},
                "broken": {"latest": "2.0", "versions": {"1.0": {"baseModules": []}}}
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_template_ref_parse() {
        let r: TemplateRef = "idle-rpg-base@1.0".parse().unwrap();
        assert_eq!(r.id, "idle-rpg-base");
        assert_eq!(r.version.as_deref(), Some("1.0"));
        assert!("Idle".parse::<TemplateRef>().is_err());
        assert!("idle@1".parse::<TemplateRef>().is_err());
        assert!("idle@1.0.0".parse::<TemplateRef>().is_err());
    }

    #[test]
    fn test_resolve_latest_with_conditions() {
        let spec = Spec::new(json!({
            "templateId": "idle-rpg-base",
            "features": {"inventory": false},
            "progression": {"maxLevel": 50}
        }));
        let selection = registry().resolve(&spec).unwrap();
        assert_eq!(selection.version_used, "1.1");
        assert_eq!(selection.version_latest, "1.1");
        assert_eq!(selection.modules, vec!["idle-loop", "combat", "progression"]);
        assert_eq!(selection.conditions_evaluated.len(), 2);
        assert!(!selection.conditions_evaluated[0].applied);
        assert!(selection.conditions_evaluated[1].applied);
        assert_eq!(selection.conditions_applied, 1);
    }

    #[test]
    fn test_resolve_pinned_version() {
        let spec = Spec::new(json!({"templateId": "idle-rpg-base@1.0"}));
        let selection = registry().resolve(&spec).unwrap();
        assert_eq!(selection.version_used, "1.0");
        assert_eq!(selection.version_latest, "1.1");
        assert_eq!(selection.modules, vec!["idle-loop"]);
    }

    #[test]
    fn test_resolve_errors() {
        let reg = registry();
        let err = reg.resolve(&Spec::new(json!({"templateId": "nope"}))).unwrap_err();
        assert!(matches!(err, AssemblyError::TemplateNotRegistered(_)));

        let err = reg.resolve(&Spec::new(json!({"templateId": "idle-rpg-base@9.9"}))).unwrap_err();
        assert!(matches!(err, AssemblyError::TemplateVersionNotRegistered { .. }));

        let err = reg.resolve(&Spec::new(json!({"templateId": "broken"}))).unwrap_err();
        assert!(matches!(err, AssemblyError::TemplateRegistryCorrupt { .. }));

        let err = reg.resolve(&Spec::new(json!({"templateId": "clicker@2.0"}))).unwrap_err();
        assert!(matches!(err, AssemblyError::TemplateVersionNotRegistered { .. }));

        let err = reg.resolve(&Spec::new(json!({"templateId": "Bad Id"}))).unwrap_err();
        assert!(matches!(err, AssemblyError::TemplateIdInvalid(_)));
    }

    #[test]
    fn test_unversioned_implicit_version() {
        let reg = registry();
        let selection = reg.resolve(&Spec::new(json!({"templateId": "clicker@1.0"}))).unwrap();
        assert_eq!(selection.version_used, IMPLICIT_VERSION);
        assert_eq!(selection.modules, vec!["clicker-core"]);
    }

    #[test]
    fn test_leaf_semantics() {
        let spec = Spec::new(json!({"a": {"n": 3, "s": "x", "nul": null}}));
        let eval = |c: Value| Condition::parse(&c).and_then(|c| c.evaluate(&spec));

        assert_eq!(eval(json!({"path": "a.n", "exists": true})), Ok(true));
        assert_eq!(eval(json!({"path": "a.nul", "exists": true})), Ok(true));
        assert_eq!(eval(json!({"path": "a.zz", "exists": false})), Ok(true));
        assert_eq!(eval(json!({"path": "a.n", "equals": 3.0})), Ok(true));
        assert_eq!(eval(json!({"path": "a.s", "in": ["y", "x"]})), Ok(true));
        assert_eq!(eval(json!({"path": "a.n", "gte": 1, "lte": 3})), Ok(true));
        assert_eq!(eval(json!({"path": "a.n", "gte": 1, "lte": 2})), Ok(false));
        assert_eq!(eval(json!({"path": "a.zz", "equals": null})), Ok(false));
        assert_eq!(eval(json!({"path": "a.s", "gte": 1})), Ok(false));
        assert!(eval(json!({"path": "a.n"})).is_err());
        assert!(eval(json!({"path": "a.n", "in": 3})).is_err());
    }

    #[test]
    fn test_groups() {
        let spec = Spec::new(json!({"a": 1, "b": 2}));
        let eval = |c: Value| Condition::parse(&c).and_then(|c| c.evaluate(&spec));

        assert_eq!(eval(json!({"and": [{"path": "a", "equals": 1}, {"path": "b", "equals": 2}]})), Ok(true));
        assert_eq!(eval(json!({"and": [{"path": "a", "equals": 1}, {"path": "b", "equals": 3}]})), Ok(false));
        assert_eq!(eval(json!({"or": [{"path": "a", "equals": 9}, {"path": "b", "equals": 2}]})), Ok(true));
        assert!(eval(json!({"or": [{"path": "a", "equals": 1}, {"nopath": true}]})).is_err());
        assert!(eval(json!({"and": [{"path": "a", "equals": 1}, {"path": "b"}]})).is_err());
    }

    #[test]
    fn test_malformed_condition_recorded_not_thrown() {
        let mut reg = TemplateRegistry::new();
        reg.register(
            "t",
            RegistryEntry::Single(TemplateEntry {
                base_modules: vec!["a".to_string()],
                conditional_modules: vec![ConditionalModules {
                    when: json!({"path": "x"}),
                    add: vec!["b".to_string()],
                }],
            }),
        );
        let selection = reg.resolve(&Spec::new(json!({"templateId": "t", "x": 1}))).unwrap();
        assert_eq!(selection.modules, vec!["a"]);
        let trace = &selection.conditions_evaluated[0];
        assert!(!trace.result);
        assert!(trace.error.as_deref().unwrap_or("").contains("no operator"));
    }
}
