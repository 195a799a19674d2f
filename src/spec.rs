//! Content Spec - Opaque Descriptor
//!
//! The spec's domain schema is owned elsewhere. This core hashes it, reads its
//! template id and looks up dotted paths for condition evaluation. Structural
//! checks go through the [`SpecContract`] seam.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AssemblyError, Result};

pub const TEMPLATE_ID_FIELD: &str = "templateId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Spec(Value);

impl Spec {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self(serde_json::from_str(&content)?))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn template_id(&self) -> Result<&str> {
        self.0
            .get(TEMPLATE_ID_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| AssemblyError::SpecSchemaInvalid(format!("{} must be a string", TEMPLATE_ID_FIELD)))
    }

    /// Resolve a dotted path (`a.b.0.c`). Arrays are indexed numerically.
    /// `None` means undefined; JSON `null` is a defined value.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return None;
        }
        let mut current = &self.0;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Structural contract for specs. Each check returns human-readable errors;
/// an empty list means the check passed.
pub trait SpecContract: Send + Sync {
    fn check_schema(&self, spec: &Spec) -> Vec<String>;
    fn check_integrity(&self, spec: &Spec) -> Vec<String>;
}

/// Generic contract: a JSON object with a string `templateId`, unique ids
/// inside every collection and resolvable `*Ref` / `*Refs` fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSpecContract;

impl SpecContract for DefaultSpecContract {
    fn check_schema(&self, spec: &Spec) -> Vec<String> {
        let mut errors = vec![];
        let Some(root) = spec.value().as_object() else {
            return vec!["spec: must be a JSON object".to_string()];
        };
        match root.get(TEMPLATE_ID_FIELD) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) => errors.push(format!("spec.{}: must not be empty", TEMPLATE_ID_FIELD)),
            Some(_) => errors.push(format!("spec.{}: must be a string", TEMPLATE_ID_FIELD)),
            None => errors.push(format!("spec.{}: required", TEMPLATE_ID_FIELD)),
        }
        errors
    }

    fn check_integrity(&self, spec: &Spec) -> Vec<String> {
        let mut errors = vec![];
        let mut ids = BTreeSet::new();
        collect_collection_ids(spec.value(), "spec", &mut ids, &mut errors);
        check_references(spec.value(), "spec", &ids, &mut errors);
        errors
    }
}

fn collect_collection_ids(
    value: &Value,
    at: &str,
    ids: &mut BTreeSet<String>,
    errors: &mut Vec<String>,
) {
    match value {
        Value::Array(items) => {
            let is_collection = items
                .iter()
                .any(|item| item.get("id").is_some() && item.is_object());
            if is_collection {
                let mut seen = BTreeSet::new();
                for (i, item) in items.iter().enumerate() {
                    match item.get("id").and_then(Value::as_str) {
                        Some(id) => {
                            if !seen.insert(id.to_string()) {
                                errors.push(format!("{}: duplicate id '{}'", at, id));
                            }
                            ids.insert(id.to_string());
                        }
                        None => errors.push(format!("{}[{}]: collection item without string id", at, i)),
                    }
                }
            }
            for (i, item) in items.iter().enumerate() {
                collect_collection_ids(item, &format!("{}[{}]", at, i), ids, errors);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                collect_collection_ids(v, &format!("{}.{}", at, k), ids, errors);
            }
        }
        _ => {}
    }
}

fn check_references(value: &Value, at: &str, ids: &BTreeSet<String>, errors: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let here = format!("{}.{}", at, k);
                if k.ends_with("Ref") {
                    if let Some(target) = v.as_str() {
                        if !ids.contains(target) {
                            errors.push(format!("{}: unresolved reference '{}'", here, target));
                        }
                    }
                } else if k.ends_with("Refs") {
                    if let Some(targets) = v.as_array() {
                        for target in targets.iter().filter_map(Value::as_str) {
                            if !ids.contains(target) {
                                errors.push(format!("{}: unresolved reference '{}'", here, target));
                            }
                        }
                    }
                }
                check_references(v, &here, ids, errors);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                check_references(item, &format!("{}[{}]", at, i), ids, errors);
            }
        }
        _ => {}
    }
}
