//! Module Manifests - Declared Identity, Files and Capabilities

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AssemblyError, Result};

/// Manifest `templateId` marking a module shared by every template.
pub const SHARED_TEMPLATE: &str = "*";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    pub id: String,
    pub kind: String,
    pub entry_path: String,
    pub template_id: String,
    #[serde(default)]
    pub provides: Capabilities,
    #[serde(default)]
    pub consumes: Capabilities,
    pub files: Vec<ManifestFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<ManifestAsset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub state: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

impl Capabilities {
    /// Every capability with its kind, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (CapabilityKind, &str)> {
        self.events
            .iter()
            .map(|n| (CapabilityKind::Event, n.as_str()))
            .chain(self.state.iter().map(|n| (CapabilityKind::State, n.as_str())))
            .chain(self.commands.iter().map(|n| (CapabilityKind::Command, n.as_str())))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Event,
    State,
    Command,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event => write!(f, "event"),
            Self::State => write!(f, "state"),
            Self::Command => write!(f, "command"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    pub path: String,
    pub role: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAsset {
    pub id: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    pub path: String,
    pub content_hash: String,
    pub size_bytes: u64,
}

impl ModuleManifest {
    pub fn entry_file(&self) -> Option<&ManifestFile> {
        self.files.iter().find(|f| f.path == self.entry_path)
    }

    /// Every declared path with its content hash: files first, then assets.
    pub fn declared_paths(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files
            .iter()
            .map(|f| (f.path.as_str(), f.content_hash.as_str()))
            .chain(self.assets.iter().map(|a| (a.path.as_str(), a.content_hash.as_str())))
    }

    /// Field rules serde cannot express. Empty means valid.
    pub fn schema_errors(&self) -> Vec<String> {
        let mut errors = vec![];
        if !is_valid_module_id(&self.id) {
            errors.push(format!("id '{}' must match ^[a-z0-9][a-z0-9-]*$", self.id));
        }
        if self.kind.trim().is_empty() {
            errors.push("kind must not be empty".to_string());
        }
        if self.template_id.trim().is_empty() {
            errors.push("templateId must not be empty".to_string());
        }
        if self.files.is_empty() {
            errors.push("files must declare at least one file".to_string());
        }
        for file in &self.files {
            if file.role.trim().is_empty() {
                errors.push(format!("file '{}' has an empty role", file.path));
            }
            if !is_content_hash(&file.content_hash) {
                errors.push(format!("file '{}' contentHash must be 64 lowercase hex characters", file.path));
            }
        }
        for asset in &self.assets {
            if asset.id.trim().is_empty() {
                errors.push(format!("asset '{}' has an empty id", asset.path));
            }
            if !is_content_hash(&asset.content_hash) {
                errors.push(format!("asset '{}' contentHash must be 64 lowercase hex characters", asset.path));
            }
        }
        if self.entry_file().is_none() {
            errors.push(format!("entryPath '{}' is not among declared files", self.entry_path));
        }
        errors
    }
}

pub fn is_valid_module_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub fn is_content_hash(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Root-relative, forward-slash, no `..`, no `.`, no empty segments, no drive
/// or absolute prefix.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') || path.contains(':') {
        return false;
    }
    path.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// Lexically normalize a forward-slash path. `None` if it climbs above its start
/// or is absolute.
pub fn normalize_relative(path: &str) -> Option<String> {
    if path.starts_with('/') || path.contains('\\') || path.contains(':') {
        return None;
    }
    let mut parts: Vec<&str> = vec![];
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    Some(parts.join("/"))
}

/// A manifest read from `<modules_root>/<id>/<manifest_file>`.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub id: String,
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
    pub raw: Value,
}

/// Why a module could not be loaded. Not fatal to the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unavailable {
    pub id: String,
    pub reason: String,
}

pub enum ManifestLoad {
    Loaded(LoadedManifest),
    Missing(Unavailable),
}

/// Locate and parse a module's manifest. A declared id that differs from the
/// directory name is fatal; anything else that prevents loading marks the
/// module missing.
pub fn load_manifest(modules_root: &Path, id: &str, manifest_file: &str) -> Result<ManifestLoad> {
    let missing = |reason: String| {
        Ok(ManifestLoad::Missing(Unavailable {
            id: id.to_string(),
            reason,
        }))
    };

    if !is_valid_module_id(id) {
        return missing(format!("module id '{}' is not a valid directory name", id));
    }
    let dir = modules_root.join(id);
    let manifest_path = dir.join(manifest_file);
    let content = match fs::read_to_string(&manifest_path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return missing(format!("manifest not found at {}", manifest_path.display()))
        }
        Err(e) => return missing(format!("manifest unreadable: {}", e)),
    };
    let raw: Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => return missing(format!("manifest is not valid JSON: {}", e)),
    };
    if let Some(declared) = raw.get("id").and_then(Value::as_str) {
        if declared != id {
            return Err(AssemblyError::ManifestIdMismatch {
                directory: id.to_string(),
                declared: declared.to_string(),
            });
        }
    }
    Ok(ManifestLoad::Loaded(LoadedManifest {
        id: id.to_string(),
        dir,
        manifest_path,
        raw,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    fn manifest_json(id: &str) -> Value {
        json!({
            "id": id,
            "kind": "system",
            "entryPath": "main.lua",
            "templateId": "idle-rpg-base",
            "provides": {"events": ["combat.hit"]},
            "consumes": {"state": ["core.clock"]},
            "files": [{"path": "main.lua", "role": "entry", "contentHash": HASH}]
        })
    }

    #[test]
    fn test_parse_defaults() {
        let m: ModuleManifest = serde_json::from_value(manifest_json("combat")).unwrap();
        assert!(m.schema_errors().is_empty());
        assert!(m.provides.state.is_empty());
        assert!(m.assets.is_empty());
        let caps: Vec<_> = m.consumes.iter().collect();
        assert_eq!(caps, vec![(CapabilityKind::State, "core.clock")]);
    }

    #[test]
    fn test_entry_must_be_declared() {
        let mut raw = manifest_json("combat");
        raw["entryPath"] = json!("other.lua");
        let m: ModuleManifest = serde_json::from_value(raw).unwrap();
        let errors = m.schema_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("entryPath"));
    }

    #[test]
    fn test_bad_hash_and_id() {
        let mut raw = manifest_json("Combat");
        raw["files"][0]["contentHash"] = json!("abc");
        let m: ModuleManifest = serde_json::from_value(raw).unwrap();
        assert_eq!(m.schema_errors().len(), 2);
    }

    #[test]
    fn test_safe_paths() {
        assert!(is_safe_relative_path("main.lua"));
        assert!(is_safe_relative_path("systems/combat.lua"));
        assert!(!is_safe_relative_path("../other/main.lua"));
        assert!(!is_safe_relative_path("a/../../b"));
        assert!(!is_safe_relative_path("/etc/passwd"));
        assert!(!is_safe_relative_path("C:/x"));
        assert!(!is_safe_relative_path("a//b"));
        assert!(!is_safe_relative_path("a\\b"));
        assert!(!is_safe_relative_path(""));
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("a/./b/../c").as_deref(), Some("a/c"));
        assert_eq!(normalize_relative("a/../.."), None);
        assert_eq!(normalize_relative("/a"), None);
    }

    #[test]
    fn test_load_manifest_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        match load_manifest(root, "combat", "module.json").unwrap() {
            ManifestLoad::Missing(u) => assert!(u.reason.contains("not found")),
            ManifestLoad::Loaded(_) => panic!("expected missing"),
        }

        fs::create_dir_all(root.join("combat")).unwrap();
        fs::write(root.join("combat/module.json"), manifest_json("combat").to_string()).unwrap();
        assert!(matches!(
            load_manifest(root, "combat", "module.json").unwrap(),
            ManifestLoad::Loaded(_)
        ));

        fs::create_dir_all(root.join("loot")).unwrap();
        fs::write(root.join("loot/module.json"), manifest_json("inventory").to_string()).unwrap();
        let err = load_manifest(root, "loot", "module.json").err().unwrap();
        assert!(matches!(err, AssemblyError::ManifestIdMismatch { .. }));

        fs::create_dir_all(root.join("broken")).unwrap();
        fs::write(root.join("broken/module.json"), "{not json").unwrap();
        assert!(matches!(
            load_manifest(root, "broken", "module.json").unwrap(),
            ManifestLoad::Missing(_)
        ));
    }
}
