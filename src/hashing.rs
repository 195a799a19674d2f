//! Hashing System - SHA-256 over Canonical JSON
//!
//! Every identity in a build (build ids, manifest hashes, cache keys,
//! export checksums) is derived here.

use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{AssemblyError, Result};

/// Number of hex characters of the input hash kept in a build id.
pub const BUILD_ID_HASH_LEN: usize = 12;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Structurally canonical form: object keys sorted recursively, array order kept.
pub fn normalize(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(normalize).collect()),
        _ => v.clone(),
    }
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> std::result::Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    serde_json::to_string(&normalize(&v))
}

/// `sha256(canonical_json(value))`
pub fn compute_hash<T: Serialize>(value: &T) -> std::result::Result<String, serde_json::Error> {
    let canonical = canonical_json(value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Derive a build id: `<prefix>-<hash[0:12]>` over the canonical input.
pub fn build_id<T: Serialize>(prefix: &str, input: &T) -> std::result::Result<String, serde_json::Error> {
    let hash = compute_hash(input)?;
    Ok(format!("{}-{}", prefix, &hash[..BUILD_ID_HASH_LEN]))
}

/// Hash a set of `(path, content_hash)` pairs independent of their input order.
pub fn hash_file_set<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut entries: Vec<_> = entries.into_iter().collect();
    entries.sort();
    let mut hasher = Sha256::new();
    for (path, hash) in entries {
        hasher.update(path.as_bytes());
        hasher.update(b"\t");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Hash every regular file under `root` as `relative/path \t sha256`, sorted by path.
///
/// A missing directory hashes like an empty one.
pub fn hash_tree(root: &Path) -> Result<String> {
    let listing = list_tree(root)?;
    Ok(hash_file_set(
        listing.iter().map(|(p, h)| (p.as_str(), h.as_str())),
    ))
}

/// Every regular file under `root` as `(forward/slash/relative, sha256)`, sorted by path.
pub fn list_tree(root: &Path) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    if !root.exists() {
        return Ok(entries);
    }
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| AssemblyError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative_slash_path(root, entry.path())?;
        let data = fs::read(entry.path())?;
        entries.push((rel, sha256_hex(&data)));
    }
    entries.sort();
    Ok(entries)
}

/// Relative path of `path` under `root`, always joined with `/`.
pub fn relative_slash_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| AssemblyError::PathEscapesRoot {
        path: path.display().to_string(),
    })?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": 3});
        let canonical = canonical_json(&obj).unwrap();
        assert_eq!(canonical, r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn test_normalize_keeps_array_order() {
        let obj = json!({"list": [{"b": 1, "a": 2}, 3, 1]});
        let canonical = canonical_json(&obj).unwrap();
        assert_eq!(canonical, r#"{"list":[{"a":2,"b":1},3,1]}"#);
    }

    #[test]
    fn test_hash_deterministic() {
        let h1 = sha256_hex(b"test data");
        let h2 = sha256_hex(b"test data");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_build_id_shape() {
        let id = build_id("build", &json!({"templateId": "idle-rpg-base"})).unwrap();
        assert!(id.starts_with("build-"));
        assert_eq!(id.len(), "build-".len() + BUILD_ID_HASH_LEN);
    }

    #[test]
    fn test_build_id_ignores_key_order() {
        let a = build_id("build", &json!({"a": 1, "b": {"c": 2, "d": 3}})).unwrap();
        let b = build_id("build", &json!({"b": {"d": 3, "c": 2}, "a": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_file_set_order_independent() {
        let a = hash_file_set(vec![("b.lua", "22"), ("a.lua", "11")]);
        let b = hash_file_set(vec![("a.lua", "11"), ("b.lua", "22")]);
        assert_eq!(a, b);
        let c = hash_file_set(vec![("a.lua", "11"), ("b.lua", "23")]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_tree_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(hash_tree(&missing).unwrap(), hash_file_set(Vec::new()));
    }

    #[test]
    fn test_list_tree_uses_forward_slashes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c.txt"), b"x").unwrap();
        fs::write(dir.path().join("top.txt"), b"y").unwrap();
        let listing = list_tree(dir.path()).unwrap();
        let paths: Vec<_> = listing.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["a/b/c.txt", "top.txt"]);
    }
}
