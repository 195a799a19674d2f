//! Content-addressed module cache.
//!
//! `<root>/<moduleId>/<cacheKey>/` holds a module's declared files. An entry
//! is written to a staging directory and renamed into place, so a present
//! entry is always complete.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SmokeModule;
use crate::error::{AssemblyError, Result};
use crate::hashing::hash_file_set;
use crate::manifest::is_safe_relative_path;

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub module_id: String,
    pub cache_key: String,
    /// Relative to the cache root.
    pub path: String,
    pub reused: bool,
}

pub struct ModuleCache {
    root: PathBuf,
}

impl ModuleCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Key over every declared `(path, contentHash)` of the module.
    pub fn cache_key(module: &SmokeModule) -> String {
        hash_file_set(
            module
                .files
                .iter()
                .map(|f| (f.path.as_str(), f.content_hash.as_str())),
        )
    }

    pub fn entry_dir(&self, module_id: &str, cache_key: &str) -> PathBuf {
        self.root.join(module_id).join(cache_key)
    }

    /// Ensure the module's files are cached; returns the entry and its directory.
    pub fn ensure(&self, module: &SmokeModule) -> Result<(CacheEntry, PathBuf)> {
        let key = Self::cache_key(module);
        let dir = self.entry_dir(&module.id, &key);
        let entry = |reused| CacheEntry {
            module_id: module.id.clone(),
            cache_key: key.clone(),
            path: format!("{}/{}", module.id, key),
            reused,
        };

        if dir.is_dir() {
            debug!(module = %module.id, key = %key, "Smoke cache hit");
            return Ok((entry(true), dir));
        }

        let staging = self.root.join(&module.id).join(format!(
            ".staging-{}-{}-{}",
            key,
            std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = stage(&staging, module) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        match fs::rename(&staging, &dir) {
            Ok(()) => {
                debug!(module = %module.id, key = %key, "Smoke cache entry written");
                Ok((entry(false), dir))
            }
            // Another build published the same entry first.
            Err(_) if dir.is_dir() => {
                fs::remove_dir_all(&staging)?;
                Ok((entry(true), dir))
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(e.into())
            }
        }
    }
}

/// Write every declared file of `module` under `staging`, in path order.
fn stage(staging: &Path, module: &SmokeModule) -> Result<()> {
    fs::create_dir_all(staging)?;
    let mut files: Vec<_> = module.files.iter().collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    for file in files {
        if !is_safe_relative_path(&file.path) {
            return Err(AssemblyError::PathEscapesRoot {
                path: format!("{}/{}", module.id, file.path),
            });
        }
        let target = staging.join(&file.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &file.content)?;
    }
    Ok(())
}
