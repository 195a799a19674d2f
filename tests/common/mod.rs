//! Shared fixtures: a temp root holding a registry, module directories,
//! workspaces and the smoke cache.

#![allow(dead_code)]

use std::fs;

use serde_json::{json, Value};
use tempfile::TempDir;

use modforge_core::hashing::sha256_hex;
use modforge_core::{Assembler, AssemblerConfig, Spec};

pub const TEMPLATE: &str = "idle-rpg-base";

pub fn registry() -> Value {
    json!({
        "idle-rpg-base": {
            "latest": "1.0",
            "versions": {
                "1.0": {
                    "baseModules": ["idle-loop", "combat"],
                    "conditionalModules": [
                        {"when": {"path": "features.progression", "equals": true}, "add": ["progression"]},
                        {"when": {"path": "features.inventory", "equals": true}, "add": ["inventory"]}
                    ]
                }
            }
        }
    })
}

pub fn idle_rpg_spec() -> Spec {
    Spec::new(json!({
        "templateId": TEMPLATE,
        "title": "Dungeon Idler",
        "features": {"progression": true, "inventory": false}
    }))
}

/// A module that counts ticks into the shared state under its own id.
pub fn lifecycle_source(id: &str) -> String {
    format!(
        r#"local M = {{}}
function M.init(ctx) ctx.state["{id}"] = 0 end
function M.start(ctx) ctx.log("{id} started") end
function M.tick(ctx, n) ctx.state["{id}"] = ctx.state["{id}"] + n end
function M.stop(ctx) ctx.emit("{id}.stopped", {{ total = ctx.state["{id}"] }}) end
function M.dispose(ctx) end
return M
"#
    )
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: AssemblerConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = AssemblerConfig::rooted_at(dir.path());
        fs::create_dir_all(config.registry_path.parent().unwrap()).unwrap();
        fs::write(&config.registry_path, registry().to_string()).unwrap();
        Self { dir, config }
    }

    /// All three modules of the idle RPG template, wired loop -> combat -> progression.
    pub fn with_idle_rpg_modules() -> Self {
        let fixture = Self::new();
        fixture.write_module("idle-loop", &["loop.tick"], &["core.clock"]);
        fixture.write_module("combat", &["combat.hit"], &["loop.tick"]);
        fixture.write_module("progression", &["level.up"], &["combat.hit"]);
        fixture
    }

    pub fn write_module(&self, id: &str, provides: &[&str], consumes: &[&str]) {
        self.write_module_source(id, provides, consumes, &lifecycle_source(id));
    }

    pub fn write_module_source(&self, id: &str, provides: &[&str], consumes: &[&str], source: &str) {
        let manifest = json!({
            "id": id,
            "kind": "system",
            "entryPath": "main.lua",
            "templateId": TEMPLATE,
            "provides": {"events": provides},
            "consumes": {"events": consumes},
            "files": [{"path": "main.lua", "role": "entry", "contentHash": sha256_hex(source.as_bytes())}]
        });
        self.write_raw_module(id, &manifest, &[("main.lua", source)]);
    }

    pub fn write_raw_module(&self, dir_name: &str, manifest: &Value, files: &[(&str, &str)]) {
        let dir = self.config.modules_root.join(dir_name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("module.json"), serde_json::to_string_pretty(manifest).unwrap()).unwrap();
        for (path, content) in files {
            let target = dir.join(path);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(target, content).unwrap();
        }
    }

    pub fn assembler(&self) -> Assembler {
        Assembler::from_config(self.config.clone()).unwrap()
    }
}
