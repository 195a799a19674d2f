//! Static scan of module sources for forbidden capabilities.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ModuleFile, PipelineInput, StageContext, StepId, ValidationStage};
use crate::config::SecurityConfig;
use crate::error::{AssemblyError, Result};
use crate::workspace::SECURITY_REPORT;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityFinding {
    /// Assembly-relative path (`<namespace>/<moduleId>/<path>`).
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub rule: String,
    pub message: String,
}

impl fmt::Display for SecurityFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{} {}", self.file, self.line, self.column, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReport {
    pub ok: bool,
    pub scanned_files: usize,
    pub findings: Vec<SecurityFinding>,
}

struct Rule {
    id: String,
    pattern: Regex,
    message: String,
}

pub struct SecurityScanner {
    rules: Vec<Rule>,
    extensions: Vec<String>,
    namespace: String,
}

impl SecurityScanner {
    pub fn new(config: &SecurityConfig, namespace: &str) -> Result<Self> {
        let rules = config
            .rules
            .iter()
            .map(|r| {
                Regex::new(&r.pattern)
                    .map(|pattern| Rule {
                        id: r.id.clone(),
                        pattern,
                        message: r.message.clone(),
                    })
                    .map_err(|e| AssemblyError::ConfigInvalid(format!("security rule '{}': {}", r.id, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            extensions: config.extensions.clone(),
            namespace: namespace.to_string(),
        })
    }

    fn is_scanned(&self, path: &str) -> bool {
        match path.rsplit_once('.') {
            Some((_, ext)) => self.extensions.iter().any(|e| e == ext),
            None => false,
        }
    }

    /// Findings are ordered by file (input order), then line, column and rule.
    pub fn scan(&self, files: &[ModuleFile]) -> SecurityReport {
        let mut findings = vec![];
        let mut scanned_files = 0;

        for file in files {
            if !self.is_scanned(&file.path) {
                continue;
            }
            // Undecodable bytes become U+FFFD; the rest of the file is still scanned.
            let text = String::from_utf8_lossy(&file.content);
            scanned_files += 1;
            let display_path = format!("{}/{}/{}", self.namespace, file.module_id, file.path);

            let mut file_findings = vec![];
            for (line_no, line) in text.lines().enumerate() {
                for rule in &self.rules {
                    for m in rule.pattern.find_iter(line) {
                        file_findings.push(SecurityFinding {
                            file: display_path.clone(),
                            line: line_no + 1,
                            column: line[..m.start()].chars().count() + 1,
                            rule: rule.id.clone(),
                            message: rule.message.clone(),
                        });
                    }
                }
            }
            file_findings.sort_by(|a, b| (a.line, a.column, &a.rule).cmp(&(b.line, b.column, &b.rule)));
            findings.extend(file_findings);
        }

        SecurityReport {
            ok: findings.is_empty(),
            scanned_files,
            findings,
        }
    }
}

pub struct SecurityScanStage {
    scanner: SecurityScanner,
}

impl SecurityScanStage {
    pub fn new(scanner: SecurityScanner) -> Self {
        Self { scanner }
    }
}

impl ValidationStage for SecurityScanStage {
    fn id(&self) -> StepId {
        StepId::Security
    }

    fn applies(&self, input: &PipelineInput<'_>) -> bool {
        !input.files.is_empty()
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<Vec<String>> {
        let report = self.scanner.scan(ctx.input.files);
        let path = ctx.workspace.write_report(SECURITY_REPORT, &report)?;
        ctx.record_artifact("securityReport", path);
        Ok(report.findings.iter().map(|f| f.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityRuleConfig;

    fn file(module: &str, path: &str, content: &str) -> ModuleFile {
        ModuleFile {
            module_id: module.to_string(),
            path: path.to_string(),
            content: content.as_bytes().to_vec(),
        }
    }

    fn scanner() -> SecurityScanner {
        SecurityScanner::new(&SecurityConfig::default(), "modules").unwrap()
    }

    #[test]
    fn test_clean_source_passes() {
        let report = scanner().scan(&[file(
            "combat",
            "main.lua",
            "local M = {}\nfunction M.tick(ctx) ctx.state.hits = 1 end\nreturn M\n",
        )]);
        assert!(report.ok);
        assert_eq!(report.scanned_files, 1);
    }

    #[test]
    fn test_finding_has_location() {
        let report = scanner().scan(&[file("combat", "main.lua", "local x = 1\n  local f = loadstring(\"x\")\n")]);
        assert!(!report.ok);
        let finding = &report.findings[0];
        assert_eq!(finding.file, "modules/combat/main.lua");
        assert_eq!(finding.line, 2);
        assert_eq!(finding.column, 13);
        assert_eq!(finding.rule, "dynamic-eval");
        assert!(finding.to_string().starts_with("modules/combat/main.lua:2:13 "));
    }

    #[test]
    fn test_unlisted_extensions_skipped() {
        let report = scanner().scan(&[
            file("combat", "notes.md", "os.execute('x')"),
            file("combat", "README", "loadstring('x')"),
        ]);
        assert!(report.ok);
        assert_eq!(report.scanned_files, 0);
    }

    #[test]
    fn test_invalid_utf8_is_still_scanned() {
        let tainted = ModuleFile {
            module_id: "combat".to_string(),
            path: "main.lua".to_string(),
            content: b"-- \xff\nlocal f = loadstring('x')\n".to_vec(),
        };
        let report = scanner().scan(&[tainted]);
        assert!(!report.ok);
        assert_eq!(report.scanned_files, 1);
        assert_eq!(report.findings[0].line, 2);
        assert_eq!(report.findings[0].column, 11);

        let binary = ModuleFile {
            module_id: "combat".to_string(),
            path: "web/hook.js".to_string(),
            content: b"\xff\xfe\neval(payload)".to_vec(),
        };
        let report = scanner().scan(&[binary]);
        assert_eq!(report.scanned_files, 1);
        assert_eq!(report.findings[0].to_string(), "modules/combat/web/hook.js:2:1 dynamic code evaluation is forbidden");
    }

    #[test]
    fn test_invalid_rule_is_config_error() {
        let config = SecurityConfig {
            extensions: vec!["lua".to_string()],
            rules: vec![SecurityRuleConfig {
                id: "broken".to_string(),
                pattern: "(".to_string(),
                message: "x".to_string(),
            }],
        };
        assert!(matches!(
            SecurityScanner::new(&config, "modules"),
            Err(AssemblyError::ConfigInvalid(_))
        ));
    }
}
