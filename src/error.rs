//! Error Taxonomy
//!
//! Validation problems are collected into report steps and never surface here.
//! These variants are the structural failures that abort a build (or an export).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Template id invalid: {0}")]
    TemplateIdInvalid(String),

    #[error("Template not registered: {0}")]
    TemplateNotRegistered(String),

    #[error("Template {template} has no registered version {version}")]
    TemplateVersionNotRegistered { template: String, version: String },

    #[error("Template registry corrupt: {template} declares latest {latest} but no such version exists")]
    TemplateRegistryCorrupt { template: String, latest: String },

    #[error("Template registry invalid: {0}")]
    RegistryInvalid(String),

    #[error("Spec invalid: {0}")]
    SpecSchemaInvalid(String),

    #[error("Required module unavailable: {0}")]
    ModuleMissing(String),

    #[error("Manifest id mismatch: directory {directory} declares id {declared}")]
    ManifestIdMismatch { directory: String, declared: String },

    #[error("Invalid runtime module {module}: missing {missing}")]
    InvalidRuntimeModule { module: String, missing: String },

    #[error("Smoke execution failed: {0}")]
    SmokeExecutionFailure(String),

    #[error("Build {build_id} is not passing (status: {status})")]
    BuildNotPassing { build_id: String, status: String },

    #[error("Path escapes root: {path}")]
    PathEscapesRoot { path: String },

    #[error("Archive too large: {0}")]
    ArchiveTooLarge(String),

    #[error("Archive malformed: {0}")]
    ArchiveMalformed(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AssemblyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        let err = AssemblyError::ManifestIdMismatch {
            directory: "combat".to_string(),
            declared: "combat-v2".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("combat"));
        assert!(msg.contains("combat-v2"));

        let err = AssemblyError::BuildNotPassing {
            build_id: "build-abc".to_string(),
            status: "FAIL".to_string(),
        };
        assert!(err.to_string().contains("not passing"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AssemblyError = io.into();
        assert!(matches!(err, AssemblyError::Io(_)));
    }
}
