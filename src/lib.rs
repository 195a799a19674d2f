//! ModForge Core - Module Assembly Compiler
//!
//! # The Six Laws (Non-Negotiable)
//! 1. Specs Are Truth
//! 2. Templates Decide Modules
//! 3. Validation Fails Fast And Explains Itself
//! 4. Modules Write Only Inside Their Namespace
//! 5. Identical Input, Identical Bytes
//! 6. Only Passing Builds Ship

pub mod assembler;
pub mod config;
pub mod error;
pub mod export;
pub mod hashing;
pub mod manifest;
pub mod smoke;
pub mod spec;
pub mod templates;
pub mod validation;
pub mod workspace;

pub use assembler::{AssembleOptions, Assembler, AssemblyOutcome, AssemblyPlan, AssemblyReport, AssemblyStatus};
pub use config::AssemblerConfig;
pub use error::{AssemblyError, Result};
pub use export::{verify_archive, verify_checksums, BuildManifest, ExportResult, Exporter};
pub use hashing::{build_id, canonical_json, compute_hash};
pub use manifest::ModuleManifest;
pub use smoke::{SmokeHarness, SmokeResult};
pub use spec::{DefaultSpecContract, Spec, SpecContract};
pub use templates::{ModuleSelection, TemplateId, TemplateRegistry};
pub use validation::{ValidationPipeline, ValidationReport, WriteIntent};
pub use workspace::Workspace;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
