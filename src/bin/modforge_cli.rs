//! ModForge CLI - Host interface for the assembly engine
//!
//! Commands: resolve, assemble, export, verify
//! Outputs JSON to stdout, logs to stderr
//! Exit codes: 0 success/PASS, 2 FAIL or refused, 1 anything else

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use modforge_core::{
    verify_archive, verify_checksums, AssembleOptions, Assembler, AssemblerConfig, AssemblyError, Exporter,
    Spec, WriteIntent,
};

#[derive(Parser)]
#[command(name = "modforge-cli")]
#[command(about = "ModForge CLI - Module Assembly Compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a spec into its module selection
    Resolve {
        #[arg(short, long)]
        spec: PathBuf,
    },

    /// Assemble, validate and smoke-test a spec
    Assemble {
        #[arg(short, long)]
        spec: PathBuf,

        /// Extra write intent, as module:path
        #[arg(short, long = "write")]
        writes: Vec<String>,
    },

    /// Export a passing build
    Export {
        /// Build id
        #[arg(short, long)]
        build: String,
    },

    /// Verify an export root or an archive
    Verify {
        #[arg(long, conflicts_with = "archive", required_unless_present = "archive")]
        export: Option<PathBuf>,

        #[arg(long)]
        archive: Option<PathBuf>,

        /// Expected archive digest (defaults to the .sha256 sidecar)
        #[arg(long, requires = "archive")]
        digest: Option<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => println!(r#"{{"error": "Failed to serialize output: {}"}}"#, e),
    }
}

fn fail(error: &AssemblyError) -> ExitCode {
    print_json(&serde_json::json!({"success": false, "error": error.to_string()}));
    match error {
        AssemblyError::BuildNotPassing { .. } | AssemblyError::ChecksumMismatch { .. } => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn parse_write(raw: &str) -> Option<WriteIntent> {
    let (module, path) = raw.split_once(':')?;
    Some(WriteIntent::new(module, path))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => match AssemblerConfig::load(path) {
            Ok(c) => c,
            Err(e) => return fail(&e),
        },
        None => AssemblerConfig::default(),
    };

    match cli.command {
        Commands::Resolve { spec } => {
            let result = Spec::load(&spec)
                .and_then(|spec| Assembler::from_config(config).and_then(|a| a.registry().resolve(&spec)));
            match result {
                Ok(selection) => {
                    print_json(&selection);
                    ExitCode::SUCCESS
                }
                Err(e) => fail(&e),
            }
        }

        Commands::Assemble { spec, writes } => {
            let mut extra_writes = Vec::with_capacity(writes.len());
            for raw in &writes {
                match parse_write(raw) {
                    Some(w) => extra_writes.push(w),
                    None => return fail(&AssemblyError::ConfigInvalid(format!("--write expects module:path, got '{}'", raw))),
                }
            }
            let options = AssembleOptions { extra_writes };
            let result = Spec::load(&spec)
                .and_then(|spec| Assembler::from_config(config).and_then(|a| a.assemble(&spec, &options)));
            match result {
                Ok(outcome) => {
                    print_json(&outcome.report);
                    if outcome.passed() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(2)
                    }
                }
                Err(e) => fail(&e),
            }
        }

        Commands::Export { build } => {
            let workspace = modforge_core::Workspace::open(&config.workspace_root, &build);
            match Exporter::new(config.export).export(&workspace) {
                Ok(result) => {
                    print_json(&result);
                    ExitCode::SUCCESS
                }
                Err(e) => fail(&e),
            }
        }

        Commands::Verify { export, archive, digest } => {
            let result = match (export, archive) {
                (Some(root), _) => verify_checksums(&root).map(|files| serde_json::json!({"success": true, "files": files})),
                (None, Some(path)) => verify_archive(&path, digest.as_deref())
                    .map(|digest| serde_json::json!({"success": true, "digest": digest})),
                (None, None) => Err(AssemblyError::ConfigInvalid("nothing to verify".to_string())),
            };
            match result {
                Ok(output) => {
                    print_json(&output);
                    ExitCode::SUCCESS
                }
                Err(e) => fail(&e),
            }
        }
    }
}
