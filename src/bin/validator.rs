//! Schema Validator CLI
//!
//! Checks schema documents against their meta-schema, validates data
//! files, and compiles schemas whose references live in a directory.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use familiar_schemac::{
    FileLoader, SchemaConfig, SchemaFetcher, SchemaRegistry, Validator,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "schema-validator")]
#[command(about = "Compile JSON schemas and validate data against them")]
struct Cli {
    /// Configuration file (defaults to schemac.toml lookup)
    #[arg(short, long)]
    config: Option<String>,

    /// Report every error instead of stopping at the first
    #[arg(long)]
    all_errors: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check schema documents against their meta-schema
    Check {
        /// Schema files or directories of *.json schemas
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Validate data files against a schema
    Validate {
        /// Schema file
        #[arg(short, long)]
        schema: PathBuf,
        /// Directory of referenced schemas
        #[arg(short, long)]
        refs: Option<PathBuf>,
        /// Data files
        #[arg(required = true)]
        data: Vec<PathBuf>,
    },

    /// Compile a schema, loading referenced schemas on demand
    Compile {
        /// Schema file
        #[arg(short, long)]
        schema: PathBuf,
        /// Directory referenced schemas are loaded from
        #[arg(short, long)]
        refs: Option<PathBuf>,
        /// URI prefix mapped onto the refs directory
        #[arg(long)]
        base_uri: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = SchemaConfig::load_from(cli.config.as_deref()).context("loading configuration")?;
    let mut options = config.options();
    options.all_errors |= cli.all_errors;
    let mut registry = SchemaRegistry::new(options)?;

    match cli.command {
        Commands::Check { paths } => {
            let mut all_valid = true;
            for file in json_files(&paths) {
                let document = read_json(&file)?;
                if registry.validate_schema(&document, false)? {
                    println!("✅ {}", file.display());
                } else {
                    println!("❌ {}", file.display());
                    println!("   {}", registry.errors_text());
                    all_valid = false;
                }
            }
            Ok(all_valid)
        }

        Commands::Validate { schema, refs, data } => {
            if let Some(dir) = &refs {
                add_ref_schemas(&mut registry, dir)?;
            }
            let validator = registry
                .compile(read_json(&schema)?)
                .with_context(|| format!("compiling {}", schema.display()))?;
            validate_files(&validator, &data)
        }

        Commands::Compile {
            schema,
            refs,
            base_uri,
        } => {
            let loader = match (refs, FileLoader::from_config(&config.loader)) {
                (Some(dir), _) => FileLoader::new(dir),
                (None, Some(loader)) => loader,
                (None, None) => bail!("no refs directory given and none configured"),
            };
            let loader = match base_uri.or_else(|| config.loader.base_uri.clone()) {
                Some(base) => loader.with_base_uri(base),
                None => loader,
            };
            let fetcher = SchemaFetcher::new(loader);
            let document = read_json(&schema)?;

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let validator = runtime
                .block_on(registry.compile_async(document, &fetcher))
                .with_context(|| format!("compiling {}", schema.display()))?;
            println!("✅ {} compiled ({})", schema.display(), validator.entry());
            Ok(true)
        }
    }
}

fn validate_files(validator: &Validator, files: &[PathBuf]) -> anyhow::Result<bool> {
    let mut all_valid = true;
    for file in files {
        let data = read_json(file)?;
        match validator.validate(&data) {
            Ok(()) => println!("✅ {}", file.display()),
            Err(errors) => {
                all_valid = false;
                println!("❌ {}", file.display());
                for error in errors.iter() {
                    println!("   └─ {} ({})", error, error.schema_path);
                }
            }
        }
    }
    Ok(all_valid)
}

/// Add every schema under `dir`, keyed by its `$id` or else its path
fn add_ref_schemas(registry: &mut SchemaRegistry, dir: &Path) -> anyhow::Result<()> {
    for file in json_files(&[dir.to_path_buf()]) {
        let document = read_json(&file)?;
        let key = match document.get("$id") {
            Some(_) => None,
            None => Some(
                file.strip_prefix(dir)
                    .unwrap_or(&file)
                    .to_string_lossy()
                    .replace('\\', "/"),
            ),
        };
        registry
            .add_schema(document, key.as_deref())
            .with_context(|| format!("adding {}", file.display()))?;
    }
    Ok(())
}

fn json_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = paths
        .iter()
        .flat_map(|path| {
            WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        })
        .collect();
    files.sort();
    files
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}
