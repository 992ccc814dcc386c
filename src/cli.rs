//! Command-line interface
//!
//! `stackverify run -f harness.yaml [-f other.yaml]` executes one run per
//! harness file, concurrently, and exits with the worst exit code.
//! `stackverify validate -f harness.yaml` only parses and checks the files.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use crate::config::HarnessConfig;
use crate::pipeline::{run_all, Pipeline};
use crate::{Error, Result};

/// Stackverify - provision, verify and tear down infrastructure stacks
#[derive(Parser, Debug)]
#[command(name = "stackverify")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "STACKVERIFY_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output formats
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision, verify and tear down each harness
    Run(RunArgs),
    /// Parse and validate harness files without touching any infrastructure
    Validate(ValidateArgs),
}

/// Arguments for `run`
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Harness file; repeat to run several harnesses concurrently
    #[arg(short = 'f', long = "file", required = true)]
    pub files: Vec<PathBuf>,

    /// Stack variable override (`key=value`), applied to every harness
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Override the stack directory of every harness
    #[arg(long)]
    pub stack_dir: Option<PathBuf>,

    /// Kubeconfig used to reach the cluster (defaults to kube's inference)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context
    #[arg(long)]
    pub context: Option<String>,
}

/// Arguments for `validate`
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Harness file(s) to validate
    #[arg(short = 'f', long = "file", required = true)]
    pub files: Vec<PathBuf>,
}

/// Parse a `key=value` pair
fn parse_var(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("invalid variable '{}', expected key=value", s)),
    }
}

impl RunArgs {
    /// Apply command-line overrides on top of a loaded harness
    fn apply_overrides(&self, config: &mut HarnessConfig) {
        if let Some(dir) = &self.stack_dir {
            config.stack.dir = dir.clone();
        }
        for (key, value) in &self.vars {
            config
                .stack
                .vars
                .insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        if self.kubeconfig.is_some() {
            config.kubernetes.kubeconfig = self.kubeconfig.clone();
        }
        if self.context.is_some() {
            config.kubernetes.context = self.context.clone();
        }
    }
}

impl Cli {
    /// Run the selected command and return the process exit code
    pub async fn run(self) -> Result<u8> {
        match self.command {
            Commands::Run(args) => run(args).await,
            Commands::Validate(args) => validate(args),
        }
    }
}

async fn run(args: RunArgs) -> Result<u8> {
    let mut runs = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let mut config = HarnessConfig::load(file)?;
        args.apply_overrides(&mut config);
        let pipeline = Pipeline::for_harness(&config)?;
        runs.push((config, pipeline));
    }

    info!(runs = runs.len(), "Starting verification runs");
    let outcomes = run_all(&runs).await;

    for outcome in &outcomes {
        println!("{}", outcome);
    }

    Ok(outcomes
        .iter()
        .map(|outcome| outcome.exit_code())
        .max()
        .unwrap_or(0))
}

fn validate(args: ValidateArgs) -> Result<u8> {
    let mut errors = Vec::new();
    for file in &args.files {
        match HarnessConfig::load(file) {
            Ok(config) => println!("  {} valid ({})", file.display(), config.name),
            Err(e) => {
                println!("  {} invalid: {}", file.display(), e);
                errors.push(e);
            }
        }
    }

    if errors.is_empty() {
        Ok(0)
    } else {
        Err(Error::config(format!(
            "{} of {} harness files invalid",
            errors.len(),
            args.files.len()
        )))
    }
}
