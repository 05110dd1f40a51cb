use crate::logging::LogFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pqaef",
    version,
    about = "Run declarative evaluation pipelines over LLM providers"
)]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t, global = true, env = "PQAEF_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Debug-level logging (ignored when RUST_LOG is set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load data, run every stage in order, write the results
    Run(RunArgs),
    /// Check a run file against the registered kinds without touching any provider
    Validate(ValidateArgs),
    /// List registered stage and provider kinds
    Kinds(KindsArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = "pqaef.yaml", env = "PQAEF_CONFIG")]
    pub config: PathBuf,

    /// Override `output.dir` from the run file
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Skip writing output files (the run report is still logged)
    #[arg(long)]
    pub no_output: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ValidateArgs {
    #[arg(long, default_value = "pqaef.yaml", env = "PQAEF_CONFIG")]
    pub config: PathBuf,

    /// Fail on unknown keys instead of warning
    #[arg(long)]
    pub strict: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct KindsArgs {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}
