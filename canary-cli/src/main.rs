// canary - test harness command line interface

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod commands;
mod tracing;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{hpc_exec, location, rebaseline, run, status};

#[derive(Parser)]
#[command(name = "canary", version, about = "Test harness for HPC and scientific software")]
struct Cli {
    /// Change to this directory before doing anything
    #[arg(short = 'C', global = true, value_name = "DIR")]
    chdir: Option<PathBuf>,

    /// Configuration file (default: ./canary.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, expand, and run test cases
    Run(run::RunArgs),
    /// Summarize the session in the work tree
    Status(status::StatusArgs),
    /// Print the working directory of a test case
    Location(location::LocationArgs),
    /// Apply baseline actions of diffed test cases
    Rebaseline(rebaseline::RebaselineArgs),
    /// Run the members of a batch inside a scheduler allocation
    #[command(name = "hpc-exec", hide = true)]
    HpcExec(hpc_exec::HpcExecArgs),
}

fn main() {
    let cli = Cli::parse();

    if let Some(dir) = &cli.chdir {
        if let Err(err) = std::env::set_current_dir(dir) {
            eprintln!("canary: cannot change to {}: {}", dir.display(), err);
            std::process::exit(2);
        }
    }

    if let Err(err) = tracing::init_tracing(cli.debug) {
        eprintln!("canary: failed to initialize logging: {err}");
    }

    let config = match canary_config::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("canary: {err}");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("canary: cannot start runtime: {err}");
            std::process::exit(2);
        }
    };

    let code = runtime.block_on(async {
        let outcome = match cli.command {
            Commands::Run(args) => run::run(args, &config).await,
            Commands::Status(args) => status::run(args).await,
            Commands::Location(args) => location::run(args).await,
            Commands::Rebaseline(args) => rebaseline::run(args).await,
            Commands::HpcExec(args) => hpc_exec::run(args, &config).await,
        };
        match outcome {
            Ok(code) => code,
            Err(err) => {
                eprintln!("canary: {err:#}");
                2
            }
        }
    });
    std::process::exit(code);
}
