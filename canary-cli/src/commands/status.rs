//! `canary status`: summarize a finished or in-progress session

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use canary_engine::{SessionSummary, Workspace};

use super::report;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Session directory
    #[arg(short = 'w', long, default_value = "TestResults", value_name = "DIR")]
    pub work_tree: PathBuf,

    /// List every case instead of the summary line
    #[arg(short = 'l', long)]
    pub long: bool,
}

pub async fn run(args: StatusArgs) -> Result<i32> {
    let workspace = Workspace::open(&args.work_tree)?;
    let catalog = workspace.load_catalog()?;
    if args.long {
        report::print_status(&catalog);
    }
    report::print_summary(&catalog);
    Ok(SessionSummary::from_catalog(&catalog).exit_code())
}
