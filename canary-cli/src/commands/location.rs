//! `canary location`: resolve a case id or name to its directory

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use canary_engine::Workspace;

#[derive(Args, Debug)]
pub struct LocationArgs {
    /// Case id (or prefix) or display name
    #[arg(value_name = "CASE")]
    pub case: String,

    /// Session directory
    #[arg(short = 'w', long, default_value = "TestResults", value_name = "DIR")]
    pub work_tree: PathBuf,
}

pub async fn run(args: LocationArgs) -> Result<i32> {
    let workspace = Workspace::open(&args.work_tree)?;
    let location = workspace.location(&args.case)?;
    println!("{}", location.display());
    Ok(0)
}
