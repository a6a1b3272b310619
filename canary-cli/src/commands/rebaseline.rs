//! `canary rebaseline`: replace baselines with case outputs

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use canary_engine::case::StatusName;
use canary_engine::Workspace;

#[derive(Args, Debug)]
pub struct RebaselineArgs {
    /// Case ids or display names; `.` rebaselines every diffed case
    #[arg(value_name = "CASE", default_value = ".")]
    pub cases: Vec<String>,

    /// Session directory
    #[arg(short = 'w', long, default_value = "TestResults", value_name = "DIR")]
    pub work_tree: PathBuf,
}

pub async fn run(args: RebaselineArgs) -> Result<i32> {
    let workspace = Workspace::open(&args.work_tree)?;
    let catalog = workspace.load_catalog()?;

    let selected: Vec<_> = if args.cases.iter().any(|c| c == ".") {
        catalog
            .iter()
            .filter(|c| c.status.name == StatusName::Diff)
            .collect()
    } else {
        let mut found = Vec::new();
        for needle in &args.cases {
            match catalog.find(needle) {
                Some(case) => found.push(case),
                None => anyhow::bail!("no such test case: {needle}"),
            }
        }
        found
    };

    let mut applied = 0;
    for case in selected {
        let n = workspace.rebaseline(case)?;
        if n > 0 {
            println!("rebaselined {} ({} file(s))", case.display_name(), n);
        }
        applied += n;
    }
    if applied == 0 {
        println!("nothing to rebaseline");
    }
    Ok(0)
}
