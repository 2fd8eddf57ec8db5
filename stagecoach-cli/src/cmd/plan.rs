use anyhow::{Context, Error};
use clap::Args;
use stagecoach_config::Config;
use stagecoach_plan::Plan;

use super::{current_branch, load_pipeline};

#[derive(Debug, Clone, Args)]
pub struct PlanArgs {
    /// The branches to resolve (default is the current branch).
    #[arg(value_name = "BRANCH")]
    pub branches: Vec<String>,
}

/// Print the jobs each branch triggers.
pub fn plan(config: &Config, args: &PlanArgs) -> Result<(), Error> {
    let pipeline = load_pipeline(config)?;
    let branches = if args.branches.is_empty() {
        vec![current_branch()?]
    } else {
        args.branches.clone()
    };
    for branch in branches.iter() {
        let plan = Plan::resolve(&pipeline, branch)
            .with_context(|| format!("failed to resolve jobs for branch '{branch}'"))?;
        println!("{plan}");
    }
    Ok(())
}
