use anyhow::{Context, Error, bail};
use clap::Args;
use stagecoach_config::Config;
use stagecoach_generate::generate_tasks;
use stagecoach_jobs::run_tasks;
use stagecoach_plan::Plan;

use super::{current_branch, load_pipeline};

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// The branch to run the pipeline for (default is the current branch).
    #[arg(short, long, value_name = "BRANCH")]
    pub branch: Option<String>,

    /// Only run these jobs, ignoring dependencies on the others.
    #[arg(short, long = "job", value_name = "NAME")]
    pub jobs: Vec<String>,

    /// Write the job scripts and show the plan without running anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Run the jobs a branch triggers, one at a time.
pub fn run(config: &Config, args: &RunArgs) -> Result<(), Error> {
    let pipeline = load_pipeline(config)?;
    let branch = match args.branch {
        Some(ref branch) => branch.clone(),
        None => current_branch()?,
    };
    let mut plan = Plan::resolve(&pipeline, &branch)
        .with_context(|| format!("failed to resolve jobs for branch '{branch}'"))?;
    if !args.jobs.is_empty() {
        plan = plan.only(&args.jobs)?;
    }
    if plan.is_empty() {
        println!("{plan}");
        return Ok(());
    }

    for (name, jobs) in pipeline.referenced_variables() {
        let users = plan
            .jobs()
            .filter(|job| jobs.contains(&job.name))
            .map(|job| job.name.as_str())
            .collect::<Vec<_>>();
        if !users.is_empty() && std::env::var_os(&name).is_none() {
            log::warn!(variable = name.as_str(); "unset variable is used by {}", users.join(", "));
        }
    }

    let tasks = generate_tasks(&config.work_dir, &config.shell, &plan, |job| {
        config.accepts_tags(job.tags.iter())
    })
    .context("failed to generate job scripts")?;

    if args.dry_run {
        println!("{plan}");
        for task in tasks.iter() {
            let scripts = std::iter::once(&task.job)
                .chain(task.after.iter())
                .map(|job| job.args.join(" "))
                .collect::<Vec<_>>()
                .join(", then ");
            println!("{}: {scripts}", task.job.name);
        }
        return Ok(());
    }

    let report = run_tasks(&tasks);
    println!("{report}");
    if !report.succeeded() {
        bail!("pipeline for branch '{branch}' failed");
    }
    Ok(())
}
