use std::{path::PathBuf, process::Command};

use anyhow::{Context, Error, bail};
use clap::{ArgAction, Parser, Subcommand};
use log::LevelFilter;
use stagecoach_config::Config;
use stagecoach_descriptor::Pipeline;

use check::check;
use plan::{PlanArgs, plan};
use run::{RunArgs, run};
use vars::vars;

pub mod check;
pub mod plan;
pub mod run;
pub mod vars;

#[derive(Debug, Clone, Parser)]
#[command(name = "stagecoach", about = "Check, resolve and run CI pipeline descriptors locally")]
pub struct Cli {
    /// The path to the config file (default is '$PWD/stagecoach.toml').
    #[arg(
        short = 'f',
        long = "config-file",
        value_name = "PATH",
        required = false,
        global = true
    )]
    pub config_file: Option<PathBuf>,

    /// Log more. Repeat for debug output.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    cmd: Cmd,
}

impl Cli {
    /// The log level requested on the command line.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Cmd {
    #[command(about = "Validate the pipeline descriptor")]
    Check,
    #[command(about = "Show which jobs a push to each branch triggers")]
    Plan(PlanArgs),
    #[command(about = "List the environment variables the jobs expect")]
    Vars,
    #[command(about = "Run the jobs a branch triggers")]
    Run(RunArgs),
}

pub fn handle_args(args: &Cli) -> Result<(), Error> {
    let config = Config::load(args.config_file.as_ref()).context("failed to load config file")?;
    log::debug!("config: {config:?}");
    match args.cmd {
        Cmd::Check => check(&config)?,
        Cmd::Plan(ref plan_args) => plan(&config, plan_args)?,
        Cmd::Vars => vars(&config)?,
        Cmd::Run(ref run_args) => run(&config, run_args)?,
    }
    Ok(())
}

/// Load the pipeline descriptor named by the config, printing every
/// structural problem it has.
fn load_pipeline(config: &Config) -> Result<Pipeline, Error> {
    let path = &config.descriptor;
    match stagecoach_descriptor::load(path) {
        Ok(pipeline) => Ok(pipeline),
        Err(stagecoach_descriptor::Error::Invalid(problems)) => {
            for problem in problems.iter() {
                eprintln!("error: {problem}");
            }
            bail!(
                "pipeline descriptor '{}' has {} problem(s)",
                path.display(),
                problems.len()
            )
        }
        Err(err) => Err(err).with_context(|| format!("failed to load '{}'", path.display())),
    }
}

/// Work out which branch a run is for when none was given.
///
/// The CI controller's own variable wins, then whatever git has checked out.
fn current_branch() -> Result<String, Error> {
    if let Ok(name) = std::env::var("CI_COMMIT_REF_NAME") {
        if !name.is_empty() {
            return Ok(name);
        }
    }
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .output()
        .context("failed to run git to find the current branch")?;
    if !output.status.success() {
        bail!("couldn't determine the current branch, pass one explicitly");
    }
    let name = String::from_utf8(output.stdout)
        .context("git printed a branch name that isn't UTF-8")?
        .trim()
        .to_string();
    if name == "HEAD" {
        bail!("HEAD is detached, pass a branch explicitly");
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["stagecoach", "plan", "master", "-vv", "-f", "ci.toml"])
            .unwrap();
        assert_eq!(cli.log_level(), LevelFilter::Debug);
        assert_eq!(cli.config_file, Some(PathBuf::from("ci.toml")));
        let Cmd::Plan(ref args) = cli.cmd else {
            panic!("expected plan");
        };
        assert_eq!(args.branches, vec!["master".to_string()]);
    }

    #[test]
    fn parses_run_options() {
        let cli = Cli::try_parse_from([
            "stagecoach",
            "run",
            "--branch",
            "development",
            "--job",
            "deploy-dev",
            "--job",
            "deploy-dev-docs",
            "--dry-run",
        ])
        .unwrap();
        let Cmd::Run(ref args) = cli.cmd else {
            panic!("expected run");
        };
        assert_eq!(args.branch.as_deref(), Some("development"));
        assert_eq!(args.jobs, vec!["deploy-dev", "deploy-dev-docs"]);
        assert!(args.dry_run);
        assert_eq!(cli.log_level(), LevelFilter::Warn);
    }
}
