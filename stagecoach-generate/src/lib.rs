use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use indoc::formatdoc;
use stagecoach_jobs::{Job, Task};
use stagecoach_plan::{Plan, Step};

/// Errors that can be encountered while generating job scripts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error encountered while creating the output directory.
    #[error("failed to create script directory '{}'", .0.display())]
    CreateDir(PathBuf, #[source] std::io::Error),
    /// An error encountered while writing a generated job script.
    #[error("failed to write generated job script '{}'", .0.display())]
    Write(PathBuf, #[source] std::io::Error),
}

/// A generated shell script and where it goes.
#[derive(Debug)]
struct Script {
    path: PathBuf,
    contents: String,
}

/// The scripts generated for one planned job.
#[derive(Debug)]
struct JobScripts<'a> {
    step: Step<'a>,
    /// The `before_script` and `script` commands, run in one shell.
    main: Script,
    /// The `after_script` commands, if there are any.
    after: Option<Script>,
}

/// Turns a job name into something safe to use in a file name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Returns the filename of a generated job script.
///
/// The position in the plan is included so that names that sanitize to the
/// same thing don't collide.
fn script_file_name(position: usize, name: &str, suffix: &str) -> String {
    format!("job_{position:02}_{}{suffix}.sh", sanitize(name))
}

/// Quotes a string for a POSIX shell.
fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Renders commands into a script that stops at the first failing command.
///
/// Each command is echoed before it runs so the job log reads like a
/// transcript. `pipefail` is only turned on where the shell knows it, so the
/// script also runs under a plain POSIX `sh`.
fn render_script<'a>(commands: impl IntoIterator<Item = &'a String>) -> String {
    let body = commands
        .into_iter()
        .map(|command| {
            let echo = shell_quote(&format!("$ {command}"));
            format!("echo {echo}\n{command}\n")
        })
        .collect::<String>();
    formatdoc! {"
        #!/usr/bin/env bash
        set -e
        if (set -o pipefail) 2>/dev/null; then set -o pipefail; fi

        {body}"}
}

/// The environment a job's scripts run with, on top of the inherited one.
fn job_env(branch: &str, job: &stagecoach_descriptor::Job) -> HashMap<String, String> {
    let mut envs = job
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<HashMap<_, _>>();
    envs.insert("CI".to_string(), "true".to_string());
    envs.insert("CI_COMMIT_REF_NAME".to_string(), branch.to_string());
    envs.insert("CI_JOB_NAME".to_string(), job.name.clone());
    envs.insert("CI_JOB_STAGE".to_string(), job.stage.clone());
    envs
}

/// Generates the scripts for every job in a plan.
fn scripts_for_plan<'a>(out_dir: &Path, plan: &'a Plan) -> Vec<JobScripts<'a>> {
    plan.steps()
        .into_iter()
        .enumerate()
        .map(|(position, step)| {
            let job = step.job;
            let main = Script {
                path: out_dir.join(script_file_name(position, &job.name, "")),
                contents: render_script(job.before_commands.iter().chain(job.commands.iter())),
            };
            let after = (!job.after_commands.is_empty()).then(|| Script {
                path: out_dir.join(script_file_name(position, &job.name, "_after")),
                contents: render_script(job.after_commands.iter()),
            });
            JobScripts { step, main, after }
        })
        .collect()
}

/// Writes the generated job scripts to disk.
fn write_scripts(out_dir: &Path, scripts: &[JobScripts<'_>]) -> Result<(), Error> {
    std::fs::create_dir_all(out_dir).map_err(|err| Error::CreateDir(out_dir.to_path_buf(), err))?;
    let all = scripts
        .iter()
        .flat_map(|s| std::iter::once(&s.main).chain(s.after.iter()));
    for script in all {
        log::debug!("writing job script to '{}'", script.path.display());
        std::fs::write(&script.path, &script.contents)
            .map_err(|err| Error::Write(script.path.clone(), err))?;
    }
    Ok(())
}

/// Generate a task for each job in the plan and write its scripts to
/// `out_dir`.
///
/// `runnable` decides whether the local runner can pick a job up at all.
pub fn generate_tasks(
    out_dir: impl AsRef<Path>,
    shell: &str,
    plan: &Plan,
    runnable: impl Fn(&stagecoach_descriptor::Job) -> bool,
) -> Result<Vec<Task>, Error> {
    let out_dir = out_dir.as_ref();
    let scripts = scripts_for_plan(out_dir, plan);
    write_scripts(out_dir, &scripts)?;
    let process = |name: &str, script: &Script, envs: &HashMap<String, String>| Job {
        name: name.to_string(),
        args: vec![
            shell.to_string(),
            script.path.to_string_lossy().to_string(),
        ],
        envs: envs.clone(),
    };
    let tasks = scripts
        .iter()
        .map(|s| {
            let job = s.step.job;
            let envs = job_env(plan.branch(), job);
            Task {
                job: process(&job.name, &s.main, &envs),
                after: s.after.as_ref().map(|after| process(&job.name, after, &envs)),
                dependencies: s.step.dependencies.clone(),
                allow_failure: job.allow_failure,
                runnable: runnable(job),
            }
        })
        .collect();
    Ok(tasks)
}
