use std::{collections::HashMap, fmt, process::Command};

/// Errors starting a job's process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("job '{0}' has no command to run")]
    NoCommand(String),
    #[error("failed to start job '{0}'")]
    Spawn(String, #[source] std::io::Error),
}

/// A process to run on behalf of a pipeline job.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
}

impl Job {
    /// Runs the process to completion with inherited stdio.
    ///
    /// Only the exit status is observed.
    pub fn execute(&self) -> Result<Status, Error> {
        let (program, args) = self
            .args
            .split_first()
            .ok_or_else(|| Error::NoCommand(self.name.clone()))?;
        let status = Command::new(program)
            .args(args)
            .envs(&self.envs)
            .status()
            .map_err(|err| Error::Spawn(self.name.clone(), err))?;
        if status.success() {
            Ok(Status::Passed)
        } else {
            Ok(Status::Failed(status.code()))
        }
    }
}

/// How a job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Passed,
    /// The process exited non-zero. There is no code when it was killed by a
    /// signal or never started.
    Failed(Option<i32>),
    /// A job it depends on didn't succeed.
    Skipped,
    /// No runner offers the tags the job asks for.
    Stuck,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Passed => f.write_str("passed"),
            Status::Failed(Some(code)) => write!(f, "failed (exit code {code})"),
            Status::Failed(None) => f.write_str("failed (no exit code)"),
            Status::Skipped => f.write_str("skipped"),
            Status::Stuck => f.write_str("stuck (no runner with matching tags)"),
        }
    }
}

/// A job as scheduled within a pipeline run.
#[derive(Debug, Clone)]
pub struct Task {
    /// The job's main process.
    pub job: Job,
    /// A cleanup process run after `job` whatever its outcome.
    pub after: Option<Job>,
    /// Positions of earlier tasks that must succeed before this one starts.
    pub dependencies: Vec<usize>,
    /// Whether a failure is tolerated by dependents and by the pipeline.
    pub allow_failure: bool,
    /// Whether a runner can pick this task up at all.
    pub runnable: bool,
}

/// The result of one task.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub name: String,
    pub status: Status,
    pub allow_failure: bool,
}

impl Outcome {
    /// Returns whether tasks depending on this one may start.
    fn unblocks(&self) -> bool {
        match self.status {
            Status::Passed => true,
            Status::Failed(_) => self.allow_failure,
            Status::Skipped | Status::Stuck => false,
        }
    }

    /// Returns whether this outcome fails the pipeline.
    pub fn is_failure(&self) -> bool {
        match self.status {
            Status::Passed | Status::Skipped => false,
            Status::Failed(_) => !self.allow_failure,
            Status::Stuck => true,
        }
    }
}

/// The outcomes of a pipeline run, in execution order.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub outcomes: Vec<Outcome>,
}

impl Report {
    /// Returns whether the pipeline as a whole succeeded.
    pub fn succeeded(&self) -> bool {
        !self.outcomes.iter().any(Outcome::is_failure)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in self.outcomes.iter() {
            write!(f, "{}: {}", outcome.name, outcome.status)?;
            if outcome.allow_failure && matches!(outcome.status, Status::Failed(_)) {
                f.write_str(" (allowed)")?;
            }
            writeln!(f)?;
        }
        if self.succeeded() {
            f.write_str("pipeline passed")
        } else {
            f.write_str("pipeline failed")
        }
    }
}

/// Runs tasks one at a time in the order given.
///
/// Dependencies must point at earlier positions. A task whose dependencies
/// didn't all succeed is skipped, and the run carries on with the rest. A
/// task whose process can't be started counts as failed.
pub fn run_tasks(tasks: &[Task]) -> Report {
    let mut report = Report::default();
    for task in tasks.iter() {
        let name = task.job.name.as_str();
        let blocked = task
            .dependencies
            .iter()
            .any(|&dep| !report.outcomes.get(dep).is_some_and(Outcome::unblocks));
        let status = if !task.runnable {
            log::warn!(job = name; "no runner offers the job's tags");
            Status::Stuck
        } else if blocked {
            log::info!(job = name; "skipping job, a dependency did not succeed");
            Status::Skipped
        } else {
            log::info!(job = name; "running job");
            let status = task.job.execute().unwrap_or_else(|err| {
                log::error!(job = name; "{err}");
                Status::Failed(None)
            });
            if let Some(ref after) = task.after {
                match after.execute() {
                    Ok(Status::Passed) => {}
                    Ok(other) => log::warn!(job = name; "after script {other}"),
                    Err(err) => log::warn!(job = name; "after script could not start: {err}"),
                }
            }
            log::info!(job = name; "job {status}");
            status
        };
        report.outcomes.push(Outcome {
            name: name.to_string(),
            status,
            allow_failure: task.allow_failure,
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use expect_test::expect;
    use tempfile::TempDir;

    use super::*;

    fn sh(name: &str, script: &str) -> Job {
        Job {
            name: name.to_string(),
            args: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            envs: HashMap::new(),
        }
    }

    fn task(job: Job, dependencies: Vec<usize>) -> Task {
        Task {
            job,
            after: None,
            dependencies,
            allow_failure: false,
            runnable: true,
        }
    }

    #[test]
    fn reports_exit_codes() {
        assert_eq!(sh("ok", "true").execute().unwrap(), Status::Passed);
        assert_eq!(sh("bad", "exit 3").execute().unwrap(), Status::Failed(Some(3)));
    }

    #[test]
    fn passes_environment() {
        let mut job = sh("env", "test \"$DATAHOME\" = /srv/data");
        assert_eq!(job.execute().unwrap(), Status::Failed(Some(1)));
        job.envs.insert("DATAHOME".to_string(), "/srv/data".to_string());
        assert_eq!(job.execute().unwrap(), Status::Passed);
    }

    #[test]
    fn missing_program_is_an_error() {
        let job = Job {
            name: "ghost".to_string(),
            args: vec!["/nonexistent/stagecoach-test-binary".to_string()],
            envs: HashMap::new(),
        };
        assert!(matches!(job.execute(), Err(Error::Spawn(..))));
        let empty = Job {
            name: "empty".to_string(),
            args: vec![],
            envs: HashMap::new(),
        };
        assert!(matches!(empty.execute(), Err(Error::NoCommand(_))));
    }

    #[test]
    fn failure_skips_dependents() {
        let tasks = vec![
            task(sh("test", "exit 2"), vec![]),
            task(sh("deploy-dev", "true"), vec![0]),
            task(sh("deploy-dev-docs", "true"), vec![0]),
        ];
        let report = run_tasks(&tasks);
        assert!(!report.succeeded());
        let expected = expect![[r#"
            test: failed (exit code 2)
            deploy-dev: skipped
            deploy-dev-docs: skipped
            pipeline failed"#]];
        expected.assert_eq(&report.to_string());
    }

    #[test]
    fn allowed_failure_unblocks_dependents() {
        let mut lint = task(sh("lint", "exit 1"), vec![]);
        lint.allow_failure = true;
        let tasks = vec![lint, task(sh("deploy", "true"), vec![0])];
        let report = run_tasks(&tasks);
        assert!(report.succeeded());
        let expected = expect![[r#"
            lint: failed (exit code 1) (allowed)
            deploy: passed
            pipeline passed"#]];
        expected.assert_eq(&report.to_string());
    }

    #[test]
    fn stuck_tasks_fail_the_pipeline() {
        let mut gpu = task(sh("gpu", "true"), vec![]);
        gpu.runnable = false;
        let tasks = vec![gpu, task(sh("after-gpu", "true"), vec![0])];
        let report = run_tasks(&tasks);
        assert_eq!(report.outcomes[0].status, Status::Stuck);
        assert_eq!(report.outcomes[1].status, Status::Skipped);
        assert!(!report.succeeded());
    }

    #[test]
    fn after_job_runs_even_on_failure() {
        let tempdir = TempDir::new().unwrap();
        let marker = tempdir.path().join("cleaned");
        let mut failing = task(sh("test", "exit 1"), vec![]);
        let mut after = sh("test", "touch \"$MARKER\"; exit 4");
        after
            .envs
            .insert("MARKER".to_string(), marker.to_string_lossy().to_string());
        failing.after = Some(after);
        let report = run_tasks(&[failing]);
        assert!(marker.exists());
        // The after script's own failure doesn't change the job's status.
        assert_eq!(report.outcomes[0].status, Status::Failed(Some(1)));
    }

    #[test]
    fn killed_process_has_no_exit_code() {
        let status = sh("killed", "kill -9 $$").execute().unwrap();
        assert_eq!(status, Status::Failed(None));
        assert_eq!(status.to_string(), "failed (no exit code)");
    }

    #[test]
    fn unstartable_job_fails_without_stopping_the_run() {
        let missing = Job {
            name: "deploy".to_string(),
            args: vec!["/nonexistent/stagecoach-test-binary".to_string()],
            envs: HashMap::new(),
        };
        let tasks = vec![
            task(sh("test", "true"), vec![]),
            task(missing, vec![0]),
            task(sh("docs", "true"), vec![0]),
            task(sh("publish", "true"), vec![1]),
        ];
        let report = run_tasks(&tasks);
        let expected = expect![[r#"
            test: passed
            deploy: failed (no exit code)
            docs: passed
            publish: skipped
            pipeline failed"#]];
        expected.assert_eq(&report.to_string());
    }
}
