use std::{collections::HashMap, fmt};

use petgraph::{
    Direction::Incoming,
    acyclic::Acyclic,
    graph::{DiGraph, NodeIndex},
};
use stagecoach_descriptor::{Job, Pipeline};

/// Errors resolving the jobs a branch triggers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("job '{job}' needs '{need}', which is not triggered on branch '{branch}'")]
    MissingNeed {
        job: String,
        need: String,
        branch: String,
    },
    #[error("job '{job}' is not triggered on branch '{branch}'")]
    NotInPlan { job: String, branch: String },
    #[error("internal error: cycle detected between jobs")]
    Cycle,
}

/// The jobs a push to one branch triggers, and the order they depend on each
/// other in.
///
/// Node indices follow execution order: stage order first, then the order
/// jobs appear in the descriptor. Every edge points from a lower index to a
/// higher one, so that order is also topological.
#[derive(Debug, Clone)]
pub struct Plan {
    branch: String,
    graph: Acyclic<DiGraph<Job, ()>>,
}

/// A job in a plan along with the positions of the jobs it waits for.
#[derive(Debug, Clone)]
pub struct Step<'a> {
    pub job: &'a Job,
    /// Positions in [`Plan::steps`] of the jobs that must succeed first.
    pub dependencies: Vec<usize>,
}

impl Plan {
    /// Select the jobs that a push to `branch` triggers and work out their
    /// dependencies.
    ///
    /// A job with `needs` waits for exactly those jobs. Every other job waits
    /// for all jobs of the closest earlier stage that has any jobs at all.
    pub fn resolve(pipeline: &Pipeline, branch: &str) -> Result<Self, Error> {
        let mut selected = pipeline
            .jobs()
            .iter()
            .filter(|job| job.condition.admits(branch))
            .collect::<Vec<_>>();
        // Stable, so descriptor order survives within a stage.
        selected.sort_by_key(|job| pipeline.stage_index(&job.stage));

        let mut graph = DiGraph::new();
        let mut by_name = HashMap::new();
        let nodes = selected
            .iter()
            .map(|&job| {
                let idx = graph.add_node(job.clone());
                by_name.insert(job.name.as_str(), idx);
                idx
            })
            .collect::<Vec<_>>();

        let mut previous_stage: Vec<NodeIndex> = Vec::new();
        let mut current_stage: Vec<NodeIndex> = Vec::new();
        let mut stage_name: Option<&str> = None;
        for (job, &node) in selected.iter().zip(nodes.iter()) {
            if stage_name != Some(job.stage.as_str()) {
                if !current_stage.is_empty() {
                    previous_stage = std::mem::take(&mut current_stage);
                }
                stage_name = Some(job.stage.as_str());
            }
            current_stage.push(node);
            match job.needs {
                Some(ref needs) => {
                    for need in needs.iter() {
                        let Some(&dep) = by_name.get(need.as_str()) else {
                            return Err(Error::MissingNeed {
                                job: job.name.clone(),
                                need: need.clone(),
                                branch: branch.to_string(),
                            });
                        };
                        graph.add_edge(dep, node, ());
                    }
                }
                None => {
                    for &dep in previous_stage.iter() {
                        graph.add_edge(dep, node, ());
                    }
                }
            }
        }

        let graph = Acyclic::try_from_graph(graph).map_err(|_| Error::Cycle)?;
        log::debug!(branch = branch, jobs = selected.len(); "resolved plan");
        Ok(Plan {
            branch: branch.to_string(),
            graph,
        })
    }

    /// Restrict the plan to the named jobs.
    ///
    /// Dependencies on jobs that are left out are dropped.
    pub fn only(&self, names: &[String]) -> Result<Self, Error> {
        for name in names.iter() {
            if self.position(name).is_none() {
                return Err(Error::NotInPlan {
                    job: name.clone(),
                    branch: self.branch.clone(),
                });
            }
        }
        let graph = self.graph.inner().filter_map(
            |_, job| names.contains(&job.name).then(|| job.clone()),
            |_, _| Some(()),
        );
        // Removing nodes keeps the relative order of the survivors, so the
        // result is still acyclic.
        let graph = Acyclic::try_from_graph(graph).map_err(|_| Error::Cycle)?;
        Ok(Plan {
            branch: self.branch.clone(),
            graph,
        })
    }

    /// The branch this plan was resolved for.
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Returns the number of jobs triggered.
    pub fn len(&self) -> usize {
        self.graph.inner().node_count()
    }

    /// Returns whether the branch triggers no jobs at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the triggered jobs in execution order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        let inner = self.graph.inner();
        inner.node_indices().map(move |idx| &inner[idx])
    }

    /// Groups the triggered jobs by stage, in stage order. Stages without
    /// jobs are left out.
    pub fn stages(&self) -> Vec<(&str, Vec<&Job>)> {
        let mut stages: Vec<(&str, Vec<&Job>)> = Vec::new();
        for job in self.jobs() {
            match stages.last_mut() {
                Some((stage, jobs)) if *stage == job.stage => jobs.push(job),
                _ => stages.push((job.stage.as_str(), vec![job])),
            }
        }
        stages
    }

    /// The jobs that must finish before the named job starts.
    pub fn dependencies(&self, name: &str) -> Vec<&Job> {
        let Some(idx) = self.position(name).map(NodeIndex::new) else {
            return Vec::new();
        };
        let inner = self.graph.inner();
        let mut deps = inner.neighbors_directed(idx, Incoming).collect::<Vec<_>>();
        deps.sort();
        deps.into_iter().map(|dep| &inner[dep]).collect()
    }

    /// Returns the jobs in execution order along with where their
    /// dependencies are.
    pub fn steps(&self) -> Vec<Step<'_>> {
        let inner = self.graph.inner();
        inner
            .node_indices()
            .map(|idx| {
                let mut dependencies = inner
                    .neighbors_directed(idx, Incoming)
                    .map(|dep| dep.index())
                    .collect::<Vec<_>>();
                dependencies.sort_unstable();
                Step {
                    job: &inner[idx],
                    dependencies,
                }
            })
            .collect()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.jobs().position(|job| job.name == name)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch '{}':", self.branch)?;
        if self.is_empty() {
            return write!(f, " no jobs");
        }
        for (stage, jobs) in self.stages() {
            write!(f, "\n  {stage}:")?;
            for job in jobs {
                write!(f, "\n    {}", job.name)?;
                let deps = self.dependencies(&job.name);
                if !deps.is_empty() {
                    let deps = deps
                        .iter()
                        .map(|dep| dep.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    write!(f, " (after {deps})")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;
    use indoc::indoc;

    use super::*;

    const DEMO: &str = include_str!("../../demos/pipeline.yml");

    fn demo() -> Pipeline {
        stagecoach_descriptor::parse(DEMO).unwrap()
    }

    fn job_names(plan: &Plan) -> Vec<&str> {
        plan.jobs().map(|job| job.name.as_str()).collect()
    }

    #[test]
    fn feature_branch_runs_tests_only() {
        let plan = Plan::resolve(&demo(), "feature-x").unwrap();
        assert_eq!(job_names(&plan), vec!["test"]);
        assert!(plan.jobs().all(|job| job.stage != "deploy"));
    }

    #[test]
    fn master_runs_master_jobs() {
        let plan = Plan::resolve(&demo(), "master").unwrap();
        assert_eq!(job_names(&plan), vec!["test-master", "deploy-master"]);
    }

    #[test]
    fn development_deploys_dev() {
        let plan = Plan::resolve(&demo(), "development").unwrap();
        assert_eq!(job_names(&plan), vec!["test", "deploy-dev", "deploy-dev-docs"]);
        let expected = expect![[r#"
            branch 'development':
              test:
                test
              deploy:
                deploy-dev (after test)
                deploy-dev-docs (after test)"#]];
        expected.assert_eq(&plan.to_string());
    }

    #[test]
    fn deploys_only_on_development_or_master() {
        let pipeline = demo();
        for branch in ["feature-x", "dev", "Master", "release-1.0"] {
            let plan = Plan::resolve(&pipeline, branch).unwrap();
            assert!(plan.jobs().all(|job| job.stage != "deploy"), "{branch}");
        }
    }

    #[test]
    fn dependencies_skip_empty_stages() {
        let input = indoc! {r#"
            stages: [build, test, deploy]
            compile:
              stage: build
              script: [make]
            unit:
              stage: test
              only: [main]
              script: [make test]
            ship:
              stage: deploy
              script: [make ship]
        "#};
        let pipeline = stagecoach_descriptor::parse(input).unwrap();
        let plan = Plan::resolve(&pipeline, "topic").unwrap();
        let expected = expect![[r#"
            branch 'topic':
              build:
                compile
              deploy:
                ship (after compile)"#]];
        expected.assert_eq(&plan.to_string());

        let steps = plan.steps();
        assert_eq!(steps[1].dependencies, vec![0]);
    }

    #[test]
    fn needs_replace_stage_ordering() {
        let input = indoc! {r#"
            stages: [build, test, deploy]
            compile:
              stage: build
              script: [make]
            docs:
              stage: build
              script: [make docs]
            unit:
              stage: test
              script: [make test]
            publish-docs:
              stage: deploy
              needs: [docs]
              script: [rsync]
            release:
              stage: deploy
              needs: [docs]
              only: [main]
              script: [rsync]
        "#};
        let pipeline = stagecoach_descriptor::parse(input).unwrap();
        let plan = Plan::resolve(&pipeline, "topic").unwrap();
        let expected = expect![[r#"
            branch 'topic':
              build:
                compile
                docs
              test:
                unit (after compile, docs)
              deploy:
                publish-docs (after docs)"#]];
        expected.assert_eq(&plan.to_string());
    }

    #[test]
    fn missing_need_is_an_error() {
        let input = indoc! {r#"
            stages: [build, deploy]
            compile:
              stage: build
              only: [main]
              script: [make]
            ship:
              stage: deploy
              needs: [compile]
              script: [rsync]
        "#};
        let pipeline = stagecoach_descriptor::parse(input).unwrap();
        assert!(Plan::resolve(&pipeline, "main").is_ok());
        let err = Plan::resolve(&pipeline, "topic").unwrap_err();
        expect![[r#"job 'ship' needs 'compile', which is not triggered on branch 'topic'"#]]
            .assert_eq(&err.to_string());
    }

    #[test]
    fn restricting_drops_outside_dependencies() {
        let plan = Plan::resolve(&demo(), "development").unwrap();
        let only = plan.only(&["deploy-dev-docs".to_string()]).unwrap();
        assert_eq!(job_names(&only), vec!["deploy-dev-docs"]);
        assert!(only.dependencies("deploy-dev-docs").is_empty());

        let err = plan.only(&["deploy-master".to_string()]).unwrap_err();
        assert!(matches!(err, Error::NotInPlan { .. }));
    }

    #[test]
    fn empty_plan() {
        let input = indoc! {r#"
            nightly:
              only: [nightly]
              script: [make]
        "#};
        let pipeline = stagecoach_descriptor::parse(input).unwrap();
        let plan = Plan::resolve(&pipeline, "main").unwrap();
        assert!(plan.is_empty());
        expect![[r#"branch 'main': no jobs"#]].assert_eq(&plan.to_string());
    }
}
