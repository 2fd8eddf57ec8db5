use anyhow::Error;
use stagecoach_config::Config;

use super::load_pipeline;

/// Validate the pipeline descriptor and summarize it.
pub fn check(config: &Config) -> Result<(), Error> {
    let pipeline = load_pipeline(config)?;
    println!(
        "{}: {} job(s) in stages {}",
        config.descriptor.display(),
        pipeline.jobs().len(),
        pipeline.stages().join(", ")
    );
    for job in pipeline.jobs() {
        let tags = job.tags.iter().cloned().collect::<Vec<_>>().join(", ");
        println!(
            "  {} [{}] {} tags: [{}], {} command(s)",
            job.name,
            job.stage,
            job.condition,
            tags,
            job.commands.len()
        );
    }
    Ok(())
}
