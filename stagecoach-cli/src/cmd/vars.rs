use anyhow::Error;
use stagecoach_config::Config;

use super::load_pipeline;

/// List the variables jobs take from the environment.
pub fn vars(config: &Config) -> Result<(), Error> {
    let pipeline = load_pipeline(config)?;
    let referenced = pipeline.referenced_variables();
    if referenced.is_empty() {
        println!("no environment variables referenced");
        return Ok(());
    }
    for (name, jobs) in referenced.iter() {
        let state = if std::env::var_os(name).is_some() {
            "set"
        } else {
            "unset"
        };
        let jobs = jobs.iter().cloned().collect::<Vec<_>>().join(", ");
        println!("{name} ({state}): {jobs}");
    }
    Ok(())
}
