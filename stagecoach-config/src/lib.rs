use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// The default name of the config file.
pub const CONFIG_FILENAME: &str = "stagecoach.toml";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("couldn't load config file at '{}': {}", .0.display(), .1)]
    MissingConfig(PathBuf, std::io::Error),
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
}

/// The configuration for stagecoach.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// The relative path of the pipeline descriptor.
    #[serde(default = "default_descriptor")]
    pub descriptor: PathBuf,
    /// The relative path of the directory in which stagecoach will write
    /// generated job scripts.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// The interpreter that generated job scripts are handed to.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// The tags offered by the local runner.
    ///
    /// When unset, every job is considered runnable regardless of its tags.
    #[serde(default)]
    pub runner_tags: Option<BTreeSet<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            descriptor: default_descriptor(),
            work_dir: default_work_dir(),
            shell: default_shell(),
            runner_tags: None,
        }
    }
}

impl Config {
    /// Load the config file from disk given an absolute or relative path.
    fn load_inner(path: impl AsRef<Path>) -> Result<Self, Error> {
        let full_path = std::path::absolute(path).map_err(Error::IO)?;
        let contents = std::fs::read_to_string(&full_path)
            .map_err(|err| Error::MissingConfig(full_path, err))?;
        toml::from_str(&contents).map_err(Error::Parse)
    }

    /// Load the config file from disk from either the default location or a
    /// user-supplied override location.
    ///
    /// A missing file is only an error when the location was given
    /// explicitly, otherwise the defaults are used.
    pub fn load(path_override: Option<&PathBuf>) -> Result<Self, Error> {
        if let Some(relpath) = path_override {
            return Self::load_inner(relpath);
        }
        let path = std::env::current_dir()
            .map_err(Error::IO)?
            .join(CONFIG_FILENAME);
        if path.is_file() {
            Self::load_inner(path)
        } else {
            log::debug!("no config file at '{}', using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Returns whether a job carrying `tags` can be picked up by the local
    /// runner.
    pub fn accepts_tags<'a>(&self, tags: impl IntoIterator<Item = &'a String>) -> bool {
        match self.runner_tags {
            None => true,
            Some(ref offered) => tags.into_iter().all(|tag| offered.contains(tag)),
        }
    }
}

fn default_descriptor() -> PathBuf {
    PathBuf::from(".gitlab-ci.yml")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".stagecoach")
}

fn default_shell() -> String {
    "bash".to_string()
}
