use std::fmt;

use regex::Regex;

/// The keyword that matches any branch.
pub const ANY_BRANCH: &str = "branches";

/// One entry of an `only` or `except` list.
#[derive(Debug, Clone)]
pub enum RefPattern {
    /// Matches every branch.
    AnyBranch,
    /// Matches a branch with exactly this name.
    Exact(String),
    /// Matches branches the expression finds a match in, written as `/expr/`
    /// or `/expr/i` in the descriptor.
    Regex { source: String, regex: Regex },
}

impl RefPattern {
    /// Parse a pattern as written in the descriptor.
    pub fn parse(text: &str) -> Result<Self, regex::Error> {
        if text == ANY_BRANCH {
            return Ok(RefPattern::AnyBranch);
        }
        if let Some(body) = text.strip_prefix('/') {
            let (expr, case_insensitive) = if let Some(expr) = body.strip_suffix("/i") {
                (expr, true)
            } else if let Some(expr) = body.strip_suffix('/') {
                (expr, false)
            } else {
                return Ok(RefPattern::Exact(text.to_string()));
            };
            let regex = if case_insensitive {
                Regex::new(&format!("(?i){expr}"))?
            } else {
                Regex::new(expr)?
            };
            return Ok(RefPattern::Regex {
                source: text.to_string(),
                regex,
            });
        }
        Ok(RefPattern::Exact(text.to_string()))
    }

    /// Returns whether this pattern matches the given branch.
    pub fn matches(&self, branch: &str) -> bool {
        match self {
            RefPattern::AnyBranch => true,
            RefPattern::Exact(name) => name == branch,
            RefPattern::Regex { regex, .. } => regex.is_match(branch),
        }
    }
}

impl fmt::Display for RefPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefPattern::AnyBranch => f.write_str(ANY_BRANCH),
            RefPattern::Exact(name) => f.write_str(name),
            RefPattern::Regex { source, .. } => f.write_str(source),
        }
    }
}

/// Restricts the branches on which a job is triggered.
#[derive(Debug, Clone, Default)]
pub enum BranchCondition {
    /// The job runs on every branch.
    #[default]
    Always,
    /// The job runs only on branches matching one of the patterns.
    Only(Vec<RefPattern>),
    /// The job runs on every branch except those matching one of the patterns.
    Except(Vec<RefPattern>),
}

impl BranchCondition {
    /// Returns whether a push to `branch` triggers a job with this condition.
    pub fn admits(&self, branch: &str) -> bool {
        match self {
            BranchCondition::Always => true,
            BranchCondition::Only(patterns) => patterns.iter().any(|p| p.matches(branch)),
            BranchCondition::Except(patterns) => !patterns.iter().any(|p| p.matches(branch)),
        }
    }
}

impl fmt::Display for BranchCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (keyword, patterns) = match self {
            BranchCondition::Always => return f.write_str("always"),
            BranchCondition::Only(patterns) => ("only", patterns),
            BranchCondition::Except(patterns) => ("except", patterns),
        };
        let patterns = patterns
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{keyword} [{patterns}]")
    }
}
