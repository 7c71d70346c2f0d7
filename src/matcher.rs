//! Selecting index entries by filename.

use glob::{MatchOptions, Pattern, PatternError};
use thiserror::Error;

/// Flags for [`MatchMode::Glob`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GlobFlags {
    /// Wildcards don't match `/`.
    pub pathname: bool,
    /// A pattern matching a leading directory of the name matches the whole name.
    pub leading_dir: bool,
}

/// How patterns are compared against filenames.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// The filename equals the pattern.
    Exact,
    /// The pattern is a string prefix of the filename.  This is not directory aware: `foo`
    /// selects `foobar` as well as `foo/bar`.
    #[default]
    Prefix,
    /// Shell wildcards.
    Glob(GlobFlags),
}

/// The user's selection: which members to extract, or with `invert`, which ones to skip.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub patterns: Vec<String>,
    pub mode: MatchMode,
    pub invert: bool,
}

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("glob match error in pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: PatternError,
    },
}

#[derive(Debug)]
enum Rules {
    Exact(Vec<String>),
    Prefix(Vec<String>),
    Glob {
        patterns: Vec<Pattern>,
        options: MatchOptions,
        leading_dir: bool,
    },
}

/// A compiled [`FilterSpec`].
#[derive(Debug)]
pub struct Matcher {
    rules: Rules,
    invert: bool,
}

impl Matcher {
    pub fn new(spec: &FilterSpec) -> Result<Self, MatchError> {
        let rules = match spec.mode {
            MatchMode::Exact => Rules::Exact(spec.patterns.clone()),
            MatchMode::Prefix => Rules::Prefix(spec.patterns.clone()),
            MatchMode::Glob(flags) => Rules::Glob {
                patterns: spec
                    .patterns
                    .iter()
                    .map(|pattern| {
                        Pattern::new(pattern).map_err(|source| MatchError::InvalidPattern {
                            pattern: pattern.clone(),
                            source,
                        })
                    })
                    .collect::<Result<_, _>>()?,
                options: MatchOptions {
                    case_sensitive: true,
                    require_literal_separator: flags.pathname,
                    require_literal_leading_dot: false,
                },
                leading_dir: flags.leading_dir,
            },
        };

        Ok(Matcher {
            rules,
            invert: spec.invert,
        })
    }

    /// Whether the entry named `filename` is selected.
    ///
    /// Patterns are tried in order until one matches; `invert` flips the outcome.  With no
    /// patterns nothing matches, so nothing is selected unless inverted.
    pub fn matches(&self, filename: &str) -> bool {
        let matched = match &self.rules {
            Rules::Exact(patterns) => patterns.iter().any(|p| p == filename),
            Rules::Prefix(patterns) => patterns.iter().any(|p| filename.starts_with(p.as_str())),
            Rules::Glob {
                patterns,
                options,
                leading_dir,
            } => patterns
                .iter()
                .any(|p| glob_matches(p, filename, *options, *leading_dir)),
        };

        matched != self.invert
    }
}

fn glob_matches(pattern: &Pattern, filename: &str, options: MatchOptions, leading_dir: bool) -> bool {
    if pattern.matches_with(filename, options) {
        return true;
    }

    // "dir" matches "dir/sub/file": try every prefix that ends right before a '/'
    leading_dir
        && filename
            .match_indices('/')
            .any(|(idx, _)| idx > 0 && pattern.matches_with(&filename[..idx], options))
}
