//! Test-case discovery.
//!
//! Test cases live in a two-level tree:
//!
//! ```text
//! <base>/
//!   functional/
//!     00_main.sy      source
//!     00_main.in      input (optional)
//!     00_main.out     expected answer
//!   performance/
//!     ...
//! ```
//!
//! A selection filter is a list of glob patterns (`*`, `?`). A pattern with
//! a `/` is matched against `series/name`; one without is matched against the
//! series alone, so `functional` selects a whole series.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Test case directory {0} does not exist")]
    MissingBase(PathBuf),

    #[error("Invalid selection pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One discovered test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCase {
    pub series: String,
    pub name: String,
    pub source: PathBuf,
    pub input: Option<PathBuf>,
    pub answer: PathBuf,
}

impl TestCase {
    /// `series/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.series, self.name)
    }
}

/// Compiled selection filter.
#[derive(Debug)]
pub struct Selection {
    patterns: Vec<(bool, Regex)>,
}

impl Selection {
    pub fn new(patterns: &[String]) -> Result<Self, DiscoveryError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let regex = glob_to_regex(p).map_err(|source| DiscoveryError::InvalidPattern {
                    pattern: p.clone(),
                    source,
                })?;
                Ok((p.contains('/'), regex))
            })
            .collect::<Result<Vec<_>, DiscoveryError>>()?;
        Ok(Self { patterns })
    }

    /// An empty selection matches everything.
    pub fn matches(&self, series: &str, name: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let full = format!("{}/{}", series, name);
        self.patterns.iter().any(|(qualified, regex)| {
            if *qualified {
                regex.is_match(&full)
            } else {
                regex.is_match(series)
            }
        })
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

/// Finds all selected test cases under `base`, sorted by series and name.
pub fn discover(base: &Path, select: &[String]) -> Result<Vec<TestCase>, DiscoveryError> {
    if !base.is_dir() {
        return Err(DiscoveryError::MissingBase(base.to_path_buf()));
    }
    let selection = Selection::new(select)?;

    let mut cases = Vec::new();
    for series_dir in sorted_entries(base)? {
        if !series_dir.is_dir() {
            continue;
        }
        let Some(series) = file_name(&series_dir) else {
            continue;
        };

        for source in sorted_entries(&series_dir)? {
            if source.extension().is_none_or(|ext| ext != "sy") {
                continue;
            }
            let Some(name) = source.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if !selection.matches(&series, &name) {
                continue;
            }

            let answer = source.with_extension("out");
            if !answer.is_file() {
                warn!("Skipping {}/{}: no answer file", series, name);
                continue;
            }
            let input = Some(source.with_extension("in")).filter(|p| p.is_file());

            cases.push(TestCase {
                series: series.clone(),
                name,
                source,
                input,
                answer,
            });
        }
    }

    debug!("Discovered {} test cases under {}", cases.len(), base.display());
    Ok(cases)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    let io_err = |source| DiscoveryError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}
