//! Backup configuration.
//!
//! This module defines the rule set and runtime settings consumed by the
//! backup engine, and how they are read from a TOML (or JSON) file and
//! validated before any mutation happens.

use crate::path_util;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Which tag wins when a file is reachable from both an `include_dirs` and a
/// `track_dirs` root.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryPriority {
    Include,
    #[default]
    Track,
}

/// The composable include/track/exclude rules.
///
/// Directory patterns are globs relative to the source root. File patterns are
/// globs too and may carry a `:rec` suffix to match at any depth.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Rules {
    pub include_dirs: Vec<String>,
    pub track_dirs: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub include_files: Vec<String>,
    pub track_files: Vec<String>,
    pub exclude_files: Vec<String>,
    pub directory_priority: DirectoryPriority,
}

impl Rules {
    /// Logs entries that appear in both an include list and its exclude list.
    pub fn warn_conflicts(&self) {
        let dirs = overlap(&self.include_dirs, &self.exclude_dirs);
        if !dirs.is_empty() {
            warn!("Directories both included and excluded: {dirs:?}");
        }
        let files = overlap(&self.include_files, &self.exclude_files);
        if !files.is_empty() {
            warn!("Files both included and excluded: {files:?}");
        }
    }
}

fn overlap<'a>(left: &'a [String], right: &'a [String]) -> BTreeSet<&'a str> {
    let right: BTreeSet<&str> = right.iter().map(String::as_str).collect();
    left.iter()
        .map(String::as_str)
        .filter(|s| right.contains(s))
        .collect()
}

/// Full configuration of one backup job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Source root to mirror.
    pub src: PathBuf,
    /// Backup root holding `mirror/`, `mirror.json` and the increments.
    pub dist: PathBuf,
    #[serde(flatten)]
    pub rules: Rules,
    /// Size of the copy worker pool.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Directories with more pending copies than this are synced sequentially.
    #[serde(default = "default_max_files_per_dir")]
    pub max_files_per_dir: usize,
    /// Directory names never pruned from the mirror when they become empty.
    #[serde(default)]
    pub preserved_dirs: BTreeSet<String>,
}

fn default_max_workers() -> usize {
    8
}

fn default_max_files_per_dir() -> usize {
    50
}

impl Config {
    /// Creates a configuration with default settings and no rules.
    pub fn new(src: impl Into<PathBuf>, dist: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dist: dist.into(),
            rules: Rules::default(),
            max_workers: default_max_workers(),
            max_files_per_dir: default_max_files_per_dir(),
            preserved_dirs: BTreeSet::new(),
        }
    }

    /// Reads, expands and validates the configuration at `path`.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as TOML.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if
    /// [`Config::validate`] rejects it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let mut config: Config = if is_json {
            serde_json::from_str(&text)?
        } else {
            toml::from_str(&text)?
        };
        config.src = path_util::expand_path(&config.src.to_string_lossy())?;
        config.dist = path_util::expand_path(&config.dist.to_string_lossy())?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the engine relies on.
    ///
    /// # Errors
    /// Returns [`Error::SourceMissing`] if `src` is not a directory and
    /// [`Error::Config`] for an unusable `dist` or zero-sized limits.
    pub fn validate(&self) -> Result<()> {
        path_util::check_dir(&self.src)?;
        let resolved_src = path_util::resolve_existing(&self.src);
        let resolved_dist = path_util::resolve_existing(&self.dist);
        if self.dist.starts_with(&self.src) || resolved_dist.starts_with(&resolved_src) {
            return Err(Error::Config(format!(
                "backup root '{}' must not be inside the source root '{}'",
                self.dist.display(),
                self.src.display()
            )));
        }
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".into()));
        }
        if self.max_files_per_dir == 0 {
            return Err(Error::Config("max_files_per_dir must be at least 1".into()));
        }
        self.rules.warn_conflicts();
        Ok(())
    }
}
