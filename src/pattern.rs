//! Resolution of directory and file glob patterns against the source root.
//!
//! File patterns may end in `:rec`, meaning "match at any depth below the
//! pattern's directory" instead of only at its literal location. Directory
//! patterns accept the suffix but ignore it. Nothing in here aborts on a bad
//! pattern or an unreadable path: the problem is logged and skipped.

use glob::{MatchOptions, Pattern};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Suffix marking a file pattern as recursive.
pub const REC_SUFFIX: &str = ":rec";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Splits a raw pattern into the glob text and whether it is recursive.
pub fn parse_pattern(raw: &str) -> (&str, bool) {
    let raw = raw.trim();
    match raw.strip_suffix(REC_SUFFIX) {
        Some(pattern) => (pattern, true),
        None => (raw, false),
    }
}

pub fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

fn clean(pattern: &str) -> &str {
    pattern.trim_matches('/')
}

/// Returns the existing directories under `root` matching `patterns`.
pub fn expand_directories(root: &Path, patterns: &[String]) -> BTreeSet<PathBuf> {
    let mut expanded = BTreeSet::new();
    for raw in patterns {
        let (pattern, rec) = parse_pattern(raw);
        if rec {
            debug!("Ignoring {REC_SUFFIX} on directory pattern '{raw}'");
        }
        let pattern = clean(pattern);
        if pattern.is_empty() {
            continue;
        }
        if has_wildcard(pattern) {
            for path in glob_under(root, pattern) {
                if path.is_dir() {
                    expanded.insert(path);
                }
            }
        } else {
            let dir = root.join(pattern);
            if dir.is_dir() {
                expanded.insert(dir);
            }
        }
    }
    expanded
}

/// Returns the existing regular files under `root` matching `patterns`.
///
/// A pattern with a `/` is resolved inside that subdirectory; a wildcard in
/// the directory portion makes the whole pattern unusable and it is skipped.
pub fn expand_files(root: &Path, patterns: &[String]) -> BTreeSet<PathBuf> {
    let mut expanded = BTreeSet::new();
    for raw in patterns {
        let (pattern, rec) = parse_pattern(raw);
        let pattern = clean(pattern);
        if pattern.is_empty() {
            continue;
        }
        let (dir, file) = pattern.rsplit_once('/').unwrap_or(("", pattern));
        if has_wildcard(dir) {
            warn!("Skipping file pattern '{raw}': wildcards are not allowed in its directory part");
            continue;
        }
        let base = if dir.is_empty() {
            root.to_path_buf()
        } else {
            root.join(dir)
        };
        if !base.is_dir() {
            warn!("Skipping file pattern '{raw}': {} is not an accessible directory", base.display());
            continue;
        }

        if rec {
            expanded.extend(walk_matching(&base, file, raw));
        } else if has_wildcard(file) {
            expanded.extend(glob_under(&base, file).into_iter().filter(|p| is_regular_file(p)));
        } else {
            let path = base.join(file);
            if is_regular_file(&path) {
                expanded.insert(path);
            }
        }
    }
    expanded
}

fn is_regular_file(path: &Path) -> bool {
    path.symlink_metadata().is_ok_and(|m| m.is_file())
}

/// Globs `pattern` relative to `base`, logging and skipping unreadable paths.
fn glob_under(base: &Path, pattern: &str) -> Vec<PathBuf> {
    let full = format!("{}/{}", Pattern::escape(&base.to_string_lossy()), pattern);
    let paths = match glob::glob_with(&full, MATCH_OPTIONS) {
        Ok(paths) => paths,
        Err(e) => {
            warn!("Invalid pattern '{pattern}': {e}");
            return vec![];
        }
    };
    let mut matches = vec![];
    for entry in paths {
        match entry {
            Ok(path) => matches.push(path),
            Err(e) => warn!("Skipping inaccessible path {}: {}", e.path().display(), e.error()),
        }
    }
    matches
}

/// Walks every depth below `base` collecting regular files whose name matches.
fn walk_matching(base: &Path, name_pattern: &str, raw: &str) -> Vec<PathBuf> {
    let pattern = match Pattern::new(name_pattern) {
        Ok(p) => p,
        Err(e) => {
            warn!("Invalid pattern '{raw}': {e}");
            return vec![];
        }
    };
    let mut matches = vec![];
    for entry in WalkDir::new(base) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping inaccessible path: {e}");
                continue;
            }
        };
        if entry.file_type().is_file()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| pattern.matches_with(name, MATCH_OPTIONS))
        {
            matches.push(entry.into_path());
        }
    }
    matches
}

/// Compiled `exclude_files` rules.
///
/// A plain pattern is matched against the file name, a pattern containing `/`
/// against the relative path, and a `:rec` pattern against the relative path
/// with `*` allowed to cross directory boundaries.
#[derive(Debug, Default)]
pub struct ExcludeMatcher {
    rules: Vec<(Pattern, ExcludeScope)>,
}

#[derive(Debug, Clone, Copy)]
enum ExcludeScope {
    Name,
    Path,
    AnyDepth,
}

impl ExcludeMatcher {
    pub fn new(patterns: &[String]) -> Self {
        let mut rules = vec![];
        for raw in patterns {
            let (text, rec) = parse_pattern(raw);
            let text = clean(text);
            if text.is_empty() {
                continue;
            }
            let scope = if rec {
                ExcludeScope::AnyDepth
            } else if text.contains('/') {
                ExcludeScope::Path
            } else {
                ExcludeScope::Name
            };
            match Pattern::new(text) {
                Ok(pattern) => rules.push((pattern, scope)),
                Err(e) => warn!("Invalid exclude pattern '{raw}': {e}"),
            }
        }
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Tests a `/`-separated relative path.
    pub fn is_excluded(&self, rel: &str) -> bool {
        let name = rel.rsplit('/').next().unwrap_or(rel);
        self.rules.iter().any(|(pattern, scope)| match scope {
            ExcludeScope::Name => pattern.matches_with(name, MATCH_OPTIONS),
            ExcludeScope::Path => pattern.matches_with(rel, MATCH_OPTIONS),
            ExcludeScope::AnyDepth => pattern.matches(rel),
        })
    }
}
