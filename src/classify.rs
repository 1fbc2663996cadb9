//! Builds the set of files to mirror and the tracked subset.

use crate::config::{DirectoryPriority, Rules};
use crate::context::{FileMeta, RunContext};
use crate::path_util::rel_key;
use crate::pattern::{self, ExcludeMatcher};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifiedFile {
    pub tracked: bool,
    /// Matched by `include_files`/`track_files` and therefore exempt from
    /// `exclude_files`.
    pub explicit: bool,
    pub meta: FileMeta,
}

/// Relative path (`/`-separated) to classification, ordered by path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub files: BTreeMap<String, ClassifiedFile>,
}

impl Classification {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn is_tracked(&self, rel: &str) -> bool {
        self.files.get(rel).is_some_and(|f| f.tracked)
    }

    pub fn tracked_count(&self) -> usize {
        self.files.values().filter(|f| f.tracked).count()
    }
}

#[derive(Debug, Default)]
struct DirHit {
    from_include: bool,
    from_track: bool,
    meta: Option<FileMeta>,
}

/// Classifies the source tree of `ctx` according to `rules`.
///
/// Directory roots are walked at every depth with `exclude_dirs` pruned,
/// `exclude_files` then removes directory-sourced files, and finally the
/// explicit file patterns are merged in untouched by any exclusion.
pub fn classify(ctx: &RunContext, rules: &Rules) -> Classification {
    let root = ctx.source_root();
    let include_roots = pattern::expand_directories(root, &rules.include_dirs);
    let track_roots = pattern::expand_directories(root, &rules.track_dirs);
    let exclude_roots: Vec<PathBuf> = pattern::expand_directories(root, &rules.exclude_dirs)
        .into_iter()
        .collect();
    info!(
        "Directories: {} included, {} tracked, {} excluded",
        include_roots.len(),
        track_roots.len(),
        exclude_roots.len()
    );

    for dir in include_roots.iter().chain(track_roots.iter()) {
        if is_under_any(dir, &exclude_roots) {
            warn!(
                "Directory {} is both selected and excluded; exclusion wins for non-explicit files",
                dir.display()
            );
        }
    }

    let mut hits: BTreeMap<String, DirHit> = BTreeMap::new();
    for dir in &include_roots {
        for (rel, meta) in scan_directory(ctx, dir, &exclude_roots) {
            let hit = hits.entry(rel).or_default();
            hit.from_include = true;
            hit.meta = Some(meta);
        }
    }
    for dir in &track_roots {
        for (rel, meta) in scan_directory(ctx, dir, &exclude_roots) {
            let hit = hits.entry(rel).or_default();
            hit.from_track = true;
            hit.meta = Some(meta);
        }
    }

    let excludes = ExcludeMatcher::new(&rules.exclude_files);
    if excludes.is_empty() {
        debug!("No exclude_files patterns");
    }
    let mut files = BTreeMap::new();
    let mut excluded = 0usize;
    for (rel, hit) in hits {
        let Some(meta) = hit.meta else { continue };
        if excludes.is_excluded(&rel) {
            excluded += 1;
            continue;
        }
        let tracked = match (hit.from_include, hit.from_track) {
            (true, true) => rules.directory_priority == DirectoryPriority::Track,
            (_, from_track) => from_track,
        };
        files.insert(
            rel,
            ClassifiedFile {
                tracked,
                explicit: false,
                meta,
            },
        );
    }
    if excluded > 0 {
        info!("Excluded {excluded} files from directories by exclude patterns");
    }

    let include_files = pattern::expand_files(root, &rules.include_files);
    let track_files: BTreeSet<PathBuf> = pattern::expand_files(root, &rules.track_files)
        .difference(&include_files)
        .cloned()
        .collect();
    let explicit = include_files
        .iter()
        .map(|p| (p, false))
        .chain(track_files.iter().map(|p| (p, true)));
    for (path, tracked) in explicit {
        let Some(rel) = rel_key(path, root) else {
            warn!("Skipping {}: not representable as a relative path", path.display());
            continue;
        };
        let Some(meta) = ctx.stat(path) else { continue };
        files
            .entry(rel)
            .and_modify(|f: &mut ClassifiedFile| {
                f.tracked |= tracked;
                f.explicit = true;
            })
            .or_insert(ClassifiedFile {
                tracked,
                explicit: true,
                meta,
            });
    }

    let classification = Classification { files };
    info!(
        "Classified {} files, {} tracked",
        classification.len(),
        classification.tracked_count()
    );
    classification
}

fn is_under_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

/// Walks `dir`, never descending into excluded directories.
fn scan_directory(ctx: &RunContext, dir: &Path, exclude_roots: &[PathBuf]) -> Vec<(String, FileMeta)> {
    let root = ctx.source_root();
    let mut found = vec![];
    if is_under_any(dir, exclude_roots) {
        debug!("Skipping excluded directory {}", dir.display());
        return found;
    }
    let walker = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && is_under_any(e.path(), exclude_roots)));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Can't scan directory entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = rel_key(entry.path(), root) else {
            warn!("Skipping {}: not representable as a relative path", entry.path().display());
            continue;
        };
        match entry.metadata() {
            Ok(meta) => found.push((rel, ctx.remember(entry.path(), &meta))),
            Err(e) => warn!("Error getting metadata for {}: {e}", entry.path().display()),
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, rel).unwrap();
    }

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn source() -> TempDir {
        let temp = TempDir::new().unwrap();
        for rel in [
            "docs/a.txt",
            "docs/b.tmp",
            "docs/cache/c.txt",
            "work/plan.md",
            "work/notes.tmp",
            "shared/s.txt",
            "loose.important",
            "other/x.important",
        ] {
            write(temp.path(), rel);
        }
        temp
    }

    #[test]
    fn test_directory_rules() {
        let temp = source();
        let ctx = RunContext::new(temp.path());
        let rules = Rules {
            include_dirs: list(&["docs"]),
            track_dirs: list(&["work"]),
            exclude_dirs: list(&["docs/cache"]),
            exclude_files: list(&["*.tmp"]),
            ..Rules::default()
        };
        let result = classify(&ctx, &rules);
        let keys: Vec<&str> = result.files.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["docs/a.txt", "work/plan.md"]);
        assert!(!result.is_tracked("docs/a.txt"));
        assert!(result.is_tracked("work/plan.md"));
        assert!(!result.files["work/plan.md"].explicit);
    }

    #[test]
    fn test_directory_priority() {
        let temp = source();
        let mut rules = Rules {
            include_dirs: list(&["shared"]),
            track_dirs: list(&["shared"]),
            ..Rules::default()
        };
        let ctx = RunContext::new(temp.path());
        assert!(classify(&ctx, &rules).is_tracked("shared/s.txt"));

        rules.directory_priority = DirectoryPriority::Include;
        let result = classify(&ctx, &rules);
        assert!(!result.is_tracked("shared/s.txt"));
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_explicit_files_are_exempt_from_exclusion() {
        let temp = source();
        let ctx = RunContext::new(temp.path());
        let rules = Rules {
            include_dirs: list(&["docs"]),
            exclude_dirs: list(&["docs/cache"]),
            include_files: list(&["docs/b.tmp", "docs/cache/c.txt"]),
            track_files: list(&["*.important:rec"]),
            exclude_files: list(&["*.tmp", "*.important"]),
            ..Rules::default()
        };
        let result = classify(&ctx, &rules);
        assert!(result.files["docs/b.tmp"].explicit);
        assert!(result.files["docs/cache/c.txt"].explicit);
        assert!(result.is_tracked("loose.important"));
        assert!(result.is_tracked("other/x.important"));
        assert!(!result.is_tracked("docs/a.txt"));
    }

    #[test]
    fn test_include_files_beat_track_files() {
        let temp = source();
        let ctx = RunContext::new(temp.path());
        let rules = Rules {
            include_files: list(&["loose.important"]),
            track_files: list(&["*.important"]),
            ..Rules::default()
        };
        let result = classify(&ctx, &rules);
        assert_eq!(result.len(), 1);
        assert!(!result.is_tracked("loose.important"));
    }

    #[test]
    fn test_classify_is_idempotent() {
        let temp = source();
        let rules = Rules {
            include_dirs: list(&["*"]),
            track_files: list(&["*.md:rec"]),
            exclude_files: list(&["*.tmp"]),
            ..Rules::default()
        };
        let first = classify(&RunContext::new(temp.path()), &rules);
        let second = classify(&RunContext::new(temp.path()), &rules);
        assert_eq!(first, second);
        assert!(first.is_tracked("work/plan.md"));
    }
}
