use crate::{Error, Result};
use std::env;
use std::path::{Component, Path, PathBuf};

/// Checks that `path` exists and is a directory.
///
/// # Errors
/// Returns [`Error::SourceMissing`] naming the path if it is missing or not
/// a directory.
pub fn check_dir(path: &Path) -> Result<()> {
    match path.metadata() {
        Ok(meta) if meta.is_dir() => Ok(()),
        _ => Err(Error::SourceMissing(path.to_path_buf())),
    }
}

/// Expands a configured path: `~` and `$HOME` become the user's home
/// directory and relative paths are resolved against the current directory.
pub fn expand_path(input: &str) -> Result<PathBuf> {
    let expanded = expand_home(input);
    let path = Path::new(&expanded);
    if path.is_absolute() {
        return Ok(normalize(path));
    }
    let cwd = env::current_dir().map_err(|e| Error::io(".", e))?;
    Ok(normalize(&cwd.join(path)))
}

fn expand_home(input: &str) -> String {
    if input.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return input.replacen('~', &home.to_string_lossy(), 1);
        }
    } else if input.starts_with("$HOME") {
        if let Some(home) = dirs::home_dir() {
            return input.replacen("$HOME", &home.to_string_lossy(), 1);
        }
    }
    input.into()
}

/// Lexically removes `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves symlinks in the longest existing prefix of `path`. The missing
/// tail, if any, is appended unchanged.
pub fn resolve_existing(path: &Path) -> PathBuf {
    for ancestor in path.ancestors() {
        if let Ok(resolved) = ancestor.canonicalize() {
            return match path.strip_prefix(ancestor) {
                Ok(tail) if !tail.as_os_str().is_empty() => resolved.join(tail),
                _ => resolved,
            };
        }
    }
    path.to_path_buf()
}

/// Returns the `/`-separated key of `path` relative to `base`, or `None` when
/// `path` is outside `base`, equal to it, or not valid UTF-8.
pub fn rel_key(path: &Path, base: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Joins a `/`-separated relative key back onto `base`.
pub fn join_key(base: &Path, key: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    path.extend(key.split('/'));
    path
}

/// Parent portion of a relative key; the empty string for top-level entries.
pub fn parent_key(key: &str) -> &str {
    key.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rel_key() {
        let base = Path::new("/data/src");
        assert_eq!(
            rel_key(Path::new("/data/src/notes/todo.track"), base).as_deref(),
            Some("notes/todo.track")
        );
        assert_eq!(rel_key(Path::new("/data/src"), base), None);
        assert_eq!(rel_key(Path::new("/data/other/a.txt"), base), None);
    }

    #[test]
    fn test_join_and_parent_key() {
        let base = Path::new("/mirror");
        assert_eq!(join_key(base, "a/b/c.txt"), PathBuf::from("/mirror/a/b/c.txt"));
        assert_eq!(parent_key("a/b/c.txt"), "a/b");
        assert_eq!(parent_key("c.txt"), "");
    }

    #[test]
    fn test_expand_path() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_path("~/backups").unwrap(), home.join("backups"));
        assert_eq!(expand_path("$HOME/x/../y").unwrap(), home.join("y"));
        assert_eq!(
            expand_path("/tmp/./a/../b").unwrap(),
            PathBuf::from("/tmp/b")
        );
        let rel = expand_path("relative/dir").unwrap();
        assert!(rel.is_absolute());
        assert!(rel.ends_with("relative/dir"));
    }

    #[test]
    fn test_resolve_existing() {
        let temp = tempfile::TempDir::new().unwrap();
        let real = temp.path().canonicalize().unwrap();
        assert_eq!(resolve_existing(temp.path()), real);
        assert_eq!(
            resolve_existing(&temp.path().join("not/yet")),
            real.join("not/yet")
        );
    }

    #[test]
    fn test_check_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(check_dir(temp.path()).is_ok());
        let missing = temp.path().join("missing");
        let err = check_dir(&missing).unwrap_err();
        assert!(format!("{err}").contains("does not exist"));
    }
}
