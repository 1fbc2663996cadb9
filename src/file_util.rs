//! File-level primitives used by the mirror and increment builders.

use filetime::FileTime;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sibling path a copy is staged at before being renamed into place.
fn staging_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(dest.file_name().unwrap_or_default());
    name.push(".hm-partial");
    dest.with_file_name(name)
}

/// Creates `dir` and its parents. A concurrent creator winning the race
/// counts as success; a non-directory occupying the path does not.
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    match fs::create_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        result => result,
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => ensure_dir(parent),
        None => Ok(()),
    }
}

fn preserve_times(src_meta: &fs::Metadata, dest: &Path) -> io::Result<()> {
    let atime = FileTime::from_last_access_time(src_meta);
    let mtime = FileTime::from_last_modification_time(src_meta);
    filetime::set_file_times(dest, atime, mtime)
}

/// Copies `src` to `dest` keeping size, permissions and mtime.
///
/// The data goes to a staging sibling that is then renamed over `dest`, so an
/// existing `dest` (possibly hardlinked into an increment) is replaced, never
/// written through.
pub fn copy_preserving(src: &Path, dest: &Path) -> io::Result<u64> {
    let src_meta = fs::metadata(src)?;
    ensure_parent(dest)?;
    let staged = staging_path(dest);
    let result = fs::copy(src, &staged)
        .and_then(|n| preserve_times(&src_meta, &staged).map(|_| n))
        .and_then(|n| fs::rename(&staged, dest).map(|_| n));
    if result.is_err() {
        let _ = fs::remove_file(&staged);
    }
    result
}

/// Asynchronous counterpart of [`copy_preserving`].
pub async fn copy_preserving_async(src: PathBuf, dest: PathBuf) -> io::Result<u64> {
    let src_meta = tokio::fs::metadata(&src).await?;
    if let Some(parent) = dest.parent() {
        match tokio::fs::create_dir_all(parent).await {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && parent.is_dir() => {}
            result => result?,
        }
    }
    let staged = staging_path(&dest);
    let copied = async {
        let n = tokio::fs::copy(&src, &staged).await?;
        preserve_times(&src_meta, &staged)?;
        tokio::fs::rename(&staged, &dest).await?;
        Ok::<u64, io::Error>(n)
    }
    .await;
    if copied.is_err() {
        let _ = tokio::fs::remove_file(&staged).await;
    }
    copied
}

/// Whether a hardlink from files under `src_dir` into `dest_dir` can work.
///
/// Both directories must exist. Hardlinks never cross devices.
#[cfg(unix)]
pub fn can_hardlink(src_dir: &Path, dest_dir: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(src_dir), fs::metadata(dest_dir)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
pub fn can_hardlink(src_dir: &Path, dest_dir: &Path) -> bool {
    src_dir.exists() && dest_dir.exists()
}

/// Materializes `src` at `dest` as a hardlink when `hardlink` allows it and
/// the link succeeds, otherwise as a full copy.
///
/// Callers only learn whether an independently restorable file now exists at
/// `dest`. Repeating the call yields the same result.
pub fn link_or_copy(src: &Path, dest: &Path, hardlink: bool) -> io::Result<()> {
    ensure_parent(dest)?;
    match fs::symlink_metadata(dest) {
        Ok(_) => fs::remove_file(dest)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if hardlink {
        match fs::hard_link(src, dest) {
            Ok(()) => return Ok(()),
            Err(e) => debug!(
                "Hardlink {} -> {} failed ({e}), copying instead",
                src.display(),
                dest.display()
            ),
        }
    }
    copy_preserving(src, dest).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn mtime_of(path: &Path) -> FileTime {
        FileTime::from_last_modification_time(&fs::metadata(path).unwrap())
    }

    #[test]
    fn test_copy_preserving_keeps_mtime_and_creates_parents() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.txt");
        fs::write(&src, b"Hello, World!").unwrap();
        let stamp = FileTime::from_system_time(UNIX_EPOCH + Duration::from_secs(1_600_000_000));
        filetime::set_file_mtime(&src, stamp).unwrap();

        let dest = temp.path().join("out/nested/a.txt");
        assert_eq!(copy_preserving(&src, &dest).unwrap(), 13);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "Hello, World!");
        assert_eq!(mtime_of(&dest), stamp);
        assert!(!staging_path(&dest).exists());
    }

    #[test]
    fn test_copy_does_not_write_through_hardlinks() {
        let temp = TempDir::new().unwrap();
        let mirror = temp.path().join("mirror.txt");
        let snapshot = temp.path().join("snapshot.txt");
        fs::write(&mirror, b"old").unwrap();
        fs::hard_link(&mirror, &snapshot).unwrap();

        let src = temp.path().join("src.txt");
        fs::write(&src, b"new content").unwrap();
        copy_preserving(&src, &mirror).unwrap();

        assert_eq!(fs::read_to_string(&mirror).unwrap(), "new content");
        assert_eq!(fs::read_to_string(&snapshot).unwrap(), "old");
    }

    #[test]
    fn test_copy_missing_source() {
        let temp = TempDir::new().unwrap();
        let err = copy_preserving(&temp.path().join("nope"), &temp.path().join("x")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_copy_preserving_async() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.txt");
        fs::write(&src, b"async").unwrap();
        let dest = temp.path().join("deep/dir/a.txt");
        copy_preserving_async(src.clone(), dest.clone()).await.unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "async");
        assert_eq!(mtime_of(&dest), mtime_of(&src));
    }

    #[test]
    fn test_link_or_copy_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.txt");
        fs::write(&src, b"data").unwrap();
        let dest = temp.path().join("inc/track/a.txt");
        let hardlink = can_hardlink(temp.path(), temp.path());

        link_or_copy(&src, &dest, hardlink).unwrap();
        link_or_copy(&src, &dest, hardlink).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "data");

        let copied = temp.path().join("inc/deleted/a.txt");
        link_or_copy(&src, &copied, false).unwrap();
        assert_eq!(fs::read_to_string(&copied).unwrap(), "data");
    }

    #[cfg(unix)]
    #[test]
    fn test_link_or_copy_links_on_same_device() {
        use std::os::unix::fs::MetadataExt;
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.txt");
        fs::write(&src, b"data").unwrap();
        let dest = temp.path().join("linked.txt");
        assert!(can_hardlink(temp.path(), temp.path()));
        link_or_copy(&src, &dest, true).unwrap();
        assert_eq!(
            fs::metadata(&src).unwrap().ino(),
            fs::metadata(&dest).unwrap().ino()
        );
    }

    #[test]
    fn test_ensure_dir_tolerates_existing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("a/b");
        ensure_dir(&dir).unwrap();
        ensure_dir(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn test_file_in_the_way_is_an_error() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("notes");
        fs::write(&blocker, b"was a file").unwrap();
        fs::write(temp.path().join("src.txt"), b"data").unwrap();

        assert!(ensure_dir(&blocker).is_err());
        let err = copy_preserving(&temp.path().join("src.txt"), &blocker.join("a.txt")).unwrap_err();
        assert_ne!(err.kind(), io::ErrorKind::NotFound);
        assert!(blocker.is_file());
    }
}
