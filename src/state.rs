//! Persistence of the last known backed-up state (`mirror.json`).
//!
//! The file is only ever replaced atomically: the new state is written to a
//! temporary file in the same directory, synced, then renamed over the
//! canonical file.

use crate::constants::STATE_FILE;
use crate::context::FileMeta;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{error, info};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct MirrorEntry {
    pub size: u64,
    pub mtime: f64,
    #[serde(default)]
    pub tracked: bool,
}

impl MirrorEntry {
    pub fn new(meta: FileMeta, tracked: bool) -> Self {
        Self {
            size: meta.size,
            mtime: meta.mtime,
            tracked,
        }
    }

    pub fn meta(&self) -> FileMeta {
        FileMeta {
            size: self.size,
            mtime: self.mtime,
        }
    }
}

/// Relative path to recorded metadata.
pub type MirrorState = BTreeMap<String, MirrorEntry>;

pub fn state_file(root: &Path) -> PathBuf {
    root.join(STATE_FILE)
}

/// Loads the state stored under the backup `root`.
///
/// A missing file yields an empty state. So does a corrupt or unreadable one,
/// after logging the problem.
pub fn load(root: &Path) -> MirrorState {
    let path = state_file(root);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No existing mirror state found");
            return MirrorState::new();
        }
        Err(e) => {
            error!("Error loading mirror state {}: {e}", path.display());
            return MirrorState::new();
        }
    };
    match serde_json::from_str::<MirrorState>(&text) {
        Ok(state) => {
            info!("Loaded mirror state with {} files", state.len());
            state
        }
        Err(e) => {
            error!("Mirror state {} is corrupt, starting empty: {e}", path.display());
            MirrorState::new()
        }
    }
}

/// Atomically replaces the state stored under the backup `root`.
///
/// # Errors
/// Returns an error if the temporary file cannot be written or renamed; the
/// previous `mirror.json` is left untouched in that case.
pub fn save(root: &Path, state: &MirrorState) -> Result<()> {
    write_json_atomic(&state_file(root), state)?;
    info!("Mirror state saved with {} files", state.len());
    Ok(())
}

/// Serializes `value` next to `path` and renames it into place.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    let temp_path = temp.path().to_path_buf();
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush().map_err(|e| Error::io(&temp_path, e))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|e| Error::io(&temp_path, e))?;
    temp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> MirrorState {
        let mut state = MirrorState::new();
        state.insert(
            "notes/todo.track".into(),
            MirrorEntry {
                size: 100,
                mtime: 1_700_000_000.25,
                tracked: true,
            },
        );
        state.insert(
            "docs/a.txt".into(),
            MirrorEntry {
                size: 7,
                mtime: 1_600_000_000.0,
                tracked: false,
            },
        );
        state
    }

    #[test]
    fn test_missing_state_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(load(temp.path()).is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let state = sample();
        save(temp.path(), &state).unwrap();
        assert_eq!(load(temp.path()), state);

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from(STATE_FILE)]);
    }

    #[test]
    fn test_corrupt_state_is_empty() {
        let temp = TempDir::new().unwrap();
        fs::write(state_file(temp.path()), b"{ \"a\": { \"size\": ").unwrap();
        assert!(load(temp.path()).is_empty());
    }

    #[test]
    fn test_failed_save_keeps_previous_state() {
        let temp = TempDir::new().unwrap();
        let state = sample();
        save(temp.path(), &state).unwrap();

        let missing_root = temp.path().join("gone");
        assert!(save(&missing_root, &MirrorState::new()).is_err());
        assert_eq!(load(temp.path()), state);
    }

    #[test]
    fn test_on_disk_format() {
        let temp = TempDir::new().unwrap();
        save(temp.path(), &sample()).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(state_file(temp.path())).unwrap()).unwrap();
        assert_eq!(raw["notes/todo.track"]["size"], 100);
        assert_eq!(raw["notes/todo.track"]["tracked"], true);
        assert_eq!(raw["docs/a.txt"]["mtime"], 1_600_000_000.0);
    }
}
