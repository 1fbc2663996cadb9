/// Mirror tree directory under the backup root.
pub const MIRROR_DIR: &str = "mirror";
/// Persisted mirror state under the backup root.
pub const STATE_FILE: &str = "mirror.json";
/// Prefix of increment directory names.
pub const INCREMENT_PREFIX: &str = "backup_";
/// `chrono` format of the increment timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
/// Subtree of an increment holding new or changed tracked files.
pub const TRACK_DIR: &str = "track";
/// Subtree of an increment holding removed tracked files.
pub const DELETED_DIR: &str = "deleted";
/// Tolerance absorbing filesystem timestamp rounding, in seconds.
pub const MTIME_TOLERANCE: f64 = 1.0;
