//! hmirror: a mirror of selected files plus hardlinked incremental snapshots.
//!
//! A run classifies the source tree through include/track/exclude rules,
//! detects metadata changes against the last recorded state, snapshots the
//! tracked changes into a timestamped increment and then brings the mirror up
//! to date. See [`backup::Backup`] for the entry point.

pub mod backup;
pub mod classify;
pub mod config;
pub mod constants;
pub mod context;
pub mod diff;
pub mod error;
pub mod file_util;
pub mod increment;
pub mod logger;
pub mod manifest;
pub mod path_util;
pub mod pattern;
pub mod state;
pub mod sync;

pub use backup::{Backup, RunReport};
pub use config::Config;
pub use error::{Error, Result};
