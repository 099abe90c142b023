//! Layered filesystem access.
//!
//! Every file the engine touches is addressed by a normalized, forward-slash
//! *logical path* relative to a virtual project root. The [`Directory`] trait
//! gives the rest of the engine one interface over several backings: the real
//! disk ([`DiskDirectory`]), a persisted in-memory tree ([`VirtualDirectory`])
//! and the prefix-routed composite used for actual builds
//! ([`MappedDirectory`]), which also synthesizes `env/…` files from the
//! process environment so that environment changes invalidate dependent
//! actions through ordinary mtime comparison.

use crate::error::{BuildError, Result};
use std::{fmt, io, path::PathBuf};

mod disk;
mod mapped;
mod memory;

pub use disk::DiskDirectory;
pub use mapped::{EnvDirectory, MappedDirectory};
pub use memory::{DirectorySnapshot, VirtualDirectory, VirtualFile};

/// Timestamp value for files that do not exist.
pub const MISSING_MTIME: f64 = -1.0;

/// A directory in which builds may be performed.
///
/// Paths are logical: relative, forward-slash, normalized (see
/// [`crate::utils::check_path`]). Timestamps are fractional seconds since the
/// epoch.
pub trait Directory: fmt::Debug + Send + Sync {
    /// Whether the file (or directory) exists.
    fn exists(&self, path: &str) -> bool;

    /// Whether the path names a directory.
    fn is_dir(&self, path: &str) -> bool;

    /// Last-modified time, or `Ok(None)` if the file does not exist.
    fn mtime(&self, path: &str) -> Result<Option<f64>>;

    /// Reads the file's contents.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Replaces the file's contents. `mtime` of `None` means "now". Parent
    /// directories are created as needed.
    fn write(&self, path: &str, content: &[u8], mtime: Option<f64>) -> Result<()>;

    /// Sets the modification time of an existing file to `mtime`, or to the
    /// current time if `None`.
    fn touch(&self, path: &str, mtime: Option<f64>) -> Result<()>;

    /// Creates the directory and any missing parents.
    fn mkdir(&self, path: &str) -> Result<()>;

    /// The real on-disk location of the path, or `None` if this backing is
    /// not disk-based (the caller must materialize a temporary file instead).
    fn disk_path(&self, path: &str) -> Option<PathBuf>;
}

pub(crate) fn not_found(path: &str) -> BuildError {
    BuildError::io(io::Error::new(io::ErrorKind::NotFound, "file not found"), path)
}
