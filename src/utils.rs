//! Utility functions

use crate::error::{BuildError, Result};
use md5::{Digest, Md5};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Top-level directories into which installable outputs may be placed.
pub const OUTPUT_DIRECTORIES: &[&str] = &["bin", "include", "lib", "share"];

/// Validates a logical build path: relative, forward-slash separated, free of
/// `.`/`..` components and empty segments.
///
/// Logical paths are the keys of the whole engine (artifact filenames, cache
/// keys, virtual-directory entries), so every path entering the graph funnels
/// through here.
pub fn check_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(BuildError::definition("empty path"));
    }
    if path.starts_with('/') {
        return Err(BuildError::definition(format!("absolute path not allowed: \"{path}\"")));
    }
    if path.contains('\\') {
        return Err(BuildError::definition(format!(
            "path must use forward slashes: \"{path}\""
        )));
    }
    for component in path.split('/') {
        if component.is_empty() {
            return Err(BuildError::definition(format!(
                "path contains an empty component: \"{path}\""
            )));
        }
        if component == "." || component == ".." {
            return Err(BuildError::definition(format!(
                "path must be normalized: \"{path}\""
            )));
        }
    }
    Ok(())
}

/// Joins path fragments into a checked logical path.
pub fn join_path(parts: &[&str]) -> Result<String> {
    let joined =
        parts.iter().filter(|p| !p.is_empty()).copied().collect::<Vec<_>>().join("/");
    check_path(&joined)?;
    Ok(joined)
}

/// Returns the directory portion of a logical path, or `None` for a top-level
/// entry.
pub fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(dir, _)| dir)
}

/// Returns the final component of a logical path.
pub fn base_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, base)| base)
}

/// Replaces the extension of the final path component, where `extension`
/// includes its leading dot (or is empty).
pub fn replace_extension(path: &str, extension: &str) -> String {
    let (dir, base) = match path.rsplit_once('/') {
        Some((dir, base)) => (Some(dir), base),
        None => (None, path),
    };
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    };
    match dir {
        Some(dir) => format!("{dir}/{stem}{extension}"),
        None => format!("{stem}{extension}"),
    }
}

/// Current time in fractional seconds since the epoch.
pub fn now() -> f64 {
    system_time_to_epoch(SystemTime::now())
}

/// Converts a [`SystemTime`] to fractional epoch seconds.
pub fn system_time_to_epoch(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Converts fractional epoch seconds back to a [`SystemTime`]. Negative
/// values clamp to the epoch.
pub fn epoch_to_system_time(seconds: f64) -> SystemTime {
    if seconds <= 0.0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_secs_f64(seconds)
    }
}

/// Modification time of an OS path, or `None` if it does not exist or is
/// inaccessible. Used for extra-tree disk inputs such as system libraries.
pub fn disk_mtime(path: &Path) -> Option<f64> {
    fs::metadata(path).and_then(|m| m.modified()).ok().map(system_time_to_epoch)
}

/// MD5 of `bytes`, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Reads and deserializes a json file.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|err| BuildError::io(err, path))?;
    serde_json::from_str(&contents).map_err(Into::into)
}

/// Serializes `content` and writes it to the path, creating parent
/// directories as needed.
pub fn write_json_file<T: Serialize>(content: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| BuildError::io(err, parent))?;
    }
    let file = fs::File::create(path).map_err(|err| BuildError::io(err, path))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, content)?;
    writer.flush().map_err(|err| BuildError::io(err, path))?;
    Ok(())
}
