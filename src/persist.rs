//! State persisted between invocations.
//!
//! Three JSON blobs live under the output root: the in-memory artifact tree,
//! the environment snapshot (plus locked variables and the
//! alternate-configuration mapping table), and the action cache. Loading is
//! deliberately forgiving — a missing or format-incompatible blob yields
//! empty state rather than an error, so stale caches can never wedge a
//! build. The CLI layer owns *when* these run (process start and end); the
//! core only provides the round-trip.

use crate::{
    cache::ActionCache,
    error::Result,
    fs::{DirectorySnapshot, EnvDirectory, VirtualDirectory},
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

pub const MEM_STATE_FILE: &str = "mem.json";
pub const ENV_STATE_FILE: &str = "env.json";
pub const CACHE_STATE_FILE: &str = "cache.json";

const MEM_FORMAT_VERSION: &str = "quarry-mem-state-1";
const ENV_FORMAT_VERSION: &str = "quarry-env-state-1";

#[derive(Debug, Serialize, Deserialize)]
struct MemBlob {
    #[serde(rename = "_format")]
    format: String,
    #[serde(flatten)]
    snapshot: DirectorySnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvBlob {
    #[serde(rename = "_format")]
    format: String,
    #[serde(flatten)]
    snapshot: DirectorySnapshot,
    /// Environment variables pinned by the configure mechanism.
    #[serde(rename = "$config")]
    locked: BTreeSet<String>,
    /// Alternate-configuration aliases to their output roots.
    #[serde(rename = "$mappings")]
    mappings: BTreeMap<String, String>,
}

/// Loads the persisted `mem/…` tree, or an empty one.
pub fn load_mem(root: &Path) -> VirtualDirectory {
    let path = root.join(MEM_STATE_FILE);
    if !path.exists() {
        return VirtualDirectory::new();
    }
    match utils::read_json_file::<MemBlob>(&path) {
        Ok(blob) if blob.format == MEM_FORMAT_VERSION => {
            trace!(files = blob.snapshot.files.len(), "loaded mem state");
            VirtualDirectory::from_snapshot(blob.snapshot)
        }
        Ok(blob) => {
            debug!(format = %blob.format, "ignoring mem state with unknown format");
            VirtualDirectory::new()
        }
        Err(err) => {
            debug!(%err, "ignoring unreadable mem state");
            VirtualDirectory::new()
        }
    }
}

/// Writes the `mem/…` tree under the output root.
pub fn save_mem(root: &Path, dir: &VirtualDirectory) -> Result<()> {
    let blob =
        MemBlob { format: MEM_FORMAT_VERSION.to_string(), snapshot: dir.snapshot() };
    utils::write_json_file(&blob, &root.join(MEM_STATE_FILE))
}

/// Loads the persisted environment view plus the alternate-configuration
/// mapping table recorded at save time.
pub fn load_env(root: &Path) -> (EnvDirectory, BTreeMap<String, String>) {
    let path = root.join(ENV_STATE_FILE);
    if !path.exists() {
        return (EnvDirectory::new(), BTreeMap::new());
    }
    match utils::read_json_file::<EnvBlob>(&path) {
        Ok(blob) if blob.format == ENV_FORMAT_VERSION => {
            trace!(
                files = blob.snapshot.files.len(),
                locked = blob.locked.len(),
                "loaded env state"
            );
            (EnvDirectory::from_state(blob.snapshot, blob.locked), blob.mappings)
        }
        Ok(blob) => {
            debug!(format = %blob.format, "ignoring env state with unknown format");
            (EnvDirectory::new(), BTreeMap::new())
        }
        Err(err) => {
            debug!(%err, "ignoring unreadable env state");
            (EnvDirectory::new(), BTreeMap::new())
        }
    }
}

/// Writes the environment view and the mapping table under the output root.
pub fn save_env(
    root: &Path,
    env: &EnvDirectory,
    mappings: &BTreeMap<String, String>,
) -> Result<()> {
    let (snapshot, locked) = env.snapshot();
    let blob = EnvBlob {
        format: ENV_FORMAT_VERSION.to_string(),
        snapshot,
        locked,
        mappings: mappings.clone(),
    };
    utils::write_json_file(&blob, &root.join(ENV_STATE_FILE))
}

/// Loads the action cache, or an empty one.
pub fn load_cache(root: &Path) -> ActionCache {
    let path = root.join(CACHE_STATE_FILE);
    if !path.exists() {
        return ActionCache::new();
    }
    match utils::read_json_file::<ActionCache>(&path) {
        Ok(cache) if cache.is_current_format() => {
            trace!(entries = cache.len(), "loaded action cache");
            cache
        }
        Ok(_) => {
            debug!("ignoring action cache with unknown format");
            ActionCache::new()
        }
        Err(err) => {
            debug!(%err, "ignoring unreadable action cache");
            ActionCache::new()
        }
    }
}

/// Writes the action cache under the output root.
pub fn save_cache(root: &Path, cache: &ActionCache) -> Result<()> {
    utils::write_json_file(cache, &root.join(CACHE_STATE_FILE))
}
