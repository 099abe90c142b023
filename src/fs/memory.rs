use super::{not_found, Directory};
use crate::{error::Result, utils};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Mutex,
};

/// A single entry of a [`VirtualDirectory`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VirtualFile {
    pub mtime: f64,
    pub content: Vec<u8>,
}

/// Serializable image of a [`VirtualDirectory`], used by the persistence
/// layer to carry the tree between invocations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub files: BTreeMap<String, VirtualFile>,
    pub dirs: BTreeSet<String>,
}

/// An in-memory [`Directory`].
///
/// Holds small text artifacts (`mem/…`) and the synthesized environment view
/// (`env/…`). All operations lock an interior mutex, so a shared
/// `Arc<VirtualDirectory>` is safe to use from several workers.
#[derive(Debug, Default)]
pub struct VirtualDirectory {
    inner: Mutex<DirectorySnapshot>,
}

impl VirtualDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: DirectorySnapshot) -> Self {
        Self { inner: Mutex::new(snapshot) }
    }

    /// Copies the current contents out for serialization.
    pub fn snapshot(&self) -> DirectorySnapshot {
        self.inner.lock().unwrap().clone()
    }

    /// Directly inserts a file, mostly useful for seeding test fixtures.
    pub fn add(&self, path: &str, mtime: f64, content: impl Into<Vec<u8>>) {
        let mut inner = self.inner.lock().unwrap();
        register_parents(&mut inner.dirs, path);
        inner.files.insert(path.to_string(), VirtualFile { mtime, content: content.into() });
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.files.is_empty() && inner.dirs.is_empty()
    }

    /// Writes `content` only if it differs from what is already stored, so
    /// the mtime moves only on genuine change. Returns whether a write
    /// happened.
    pub fn write_if_changed(&self, path: &str, content: &[u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.files.get(path).is_some_and(|f| f.content == content) {
            return false;
        }
        register_parents(&mut inner.dirs, path);
        inner.files.insert(
            path.to_string(),
            VirtualFile { mtime: utils::now(), content: content.to_vec() },
        );
        true
    }
}

fn register_parents(dirs: &mut BTreeSet<String>, path: &str) {
    let mut dir = path;
    while let Some(parent) = utils::parent_dir(dir) {
        dirs.insert(parent.to_string());
        dir = parent;
    }
}

impl Directory for VirtualDirectory {
    fn exists(&self, path: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.files.contains_key(path) || inner.dirs.contains(path)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.inner.lock().unwrap().dirs.contains(path)
    }

    fn mtime(&self, path: &str) -> Result<Option<f64>> {
        Ok(self.inner.lock().unwrap().files.get(path).map(|f| f.mtime))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|f| f.content.clone())
            .ok_or_else(|| not_found(path))
    }

    fn write(&self, path: &str, content: &[u8], mtime: Option<f64>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        register_parents(&mut inner.dirs, path);
        inner.files.insert(
            path.to_string(),
            VirtualFile {
                mtime: mtime.unwrap_or_else(utils::now),
                content: content.to_vec(),
            },
        );
        Ok(())
    }

    fn touch(&self, path: &str, mtime: Option<f64>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner.files.get_mut(path).ok_or_else(|| not_found(path))?;
        file.mtime = mtime.unwrap_or_else(utils::now);
        Ok(())
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        register_parents(&mut inner.dirs, path);
        inner.dirs.insert(path.to_string());
        Ok(())
    }

    fn disk_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}
