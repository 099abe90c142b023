use super::Directory;
use crate::{
    error::{BuildError, Result},
    utils,
};
use path_slash::PathBufExt;
use std::{
    fs,
    io,
    path::PathBuf,
};

/// A [`Directory`] rooted at a location on the real filesystem.
#[derive(Debug, Clone)]
pub struct DiskDirectory {
    root: PathBuf,
}

impl DiskDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(PathBuf::from_slash(path))
    }
}

impl Directory for DiskDirectory {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn is_dir(&self, path: &str) -> bool {
        self.resolve(path).is_dir()
    }

    fn mtime(&self, path: &str) -> Result<Option<f64>> {
        let resolved = self.resolve(path);
        match fs::metadata(&resolved) {
            Ok(meta) => {
                let modified =
                    meta.modified().map_err(|err| BuildError::io(err, &resolved))?;
                Ok(Some(utils::system_time_to_epoch(modified)))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BuildError::io(err, resolved)),
        }
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let resolved = self.resolve(path);
        fs::read(&resolved).map_err(|err| BuildError::io(err, resolved))
    }

    fn write(&self, path: &str, content: &[u8], mtime: Option<f64>) -> Result<()> {
        let resolved = self.resolve(path);
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).map_err(|err| BuildError::io(err, parent))?;
        }
        fs::write(&resolved, content).map_err(|err| BuildError::io(err, &resolved))?;
        if let Some(mtime) = mtime {
            let file = fs::OpenOptions::new()
                .append(true)
                .open(&resolved)
                .map_err(|err| BuildError::io(err, &resolved))?;
            file.set_modified(utils::epoch_to_system_time(mtime))
                .map_err(|err| BuildError::io(err, resolved))?;
        }
        Ok(())
    }

    fn touch(&self, path: &str, mtime: Option<f64>) -> Result<()> {
        let resolved = self.resolve(path);
        let file = fs::OpenOptions::new()
            .append(true)
            .open(&resolved)
            .map_err(|err| BuildError::io(err, &resolved))?;
        let target = match mtime {
            Some(mtime) => utils::epoch_to_system_time(mtime),
            None => std::time::SystemTime::now(),
        };
        file.set_modified(target).map_err(|err| BuildError::io(err, resolved))
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path);
        fs::create_dir_all(&resolved).map_err(|err| BuildError::io(err, resolved))
    }

    fn disk_path(&self, path: &str) -> Option<PathBuf> {
        Some(self.resolve(path))
    }
}
