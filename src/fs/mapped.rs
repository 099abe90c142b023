use super::{Directory, DirectorySnapshot, VirtualDirectory};
use crate::error::{BuildError, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{Arc, Mutex},
};

/// Synthesized view of the process environment as a file tree.
///
/// `env/NAME` holds the variable's current value (empty if unset) and
/// `env/set/NAME` holds `true` or `false` for presence. Files are refreshed
/// from the live environment on every access, but rewritten only when the
/// value actually changed, so dependent actions go dirty exactly when the
/// environment does. Variables locked through the configure mechanism keep
/// their stored value and are never refreshed.
#[derive(Debug, Default)]
pub struct EnvDirectory {
    dir: VirtualDirectory,
    locked: Mutex<BTreeSet<String>>,
}

impl EnvDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(snapshot: DirectorySnapshot, locked: BTreeSet<String>) -> Self {
        Self { dir: VirtualDirectory::from_snapshot(snapshot), locked: Mutex::new(locked) }
    }

    pub fn snapshot(&self) -> (DirectorySnapshot, BTreeSet<String>) {
        (self.dir.snapshot(), self.locked.lock().unwrap().clone())
    }

    /// Pins `var` to `value` (or to "unset" if `None`), shielding it from the
    /// live environment until [`EnvDirectory::unlock`].
    pub fn lock(&self, var: &str, value: Option<&str>) {
        self.store(var, value);
        self.locked.lock().unwrap().insert(var.to_string());
    }

    pub fn unlock(&self, var: &str) {
        self.locked.lock().unwrap().remove(var);
    }

    pub fn is_locked(&self, var: &str) -> bool {
        self.locked.lock().unwrap().contains(var)
    }

    fn store(&self, var: &str, value: Option<&str>) {
        self.dir
            .write_if_changed(&format!("env/{var}"), value.unwrap_or_default().as_bytes());
        self.dir.write_if_changed(
            &format!("env/set/{var}"),
            if value.is_some() { b"true" as &[u8] } else { b"false" },
        );
    }

    /// Refreshes the files backing `path` from the live environment.
    fn sync(&self, path: &str) {
        let Some(name) = path.strip_prefix("env/") else { return };
        let var = name.strip_prefix("set/").unwrap_or(name);
        if var.is_empty() || var.contains('/') || self.is_locked(var) {
            return;
        }
        let value = std::env::var(var).ok();
        self.store(var, value.as_deref());
    }
}

impl Directory for EnvDirectory {
    fn exists(&self, path: &str) -> bool {
        self.sync(path);
        self.dir.exists(path)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.dir.is_dir(path)
    }

    fn mtime(&self, path: &str) -> Result<Option<f64>> {
        self.sync(path);
        self.dir.mtime(path)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.sync(path);
        self.dir.read(path)
    }

    fn write(&self, path: &str, content: &[u8], mtime: Option<f64>) -> Result<()> {
        self.dir.write(path, content, mtime)
    }

    fn touch(&self, path: &str, mtime: Option<f64>) -> Result<()> {
        self.dir.touch(path, mtime)
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        self.dir.mkdir(path)
    }

    fn disk_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

/// The composite directory a build runs in.
///
/// Routes each logical path to a backing by its top-level prefix:
///
/// | prefix       | backing                                  |
/// |--------------|------------------------------------------|
/// | `src*`       | source tree (read-only)                  |
/// | `mem/…`      | persisted [`VirtualDirectory`]           |
/// | `env/…`      | synthesized [`EnvDirectory`]             |
/// | `alt/<c>/…`  | the sibling configuration named `<c>`    |
/// | anything else| output tree (`tmp/`, `bin/`, `lib/`, …)  |
#[derive(Debug)]
pub struct MappedDirectory {
    source: Arc<dyn Directory>,
    output: Arc<dyn Directory>,
    mem: Arc<VirtualDirectory>,
    env: Arc<EnvDirectory>,
    alts: BTreeMap<String, Arc<MappedDirectory>>,
    alt_paths: BTreeMap<String, String>,
}

impl MappedDirectory {
    pub fn new(source: Arc<dyn Directory>, output: Arc<dyn Directory>) -> Self {
        Self::with_state(
            source,
            output,
            Arc::new(VirtualDirectory::new()),
            Arc::new(EnvDirectory::new()),
        )
    }

    /// Builds a mapped directory around previously persisted mem/env state.
    pub fn with_state(
        source: Arc<dyn Directory>,
        output: Arc<dyn Directory>,
        mem: Arc<VirtualDirectory>,
        env: Arc<EnvDirectory>,
    ) -> Self {
        Self {
            source,
            output,
            mem,
            env,
            alts: BTreeMap::new(),
            alt_paths: BTreeMap::new(),
        }
    }

    /// Registers the root of a sibling configuration reachable under
    /// `alt/<name>/…`. `location` is recorded for persistence so the CLI can
    /// reconstruct the mapping table next run.
    pub fn add_alternate(&mut self, name: &str, location: &str, dir: Arc<MappedDirectory>) {
        self.alts.insert(name.to_string(), dir);
        self.alt_paths.insert(name.to_string(), location.to_string());
    }

    pub fn mem(&self) -> &Arc<VirtualDirectory> {
        &self.mem
    }

    pub fn env(&self) -> &Arc<EnvDirectory> {
        &self.env
    }

    pub fn alternate_paths(&self) -> &BTreeMap<String, String> {
        &self.alt_paths
    }

    fn route<'a>(&'a self, path: &'a str) -> Result<(&'a dyn Directory, &'a str)> {
        let first = path.split('/').next().unwrap_or("");
        if first.starts_with("src") {
            return Ok((&*self.source, path));
        }
        match first {
            "mem" => Ok((&*self.mem, path)),
            "env" => Ok((&*self.env, path)),
            "alt" => {
                let rest = &path[usize::min(path.len(), 4)..];
                let (config, inner) = rest.split_once('/').ok_or_else(|| {
                    BuildError::definition(format!(
                        "alternate-configuration path too short: \"{path}\""
                    ))
                })?;
                let alt = self.alts.get(config).ok_or_else(|| {
                    BuildError::definition(format!("unknown alternate configuration: \"{config}\""))
                })?;
                Ok((&**alt, inner))
            }
            _ => Ok((&*self.output, path)),
        }
    }

    fn check_writable(&self, path: &str) -> Result<()> {
        if path.split('/').next().unwrap_or("").starts_with("src") {
            return Err(BuildError::msg(format!("source tree is read-only: \"{path}\"")));
        }
        Ok(())
    }
}

impl Directory for MappedDirectory {
    fn exists(&self, path: &str) -> bool {
        self.route(path).map(|(dir, inner)| dir.exists(inner)).unwrap_or(false)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.route(path).map(|(dir, inner)| dir.is_dir(inner)).unwrap_or(false)
    }

    fn mtime(&self, path: &str) -> Result<Option<f64>> {
        let (dir, inner) = self.route(path)?;
        dir.mtime(inner)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let (dir, inner) = self.route(path)?;
        dir.read(inner)
    }

    fn write(&self, path: &str, content: &[u8], mtime: Option<f64>) -> Result<()> {
        self.check_writable(path)?;
        let (dir, inner) = self.route(path)?;
        dir.write(inner, content, mtime)
    }

    fn touch(&self, path: &str, mtime: Option<f64>) -> Result<()> {
        self.check_writable(path)?;
        let (dir, inner) = self.route(path)?;
        dir.touch(inner, mtime)
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        self.check_writable(path)?;
        let (dir, inner) = self.route(path)?;
        dir.mkdir(inner)
    }

    fn disk_path(&self, path: &str) -> Option<PathBuf> {
        let (dir, inner) = self.route(path).ok()?;
        dir.disk_path(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped() -> MappedDirectory {
        let source = Arc::new(VirtualDirectory::new());
        source.add("src/pkg/main.c", 2.0, "int main() {}\n");
        let output = Arc::new(VirtualDirectory::new());
        MappedDirectory::new(source, output)
    }

    #[test]
    fn routes_by_prefix() {
        let dir = mapped();
        assert!(dir.exists("src/pkg/main.c"));
        assert!(!dir.exists("tmp/pkg/main.o"));

        dir.write("tmp/pkg/main.o", b"obj", None).unwrap();
        dir.write("mem/pkg/flags", b"-O2", None).unwrap();
        assert!(dir.exists("tmp/pkg/main.o"));
        assert_eq!(dir.mem().read("mem/pkg/flags").unwrap(), b"-O2");
    }

    #[test]
    fn source_tree_is_read_only() {
        let dir = mapped();
        assert!(dir.write("src/pkg/main.c", b"nope", None).is_err());
        assert!(dir.touch("src/pkg/main.c", None).is_err());
    }

    #[test]
    fn synthesizes_env_files() {
        let dir = mapped();
        std::env::set_var("QUARRY_MAPPED_TEST_VAR", "zap");

        assert_eq!(dir.read("env/QUARRY_MAPPED_TEST_VAR").unwrap(), b"zap");
        assert_eq!(dir.read("env/set/QUARRY_MAPPED_TEST_VAR").unwrap(), b"true");
        let before = dir.mtime("env/QUARRY_MAPPED_TEST_VAR").unwrap().unwrap();

        // Unchanged value, unchanged mtime.
        assert_eq!(dir.mtime("env/QUARRY_MAPPED_TEST_VAR").unwrap(), Some(before));

        std::env::set_var("QUARRY_MAPPED_TEST_VAR", "zing");
        assert_eq!(dir.read("env/QUARRY_MAPPED_TEST_VAR").unwrap(), b"zing");
        assert!(dir.mtime("env/QUARRY_MAPPED_TEST_VAR").unwrap().unwrap() >= before);

        std::env::remove_var("QUARRY_MAPPED_TEST_VAR");
        assert_eq!(dir.read("env/QUARRY_MAPPED_TEST_VAR").unwrap(), b"");
        assert_eq!(dir.read("env/set/QUARRY_MAPPED_TEST_VAR").unwrap(), b"false");
    }

    #[test]
    fn locked_vars_ignore_the_environment() {
        let dir = mapped();
        dir.env().lock("QUARRY_MAPPED_LOCKED_VAR", Some("pinned"));
        std::env::set_var("QUARRY_MAPPED_LOCKED_VAR", "live");

        assert_eq!(dir.read("env/QUARRY_MAPPED_LOCKED_VAR").unwrap(), b"pinned");

        dir.env().unlock("QUARRY_MAPPED_LOCKED_VAR");
        assert_eq!(dir.read("env/QUARRY_MAPPED_LOCKED_VAR").unwrap(), b"live");
        std::env::remove_var("QUARRY_MAPPED_LOCKED_VAR");
    }

    #[test]
    fn alternates_resolve_to_sibling_roots() {
        let mut dir = mapped();
        let alt = Arc::new(mapped());
        alt.write("tmp/pkg/alt.o", b"alt-obj", None).unwrap();
        dir.add_alternate("dbg", "build/dbg", alt);

        assert_eq!(dir.read("alt/dbg/tmp/pkg/alt.o").unwrap(), b"alt-obj");
        assert!(dir.read("alt/opt/tmp/pkg/alt.o").is_err());
        assert_eq!(dir.alternate_paths().get("dbg").map(String::as_str), Some("build/dbg"));
    }
}
