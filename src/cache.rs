//! The content-hash action cache.
//!
//! Mtime analysis answers "might this have changed"; the cache answers "did
//! it actually change". [`CachingRunner`] wraps any [`ActionRunner`] and
//! skips an action when an MD5 digest over its input contents, disk-input
//! contents, output names and command definition matches the digest recorded
//! for every output by a previous successful run — in which case the outputs
//! merely get their mtimes bumped so downstream mtime comparisons see them as
//! fresh. Collision resistance is a correctness nicety here, not a security
//! boundary, so a fast digest is the right tool.

use crate::{
    error::Result,
    fs::Directory,
    graph::Graph,
    report::{ConsoleReporter, Reporter},
    runner::{ActionRequest, ActionRunner},
};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{atomic::AtomicBool, Arc, Mutex},
};

/// Format marker for the persisted cache blob.
pub const CACHE_FORMAT_VERSION: &str = "quarry-action-cache-1";

/// Map from output filename to the digest of the run that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCache {
    #[serde(rename = "_format")]
    format: String,
    pub entries: BTreeMap<String, String>,
}

impl Default for ActionCache {
    fn default() -> Self {
        Self { format: CACHE_FORMAT_VERSION.to_string(), entries: BTreeMap::new() }
    }
}

impl ActionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this blob was written by a compatible version. The caller
    /// should fall back to an empty cache otherwise.
    pub fn is_current_format(&self) -> bool {
        self.format == CACHE_FORMAT_VERSION
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decorator around an [`ActionRunner`] implementing the skip cache.
#[derive(Debug)]
pub struct CachingRunner<R> {
    inner: R,
    dir: Arc<dyn Directory>,
    cache: Mutex<ActionCache>,
    reporter: Arc<dyn Reporter>,
}

impl<R: ActionRunner> CachingRunner<R> {
    pub fn new(inner: R, dir: Arc<dyn Directory>, cache: ActionCache) -> Self {
        Self::with_reporter(inner, dir, cache, Arc::new(ConsoleReporter::new()))
    }

    pub fn with_reporter(
        inner: R,
        dir: Arc<dyn Directory>,
        cache: ActionCache,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self { inner, dir, cache: Mutex::new(cache), reporter }
    }

    /// The wrapped runner.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Copies the cache out for persistence.
    pub fn cache_snapshot(&self) -> ActionCache {
        self.cache.lock().unwrap().clone()
    }

    pub fn into_cache(self) -> ActionCache {
        self.cache.into_inner().unwrap()
    }

    /// Digest of the action's current world: ordered inputs (name +
    /// contents), ordered disk inputs (name + contents), ordered output
    /// names, and the command's own canonical hash. `None` when some piece
    /// cannot be read — then the action can neither be skipped nor recorded.
    fn compute_digest(&self, graph: &Graph, request: &ActionRequest) -> Option<String> {
        let mut hasher = Md5::new();

        let mut inputs: Vec<&str> = request
            .inputs
            .iter()
            .map(|artifact| graph.artifact(*artifact).filename.as_str())
            .collect();
        inputs.sort_unstable();
        for filename in inputs {
            let content = match self.dir.read(filename) {
                Ok(content) => content,
                Err(err) => {
                    trace!(filename, %err, "input unreadable, not caching");
                    return None;
                }
            };
            hasher.update(b"i");
            put_str(&mut hasher, filename);
            put_bytes(&mut hasher, &content);
        }

        let mut disk_inputs: Vec<&str> =
            request.disk_inputs.iter().map(String::as_str).collect();
        disk_inputs.sort_unstable();
        for path in disk_inputs {
            let content = match std::fs::read(path) {
                Ok(content) => content,
                Err(err) => {
                    trace!(path, %err, "disk input unreadable, not caching");
                    return None;
                }
            };
            hasher.update(b"d");
            put_str(&mut hasher, path);
            put_bytes(&mut hasher, &content);
        }

        let mut outputs: Vec<&str> = request
            .outputs
            .iter()
            .map(|artifact| graph.artifact(*artifact).filename.as_str())
            .collect();
        outputs.sort_unstable();
        for filename in outputs {
            hasher.update(b"o");
            put_str(&mut hasher, filename);
        }

        graph
            .action(request.action)
            .command
            .as_ref()?
            .hash(graph, request.action, &mut hasher);
        Some(hex::encode(hasher.finalize()))
    }

    /// The skip test: every output must carry the same recorded digest, that
    /// digest must equal the fresh one, every disk input and every output
    /// must still exist. Actions without outputs never skip.
    fn can_skip(&self, graph: &Graph, request: &ActionRequest, digest: &str) -> bool {
        if request.outputs.is_empty() {
            return false;
        }
        {
            let cache = self.cache.lock().unwrap();
            for &output in &request.outputs {
                let filename = &graph.artifact(output).filename;
                match cache.entries.get(filename) {
                    Some(recorded) if recorded == digest => {}
                    _ => return false,
                }
            }
        }
        for path in &request.disk_inputs {
            if !Path::new(path).exists() {
                return false;
            }
        }
        request
            .outputs
            .iter()
            .all(|&output| self.dir.exists(&graph.artifact(output).filename))
    }
}

impl<R: ActionRunner> ActionRunner for CachingRunner<R> {
    fn run(&self, graph: &Graph, request: &ActionRequest, cancel: &AtomicBool) -> Result<bool> {
        let digest = self.compute_digest(graph, request);

        if let Some(digest) = &digest {
            if self.can_skip(graph, request, digest) {
                // Bump mtimes so the scheduler's dirtiness analysis sees the
                // outputs as freshly built.
                for &output in &request.outputs {
                    self.dir.touch(&graph.artifact(output).filename, None)?;
                }
                let action = graph.action(request.action);
                trace!(action = %graph.action_name(request.action), "skipping unchanged action");
                self.reporter.no_changes(&action.verb, graph.action_name(request.action));
                return Ok(true);
            }
        }

        let ok = self.inner.run(graph, request, cancel)?;

        let mut cache = self.cache.lock().unwrap();
        match (&digest, ok) {
            (Some(digest), true) => {
                for &output in &request.outputs {
                    cache
                        .entries
                        .insert(graph.artifact(output).filename.clone(), digest.clone());
                }
            }
            _ => {
                // Failed runs (or unreadable worlds) must not be reused.
                for &output in &request.outputs {
                    cache.entries.remove(&graph.artifact(output).filename);
                }
            }
        }
        Ok(ok)
    }
}

fn put_bytes(hasher: &mut Md5, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn put_str(hasher: &mut Md5, s: &str) {
    put_bytes(hasher, s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{Command, EnvDefault},
        fs::VirtualDirectory,
        graph::{ActionId, ArtifactId},
        report::NullReporter,
        runner::ActionRequest,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts how many times the wrapped runner actually executed.
    #[derive(Debug)]
    struct CountingRunner {
        runs: AtomicUsize,
        succeed: bool,
    }

    impl ActionRunner for CountingRunner {
        fn run(
            &self,
            _graph: &Graph,
            _request: &ActionRequest,
            _cancel: &AtomicBool,
        ) -> Result<bool> {
            self.runs.fetch_add(1, Ordering::Relaxed);
            Ok(self.succeed)
        }
    }

    struct Fixture {
        graph: Graph,
        dir: Arc<VirtualDirectory>,
        action: ActionId,
        input: ArtifactId,
        output: ArtifactId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut graph = Graph::new();
            let rule = graph.add_rule("pkg.build:copy", 0.0);
            let action = graph.new_action(rule, "copy", None);
            let input = graph.create_artifact("src/pkg/in".into(), None).unwrap();
            let output = graph.create_artifact("tmp/pkg/out".into(), Some(action)).unwrap();
            graph.set_command(
                action,
                Command::EnvLookup {
                    var: "QUARRY_CACHE_TEST_UNSET".into(),
                    output,
                    default: Some(EnvDefault::Artifact(input)),
                    set_status: false,
                },
            );
            let dir = Arc::new(VirtualDirectory::new());
            dir.add("src/pkg/in", 2.0, "payload");
            Self { graph, dir, action, input, output }
        }

        fn request(&self) -> ActionRequest {
            ActionRequest {
                action: self.action,
                inputs: vec![self.input],
                disk_inputs: vec![],
                outputs: vec![self.output],
                test: None,
            }
        }

        fn runner(&self, cache: ActionCache, succeed: bool) -> CachingRunner<CountingRunner> {
            CachingRunner::with_reporter(
                CountingRunner { runs: AtomicUsize::new(0), succeed },
                self.dir.clone(),
                cache,
                Arc::new(NullReporter),
            )
        }
    }

    #[test]
    fn first_run_executes_and_records() {
        let fx = Fixture::new();
        fx.dir.add("tmp/pkg/out", 3.0, "payload");
        let runner = fx.runner(ActionCache::new(), true);
        let cancel = AtomicBool::new(false);

        assert!(runner.run(&fx.graph, &fx.request(), &cancel).unwrap());
        assert_eq!(runner.inner.runs.load(Ordering::Relaxed), 1);
        let cache = runner.into_cache();
        assert_eq!(cache.len(), 1);
        assert!(cache.entries.contains_key("tmp/pkg/out"));
    }

    #[test]
    fn identical_world_skips_and_touches() {
        let fx = Fixture::new();
        fx.dir.add("tmp/pkg/out", 3.0, "payload");
        let cancel = AtomicBool::new(false);

        let runner = fx.runner(ActionCache::new(), true);
        runner.run(&fx.graph, &fx.request(), &cancel).unwrap();
        let cache = runner.into_cache();

        // Input touched, contents identical: mtime analysis would rebuild,
        // the cache proves nothing changed.
        fx.dir.touch("src/pkg/in", Some(50.0)).unwrap();
        let runner = fx.runner(cache, true);
        let before = crate::utils::now();
        assert!(runner.run(&fx.graph, &fx.request(), &cancel).unwrap());
        assert_eq!(runner.inner.runs.load(Ordering::Relaxed), 0);
        let touched = fx.dir.mtime("tmp/pkg/out").unwrap().unwrap();
        assert!(touched >= before - 1.0);
    }

    #[test]
    fn changed_input_contents_run_again() {
        let fx = Fixture::new();
        fx.dir.add("tmp/pkg/out", 3.0, "payload");
        let cancel = AtomicBool::new(false);

        let runner = fx.runner(ActionCache::new(), true);
        runner.run(&fx.graph, &fx.request(), &cancel).unwrap();
        let cache = runner.into_cache();

        fx.dir.add("src/pkg/in", 60.0, "different");
        let runner = fx.runner(cache, true);
        assert!(runner.run(&fx.graph, &fx.request(), &cancel).unwrap());
        assert_eq!(runner.inner.runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn missing_output_is_never_skipped() {
        let fx = Fixture::new();
        fx.dir.add("tmp/pkg/out", 3.0, "payload");
        let cancel = AtomicBool::new(false);

        let runner = fx.runner(ActionCache::new(), true);
        runner.run(&fx.graph, &fx.request(), &cancel).unwrap();
        let cache = runner.into_cache();

        // Same digests recorded, but the output does not exist in this
        // otherwise identical world.
        let fx2 = Fixture::new();
        let runner = fx2.runner(cache, true);
        assert!(runner.run(&fx2.graph, &fx2.request(), &cancel).unwrap());
        assert_eq!(runner.inner.runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failure_evicts_cache_entries() {
        let fx = Fixture::new();
        fx.dir.add("tmp/pkg/out", 3.0, "payload");
        let cancel = AtomicBool::new(false);

        let runner = fx.runner(ActionCache::new(), true);
        runner.run(&fx.graph, &fx.request(), &cancel).unwrap();
        let cache = runner.into_cache();
        assert_eq!(cache.len(), 1);

        fx.dir.add("src/pkg/in", 60.0, "changed");
        let runner = fx.runner(cache, false);
        assert!(!runner.run(&fx.graph, &fx.request(), &cancel).unwrap());
        assert!(runner.into_cache().is_empty());
    }

    #[test]
    fn disk_inputs_guard_the_skip() {
        let fx = Fixture::new();
        fx.dir.add("tmp/pkg/out", 3.0, "payload");
        let cancel = AtomicBool::new(false);

        let tmp = tempfile::tempdir().unwrap();
        let extra = tmp.path().join("libdep.a");
        std::fs::write(&extra, "dep bytes").unwrap();
        let mut request = fx.request();
        request.disk_inputs = vec![extra.to_string_lossy().into_owned()];

        let runner = fx.runner(ActionCache::new(), true);
        runner.run(&fx.graph, &request, &cancel).unwrap();
        let cache = runner.into_cache();

        // Unchanged disk input: skips.
        let runner = fx.runner(cache, true);
        assert!(runner.run(&fx.graph, &request, &cancel).unwrap());
        assert_eq!(runner.inner.runs.load(Ordering::Relaxed), 0);
        let cache = runner.into_cache();

        // Changed contents: runs.
        std::fs::write(&extra, "new dep bytes").unwrap();
        let runner = fx.runner(cache, true);
        assert!(runner.run(&fx.graph, &request, &cancel).unwrap());
        assert_eq!(runner.inner.runs.load(Ordering::Relaxed), 1);
        let cache = runner.into_cache();

        // Missing disk input: digest unavailable, never skipped.
        std::fs::remove_file(&extra).unwrap();
        let runner = fx.runner(cache, true);
        assert!(runner.run(&fx.graph, &request, &cancel).unwrap());
        assert_eq!(runner.inner.runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn actions_without_outputs_never_skip() {
        let mut fx = Fixture::new();
        fx.dir.add("tmp/pkg/out", 3.0, "payload");
        let cancel = AtomicBool::new(false);

        // Strip the outputs from the request: even with a stable digest the
        // runner must execute.
        fx.graph.set_command(
            fx.action,
            Command::EnvLookup {
                var: "QUARRY_CACHE_TEST_UNSET".into(),
                output: fx.output,
                default: Some(EnvDefault::Artifact(fx.input)),
                set_status: false,
            },
        );
        let mut request = fx.request();
        request.outputs.clear();

        let runner = fx.runner(ActionCache::new(), true);
        runner.run(&fx.graph, &request, &cancel).unwrap();
        runner.run(&fx.graph, &request, &cancel).unwrap();
        assert_eq!(runner.inner.runs.load(Ordering::Relaxed), 2);
    }
}
