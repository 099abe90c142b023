//! Derived per-artifact and per-action state.
//!
//! The [`StateMap`] lazily computes, for every artifact it is asked about,
//! whether the stored file is up to date with respect to its producing
//! action's inputs, and, for every action, whether its full input/output
//! enumeration is known and all inputs are clean ("ready"). Enumeration can
//! be incomplete while content-dependent inputs are still dirty, so readiness
//! is re-evaluated every time a blocker finishes until the blocking set
//! drains; the scheduler drives that fixed point through the `blocked`
//! back-edges recorded here.

use crate::{
    command::ArtifactEnumerator,
    error::{BuildError, Result},
    fs::{Directory, MISSING_MTIME},
    graph::{ActionId, ArtifactId, Graph, TestId},
    utils,
};
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

/// Disk filesystems commonly round mtimes to whole seconds while virtual
/// files keep sub-second precision, so the output side of every comparison
/// gets one second of grace.
const TIMESTAMP_GRACE: f64 = 1.0;

/// Snapshot state of one artifact, fixed at first reference.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArtifactState {
    /// Modification time in epoch seconds, [`MISSING_MTIME`] if absent.
    pub timestamp: f64,
    /// Whether the artifact must be (re)built before consumers may read it.
    pub is_dirty: bool,
}

/// Scheduling state of one action.
#[derive(Debug, Default)]
pub struct ActionState {
    /// The scheduler has committed to running this action this build.
    pub is_pending: bool,
    /// The full input set is known and every input is clean. Monotonic:
    /// once ready, never re-evaluated.
    pub is_ready: bool,
    pub inputs: Vec<ArtifactId>,
    /// Extra-tree dependencies by OS path (system headers, libraries).
    pub disk_inputs: Vec<String>,
    pub outputs: Vec<ArtifactId>,
    /// Actions that must finish before this one can become ready.
    pub blocking: HashSet<ActionId>,
    /// Reverse edges: actions that discovered a dependency on this one.
    pub blocked: HashSet<ActionId>,
    /// Present iff this action produces a test's result artifact.
    pub test: Option<TestId>,
}

/// Result of a readiness evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    AlreadyReady,
    NewlyReady,
    Blocked,
}

/// Lazily populated map from graph entities to their derived state.
#[derive(Debug)]
pub struct StateMap {
    dir: Arc<dyn Directory>,
    artifacts: HashMap<ArtifactId, ArtifactState>,
    actions: HashMap<ActionId, ActionState>,
    visiting: HashSet<ArtifactId>,
}

impl StateMap {
    pub fn new(dir: Arc<dyn Directory>) -> Self {
        Self {
            dir,
            artifacts: HashMap::new(),
            actions: HashMap::new(),
            visiting: HashSet::new(),
        }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.dir
    }

    pub fn action_state(&self, action: ActionId) -> &ActionState {
        &self.actions[&action]
    }

    pub fn action_state_mut(&mut self, action: ActionId) -> &mut ActionState {
        self.actions.get_mut(&action).expect("action state not yet created")
    }

    /// State of `artifact`, computing it (and everything upstream it depends
    /// on) on first reference.
    pub fn artifact_state(&mut self, graph: &Graph, artifact: ArtifactId) -> Result<ArtifactState> {
        if let Some(state) = self.artifacts.get(&artifact) {
            return Ok(*state);
        }
        if !self.visiting.insert(artifact) {
            return Err(BuildError::definition(format!(
                "dependency cycle involving \"{}\"",
                graph.artifact(artifact).filename
            )));
        }
        let computed = self.compute_artifact_state(graph, artifact);
        self.visiting.remove(&artifact);
        let state = computed?;
        trace!(
            filename = %graph.artifact(artifact).filename,
            timestamp = state.timestamp,
            dirty = state.is_dirty,
            "resolved artifact state"
        );
        self.artifacts.insert(artifact, state);
        Ok(state)
    }

    fn compute_artifact_state(
        &mut self,
        graph: &Graph,
        artifact: ArtifactId,
    ) -> Result<ArtifactState> {
        let entry = graph.artifact(artifact);
        let filename = entry.filename.clone();
        let producer = entry.action;

        let timestamp = match self.dir.mtime(&filename) {
            Ok(Some(timestamp)) => timestamp,
            Ok(None) => {
                return match producer {
                    // Derived artifact that simply hasn't been built yet.
                    Some(_) => Ok(ArtifactState { timestamp: MISSING_MTIME, is_dirty: true }),
                    None => Err(BuildError::definition(format!(
                        "The required source file \"{filename}\" does not exist."
                    ))),
                };
            }
            Err(err) => {
                return match producer {
                    Some(_) => Ok(ArtifactState { timestamp: MISSING_MTIME, is_dirty: true }),
                    None => Err(BuildError::definition(format!(
                        "The required source file \"{filename}\" is not accessible: {err}"
                    ))),
                };
            }
        };

        let Some(action) = producer else {
            // Source file, present: always clean.
            return Ok(ArtifactState { timestamp, is_dirty: false });
        };

        self.ensure_action(graph, action)?;
        let action_state = &self.actions[&action];
        if !action_state.is_ready {
            return Ok(ArtifactState { timestamp, is_dirty: true });
        }
        if !action_state.outputs.contains(&artifact) {
            // The producing command, as currently enumerated, will not write
            // this file (e.g. the unchosen branch of a conditional).
            return Ok(ArtifactState { timestamp, is_dirty: true });
        }

        let inputs = action_state.inputs.clone();
        let disk_inputs = action_state.disk_inputs.clone();

        let mut is_dirty = false;
        for input in inputs {
            let input_state = self.artifact_state(graph, input)?;
            if input_state.is_dirty || timestamp + TIMESTAMP_GRACE < input_state.timestamp {
                is_dirty = true;
                break;
            }
        }
        if !is_dirty {
            for disk_input in &disk_inputs {
                match utils::disk_mtime(Path::new(disk_input)) {
                    Some(mtime) if timestamp + TIMESTAMP_GRACE >= mtime => {}
                    _ => {
                        is_dirty = true;
                        break;
                    }
                }
            }
        }
        if !is_dirty && timestamp < graph.rule(graph.action(action).rule).timestamp {
            // The build description is newer than the output.
            is_dirty = true;
        }

        Ok(ArtifactState { timestamp, is_dirty })
    }

    /// Marks an output clean after its producing action succeeded. Within a
    /// build this flip is one-way.
    pub fn mark_clean(&mut self, graph: &Graph, artifact: ArtifactId) {
        let timestamp = self
            .dir
            .mtime(&graph.artifact(artifact).filename)
            .ok()
            .flatten()
            .unwrap_or_else(utils::now);
        self.artifacts.insert(artifact, ArtifactState { timestamp, is_dirty: false });
    }

    /// Creates the action's state on first reference, running an initial
    /// readiness evaluation.
    pub fn ensure_action(&mut self, graph: &Graph, action: ActionId) -> Result<()> {
        if self.actions.contains_key(&action) {
            return Ok(());
        }
        self.actions.insert(action, ActionState::default());
        self.update_readiness(graph, action)?;
        Ok(())
    }

    /// Re-enumerates the action's command and recomputes its blocking set.
    ///
    /// Readiness is monotonic; once an action reports ready its input,
    /// disk-input and output lists are final. While blocked, each newly
    /// discovered blocker gains a `blocked` back-edge to this action so the
    /// scheduler knows to come back here.
    pub fn update_readiness(&mut self, graph: &Graph, action: ActionId) -> Result<Readiness> {
        self.actions.entry(action).or_default();
        if self.actions[&action].is_ready {
            return Ok(Readiness::AlreadyReady);
        }

        let command = graph.action(action).command.as_ref().ok_or_else(|| {
            BuildError::definition(format!(
                "action \"{}\" has no command",
                graph.action_name(action)
            ))
        })?;

        let mut enumerator = StateEnumerator {
            map: &mut *self,
            graph,
            inputs: Vec::new(),
            outputs: Vec::new(),
            disk_inputs: Vec::new(),
            input_seen: HashSet::new(),
            output_seen: HashSet::new(),
            error: None,
        };
        command.enumerate_artifacts(graph, action, &mut enumerator);
        let StateEnumerator { inputs, outputs, mut disk_inputs, error, .. } = enumerator;
        if let Some(err) = error {
            return Err(err);
        }
        disk_inputs.sort_unstable();
        disk_inputs.dedup();

        let mut blocking = HashSet::new();
        for &input in &inputs {
            let input_state = self.artifact_state(graph, input)?;
            if !input_state.is_dirty {
                continue;
            }
            // Dirty implies derived: a present source is never dirty and a
            // missing one raised a definition error above.
            let producer = graph.artifact(input).action.ok_or_else(|| {
                BuildError::definition(format!(
                    "source file \"{}\" unexpectedly out of date",
                    graph.artifact(input).filename
                ))
            })?;
            self.ensure_action(graph, producer)?;
            let producer_state = &self.actions[&producer];
            if producer_state.is_ready && !producer_state.outputs.contains(&input) {
                return Err(BuildError::definition(format!(
                    "\"{}\" is needed by \"{}\", but \"{}\" did not generate it",
                    graph.artifact(input).filename,
                    graph.action_name(action),
                    graph.action_name(producer)
                )));
            }
            blocking.insert(producer);
        }

        for &blocker in &blocking {
            self.actions.get_mut(&blocker).expect("blocker state exists").blocked.insert(action);
        }

        let state = self.actions.get_mut(&action).expect("state inserted above");
        state.inputs = inputs;
        state.disk_inputs = disk_inputs;
        state.outputs = outputs;
        state.blocking = blocking;
        if state.blocking.is_empty() {
            state.is_ready = true;
            trace!(action = %graph.action_name(action), "action ready");
            Ok(Readiness::NewlyReady)
        } else {
            trace!(
                action = %graph.action_name(action),
                blockers = state.blocking.len(),
                "action blocked"
            );
            Ok(Readiness::Blocked)
        }
    }
}

/// Enumerator that resolves `read` through the state map: only clean
/// artifacts are readable, everything read becomes an input.
struct StateEnumerator<'a> {
    map: &'a mut StateMap,
    graph: &'a Graph,
    inputs: Vec<ArtifactId>,
    outputs: Vec<ArtifactId>,
    disk_inputs: Vec<String>,
    input_seen: HashSet<ArtifactId>,
    output_seen: HashSet<ArtifactId>,
    error: Option<BuildError>,
}

impl ArtifactEnumerator for StateEnumerator<'_> {
    fn add_input(&mut self, artifact: ArtifactId) {
        if self.input_seen.insert(artifact) {
            self.inputs.push(artifact);
        }
    }

    fn add_output(&mut self, artifact: ArtifactId) {
        if self.output_seen.insert(artifact) {
            self.outputs.push(artifact);
        }
    }

    fn add_disk_input(&mut self, path: &str) {
        self.disk_inputs.push(path.to_string());
    }

    fn read(&mut self, artifact: ArtifactId) -> Option<Vec<u8>> {
        self.add_input(artifact);
        if self.error.is_some() {
            return None;
        }
        match self.map.artifact_state(self.graph, artifact) {
            Ok(state) if !state.is_dirty => {
                self.map.dir.read(&self.graph.artifact(artifact).filename).ok()
            }
            Ok(_) => None,
            Err(err) => {
                self.error = Some(err);
                None
            }
        }
    }

    fn getenv(&mut self, var: &str) -> Option<String> {
        std::env::var(var).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{Arg, Command},
        fs::VirtualDirectory,
        graph::RuleId,
    };

    struct Fixture {
        graph: Graph,
        dir: Arc<VirtualDirectory>,
        rule: RuleId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut graph = Graph::new();
            let rule = graph.add_rule("pkg.build:lib", 0.0);
            Self { graph, dir: Arc::new(VirtualDirectory::new()), rule }
        }

        fn map(&self) -> StateMap {
            StateMap::new(self.dir.clone())
        }

        /// An action consuming `inputs` and producing `outputs` through a
        /// plain subprocess command.
        fn tool_action(
            &mut self,
            inputs: &[ArtifactId],
            output_names: &[&str],
        ) -> (ActionId, Vec<ArtifactId>) {
            let action = self.graph.new_action(self.rule, "build", None);
            let outputs: Vec<ArtifactId> = output_names
                .iter()
                .map(|name| {
                    self.graph.create_artifact(format!("tmp/{name}"), Some(action)).unwrap()
                })
                .collect();
            let mut args = vec![Arg::lit("tool")];
            args.extend(inputs.iter().map(|a| Arg::File(*a)));
            args.extend(outputs.iter().map(|a| Arg::File(*a)));
            self.graph.set_command(
                action,
                Command::Subprocess {
                    args,
                    implicit: vec![],
                    capture_stdout: None,
                    capture_stderr: None,
                    capture_exit_status: None,
                },
            );
            (action, outputs)
        }

        fn source(&mut self, name: &str, mtime: f64) -> ArtifactId {
            self.dir.add(&format!("src/{name}"), mtime, "");
            self.graph.create_artifact(format!("src/{name}"), None).unwrap()
        }
    }

    #[test]
    fn missing_source_is_a_definition_error() {
        let mut fx = Fixture::new();
        let missing = fx.graph.create_artifact("src/missing.c".into(), None).unwrap();
        let mut map = fx.map();
        let err = map.artifact_state(&fx.graph, missing).unwrap_err();
        assert!(matches!(err, BuildError::Definition(_)));
    }

    #[test]
    fn output_dirty_states_follow_input_mtimes() {
        let mut fx = Fixture::new();
        let input = fx.source("input", 2.0);
        let (_, outputs) = fx.tool_action(&[input], &["output"]);
        let output = outputs[0];

        // Absent output: dirty.
        let mut map = fx.map();
        let state = map.artifact_state(&fx.graph, output).unwrap();
        assert!(state.is_dirty);
        assert_eq!(state.timestamp, MISSING_MTIME);

        // Output older than the input beyond the grace window: dirty.
        fx.dir.add("tmp/output", 0.5, "");
        let mut map = fx.map();
        assert!(map.artifact_state(&fx.graph, output).unwrap().is_dirty);

        // Newer than the input: clean.
        fx.dir.add("tmp/output", 4.0, "");
        let mut map = fx.map();
        assert!(!map.artifact_state(&fx.graph, output).unwrap().is_dirty);
    }

    #[test]
    fn grace_window_tolerates_rounded_mtimes() {
        let mut fx = Fixture::new();
        let input = fx.source("input", 3.0);
        let (_, outputs) = fx.tool_action(&[input], &["output"]);
        let output = outputs[0];

        // 2.5 + 1s grace covers an input written at 3.0.
        fx.dir.add("tmp/output", 2.5, "");
        let mut map = fx.map();
        assert!(!map.artifact_state(&fx.graph, output).unwrap().is_dirty);

        fx.dir.add("tmp/output", 1.5, "");
        let mut map = fx.map();
        assert!(map.artifact_state(&fx.graph, output).unwrap().is_dirty);
    }

    #[test]
    fn newer_build_description_invalidates_outputs() {
        let mut fx = Fixture::new();
        let input = fx.source("input", 2.0);
        let (_, outputs) = fx.tool_action(&[input], &["output"]);
        let output = outputs[0];
        fx.dir.add("tmp/output", 4.0, "");

        let mut map = fx.map();
        assert!(!map.artifact_state(&fx.graph, output).unwrap().is_dirty);

        // Same world, younger build description.
        fx.graph.set_rule_timestamp(fx.rule, 6.0);
        let mut map = fx.map();
        assert!(map.artifact_state(&fx.graph, output).unwrap().is_dirty);
    }

    #[test]
    fn dirty_inputs_propagate() {
        let mut fx = Fixture::new();
        let input = fx.source("input", 2.0);
        let (_, mids) = fx.tool_action(&[input], &["mid"]);
        let (_, outs) = fx.tool_action(&[mids[0]], &["out"]);

        // mid missing, out present: out is dirty purely because mid is.
        fx.dir.add("tmp/out", 10.0, "");
        let mut map = fx.map();
        assert!(map.artifact_state(&fx.graph, outs[0]).unwrap().is_dirty);
    }

    #[test]
    fn readiness_tracks_blockers() {
        let mut fx = Fixture::new();
        let input = fx.source("input", 2.0);
        let (upstream, mids) = fx.tool_action(&[input], &["mid"]);
        let (downstream, _) = fx.tool_action(&[mids[0]], &["out"]);

        let mut map = fx.map();
        map.ensure_action(&fx.graph, downstream).unwrap();
        assert!(!map.action_state(downstream).is_ready);
        assert!(map.action_state(downstream).blocking.contains(&upstream));
        assert!(map.action_state(upstream).blocked.contains(&downstream));
        assert!(map.action_state(upstream).is_ready);

        // Once mid exists and is clean, the dependent becomes ready.
        fx.dir.add("tmp/mid", 3.0, "");
        let mut map = fx.map();
        map.ensure_action(&fx.graph, downstream).unwrap();
        assert!(map.action_state(downstream).is_ready);
        assert_eq!(map.action_state(downstream).inputs, vec![mids[0]]);
    }

    #[test]
    fn ready_producer_must_actually_generate_the_input() {
        let mut fx = Fixture::new();
        // `claimed` is registered as produced by `producer`, but the echo
        // command only writes `real`.
        let producer = fx.graph.new_action(fx.rule, "build", None);
        let real = fx.graph.create_artifact("tmp/real".into(), Some(producer)).unwrap();
        let claimed = fx.graph.create_artifact("tmp/claimed".into(), Some(producer)).unwrap();
        fx.graph.set_command(producer, Command::Echo { content: b"x".to_vec(), output: real });

        let (consumer, _) = fx.tool_action(&[claimed], &["out"]);
        let mut map = fx.map();
        let err = map.ensure_action(&fx.graph, consumer).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("did not generate"), "{message}");
    }

    #[test]
    fn mark_clean_flips_dirty_off() {
        let mut fx = Fixture::new();
        let input = fx.source("input", 2.0);
        let (_, outputs) = fx.tool_action(&[input], &["output"]);
        let output = outputs[0];

        let mut map = fx.map();
        assert!(map.artifact_state(&fx.graph, output).unwrap().is_dirty);
        fx.dir.add("tmp/output", 5.0, "");
        map.mark_clean(&fx.graph, output);
        assert!(!map.artifact_state(&fx.graph, output).unwrap().is_dirty);
    }
}
