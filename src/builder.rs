//! The scheduler.
//!
//! A [`Builder`] accepts rules, tests and individual artifacts, decides which
//! actions are pending via the [`StateMap`](crate::state::StateMap), and runs
//! them on a pool of worker threads. One mutex guards all scheduler state;
//! workers drop the guard for the duration of [`ActionRunner::run`] and
//! reacquire it to commit results, so filesystem-bound work never serializes
//! the pool. Newly-ready actions go to the *front* of the queue so locally
//! related work stays grouped: compiling library A, linking A, compiling B,
//! linking B, rather than compiling everything before linking anything.

use crate::{
    error::{BuildError, Result},
    graph::{ActionId, ArtifactId, Graph, RuleId, TestId},
    runner::{ActionRequest, ActionRunner},
    state::{Readiness, StateMap},
};
use std::{
    collections::VecDeque,
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};
use yansi::Paint;

/// Bound on the idle wait, so workers also notice cancellation flags set by
/// signal handlers that cannot notify the condvar.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// One registered test, remembered until the report is printed.
#[derive(Clone, Copy, Debug)]
struct TestRecord {
    test: TestId,
    /// The result artifact was already up to date when the test was added.
    cached: bool,
}

/// Outcome of one test after the build finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestOutcome {
    pub name: String,
    pub passed: bool,
    /// The result was reused from a previous run.
    pub cached: bool,
    /// Where the test's console output lives, for debugging failures.
    pub output_path: String,
}

/// Scheduler state guarded by the global mutex.
#[derive(Debug)]
struct Core {
    state: StateMap,
    /// Actions that are pending and ready but not yet started.
    queue: VecDeque<ActionId>,
    /// Pending actions not yet handed to a worker.
    num_pending: usize,
    /// Actions currently executing on some worker.
    running: usize,
    failed: Option<BuildError>,
}

impl Core {
    fn add_artifact(&mut self, graph: &Graph, artifact: ArtifactId) -> Result<()> {
        let state = self.state.artifact_state(graph, artifact)?;
        if !state.is_dirty {
            return Ok(());
        }
        // Dirty implies derived; sources are clean or a definition error.
        let action = graph.artifact(artifact).action.ok_or_else(|| {
            BuildError::definition(format!(
                "source file \"{}\" unexpectedly out of date",
                graph.artifact(artifact).filename
            ))
        })?;
        self.add_action(graph, action)
    }

    fn add_action(&mut self, graph: &Graph, action: ActionId) -> Result<()> {
        self.state.ensure_action(graph, action)?;
        if self.state.action_state(action).is_pending {
            return Ok(());
        }
        self.state.action_state_mut(action).is_pending = true;
        self.num_pending += 1;
        trace!(action = %graph.action_name(action), "action pending");

        if self.state.action_state(action).is_ready {
            self.queue.push_back(action);
        } else {
            let mut blockers: Vec<ActionId> =
                self.state.action_state(action).blocking.iter().copied().collect();
            blockers.sort_unstable();
            for blocker in blockers {
                self.add_action(graph, blocker)?;
            }
        }
        Ok(())
    }

    /// After `action` succeeded: outputs become clean, dependents re-evaluate
    /// readiness, and blockers revealed by now-complete enumerations are
    /// scheduled.
    fn commit_success(&mut self, graph: &Graph, action: ActionId) -> Result<()> {
        let outputs = self.state.action_state(action).outputs.clone();
        for output in outputs {
            self.state.mark_clean(graph, output);
        }

        let mut dependents: Vec<ActionId> =
            self.state.action_state(action).blocked.iter().copied().collect();
        dependents.sort_unstable();
        for dependent in dependents {
            let readiness = self.state.update_readiness(graph, dependent)?;
            if !self.state.action_state(dependent).is_pending {
                continue;
            }
            match readiness {
                Readiness::NewlyReady => self.queue.push_front(dependent),
                Readiness::Blocked => {
                    // The completed input revealed new requirements the
                    // earlier, incomplete enumeration could not see.
                    let mut blockers: Vec<ActionId> = self
                        .state
                        .action_state(dependent)
                        .blocking
                        .iter()
                        .copied()
                        .collect();
                    blockers.sort_unstable();
                    for blocker in blockers {
                        if !self.state.action_state(blocker).is_pending {
                            self.add_action(graph, blocker)?;
                        }
                    }
                }
                Readiness::AlreadyReady => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    core: Mutex<Core>,
    cond: Condvar,
    cancel: Arc<AtomicBool>,
}

/// The build scheduler. See the module docs.
#[derive(Debug)]
pub struct Builder {
    shared: Shared,
    tests: Vec<TestRecord>,
    jobs: usize,
}

impl Builder {
    pub fn new(dir: Arc<dyn crate::fs::Directory>) -> Self {
        Self {
            shared: Shared {
                core: Mutex::new(Core {
                    state: StateMap::new(dir),
                    queue: VecDeque::new(),
                    num_pending: 0,
                    running: 0,
                    failed: None,
                }),
                cond: Condvar::new(),
                cancel: Arc::new(AtomicBool::new(false)),
            },
            tests: Vec::new(),
            jobs: num_cpus::get(),
        }
    }

    /// Number of worker threads `build` will use (at least one).
    pub fn set_jobs(&mut self, jobs: usize) {
        self.jobs = jobs.max(1);
    }

    /// Flag observed by workers and in-flight subprocess waits; setting it
    /// (e.g. from a ctrl-c handler) cancels the build.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.shared.cancel.clone()
    }

    /// Registers `artifact` to be brought up to date.
    pub fn add_artifact(&mut self, graph: &Graph, artifact: ArtifactId) -> Result<()> {
        self.shared.core.lock().unwrap().add_artifact(graph, artifact)
    }

    /// Registers every output of `rule`.
    pub fn add_rule(&mut self, graph: &Graph, rule: RuleId) -> Result<()> {
        for output in graph.rule(rule).outputs.clone() {
            self.add_artifact(graph, output)?;
        }
        Ok(())
    }

    /// Registers a test: its result and output artifacts are scheduled, the
    /// producing action is tagged as a test action, and the test is recorded
    /// for the final report (noting whether the result was already cached).
    pub fn add_test(&mut self, graph: &Graph, test: TestId) -> Result<()> {
        let entry = graph.test(test);
        let result_artifact = entry.result_artifact;
        let output_artifact = entry.output_artifact;
        let producer = graph.artifact(result_artifact).action.ok_or_else(|| {
            BuildError::definition(format!(
                "test \"{}\": its result artifact must be generated by an action",
                graph.rule(entry.rule).name
            ))
        })?;

        let mut core = self.shared.core.lock().unwrap();
        core.add_artifact(graph, result_artifact)?;
        core.add_artifact(graph, output_artifact)?;
        let cached = !core.state.artifact_state(graph, result_artifact)?.is_dirty;
        core.state.ensure_action(graph, producer)?;
        core.state.action_state_mut(producer).test = Some(test);
        drop(core);

        self.tests.push(TestRecord { test, cached });
        Ok(())
    }

    /// Runs workers until nothing is pending or something failed. Returns
    /// the first failure; on cancellation that is [`BuildError::Interrupted`].
    pub fn build(&mut self, graph: &Graph, runner: &dyn ActionRunner) -> Result<()> {
        {
            let core = self.shared.core.lock().unwrap();
            if core.num_pending == 0 {
                debug!("nothing to build");
                return Ok(());
            }
        }

        let workers = self.jobs.max(1);
        debug!(workers, "starting build");
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| worker_loop(&self.shared, graph, runner));
            }
        });

        let failed = self.shared.core.lock().unwrap().failed.take();
        match failed {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Reads every registered test's result artifact. A result that is
    /// neither `true` nor `false` is a definition error.
    pub fn test_report(&self, graph: &Graph) -> Result<Vec<TestOutcome>> {
        let dir = self.shared.core.lock().unwrap().state.directory().clone();
        let mut outcomes = Vec::with_capacity(self.tests.len());
        for record in &self.tests {
            let test = graph.test(record.test);
            let name = graph.rule(test.rule).name.clone();
            let result_file = &graph.artifact(test.result_artifact).filename;
            let contents = dir.read(result_file).map_err(|_| {
                BuildError::definition(format!(
                    "test \"{name}\" did not produce its result artifact \"{result_file}\""
                ))
            })?;
            let passed = match contents.as_slice() {
                b"true" => true,
                b"false" => false,
                _ => {
                    return Err(BuildError::definition(format!(
                        "test result artifact \"{result_file}\" contained neither \"true\" nor \"false\""
                    )))
                }
            };
            outcomes.push(TestOutcome {
                name,
                passed,
                cached: record.cached,
                output_path: graph.artifact(test.output_artifact).filename.clone(),
            });
        }
        outcomes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(outcomes)
    }

    /// Renders the test table to `out` and returns whether everything passed.
    pub fn print_test_results(&self, graph: &Graph, out: &mut dyn Write) -> Result<bool> {
        let outcomes = self.test_report(graph)?;
        let mut all_passed = true;
        writeln!(out, "\nTest results:").map_err(|err| BuildError::msg(err))?;
        for outcome in &outcomes {
            let indicator = if outcome.passed {
                Paint::green("PASSED")
            } else {
                all_passed = false;
                Paint::red("FAILED")
            };
            let cached = if outcome.cached { " (cached)" } else { "" };
            writeln!(out, "  {:<70} {indicator}{cached}", outcome.name)
                .map_err(|err| BuildError::msg(err))?;
            if !outcome.passed {
                writeln!(out, "    {}", outcome.output_path).map_err(|err| BuildError::msg(err))?;
            }
        }
        Ok(all_passed)
    }
}

fn worker_loop(shared: &Shared, graph: &Graph, runner: &dyn ActionRunner) {
    let mut core = shared.core.lock().unwrap();
    loop {
        if shared.cancel.load(Ordering::Relaxed) && core.failed.is_none() {
            core.failed = Some(BuildError::Interrupted);
        }
        if core.failed.is_some() {
            break;
        }
        if core.num_pending == 0 && core.running == 0 {
            break;
        }

        let Some(action) = core.queue.pop_front() else {
            if core.running == 0 && core.num_pending > 0 {
                // Everything left is blocked on something that will never
                // complete; the graph is cyclic or unsatisfiable.
                core.failed = Some(BuildError::definition(
                    "actions remain pending but none can become ready",
                ));
                break;
            }
            core = shared.cond.wait_timeout(core, IDLE_WAIT).unwrap().0;
            continue;
        };

        core.num_pending -= 1;
        core.running += 1;
        let state = core.state.action_state(action);
        let request = ActionRequest {
            action,
            inputs: state.inputs.clone(),
            disk_inputs: state.disk_inputs.clone(),
            outputs: state.outputs.clone(),
            test: state.test,
        };
        drop(core);

        let result = runner.run(graph, &request, &shared.cancel);

        core = shared.core.lock().unwrap();
        core.running -= 1;
        match result {
            Ok(true) => {
                if let Err(err) = core.commit_success(graph, action) {
                    if core.failed.is_none() {
                        core.failed = Some(err);
                    }
                }
            }
            Ok(false) => {
                if core.failed.is_none() {
                    core.failed = Some(BuildError::CommandFailed {
                        verb: graph.action(action).verb.clone(),
                        name: graph.action_name(action).to_string(),
                    });
                }
            }
            Err(err) => {
                if err.is_interrupted() {
                    shared.cancel.store(true, Ordering::Relaxed);
                }
                if core.failed.is_none() {
                    core.failed = Some(err);
                }
            }
        }
        shared.cond.notify_all();
    }
    drop(core);
    shared.cond.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{Arg, Command},
        fs::VirtualDirectory,
        graph::RuleId,
    };
    use std::sync::Mutex as StdMutex;

    /// Runner that records what it was asked to run and always succeeds.
    #[derive(Debug, Default)]
    struct MockRunner {
        ran: StdMutex<Vec<ActionId>>,
    }

    impl ActionRunner for MockRunner {
        fn run(
            &self,
            _graph: &Graph,
            request: &ActionRequest,
            _cancel: &AtomicBool,
        ) -> Result<bool> {
            self.ran.lock().unwrap().push(request.action);
            Ok(true)
        }
    }

    /// Runner that fails a chosen action.
    #[derive(Debug)]
    struct FailingRunner {
        fail: ActionId,
    }

    impl ActionRunner for FailingRunner {
        fn run(
            &self,
            _graph: &Graph,
            request: &ActionRequest,
            _cancel: &AtomicBool,
        ) -> Result<bool> {
            Ok(request.action != self.fail)
        }
    }

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

        fn source(&mut self, name: &str, mtime: f64) -> ArtifactId {
            self.dir.add(name, mtime, "");
            self.graph.create_artifact(name.to_string(), None).unwrap()
        }

        fn tool_action(
            &mut self,
            inputs: &[ArtifactId],
            output_names: &[&str],
        ) -> (ActionId, Vec<ArtifactId>) {
            let action = self.graph.new_action(self.rule, "build", None);
            let outputs: Vec<ArtifactId> = output_names
                .iter()
                .map(|name| self.graph.create_artifact(name.to_string(), Some(action)).unwrap())
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

        /// Fresh builder + mock runner over the current world; returns the
        /// actions that executed.
        fn build(&self, artifacts: &[ArtifactId]) -> Vec<ActionId> {
            let mut builder = Builder::new(self.dir.clone());
            builder.set_jobs(1);
            for &artifact in artifacts {
                builder.add_artifact(&self.graph, artifact).unwrap();
            }
            let runner = MockRunner::default();
            builder.build(&self.graph, &runner).unwrap();
            runner.ran.into_inner().unwrap()
        }
    }

    #[test]
    fn missing_source_fails_registration() {
        let mut fx = Fixture::new();
        let missing = fx.graph.create_artifact("src/input".into(), None).unwrap();
        let mut builder = Builder::new(fx.dir.clone());
        assert!(builder.add_artifact(&fx.graph, missing).is_err());

        fx.dir.add("src/input", 2.0, "");
        let mut builder = Builder::new(fx.dir.clone());
        builder.add_artifact(&fx.graph, missing).unwrap();
    }

    #[test]
    fn simple_rebuild_scenarios() {
        let mut fx = Fixture::new();
        let input = fx.source("src/input", 2.0);
        let (action, outputs) = fx.tool_action(&[input], &["tmp/output"]);
        let output = outputs[0];

        // Output missing: runs.
        assert_eq!(fx.build(&[output]), vec![action]);

        // Output older than the input (beyond the grace window): runs.
        fx.dir.add("tmp/output", 0.5, "");
        assert_eq!(fx.build(&[output]), vec![action]);

        // Output newer: nothing to do.
        fx.dir.add("tmp/output", 4.0, "");
        assert_eq!(fx.build(&[output]), vec![]);
    }

    #[test]
    fn multiple_outputs_rebuild_together() {
        let mut fx = Fixture::new();
        let in1 = fx.source("src/in1", 2.0);
        let in2 = fx.source("src/in2", 4.0);
        let (action, outputs) = fx.tool_action(&[in1, in2], &["tmp/out1", "tmp/out2"]);
        let (out1, out2) = (outputs[0], outputs[1]);

        assert_eq!(fx.build(&[out1, out2]), vec![action]);

        // One output stale relative to the younger input: the action runs
        // when that output is requested, but not for the fresh one alone.
        fx.dir.add("tmp/out1", 6.0, "");
        fx.dir.add("tmp/out2", 2.5, "");
        assert_eq!(fx.build(&[out1, out2]), vec![action]);
        assert_eq!(fx.build(&[out1]), vec![]);

        fx.dir.add("tmp/out2", 6.0, "");
        assert_eq!(fx.build(&[out1, out2]), vec![]);
    }

    #[test]
    fn diamond_builds_only_the_stale_side() {
        let mut fx = Fixture::new();
        let input = fx.source("src/input", 2.0);
        let (a1, t1) = fx.tool_action(&[input], &["tmp/t1"]);
        let (a2, t2) = fx.tool_action(&[input], &["tmp/t2"]);
        let (a3, outs) = fx.tool_action(&[t1[0], t2[0]], &["tmp/output"]);
        let output = outs[0];

        // t1 fresh, t2 missing: only the t2 side and the join run.
        fx.dir.add("tmp/t1", 3.5, "");
        fx.dir.add("tmp/output", 4.0, "");
        let ran = fx.build(&[output]);
        assert_eq!(ran, vec![a2, a3]);

        // Everything fresh: nothing runs.
        fx.dir.add("tmp/t2", 3.5, "");
        fx.dir.add("tmp/output", 5.0, "");
        assert_eq!(fx.build(&[output]), vec![]);

        // Input touched: all three run, the join last.
        fx.dir.add("src/input", 7.0, "");
        let ran = fx.build(&[output]);
        assert_eq!(ran.len(), 3);
        assert_eq!(*ran.last().unwrap(), a3);
        assert!(ran.contains(&a1) && ran.contains(&a2));
    }

    #[test]
    fn chain_runs_in_dependency_order() {
        let mut fx = Fixture::new();
        let input = fx.source("src/input", 2.0);
        let (a1, t1) = fx.tool_action(&[input], &["tmp/t1"]);
        let (a2, outs) = fx.tool_action(&[t1[0]], &["tmp/output"]);

        assert_eq!(fx.build(&[outs[0]]), vec![a1, a2]);

        // t1 fresh but output stale: only the tail runs.
        fx.dir.add("tmp/t1", 3.0, "");
        assert_eq!(fx.build(&[outs[0]]), vec![a2]);
    }

    #[test]
    fn failure_stops_the_build() {
        let mut fx = Fixture::new();
        let input = fx.source("src/input", 2.0);
        let (a1, t1) = fx.tool_action(&[input], &["tmp/t1"]);
        let (_a2, outs) = fx.tool_action(&[t1[0]], &["tmp/output"]);

        let mut builder = Builder::new(fx.dir.clone());
        builder.set_jobs(1);
        builder.add_artifact(&fx.graph, outs[0]).unwrap();
        let runner = FailingRunner { fail: a1 };
        let err = builder.build(&fx.graph, &runner).unwrap_err();
        assert!(matches!(err, BuildError::CommandFailed { .. }));
    }

    #[test]
    fn parallel_build_completes() {
        let mut fx = Fixture::new();
        let input = fx.source("src/input", 2.0);
        let mut finals = Vec::new();
        for i in 0..8 {
            let (_, mid) = fx.tool_action(&[input], &[&format!("tmp/mid{i}")]);
            let (_, out) = fx.tool_action(&[mid[0]], &[&format!("tmp/out{i}")]);
            finals.push(out[0]);
        }

        let mut builder = Builder::new(fx.dir.clone());
        builder.set_jobs(4);
        for &artifact in &finals {
            builder.add_artifact(&fx.graph, artifact).unwrap();
        }
        let runner = MockRunner::default();
        builder.build(&fx.graph, &runner).unwrap();
        assert_eq!(runner.ran.into_inner().unwrap().len(), 16);
    }

    #[test]
    fn pending_actions_pop_at_most_once() {
        let mut fx = Fixture::new();
        let input = fx.source("src/input", 2.0);
        let (_, t1) = fx.tool_action(&[input], &["tmp/t1"]);
        let (_, t2) = fx.tool_action(&[input], &["tmp/t2"]);
        let (_, outs) = fx.tool_action(&[t1[0], t2[0]], &["tmp/output"]);

        // Requesting overlapping artifacts must not double-schedule.
        let ran = fx.build(&[outs[0], t1[0], t2[0], outs[0]]);
        assert_eq!(ran.len(), 3);
    }

    #[test]
    fn cancellation_surfaces_as_interrupted() {
        let mut fx = Fixture::new();
        let input = fx.source("src/input", 2.0);
        let (_, outs) = fx.tool_action(&[input], &["tmp/output"]);

        let mut builder = Builder::new(fx.dir.clone());
        builder.set_jobs(1);
        builder.add_artifact(&fx.graph, outs[0]).unwrap();
        builder.cancel_flag().store(true, Ordering::Relaxed);
        let runner = MockRunner::default();
        let err = builder.build(&fx.graph, &runner).unwrap_err();
        assert!(err.is_interrupted());
        assert!(runner.ran.into_inner().unwrap().is_empty());
    }
}
