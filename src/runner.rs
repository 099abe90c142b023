//! Action execution.
//!
//! The [`ExecutionRunner`] runs one action at a time: it materializes a
//! [`CommandContext`] over the build directory, lets the command do its work,
//! and guarantees that in-memory artifacts which were reified to temporary
//! files are flushed back on every exit path, including failure and
//! cancellation. Failed actions get their outputs' mtimes zeroed so the next
//! invocation reconsiders them.

use crate::{
    command::{CommandContext, SpawnOutcome, SpawnRequest, StreamTarget},
    error::{BuildError, Result},
    fs::Directory,
    graph::{ActionId, ArtifactId, Graph, TestId},
    report::{ActionDisposition, ConsoleReporter, Reporter},
    utils,
};
use std::{
    collections::HashMap,
    fs,
    io::{Read, Write},
    path::PathBuf,
    process::{Child, Command as OsCommand, Stdio},
    sync::{atomic::AtomicBool, atomic::Ordering, Arc},
    thread,
    time::Duration,
};
use tempfile::NamedTempFile;

/// Poll interval while waiting on a child process; each tick also observes
/// the cancellation flag.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Everything a runner needs to know about one action, resolved by the
/// scheduler at the moment the action became ready.
#[derive(Clone, Debug)]
pub struct ActionRequest {
    pub action: ActionId,
    pub inputs: Vec<ArtifactId>,
    pub disk_inputs: Vec<String>,
    pub outputs: Vec<ArtifactId>,
    pub test: Option<TestId>,
}

/// An object which can execute actions. Implementations are shared across
/// worker threads.
pub trait ActionRunner: Send + Sync {
    /// Executes the action. `Ok(false)` means the command failed (details
    /// already reported); `Err` carries cancellation or an internal error.
    fn run(&self, graph: &Graph, request: &ActionRequest, cancel: &AtomicBool) -> Result<bool>;
}

/// The runner that actually executes commands.
#[derive(Debug)]
pub struct ExecutionRunner {
    dir: Arc<dyn Directory>,
    reporter: Arc<dyn Reporter>,
}

impl ExecutionRunner {
    pub fn new(dir: Arc<dyn Directory>) -> Self {
        Self::with_reporter(dir, Arc::new(ConsoleReporter::new()))
    }

    pub fn with_reporter(dir: Arc<dyn Directory>, reporter: Arc<dyn Reporter>) -> Self {
        Self { dir, reporter }
    }

    fn zero_outputs(&self, graph: &Graph, request: &ActionRequest) {
        // Failed outputs must look stale next run; a file that can't be
        // touched (e.g. never created) is already stale.
        for &output in &request.outputs {
            let _ = self.dir.touch(&graph.artifact(output).filename, Some(0.0));
        }
    }
}

impl ActionRunner for ExecutionRunner {
    fn run(&self, graph: &Graph, request: &ActionRequest, cancel: &AtomicBool) -> Result<bool> {
        let action = graph.action(request.action);
        let verb = action.verb.clone();
        let name = graph.action_name(request.action).to_string();
        self.reporter.action_started(&verb, &name);

        for &output in &request.outputs {
            if let Some(parent) = utils::parent_dir(&graph.artifact(output).filename) {
                self.dir.mkdir(parent)?;
            }
        }

        let command = action.command.as_ref().ok_or_else(|| {
            BuildError::definition(format!("action \"{name}\" has no command"))
        })?;

        let mut context = ExecContext {
            dir: self.dir.clone(),
            graph,
            cancel,
            reporter: self.reporter.clone(),
            action_label: name.clone(),
            temp_files: HashMap::new(),
        };
        let mut log = Vec::new();
        let run_result = command.run(graph, request.action, &mut context, &mut log);
        let flush_result = context.resolve_mem_files();

        match run_result {
            Ok(true) => {
                if let Err(err) = flush_result {
                    self.zero_outputs(graph, request);
                    self.reporter.action_finished(
                        &verb,
                        &name,
                        ActionDisposition::Failed,
                        err.to_string().as_bytes(),
                    );
                    return Err(err);
                }
                let disposition = match request.test {
                    None => ActionDisposition::Success,
                    Some(test) => self.test_disposition(graph, &name, test)?,
                };
                self.reporter.action_finished(&verb, &name, disposition, &log);
                Ok(true)
            }
            Ok(false) => {
                self.zero_outputs(graph, request);
                self.reporter.action_finished(&verb, &name, ActionDisposition::Failed, &log);
                Ok(false)
            }
            Err(err) => {
                self.zero_outputs(graph, request);
                let disposition = if err.is_interrupted() {
                    ActionDisposition::Cancelled
                } else {
                    ActionDisposition::Failed
                };
                self.reporter.action_finished(&verb, &name, disposition, &log);
                Err(err)
            }
        }
    }
}

impl ExecutionRunner {
    fn test_disposition(
        &self,
        graph: &Graph,
        name: &str,
        test: TestId,
    ) -> Result<ActionDisposition> {
        let result_file = &graph.artifact(graph.test(test).result_artifact).filename;
        let contents = self.dir.read(result_file).map_err(|_| {
            BuildError::definition(format!(
                "test \"{name}\" did not produce its result artifact \"{result_file}\""
            ))
        })?;
        match contents.as_slice() {
            b"true" => Ok(ActionDisposition::TestPassed),
            b"false" => Ok(ActionDisposition::TestFailed),
            _ => Err(BuildError::definition(format!(
                "test result artifact \"{result_file}\" contained neither \"true\" nor \"false\""
            ))),
        }
    }
}

/// The [`CommandContext`] handed to a command for one action.
///
/// Artifacts without a disk backing are lazily reified to executable
/// temporary files; [`ExecContext::resolve_mem_files`] flushes them back
/// (preserving the file mtime) and must run on every exit path.
struct ExecContext<'a> {
    dir: Arc<dyn Directory>,
    graph: &'a Graph,
    cancel: &'a AtomicBool,
    reporter: Arc<dyn Reporter>,
    action_label: String,
    temp_files: HashMap<String, NamedTempFile>,
}

impl ExecContext<'_> {
    fn resolve_mem_files(&mut self) -> Result<()> {
        let mut first_error = None;
        for (filename, temp) in std::mem::take(&mut self.temp_files) {
            let flushed = flush_temp(&*self.dir, &filename, &temp);
            if let Err(err) = flushed {
                warn!(%filename, %err, "failed to flush in-memory artifact");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

fn flush_temp(dir: &dyn Directory, filename: &str, temp: &NamedTempFile) -> Result<()> {
    let modified = temp
        .as_file()
        .metadata()
        .and_then(|meta| meta.modified())
        .map_err(|err| BuildError::io(err, temp.path()))?;
    let content = fs::read(temp.path()).map_err(|err| BuildError::io(err, temp.path()))?;
    dir.write(filename, &content, Some(utils::system_time_to_epoch(modified)))
}

impl CommandContext for ExecContext<'_> {
    fn disk_path(&mut self, artifact: ArtifactId, use_temporary: bool) -> Result<Option<PathBuf>> {
        let filename = &self.graph.artifact(artifact).filename;
        if let Some(path) = self.dir.disk_path(filename) {
            return Ok(Some(path));
        }
        if !use_temporary {
            return Ok(None);
        }
        if let Some(existing) = self.temp_files.get(filename) {
            return Ok(Some(existing.path().to_path_buf()));
        }

        let temp = tempfile::Builder::new()
            .prefix("quarry_")
            .suffix(&format!("_{}", utils::base_name(filename)))
            .tempfile()
            .map_err(|err| BuildError::io(err, filename))?;
        if self.dir.exists(filename) {
            let content = self.dir.read(filename)?;
            fs::write(temp.path(), content).map_err(|err| BuildError::io(err, temp.path()))?;
            if let Some(mtime) = self.dir.mtime(filename)? {
                temp.as_file()
                    .set_modified(utils::epoch_to_system_time(mtime))
                    .map_err(|err| BuildError::io(err, temp.path()))?;
            }
        }
        // The executable bit is not tracked, so every materialized file gets
        // it just in case.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o700));
        }

        let path = temp.path().to_path_buf();
        self.temp_files.insert(filename.clone(), temp);
        Ok(Some(path))
    }

    fn read(&mut self, artifact: ArtifactId) -> Result<Vec<u8>> {
        let filename = &self.graph.artifact(artifact).filename;
        match self.temp_files.get(filename) {
            Some(temp) => fs::read(temp.path()).map_err(|err| BuildError::io(err, temp.path())),
            None => self.dir.read(filename),
        }
    }

    fn write(&mut self, artifact: ArtifactId, content: &[u8]) -> Result<()> {
        let filename = &self.graph.artifact(artifact).filename;
        match self.temp_files.get(filename) {
            Some(temp) => {
                fs::write(temp.path(), content).map_err(|err| BuildError::io(err, temp.path()))
            }
            None => self.dir.write(filename, content, None),
        }
    }

    fn getenv(&self, var: &str) -> Option<String> {
        std::env::var(var).ok()
    }

    fn spawn(&mut self, request: SpawnRequest<'_>) -> Result<SpawnOutcome> {
        let program = request.argv[0].clone();
        trace!(argv = ?request.argv, "spawning subprocess");

        let mut command = OsCommand::new(&program);
        command.args(&request.argv[1..]);
        command.stdin(if request.stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut merge_handle = None;
        match &request.stdout {
            StreamTarget::ToFile(path) => {
                let file =
                    fs::File::create(path).map_err(|err| BuildError::io(err, path))?;
                merge_handle =
                    Some(file.try_clone().map_err(|err| BuildError::io(err, path))?);
                command.stdout(Stdio::from(file));
            }
            _ => {
                command.stdout(Stdio::piped());
            }
        }
        // When stderr merges into a piped stdout, both streams are collected
        // and concatenated below; exact interleaving is not preserved.
        let mut stderr_merged_into_pipe = false;
        match &request.stderr {
            StreamTarget::ToFile(path) => {
                let file =
                    fs::File::create(path).map_err(|err| BuildError::io(err, path))?;
                command.stderr(Stdio::from(file));
            }
            StreamTarget::MergeWithStdout => match merge_handle.take() {
                Some(file) => {
                    command.stderr(Stdio::from(file));
                }
                None => {
                    stderr_merged_into_pipe = true;
                    command.stderr(Stdio::piped());
                }
            },
            StreamTarget::Piped => {
                command.stderr(Stdio::piped());
            }
        }

        let mut child = command.spawn().map_err(|err| BuildError::io(err, &program))?;
        let (status, mut stdout, mut stderr) =
            wait_with_cancel(&mut child, request.stdin, self.cancel, &program)?;
        if stderr_merged_into_pipe {
            stdout.append(&mut stderr);
        }

        let exit_code = match status.code() {
            Some(code) => code,
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    match status.signal() {
                        // A child dying from SIGINT means the user hit ctrl-c.
                        Some(2) => return Err(BuildError::Interrupted),
                        Some(signal) => 128 + signal,
                        None => -1,
                    }
                }
                #[cfg(not(unix))]
                {
                    -1
                }
            }
        };

        Ok(SpawnOutcome { exit_code, stdout, stderr })
    }

    fn status(&mut self, text: &str) {
        self.reporter.action_status(&self.action_label, text);
    }
}

/// Waits for the child while watching the cancellation flag, reading the
/// piped streams from helper threads so a chatty child never blocks on a
/// full pipe.
fn wait_with_cancel(
    child: &mut Child,
    stdin: Option<&[u8]>,
    cancel: &AtomicBool,
    program: &str,
) -> Result<(std::process::ExitStatus, Vec<u8>, Vec<u8>)> {
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();
    let stdin_handle = child.stdin.take();

    thread::scope(|scope| {
        if let (Some(mut pipe), Some(bytes)) = (stdin_handle, stdin) {
            let bytes = bytes.to_vec();
            scope.spawn(move || {
                let _ = pipe.write_all(&bytes);
            });
        }
        let stdout_reader = stdout_handle.map(|mut handle| {
            scope.spawn(move || {
                let mut buffer = Vec::new();
                let _ = handle.read_to_end(&mut buffer);
                buffer
            })
        });
        let stderr_reader = stderr_handle.map(|mut handle| {
            scope.spawn(move || {
                let mut buffer = Vec::new();
                let _ = handle.read_to_end(&mut buffer);
                buffer
            })
        });

        let status = loop {
            if cancel.load(Ordering::Relaxed) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BuildError::Interrupted);
            }
            match child.try_wait().map_err(|err| BuildError::io(err, program))? {
                Some(status) => break status,
                None => thread::sleep(CHILD_POLL_INTERVAL),
            }
        };

        let stdout = stdout_reader.map(|reader| reader.join().unwrap_or_default());
        let stderr = stderr_reader.map(|reader| reader.join().unwrap_or_default());
        Ok((status, stdout.unwrap_or_default(), stderr.unwrap_or_default()))
    })
}
