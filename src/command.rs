//! Commands define exactly what an action does.
//!
//! A [`Command`] is an inspectable value: it can enumerate the artifacts it
//! will read and write (possibly incompletely, until content it depends on
//! becomes available), it can feed a canonical byte sequence into a digest so
//! the caching runner can tell whether it changed, and it can run against a
//! [`CommandContext`]. The set of variants is closed on purpose; new kinds of
//! work belong here, not in type-switches at call sites.

use crate::{
    error::{BuildError, Result},
    graph::{ActionId, ArtifactId, Graph},
};
use md5::{Digest, Md5};
use std::{io::Write, path::PathBuf};

/// One element of a subprocess argument list.
///
/// A bare [`Arg::Content`] at the top level is whitespace-split into multiple
/// arguments; inside an [`Arg::Concat`] the contents are spliced verbatim and
/// the fragments join into a single argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    Literal(String),
    /// Replaced by the artifact's on-disk path, materialized if needed.
    File(ArtifactId),
    /// Replaced by the artifact's contents.
    Content(ArtifactId),
    /// Fragments joined into one argument.
    Concat(Vec<Arg>),
}

impl Arg {
    pub fn lit(s: impl Into<String>) -> Self {
        Arg::Literal(s.into())
    }
}

/// Fallback for [`Command::EnvLookup`] when the variable is unset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvDefault {
    Value(String),
    /// Use the contents of this artifact.
    Artifact(ArtifactId),
}

/// What an action does. See the module docs; the five variants are the
/// complete set understood by the engine core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Writes literal bytes into `output`.
    Echo { content: Vec<u8>, output: ArtifactId },
    /// Reads environment variable `var` (falling back to `default`) and
    /// writes the value into `output`. With `set_status`, the resolved value
    /// is also surfaced on the action's status line.
    EnvLookup {
        var: String,
        output: ArtifactId,
        default: Option<EnvDefault>,
        set_status: bool,
    },
    /// Runs each subcommand in order; the first failure stops the sequence.
    DoAll(Vec<Command>),
    /// Reads `condition` (expected to contain `true` or `false`) and runs
    /// the matching branch. A missing false-branch means trivial success.
    Conditional {
        condition: ArtifactId,
        on_true: Box<Command>,
        on_false: Option<Box<Command>>,
    },
    /// Spawns a subprocess. Captured streams land in the given artifacts;
    /// with `capture_exit_status` set, a non-zero exit writes `false` there
    /// instead of failing the command.
    Subprocess {
        args: Vec<Arg>,
        /// Artifacts used or produced without appearing in the argv.
        implicit: Vec<ArtifactId>,
        capture_stdout: Option<ArtifactId>,
        capture_stderr: Option<ArtifactId>,
        capture_exit_status: Option<ArtifactId>,
    },
}

/// Callbacks through which a command reports its inputs and outputs.
///
/// `read` returns the artifact's current bytes if it is clean and available,
/// or `None` otherwise — in which case the reported sets are incomplete and
/// the caller must re-enumerate once the artifact has been produced. Calling
/// `read` implies the artifact is an input.
pub trait ArtifactEnumerator {
    fn add_input(&mut self, artifact: ArtifactId);
    fn add_output(&mut self, artifact: ArtifactId);
    /// An extra-tree dependency addressed by OS path, e.g. a system library.
    fn add_disk_input(&mut self, path: &str);
    fn read(&mut self, artifact: ArtifactId) -> Option<Vec<u8>>;
    /// Must agree with [`CommandContext::getenv`] at run time.
    fn getenv(&mut self, var: &str) -> Option<String>;
}

/// Where a subprocess stream should go.
#[derive(Debug)]
pub enum StreamTarget {
    /// Collect through a pipe and hand the bytes back in [`SpawnOutcome`].
    Piped,
    /// Stream directly into this file.
    ToFile(PathBuf),
    /// stderr only: merge into wherever stdout goes.
    MergeWithStdout,
}

/// A subprocess invocation request built by [`Command::Subprocess`].
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    pub argv: &'a [String],
    pub stdout: StreamTarget,
    pub stderr: StreamTarget,
    pub stdin: Option<&'a [u8]>,
}

/// Result of a finished subprocess. Streams routed to files come back empty.
#[derive(Debug)]
pub struct SpawnOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// The execution environment a command runs in. Implemented by the runner;
/// mock implementations drive command unit tests.
pub trait CommandContext {
    /// On-disk path of the artifact. For artifacts without a disk backing, a
    /// temporary file seeded with the current contents is created when
    /// `use_temporary` is true, otherwise `None` is returned.
    fn disk_path(&mut self, artifact: ArtifactId, use_temporary: bool) -> Result<Option<PathBuf>>;
    fn read(&mut self, artifact: ArtifactId) -> Result<Vec<u8>>;
    fn write(&mut self, artifact: ArtifactId, content: &[u8]) -> Result<()>;
    fn getenv(&self, var: &str) -> Option<String>;
    fn spawn(&mut self, request: SpawnRequest<'_>) -> Result<SpawnOutcome>;
    /// Attaches a short status note to the action's console line.
    fn status(&mut self, text: &str);
}

/// Folds an io failure into the action log (commands report `false` for
/// those), letting cancellation through untouched.
fn check_io<T>(result: Result<T>, log: &mut Vec<u8>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_interrupted() => Err(err),
        Err(err) => {
            let _ = writeln!(log, "{err}");
            Ok(None)
        }
    }
}

impl Command {
    /// Reports the command's inputs and outputs to `enumerator`. The result
    /// is complete unless a `read` came back unavailable.
    pub fn enumerate_artifacts(
        &self,
        graph: &Graph,
        action: ActionId,
        enumerator: &mut dyn ArtifactEnumerator,
    ) {
        match self {
            Command::Echo { output, .. } => enumerator.add_output(*output),
            Command::EnvLookup { var, output, default, .. } => {
                if let Some(EnvDefault::Artifact(fallback)) = default {
                    if enumerator.getenv(var).is_none() {
                        enumerator.add_input(*fallback);
                    }
                }
                enumerator.add_output(*output);
            }
            Command::DoAll(commands) => {
                for command in commands {
                    command.enumerate_artifacts(graph, action, enumerator);
                }
            }
            Command::Conditional { condition, on_true, on_false } => {
                match enumerator.read(*condition).as_deref() {
                    Some(b"true") => on_true.enumerate_artifacts(graph, action, enumerator),
                    Some(b"false") => {
                        if let Some(on_false) = on_false {
                            on_false.enumerate_artifacts(graph, action, enumerator);
                        }
                    }
                    // Unavailable (incomplete enumeration) or malformed; the
                    // latter fails at run time.
                    _ => {}
                }
            }
            Command::Subprocess {
                args,
                implicit,
                capture_stdout,
                capture_stderr,
                capture_exit_status,
            } => {
                for capture in [capture_stdout, capture_stderr, capture_exit_status]
                    .into_iter()
                    .flatten()
                {
                    enumerator.add_output(*capture);
                }
                let mut referenced = implicit.clone();
                collect_arg_artifacts(args, &mut referenced);
                // Artifacts generated by this very action are its outputs;
                // everything else it references is an input.
                for artifact in referenced {
                    if graph.artifact(artifact).action == Some(action) {
                        enumerator.add_output(artifact);
                    } else {
                        enumerator.add_input(artifact);
                    }
                }
            }
        }
    }

    /// Executes the command. `Ok(false)` means failure with diagnostics
    /// appended to `log`; `Err` is reserved for cancellation.
    pub fn run(
        &self,
        graph: &Graph,
        action: ActionId,
        context: &mut dyn CommandContext,
        log: &mut Vec<u8>,
    ) -> Result<bool> {
        match self {
            Command::Echo { content, output } => {
                match check_io(context.write(*output, content), log)? {
                    Some(()) => Ok(true),
                    None => Ok(false),
                }
            }
            Command::EnvLookup { var, output, default, set_status } => {
                let value: Vec<u8> = match context.getenv(var) {
                    Some(value) => value.into_bytes(),
                    None => match default {
                        Some(EnvDefault::Value(value)) => value.clone().into_bytes(),
                        Some(EnvDefault::Artifact(fallback)) => {
                            match check_io(context.read(*fallback), log)? {
                                Some(bytes) => bytes,
                                None => return Ok(false),
                            }
                        }
                        None => {
                            let _ = writeln!(log, "Environment variable not set: {var}");
                            return Ok(false);
                        }
                    },
                };
                if check_io(context.write(*output, &value), log)?.is_none() {
                    return Ok(false);
                }
                if *set_status {
                    context.status(&String::from_utf8_lossy(&value));
                }
                Ok(true)
            }
            Command::DoAll(commands) => {
                for command in commands {
                    if !command.run(graph, action, context, log)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Command::Conditional { condition, on_true, on_false } => {
                let value = match check_io(context.read(*condition), log)? {
                    Some(bytes) => bytes,
                    None => return Ok(false),
                };
                match value.as_slice() {
                    b"true" => on_true.run(graph, action, context, log),
                    b"false" => match on_false {
                        Some(on_false) => on_false.run(graph, action, context, log),
                        None => Ok(true),
                    },
                    _ => {
                        let _ = writeln!(
                            log,
                            "Condition artifact was not true or false: {}",
                            graph.artifact(*condition).filename
                        );
                        Ok(false)
                    }
                }
            }
            Command::Subprocess {
                args,
                implicit: _,
                capture_stdout,
                capture_stderr,
                capture_exit_status,
            } => run_subprocess(
                args,
                *capture_stdout,
                *capture_stderr,
                *capture_exit_status,
                context,
                log,
            ),
        }
    }

    /// Feeds a canonical byte sequence uniquely identifying this command into
    /// `hasher`: a variant tag, then every field, strings length-prefixed,
    /// artifacts tagged by whether this action produces them, sets pre-sorted
    /// so iteration order never leaks into the digest.
    pub fn hash(&self, graph: &Graph, action: ActionId, hasher: &mut Md5) {
        match self {
            Command::Echo { content, output } => {
                hasher.update([0u8]);
                put_bytes(hasher, content);
                put_artifact(hasher, graph, action, *output);
            }
            Command::EnvLookup { var, output, default, set_status } => {
                hasher.update([1u8]);
                put_str(hasher, var);
                put_artifact(hasher, graph, action, *output);
                match default {
                    None => hasher.update([0u8]),
                    Some(EnvDefault::Value(value)) => {
                        hasher.update([1u8]);
                        put_str(hasher, value);
                    }
                    Some(EnvDefault::Artifact(artifact)) => {
                        hasher.update([2u8]);
                        put_artifact(hasher, graph, action, *artifact);
                    }
                }
                hasher.update([u8::from(*set_status)]);
            }
            Command::DoAll(commands) => {
                hasher.update([2u8]);
                hasher.update((commands.len() as u64).to_le_bytes());
                for command in commands {
                    command.hash(graph, action, hasher);
                }
            }
            Command::Conditional { condition, on_true, on_false } => {
                hasher.update([3u8]);
                put_artifact(hasher, graph, action, *condition);
                on_true.hash(graph, action, hasher);
                match on_false {
                    None => hasher.update([0u8]),
                    Some(on_false) => {
                        hasher.update([1u8]);
                        on_false.hash(graph, action, hasher);
                    }
                }
            }
            Command::Subprocess {
                args,
                implicit,
                capture_stdout,
                capture_stderr,
                capture_exit_status,
            } => {
                hasher.update([4u8]);
                hasher.update((args.len() as u64).to_le_bytes());
                for arg in args {
                    hash_arg(arg, graph, action, hasher);
                }
                let mut implicit: Vec<&str> =
                    implicit.iter().map(|a| graph.artifact(*a).filename.as_str()).collect();
                implicit.sort_unstable();
                implicit.dedup();
                hasher.update((implicit.len() as u64).to_le_bytes());
                for filename in implicit {
                    put_str(hasher, filename);
                }
                for capture in [capture_stdout, capture_stderr, capture_exit_status] {
                    match capture {
                        None => hasher.update([0u8]),
                        Some(artifact) => {
                            hasher.update([1u8]);
                            put_artifact(hasher, graph, action, *artifact);
                        }
                    }
                }
            }
        }
    }
}

fn run_subprocess(
    args: &[Arg],
    capture_stdout: Option<ArtifactId>,
    capture_stderr: Option<ArtifactId>,
    capture_exit_status: Option<ArtifactId>,
    context: &mut dyn CommandContext,
    log: &mut Vec<u8>,
) -> Result<bool> {
    let mut argv = Vec::new();
    if check_io(format_args(args, context, true, &mut argv), log)?.is_none() {
        return Ok(false);
    }
    if argv.is_empty() {
        let _ = writeln!(log, "Empty command line");
        return Ok(false);
    }

    // A capture artifact with a real disk location gets the stream
    // written directly; otherwise we collect through a pipe and store the
    // bytes afterwards.
    let stdout = match capture_stdout {
        Some(artifact) => match check_io(context.disk_path(artifact, false), log)? {
            Some(Some(path)) => StreamTarget::ToFile(path),
            Some(None) => StreamTarget::Piped,
            None => return Ok(false),
        },
        None => StreamTarget::Piped,
    };
    let stdout_piped = matches!(stdout, StreamTarget::Piped);
    let stderr = match capture_stderr {
        Some(artifact) if capture_stdout == Some(artifact) => StreamTarget::MergeWithStdout,
        Some(artifact) => match check_io(context.disk_path(artifact, false), log)? {
            Some(Some(path)) => StreamTarget::ToFile(path),
            Some(None) => StreamTarget::Piped,
            None => return Ok(false),
        },
        None => StreamTarget::Piped,
    };
    let stderr_piped = matches!(stderr, StreamTarget::Piped);

    let request = SpawnRequest { argv: &argv, stdout, stderr, stdin: None };
    let outcome = match check_io(context.spawn(request), log)? {
        Some(outcome) => outcome,
        None => return Ok(false),
    };

    if stdout_piped {
        match capture_stdout {
            Some(artifact) => {
                if check_io(context.write(artifact, &outcome.stdout), log)?.is_none() {
                    return Ok(false);
                }
            }
            None => log.extend_from_slice(&outcome.stdout),
        }
    }
    if stderr_piped {
        match capture_stderr {
            Some(artifact) => {
                if check_io(context.write(artifact, &outcome.stderr), log)?.is_none() {
                    return Ok(false);
                }
            }
            None => log.extend_from_slice(&outcome.stderr),
        }
    }

    if let Some(status_artifact) = capture_exit_status {
        let status: &[u8] = if outcome.exit_code == 0 { b"true" } else { b"false" };
        if check_io(context.write(status_artifact, status), log)?.is_none() {
            return Ok(false);
        }
        return Ok(true);
    }
    if outcome.exit_code == 0 {
        Ok(true)
    } else {
        let _ = writeln!(
            log,
            "Command failed with exit code {}: {}",
            outcome.exit_code,
            argv.join(" ")
        );
        Ok(false)
    }
}

fn collect_arg_artifacts(args: &[Arg], out: &mut Vec<ArtifactId>) {
    for arg in args {
        match arg {
            Arg::Literal(_) => {}
            Arg::File(artifact) | Arg::Content(artifact) => out.push(*artifact),
            Arg::Concat(parts) => collect_arg_artifacts(parts, out),
        }
    }
}

/// Expands `args` into concrete argv strings. At the top level, `Content`
/// splices are whitespace-split into separate arguments; within a `Concat`
/// everything joins into one argument and splices are verbatim.
fn format_args(
    args: &[Arg],
    context: &mut dyn CommandContext,
    split_content: bool,
    out: &mut Vec<String>,
) -> Result<()> {
    for arg in args {
        match arg {
            Arg::Literal(text) => out.push(text.clone()),
            Arg::File(artifact) => {
                let path = context.disk_path(*artifact, true)?.ok_or_else(|| {
                    BuildError::msg("artifact could not be materialized on disk")
                })?;
                out.push(path.to_string_lossy().into_owned());
            }
            Arg::Content(artifact) => {
                let content = String::from_utf8_lossy(&context.read(*artifact)?).into_owned();
                if split_content {
                    out.extend(content.split_whitespace().map(str::to_string));
                } else {
                    out.push(content);
                }
            }
            Arg::Concat(parts) => {
                let mut pieces = Vec::new();
                format_args(parts, context, false, &mut pieces)?;
                out.push(pieces.concat());
            }
        }
    }
    Ok(())
}

fn put_bytes(hasher: &mut Md5, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn put_str(hasher: &mut Md5, s: &str) {
    put_bytes(hasher, s.as_bytes());
}

fn put_artifact(hasher: &mut Md5, graph: &Graph, action: ActionId, artifact: ArtifactId) {
    let entry = graph.artifact(artifact);
    hasher.update(if entry.action == Some(action) { b"o" } else { b"i" });
    put_str(hasher, &entry.filename);
}

fn hash_arg(arg: &Arg, graph: &Graph, action: ActionId, hasher: &mut Md5) {
    match arg {
        Arg::Literal(text) => {
            hasher.update([0u8]);
            put_str(hasher, text);
        }
        Arg::File(artifact) => {
            hasher.update([1u8]);
            put_artifact(hasher, graph, action, *artifact);
        }
        Arg::Content(artifact) => {
            hasher.update([2u8]);
            put_artifact(hasher, graph, action, *artifact);
        }
        Arg::Concat(parts) => {
            hasher.update([3u8]);
            hasher.update((parts.len() as u64).to_le_bytes());
            for part in parts {
                hash_arg(part, graph, action, hasher);
            }
        }
    }
}
