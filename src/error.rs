use std::{
    fmt,
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// An io error bound to the path that produced it.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {source}", .path.display())]
pub struct PathIoError {
    #[source]
    source: io::Error,
    path: PathBuf,
}

impl PathIoError {
    pub fn new(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { source, path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the underlying error is a plain not-found.
    pub fn is_not_found(&self) -> bool {
        self.source.kind() == io::ErrorKind::NotFound
    }
}

/// Errors produced while registering or executing a build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The build graph itself is invalid: missing source file, duplicate
    /// producers, unnormalized path, cyclic dependencies, malformed test
    /// result, or an input that its producer never generated.
    #[error("{0}")]
    Definition(String),
    /// A command reported failure. Diagnostics were routed to the per-action
    /// log before this was raised.
    #[error("{verb}: {name} failed")]
    CommandFailed { verb: String, name: String },
    /// The build was interrupted by the user.
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Io(#[from] PathIoError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn definition(msg: impl fmt::Display) -> Self {
        BuildError::Definition(msg.to_string())
    }

    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        BuildError::Io(PathIoError::new(err, path))
    }

    pub(crate) fn msg(msg: impl fmt::Display) -> Self {
        BuildError::Message(msg.to_string())
    }

    /// True for user cancellation, which must propagate unchanged instead of
    /// being folded into a command failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, BuildError::Interrupted)
    }
}
