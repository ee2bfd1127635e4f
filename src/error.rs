use std::backtrace::BacktraceStatus;
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use thiserror::Error;

/// Stable, machine-readable identifier attached to every [`GobbleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A build was requested without a destination directory.
    MissingDestDir,
    /// The destination directory already has content and `force` was not set.
    DirNotEmpty,
    /// A user transform signalled, returned or panicked with an error.
    TransformationFailed,
    /// A filesystem operation performed by the pipeline itself failed.
    #[serde(rename = "IO_ERROR")]
    Io,
    /// A source node points at something that is not a directory.
    MissingDirectory,
    /// Queued work was rejected because the execution queue was aborted.
    Aborted,
    /// Work was requested against a session that has already been destroyed.
    SessionDestroyed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MissingDestDir => "MISSING_DEST_DIR",
            ErrorCode::DirNotEmpty => "DIR_NOT_EMPTY",
            ErrorCode::TransformationFailed => "TRANSFORMATION_FAILED",
            ErrorCode::Io => "IO_ERROR",
            ErrorCode::MissingDirectory => "MISSING_DIRECTORY",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::SessionDestroyed => "SESSION_DESTROYED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position in user code a failure was traced back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// The original error behind a failure.
///
/// Readiness futures are shared between every consumer of a node, so the
/// error they resolve to has to be cloneable. The user's `anyhow::Error` is
/// kept behind an `Arc` to make that possible without losing its chain or
/// its captured backtrace.
#[derive(Debug, Clone)]
pub struct Cause(Arc<anyhow::Error>);

impl Cause {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Text of the backtrace captured together with the error, if any.
    pub fn backtrace(&self) -> Option<String> {
        let backtrace = self.0.backtrace();

        match backtrace.status() {
            BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for Cause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for Cause {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

/// The single user-facing error of the pipeline.
///
/// Created only at failure boundaries and never mutated afterwards; the
/// builder-style `with_*` methods are used while it is being assembled.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GobbleError {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub original: Option<Cause>,
    pub stack: Option<String>,
    pub location: Option<SourceLocation>,
    /// Id of the node the failure happened in.
    pub id: Option<String>,
    pub path: Option<Utf8PathBuf>,
    pub task: Option<&'static str>,
}

impl GobbleError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            original: None,
            stack: None,
            location: None,
            id: None,
            path: None,
            task: None,
        }
    }

    pub fn missing_dest_dir() -> Self {
        Self::new(
            ErrorCode::MissingDestDir,
            "you must specify a destination directory",
        )
        .with_task("build")
    }

    pub fn dir_not_empty(dest: &Utf8Path) -> Self {
        Self::new(
            ErrorCode::DirNotEmpty,
            format!("destination folder ({dest}) is not empty"),
        )
        .with_path(dest)
    }

    /// Wraps an error raised by a user transform, recovering the location in
    /// user code from the backtrace captured alongside it.
    pub fn transformation(id: &str, cause: Cause) -> Self {
        let stack = cause.backtrace();
        let location = stack.as_deref().and_then(extract_location);

        Self {
            stack,
            location,
            ..Self::new(ErrorCode::TransformationFailed, "transformation failed")
                .with_id(id)
                .with_original(cause)
        }
    }

    pub fn io(path: &Utf8Path, err: std::io::Error) -> Self {
        Self::new(ErrorCode::Io, format!("{path}: {err}"))
            .with_path(path)
            .with_original(Cause::new(err))
    }

    pub fn missing_directory(path: &Utf8Path) -> Self {
        Self::new(
            ErrorCode::MissingDirectory,
            format!("the '{path}' directory does not exist"),
        )
        .with_path(path)
    }

    pub fn aborted() -> Self {
        Self::new(ErrorCode::Aborted, "queued work was aborted")
    }

    pub fn session_destroyed() -> Self {
        Self::new(ErrorCode::SessionDestroyed, "the build session has been destroyed")
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_owned());
        self
    }

    pub fn with_path(mut self, path: &Utf8Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    pub fn with_task(mut self, task: &'static str) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_original(mut self, cause: Cause) -> Self {
        self.original = Some(cause);
        self
    }

    /// Message of the original cause, if there is one.
    pub fn original_message(&self) -> Option<String> {
        self.original.as_ref().map(ToString::to_string)
    }
}

/// Symbol prefixes of frames that belong to the pipeline or the runtime
/// rather than to the transform that failed.
const INFRASTRUCTURE: &[&str] = &[
    "gobble::",
    "std::",
    "core::",
    "alloc::",
    "tokio::",
    "futures",
    "anyhow::",
    "__rust",
    "rust_begin_unwind",
    "rust_panic",
];

fn is_infrastructure(symbol: &str) -> bool {
    let symbol = symbol.trim_start_matches('<');
    INFRASTRUCTURE.iter().any(|prefix| symbol.starts_with(prefix))
}

/// Finds the first frame of a rendered backtrace that lies outside of core
/// infrastructure and returns its file, line and column.
///
/// Frames are rendered as a numbered symbol line followed by an
/// `at file:line:column` line; frames without a location are skipped.
pub fn extract_location(stack: &str) -> Option<SourceLocation> {
    let mut symbol = None;

    for line in stack.lines() {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("at ") {
            let Some(current) = symbol.take() else {
                continue;
            };

            if is_infrastructure(current) {
                continue;
            }

            if let Some(location) = parse_location(rest) {
                return Some(location);
            }
        } else if let Some((index, name)) = line.split_once(": ")
            && !index.is_empty()
            && index.chars().all(|c| c.is_ascii_digit())
        {
            symbol = Some(name);
        }
    }

    None
}

fn parse_location(text: &str) -> Option<SourceLocation> {
    let mut parts = text.rsplitn(3, ':');
    let column = parts.next()?.parse().ok()?;
    let line = parts.next()?.parse().ok()?;
    let file = parts.next()?;

    Some(SourceLocation {
        file: file.to_owned(),
        line,
        column,
    })
}
