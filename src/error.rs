use std::fmt::Write;
use std::path::PathBuf;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

pub use anyhow::Error as RuntimeError;

/// Error raised by a lazily computed value. Cloneable so that the same
/// failure can be reported by every consumer of the value.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct LazyValueError(#[from] pub(crate) Arc<anyhow::Error>);

impl LazyValueError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for LazyValueError {
    fn from(e: anyhow::Error) -> Self {
        LazyValueError(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Couldn't read '{path}'.\n{source}")]
    Unreadable {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Path '{0}' is not valid UTF-8")]
    NonUtf8Path(PathBuf),

    #[error("Path '{0}' is not absolute")]
    RelativePath(Utf8PathBuf),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Couldn't access the store file '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("The store in '{0}' is locked by another process")]
    Locked(Utf8PathBuf),

    #[error("Couldn't encode {what}.\n{message}")]
    Encode { what: String, message: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error(
        "Output '{path}' of '{identity}' was modified by something other than the build, refusing to delete it"
    )]
    ForeignOutput {
        identity: String,
        path: Utf8PathBuf,
    },

    #[error("Output '{path}' is claimed by both '{first}' and '{second}'")]
    OverlappingOutputs {
        first: String,
        second: String,
        path: Utf8PathBuf,
    },

    #[error("Work item '{0}' is declared or executed more than once")]
    DuplicateIdentity(String),
}

#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("{}", missing_message(.0))]
    Missing(Vec<Arc<str>>),

    #[error("Reading {0} requires evaluating a value whose producer is unknown")]
    UnsafeRead(String),

    #[error("Couldn't compute {0}.\n{1}")]
    Compute(String, LazyValueError),
}

fn missing_message(path: &[Arc<str>]) -> String {
    let mut message = String::from("Cannot query the value because it has no value available.");

    if !path.is_empty() {
        message.push_str("\nThe value is missing because of:");
        for name in path {
            let _ = write!(message, "\n  - {name}");
        }
    }

    message
}

/// Failure of a single work item. Fatal to that item only.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("Input '{0}':\n{1}")]
    Input(String, ProviderError),

    #[error("Output '{0}':\n{1}")]
    Output(String, ProviderError),

    #[error("Couldn't fingerprint input '{0}'.\n{1}")]
    Fingerprint(String, String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Couldn't clean stale output '{path}'.\n{source}")]
    Cleanup {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't prepare output location '{path}'.\n{source}")]
    Prepare {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Action failed:\n{0}")]
    Action(anyhow::Error),

    #[error("{0}")]
    Panic(String),
}

/// A failed work item, as collected in the build report.
#[derive(Debug, Clone)]
pub struct WorkFailure {
    pub identity: String,
    pub error: Arc<ExecutionError>,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("Cycle detected in the work graph at '{0}'")]
    Cycle(String),

    #[error("Work item '{identity}' depends on unknown work item '{dependency}'")]
    UnknownDependency { identity: String, dependency: String },

    #[error("Output '{1}' of '{0}' has no fixed location.\n{2}")]
    OutputLocation(String, String, ProviderError),

    #[error("Couldn't start the worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("{}", failures_message(.0))]
    Failed(Vec<WorkFailure>),
}

fn failures_message(failures: &[WorkFailure]) -> String {
    let mut message = format!("{} work item(s) failed:", failures.len());
    for failure in failures {
        let _ = write!(message, "\nWork item '{}':\n{}", failure.identity, failure.error);
    }
    message
}

#[derive(Debug, Error)]
pub enum KilnError {
    #[error("Couldn't read the settings.\n{0}")]
    Settings(#[from] serde_json::Error),

    #[error("Error while opening the build store:\n{0}")]
    Store(#[from] StoreError),

    #[error("Error while building:\n{0}")]
    Build(#[from] BuildError),

    #[error("A build session can only run once")]
    SessionReused,
}
