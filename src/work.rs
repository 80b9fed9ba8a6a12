use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::Span;

use crate::core::{ArcStr, Hash32};
use crate::engine::ExecutionReason;
use crate::error::ExecutionError;
use crate::provider::{Provider, ValueConsumer, ValueProducer};
use crate::snapshot::Snapshotter;
use crate::store::{FileFingerprint, InputFingerprint};

/// Result type returned by work actions.
pub type WorkResult<T = ()> = anyhow::Result<T>;

pub(crate) type Action = Box<dyn Fn(&WorkContext<'_>) -> WorkResult + Send + Sync>;

/// Something a work item reads, reduced to a fingerprint before every check.
pub trait InputSource: Send + Sync {
    fn producer(&self) -> ValueProducer;

    fn fingerprint(
        &self,
        name: &str,
        snapshotter: &Snapshotter,
    ) -> Result<InputFingerprint, ExecutionError>;
}

/// A scalar input compared by the digest of its serialized form.
pub struct ValueInput<T> {
    provider: Provider<T>,
}

impl<T> ValueInput<T> {
    pub fn new(provider: Provider<T>) -> Self {
        Self { provider }
    }
}

impl<T> InputSource for ValueInput<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    fn producer(&self) -> ValueProducer {
        self.provider.producer()
    }

    fn fingerprint(
        &self,
        name: &str,
        _: &Snapshotter,
    ) -> Result<InputFingerprint, ExecutionError> {
        let value = self
            .provider
            .calculate_value(ValueConsumer::Lenient)
            .map_err(|e| ExecutionError::Input(name.to_string(), e))?;

        let Some(value) = value.or_none() else {
            return Ok(InputFingerprint::Absent);
        };

        let mut buffer = Vec::new();
        ciborium::into_writer(&value, &mut buffer)
            .map_err(|e| ExecutionError::Fingerprint(name.to_string(), e.to_string()))?;

        Ok(InputFingerprint::Value(Hash32::hash(buffer)))
    }
}

/// Files read by a work item, compared by content.
pub struct FileInput {
    provider: Provider<Vec<Utf8PathBuf>>,
}

impl FileInput {
    pub fn new(provider: Provider<Vec<Utf8PathBuf>>) -> Self {
        Self { provider }
    }
}

impl InputSource for FileInput {
    fn producer(&self) -> ValueProducer {
        self.provider.producer()
    }

    fn fingerprint(
        &self,
        name: &str,
        snapshotter: &Snapshotter,
    ) -> Result<InputFingerprint, ExecutionError> {
        let paths = self
            .provider
            .calculate_value(ValueConsumer::Lenient)
            .map_err(|e| ExecutionError::Input(name.to_string(), e))?;

        let Some(paths) = paths.or_none() else {
            return Ok(InputFingerprint::Absent);
        };

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let path = crate::io::absolute(&path)
                .map_err(|e| ExecutionError::Fingerprint(name.to_string(), e.to_string()))?;
            let snapshot = snapshotter.snapshot_located(&path)?;
            files.push(FileFingerprint::from(&snapshot));
        }

        Ok(InputFingerprint::Files(files))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    File,
    Directory,
}

pub(crate) struct InputProperty {
    pub name: ArcStr,
    pub source: Box<dyn InputSource>,
}

pub(crate) struct OutputProperty {
    pub name: ArcStr,
    pub kind: OutputKind,
    pub location: Provider<Utf8PathBuf>,
}

/// A unit of work with declared inputs and outputs.
pub struct WorkItem {
    pub(crate) identity: ArcStr,
    pub(crate) implementation: String,
    pub(crate) inputs: Vec<InputProperty>,
    pub(crate) outputs: Vec<OutputProperty>,
    pub(crate) dependencies: Vec<ArcStr>,
    pub(crate) action: Action,
}

impl WorkItem {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|input| &*input.name)
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|output| &*output.name)
    }

    /// Work items that must complete before this one, named explicitly or
    /// inferred from the producers of its inputs.
    pub(crate) fn upstream(&self) -> Vec<ArcStr> {
        let mut upstream = self.dependencies.clone();

        let mut visit = |task: &ArcStr| {
            if *task != self.identity && !upstream.contains(task) {
                upstream.push(task.clone());
            }
        };

        for input in &self.inputs {
            input.source.producer().visit_producer_tasks(&mut visit);
        }
        for output in &self.outputs {
            output.location.producer().visit_producer_tasks(&mut visit);
        }

        upstream
    }

    /// Whether any input is produced by this work item itself.
    pub(crate) fn consumes_own_output(&self) -> bool {
        let mut found = false;
        for input in &self.inputs {
            input.source.producer().visit_producer_tasks(&mut |task| {
                found |= *task == self.identity;
            });
        }
        found
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("identity", &self.identity)
            .field("implementation", &self.implementation)
            .field("inputs", &self.input_names().collect::<Vec<_>>())
            .field("outputs", &self.output_names().collect::<Vec<_>>())
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// What a running action gets to see.
pub struct WorkContext<'a> {
    pub(crate) identity: &'a str,
    pub(crate) reason: &'a ExecutionReason,
    pub(crate) outputs: &'a [(ArcStr, Utf8PathBuf)],
    /// Span of the running item, use it to report progress.
    pub span: Span,
}

impl WorkContext<'_> {
    pub fn identity(&self) -> &str {
        self.identity
    }

    /// Why the item is executing.
    pub fn reason(&self) -> &ExecutionReason {
        self.reason
    }

    /// Resolved absolute location of the output property `name`.
    pub fn output(&self, name: &str) -> Option<&Utf8Path> {
        self.outputs
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, path)| path.as_path())
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&str, &Utf8Path)> {
        self.outputs.iter().map(|(n, p)| (&**n, p.as_path()))
    }
}
