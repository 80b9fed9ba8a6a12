use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use tracing::Span;

use crate::core::ArcStr;
use crate::engine::checker::{Current, Decision, ExecutionReason, decide};
use crate::error::{ConflictError, ExecutionError};
use crate::snapshot::{LocatedSnapshot, Snapshotter};
use crate::store::{ExecutionRecord, InputFingerprint, Store};
use crate::work::{OutputKind, WorkContext, WorkItem};

/// Lifecycle of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    NotStarted,
    Checking,
    Skipped,
    Executing,
    Succeeded,
    Failed,
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkState::NotStarted => "not started",
            WorkState::Checking => "checking",
            WorkState::Skipped => "skipped",
            WorkState::Executing => "executing",
            WorkState::Succeeded => "succeeded",
            WorkState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Skipped,
    Executed,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Skipped => f.write_str("UP-TO-DATE"),
            Outcome::Executed => f.write_str("EXECUTED"),
            Outcome::Failed => f.write_str("FAILED"),
        }
    }
}

/// Result of one execution attempt, as reported to the caller.
#[derive(Debug, Clone)]
pub struct WorkOutcome {
    pub identity: ArcStr,
    pub outcome: Outcome,
    /// Why the item executed, or why it was skipped.
    pub reason: String,
    /// Output snapshots after the attempt. For skipped items these are the
    /// recorded ones.
    pub outputs: Vec<(String, LocatedSnapshot)>,
    pub start: Instant,
    pub duration: Duration,
    pub failure: Option<Arc<ExecutionError>>,
}

impl WorkOutcome {
    pub fn is_failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }
}

/// Checks, executes and records work items against one store.
pub struct Executor<'a> {
    store: &'a Store,
    snapshotter: Snapshotter,
    in_flight: Mutex<HashSet<ArcStr>>,
}

/// Marks an identity as in flight until dropped.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<ArcStr>>,
    identity: ArcStr,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.identity);
    }
}

impl<'a> Executor<'a> {
    pub fn new(store: &'a Store, snapshotter: Snapshotter) -> Self {
        Self {
            store,
            snapshotter,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, identity: &ArcStr) -> Result<Claim<'_>, ConflictError> {
        if !self.in_flight.lock().insert(identity.clone()) {
            return Err(ConflictError::DuplicateIdentity(identity.to_string()));
        }

        Ok(Claim {
            in_flight: &self.in_flight,
            identity: identity.clone(),
        })
    }

    /// Runs one work item through check, execution and recording. Never
    /// panics on behalf of user code, failures end up in the outcome.
    pub fn execute(&self, item: &WorkItem, span: Span) -> WorkOutcome {
        let start = Instant::now();

        // Providers run user closures during the check, outside the action.
        let attempt = catch_unwind(AssertUnwindSafe(|| self.try_execute(item, span)))
            .unwrap_or_else(|panic| {
                Err(ExecutionError::Panic(format!(
                    "Work item panicked while checking: {}",
                    panic_message(panic.as_ref())
                )))
            });

        let (outcome, reason, outputs, failure) = match attempt {
            Ok(Attempt::Skipped {
                explanation,
                outputs,
            }) => (Outcome::Skipped, explanation, outputs, None),
            Ok(Attempt::Executed { reason, outputs }) => {
                (Outcome::Executed, reason.to_string(), outputs, None)
            }
            Ok(Attempt::Failed {
                reason,
                outputs,
                error,
            }) => (
                Outcome::Failed,
                reason.to_string(),
                outputs,
                Some(Arc::new(error)),
            ),
            Err(error) => (
                Outcome::Failed,
                String::from("The up-to-date check failed."),
                Vec::new(),
                Some(Arc::new(error)),
            ),
        };

        WorkOutcome {
            identity: item.identity.clone(),
            outcome,
            reason,
            outputs,
            start,
            duration: start.elapsed(),
            failure,
        }
    }

    fn try_execute(&self, item: &WorkItem, span: Span) -> Result<Attempt, ExecutionError> {
        let _claim = self.claim(&item.identity)?;
        let mut state = WorkState::NotStarted;
        transition(item, &mut state, WorkState::Checking);

        let locations = self.resolve_outputs(item)?;

        let mut inputs = Vec::with_capacity(item.inputs.len());
        let mut untracked = Vec::new();
        for input in &item.inputs {
            if input.source.producer().has_unknown() {
                untracked.push(input.name.clone());
            }
            let fingerprint = input.source.fingerprint(&input.name, &self.snapshotter)?;
            inputs.push((input.name.clone(), fingerprint));
        }

        let before = self.snapshot_outputs(&locations)?;
        let previous = self.store.history().get(&item.identity);

        let current = Current {
            identity: &item.identity,
            implementation: &item.implementation,
            inputs: &inputs,
            untracked: &untracked,
            outputs: &before,
        };

        let (reason, cleanup) = match decide(&current, previous.as_deref(), self.store.outputs())? {
            Decision::Skip { explanation } => {
                transition(item, &mut state, WorkState::Skipped);
                tracing::debug!("{} is up to date. {}", item.identity, explanation);

                let outputs = previous.map(|r| r.outputs.clone()).unwrap_or_default();
                return Ok(Attempt::Skipped {
                    explanation,
                    outputs,
                });
            }
            Decision::Execute { reason, cleanup } => (reason, cleanup),
        };

        tracing::info!("Executing {}. {}", item.identity, reason);
        transition(item, &mut state, WorkState::Executing);

        for path in &cleanup {
            tracing::debug!("Removing stale output {}", path);
            crate::io::remove_path(path).map_err(|source| ExecutionError::Cleanup {
                path: path.clone(),
                source,
            })?;
        }

        for (_, kind, path) in &locations {
            prepare(*kind, path)?;
        }

        let resolved: Vec<_> = locations
            .iter()
            .map(|(name, _, path)| (name.clone(), path.clone()))
            .collect();

        let context = WorkContext {
            identity: &item.identity,
            reason: &reason,
            outputs: &resolved,
            span,
        };

        let result = run_action(item, &context);
        let after = self.snapshot_outputs(&locations)?;
        self.record(item, inputs, &after, result.is_ok())?;

        let outputs = after
            .into_iter()
            .map(|(name, snapshot)| (name.to_string(), snapshot))
            .collect();

        match result {
            Ok(()) => {
                transition(item, &mut state, WorkState::Succeeded);
                Ok(Attempt::Executed { reason, outputs })
            }
            Err(e) => {
                transition(item, &mut state, WorkState::Failed);
                Ok(Attempt::Failed {
                    reason,
                    outputs,
                    error: ExecutionError::Action(e),
                })
            }
        }
    }

    fn resolve_outputs(
        &self,
        item: &WorkItem,
    ) -> Result<Vec<(ArcStr, OutputKind, Utf8PathBuf)>, ExecutionError> {
        item.outputs
            .iter()
            .map(|output| {
                let path = output
                    .location
                    .get()
                    .map_err(|e| ExecutionError::Output(output.name.to_string(), e))?;
                let path = crate::io::absolute(&path).map_err(|source| {
                    ExecutionError::Prepare {
                        path: path.clone(),
                        source,
                    }
                })?;
                Ok((output.name.clone(), output.kind, path))
            })
            .collect()
    }

    fn snapshot_outputs(
        &self,
        locations: &[(ArcStr, OutputKind, Utf8PathBuf)],
    ) -> Result<Vec<(ArcStr, LocatedSnapshot)>, ExecutionError> {
        locations
            .iter()
            .map(|(name, _, path)| Ok((name.clone(), self.snapshotter.snapshot_located(path)?)))
            .collect()
    }

    /// Records the attempt in the store. Both changes reach the disk when the
    /// store is flushed.
    fn record(
        &self,
        item: &WorkItem,
        inputs: Vec<(ArcStr, InputFingerprint)>,
        outputs: &[(ArcStr, LocatedSnapshot)],
        successful: bool,
    ) -> Result<(), ExecutionError> {
        let record = ExecutionRecord {
            identity: item.identity.to_string(),
            implementation: item.implementation.clone(),
            inputs: inputs
                .into_iter()
                .map(|(name, fingerprint)| (name.to_string(), fingerprint))
                .collect(),
            outputs: outputs
                .iter()
                .map(|(name, snapshot)| (name.to_string(), snapshot.clone()))
                .collect(),
            successful,
        };

        self.store.history().put(record)?;
        self.store
            .outputs()
            .record_outputs(outputs.iter().map(|(_, snapshot)| snapshot))?;

        Ok(())
    }
}

enum Attempt {
    Skipped {
        explanation: String,
        outputs: Vec<(String, LocatedSnapshot)>,
    },
    Executed {
        reason: ExecutionReason,
        outputs: Vec<(String, LocatedSnapshot)>,
    },
    Failed {
        reason: ExecutionReason,
        outputs: Vec<(String, LocatedSnapshot)>,
        error: ExecutionError,
    },
}

fn transition(item: &WorkItem, state: &mut WorkState, next: WorkState) {
    tracing::trace!("{}: {} -> {}", item.identity, state, next);
    *state = next;
}

fn prepare(kind: OutputKind, path: &Utf8PathBuf) -> Result<(), ExecutionError> {
    let dir = match kind {
        OutputKind::File => path.parent(),
        OutputKind::Directory => Some(path.as_path()),
    };

    if let Some(dir) = dir {
        fs::create_dir_all(dir).map_err(|source| ExecutionError::Prepare {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    Ok(())
}

fn run_action(item: &WorkItem, context: &WorkContext<'_>) -> anyhow::Result<()> {
    // The action only sees shared references, a panic can't leave the
    // executor's own state half-updated.
    match catch_unwind(AssertUnwindSafe(|| (item.action)(context))) {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "Work item panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use crate::work::{InputProperty, OutputProperty, ValueInput};

    fn root(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    fn writer(out: Utf8PathBuf, message: &str) -> WorkItem {
        let content = message.to_string();
        WorkItem {
            identity: ":write".into(),
            implementation: "v1".to_string(),
            inputs: vec![InputProperty {
                name: "message".into(),
                source: Box::new(ValueInput::new(Provider::of(message.to_string()))),
            }],
            outputs: vec![OutputProperty {
                name: "out".into(),
                kind: OutputKind::File,
                location: Provider::of(out),
            }],
            dependencies: vec![],
            action: Box::new(move |ctx: &WorkContext<'_>| {
                let path = ctx.output("out").unwrap();
                fs::write(path, &content)?;
                Ok(())
            }),
        }
    }

    #[test]
    fn test_execute_then_skip() {
        let dir = tempfile::tempdir().unwrap();
        let root = root(&dir);
        let store = Store::open(&root.join("cache")).unwrap();
        let executor = Executor::new(&store, Snapshotter::default());
        let item = writer(root.join("build/out.txt"), "hello");

        let first = executor.execute(&item, Span::none());
        assert_eq!(first.outcome, Outcome::Executed);
        assert_eq!(first.reason, ExecutionReason::NoHistory.to_string());
        assert_eq!(
            fs::read_to_string(root.join("build/out.txt")).unwrap(),
            "hello"
        );

        let second = executor.execute(&item, Span::none());
        assert_eq!(second.outcome, Outcome::Skipped);
        assert_eq!(second.outputs[0].1.identity(), first.outputs[0].1.identity());
        assert!(store.outputs().is_generated_by_build(&root.join("build/out.txt")));
    }

    #[test]
    fn test_panic_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let root = root(&dir);
        let store = Store::open(&root.join("cache")).unwrap();
        let executor = Executor::new(&store, Snapshotter::default());

        let mut item = writer(root.join("out.txt"), "x");
        item.action = Box::new(|_: &WorkContext<'_>| -> crate::work::WorkResult { panic!("kaboom") });

        let outcome = executor.execute(&item, Span::none());
        assert!(outcome.is_failed());
        assert!(
            outcome
                .failure
                .unwrap()
                .to_string()
                .contains("Work item panicked: kaboom")
        );

        let record = store.history().get(":write").unwrap();
        assert!(!record.successful);
    }

    #[test]
    fn test_panicking_input_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let root = root(&dir);
        let store = Store::open(&root.join("cache")).unwrap();
        let executor = Executor::new(&store, Snapshotter::default());

        let mut item = writer(root.join("out.txt"), "x");
        let broken = Provider::of(1u32).map(|_| -> u32 { panic!("no value today") });
        item.inputs[0].source = Box::new(ValueInput::new(broken));

        let outcome = executor.execute(&item, Span::none());
        assert!(outcome.is_failed());
        assert!(matches!(
            outcome.failure.as_deref(),
            Some(ExecutionError::Panic(message)) if message.contains("no value today")
        ));
        assert!(store.history().get(":write").is_none());

        // The identity is released again.
        assert!(executor.claim(&ArcStr::from(":write")).is_ok());
    }

    #[test]
    fn test_duplicate_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&root(&dir).join("cache")).unwrap();
        let executor = Executor::new(&store, Snapshotter::default());

        let identity = ArcStr::from(":write");
        let _claim = executor.claim(&identity).unwrap();
        assert!(matches!(
            executor.claim(&identity),
            Err(ConflictError::DuplicateIdentity(_))
        ));
    }

    #[test]
    fn test_missing_output_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&root(&dir).join("cache")).unwrap();
        let executor = Executor::new(&store, Snapshotter::default());

        let mut item = writer(root(&dir).join("out.txt"), "x");
        item.outputs[0].location = Provider::not_defined();

        let outcome = executor.execute(&item, Span::none());
        assert!(outcome.is_failed());
        assert!(matches!(
            outcome.failure.as_deref(),
            Some(ExecutionError::Output(name, _)) if name == "out"
        ));
    }
}
