use std::fmt::{self, Write};

use camino::Utf8PathBuf;

use crate::core::ArcStr;
use crate::error::ConflictError;
use crate::snapshot::LocatedSnapshot;
use crate::store::{ExecutionRecord, InputFingerprint, OutputFilesRepository};

/// Why a work item has to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionReason {
    NoHistory,
    ImplementationChanged { previous: String, current: String },
    PreviousExecutionFailed,
    UnknownInputProducer { property: String },
    InputAdded { property: String },
    InputRemoved { property: String },
    InputChanged {
        property: String,
        expected: String,
        actual: String,
    },
    OutputPropertiesChanged,
    OutputChanged { property: String, path: Utf8PathBuf },
    OutputRemoved { property: String, path: Utf8PathBuf },
}

impl fmt::Display for ExecutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionReason::NoHistory => f.write_str("No history is available."),
            ExecutionReason::ImplementationChanged { previous, current } => write!(
                f,
                "The implementation has changed from '{previous}' to '{current}'."
            ),
            ExecutionReason::PreviousExecutionFailed => {
                f.write_str("The previous execution failed.")
            }
            ExecutionReason::UnknownInputProducer { property } => write!(
                f,
                "Input property '{property}' is produced by something the build can't track."
            ),
            ExecutionReason::InputAdded { property } => {
                write!(f, "Input property '{property}' has been added.")
            }
            ExecutionReason::InputRemoved { property } => {
                write!(f, "Input property '{property}' has been removed.")
            }
            ExecutionReason::InputChanged {
                property,
                expected,
                actual,
            } => write!(
                f,
                "Input property '{property}' has changed (expected {expected}, was {actual})."
            ),
            ExecutionReason::OutputPropertiesChanged => {
                f.write_str("The output properties have changed.")
            }
            ExecutionReason::OutputChanged { property, path } => write!(
                f,
                "Output property '{property}' at '{path}' has been modified since it was produced."
            ),
            ExecutionReason::OutputRemoved { property, path } => write!(
                f,
                "Output property '{property}' at '{path}' has been removed."
            ),
        }
    }
}

/// Outcome of an up-to-date check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decision {
    Skip {
        explanation: String,
    },
    Execute {
        reason: ExecutionReason,
        /// Registered outputs to delete before the action runs.
        cleanup: Vec<Utf8PathBuf>,
    },
}

/// State of a work item right before its check.
pub(crate) struct Current<'a> {
    pub identity: &'a str,
    pub implementation: &'a str,
    pub inputs: &'a [(ArcStr, InputFingerprint)],
    /// Inputs whose producer can't be fully named, in declared order.
    pub untracked: &'a [ArcStr],
    pub outputs: &'a [(ArcStr, LocatedSnapshot)],
}

/// Decides whether a work item may be skipped.
///
/// Checks run in a fixed order and the first mismatch wins: history,
/// implementation, previous failure, untracked inputs, inputs, outputs.
/// Properties are compared in declared order. Output tampering is inspected
/// even when an earlier check already forces execution, an output that changed
/// on disk without being registered is never overwritten.
pub(crate) fn decide(
    current: &Current<'_>,
    previous: Option<&ExecutionRecord>,
    registry: &OutputFilesRepository,
) -> Result<Decision, ConflictError> {
    let Some(previous) = previous else {
        return Ok(Decision::Execute {
            reason: ExecutionReason::NoHistory,
            cleanup: stale_outputs(current, registry),
        });
    };

    let outputs = compare_outputs(current, previous, registry)?;

    let reason = if previous.implementation != current.implementation {
        ExecutionReason::ImplementationChanged {
            previous: previous.implementation.clone(),
            current: current.implementation.to_string(),
        }
    } else if !previous.successful {
        ExecutionReason::PreviousExecutionFailed
    } else if let Some(property) = current.untracked.first() {
        ExecutionReason::UnknownInputProducer {
            property: property.to_string(),
        }
    } else if let Some(reason) = compare_inputs(current, previous) {
        reason
    } else if let Some(reason) = outputs {
        reason
    } else {
        return Ok(Decision::Skip {
            explanation: explain(current),
        });
    };

    Ok(Decision::Execute {
        reason,
        cleanup: stale_outputs(current, registry),
    })
}

/// Outputs present on disk that the build owns and may delete.
fn stale_outputs(current: &Current<'_>, registry: &OutputFilesRepository) -> Vec<Utf8PathBuf> {
    current
        .outputs
        .iter()
        .filter(|(_, output)| !output.snapshot.is_missing())
        .filter(|(_, output)| registry.is_generated_by_build(&output.path))
        .map(|(_, output)| output.path.clone())
        .collect()
}

fn compare_inputs(current: &Current<'_>, previous: &ExecutionRecord) -> Option<ExecutionReason> {
    for (name, fingerprint) in current.inputs {
        let Some(recorded) = previous.input(name) else {
            return Some(ExecutionReason::InputAdded {
                property: name.to_string(),
            });
        };

        let (expected, actual) = (recorded.digest(), fingerprint.digest());
        if expected != actual {
            return Some(ExecutionReason::InputChanged {
                property: name.to_string(),
                expected: expected.short(),
                actual: actual.short(),
            });
        }
    }

    previous
        .inputs
        .iter()
        .find(|(name, _)| !current.inputs.iter().any(|(n, _)| **n == **name))
        .map(|(name, _)| ExecutionReason::InputRemoved {
            property: name.clone(),
        })
}

fn compare_outputs(
    current: &Current<'_>,
    previous: &ExecutionRecord,
    registry: &OutputFilesRepository,
) -> Result<Option<ExecutionReason>, ConflictError> {
    let same_properties = current.outputs.len() == previous.outputs.len()
        && current
            .outputs
            .iter()
            .zip(&previous.outputs)
            .all(|((a, x), (b, y))| **a == **b && x.path == y.path);

    if !same_properties {
        return Ok(Some(ExecutionReason::OutputPropertiesChanged));
    }

    let mut reason = None;

    for ((name, now), (_, then)) in current.outputs.iter().zip(&previous.outputs) {
        if now.identity() == then.identity() {
            continue;
        }

        if now.snapshot.is_missing() {
            reason.get_or_insert_with(|| ExecutionReason::OutputRemoved {
                property: name.to_string(),
                path: now.path.clone(),
            });
            continue;
        }

        if !registry.is_generated_by_build(&now.path) {
            return Err(ConflictError::ForeignOutput {
                identity: current.identity.to_string(),
                path: now.path.clone(),
            });
        }

        reason.get_or_insert_with(|| ExecutionReason::OutputChanged {
            property: name.to_string(),
            path: now.path.clone(),
        });
    }

    Ok(reason)
}

fn explain(current: &Current<'_>) -> String {
    let mut explanation = String::from("Up to date:");

    for (name, fingerprint) in current.inputs {
        let _ = write!(
            explanation,
            " input '{}' = {};",
            name,
            fingerprint.digest().short()
        );
    }
    for (name, output) in current.outputs {
        let _ = write!(
            explanation,
            " output '{}' = {};",
            name,
            output.identity().short()
        );
    }

    explanation.pop();
    explanation
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::Hash32;
    use crate::snapshot::Snapshotter;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        registry: OutputFilesRepository,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let registry = OutputFilesRepository::open(root.join("cache/outputs.bin")).unwrap();
        Fixture {
            _dir: dir,
            root,
            registry,
        }
    }

    fn inputs(message: &str) -> Vec<(ArcStr, InputFingerprint)> {
        vec![(
            "message".into(),
            InputFingerprint::Value(Hash32::hash(message)),
        )]
    }

    fn outputs(root: &Utf8PathBuf) -> Vec<(ArcStr, LocatedSnapshot)> {
        let snapshot = Snapshotter::default()
            .snapshot_located(&root.join("out.txt"))
            .unwrap();
        vec![("out".into(), snapshot)]
    }

    fn record(
        inputs: &[(ArcStr, InputFingerprint)],
        outputs: &[(ArcStr, LocatedSnapshot)],
        successful: bool,
    ) -> ExecutionRecord {
        ExecutionRecord {
            identity: ":write".to_string(),
            implementation: "v1".to_string(),
            inputs: inputs.iter().map(|(n, f)| (n.to_string(), f.clone())).collect(),
            outputs: outputs.iter().map(|(n, s)| (n.to_string(), s.clone())).collect(),
            successful,
        }
    }

    fn current<'a>(
        inputs: &'a [(ArcStr, InputFingerprint)],
        outputs: &'a [(ArcStr, LocatedSnapshot)],
    ) -> Current<'a> {
        Current {
            identity: ":write",
            implementation: "v1",
            inputs,
            untracked: &[],
            outputs,
        }
    }

    fn produce(fx: &Fixture, content: &str) -> Vec<(ArcStr, LocatedSnapshot)> {
        fs::write(fx.root.join("out.txt"), content).unwrap();
        let outputs = outputs(&fx.root);
        fx.registry
            .record_outputs(outputs.iter().map(|(_, s)| s))
            .unwrap();
        outputs
    }

    #[test]
    fn test_no_history() {
        let fx = fixture();
        let inputs = inputs("hi");
        let outputs = outputs(&fx.root);

        let decision = decide(&current(&inputs, &outputs), None, &fx.registry).unwrap();
        assert_eq!(
            decision,
            Decision::Execute {
                reason: ExecutionReason::NoHistory,
                cleanup: vec![],
            }
        );
    }

    #[test]
    fn test_unchanged_is_skipped() {
        let fx = fixture();
        let inputs = inputs("hi");
        let outputs = produce(&fx, "v1");
        let previous = record(&inputs, &outputs, true);

        let decision = decide(&current(&inputs, &outputs), Some(&previous), &fx.registry).unwrap();
        let Decision::Skip { explanation } = decision else {
            panic!("expected a skip, got {decision:?}");
        };
        assert!(explanation.contains("input 'message'"));
        assert!(explanation.contains("output 'out'"));
    }

    #[test]
    fn test_input_change_names_property() {
        let fx = fixture();
        let outputs = produce(&fx, "v1");
        let previous = record(&inputs("hi"), &outputs, true);
        let changed = inputs("bye");

        let decision = decide(&current(&changed, &outputs), Some(&previous), &fx.registry).unwrap();
        let Decision::Execute { reason, cleanup } = decision else {
            panic!("expected an execution");
        };
        assert!(matches!(reason, ExecutionReason::InputChanged { ref property, .. } if property == "message"));
        assert_eq!(cleanup, vec![fx.root.join("out.txt")]);
    }

    #[test]
    fn test_input_added_and_removed() {
        let fx = fixture();
        let outputs = produce(&fx, "v1");
        let previous = record(&inputs("hi"), &outputs, true);

        let mut more = inputs("hi");
        more.push(("extra".into(), InputFingerprint::Absent));
        let decision = decide(&current(&more, &outputs), Some(&previous), &fx.registry).unwrap();
        assert!(matches!(
            decision,
            Decision::Execute {
                reason: ExecutionReason::InputAdded { .. },
                ..
            }
        ));

        let decision = decide(&current(&[], &outputs), Some(&previous), &fx.registry).unwrap();
        assert!(matches!(
            decision,
            Decision::Execute {
                reason: ExecutionReason::InputRemoved { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_implementation_change() {
        let fx = fixture();
        let inputs = inputs("hi");
        let outputs = produce(&fx, "v1");
        let mut previous = record(&inputs, &outputs, true);
        previous.implementation = "v0".to_string();

        let decision = decide(&current(&inputs, &outputs), Some(&previous), &fx.registry).unwrap();
        assert!(matches!(
            decision,
            Decision::Execute {
                reason: ExecutionReason::ImplementationChanged { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_failed_execution_forces_rerun() {
        let fx = fixture();
        let inputs = inputs("hi");
        let outputs = produce(&fx, "v1");
        let previous = record(&inputs, &outputs, false);

        let decision = decide(&current(&inputs, &outputs), Some(&previous), &fx.registry).unwrap();
        assert!(matches!(
            decision,
            Decision::Execute {
                reason: ExecutionReason::PreviousExecutionFailed,
                ..
            }
        ));
    }

    #[test]
    fn test_untracked_input_forces_rerun() {
        let fx = fixture();
        let inputs = inputs("hi");
        let outputs = produce(&fx, "v1");
        let previous = record(&inputs, &outputs, true);
        let untracked = [ArcStr::from("message")];

        let current = Current {
            untracked: &untracked,
            ..current(&inputs, &outputs)
        };
        let decision = decide(&current, Some(&previous), &fx.registry).unwrap();
        assert!(matches!(
            decision,
            Decision::Execute {
                reason: ExecutionReason::UnknownInputProducer { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_tampered_registered_output() {
        let fx = fixture();
        let inputs = inputs("hi");
        let produced = produce(&fx, "v1");
        let previous = record(&inputs, &produced, true);

        fs::write(fx.root.join("out.txt"), "v2").unwrap();
        let now = outputs(&fx.root);

        let decision = decide(&current(&inputs, &now), Some(&previous), &fx.registry).unwrap();
        let Decision::Execute { reason, cleanup } = decision else {
            panic!("expected an execution");
        };
        assert!(matches!(reason, ExecutionReason::OutputChanged { .. }));
        assert_eq!(cleanup, vec![fx.root.join("out.txt")]);
    }

    #[test]
    fn test_removed_output() {
        let fx = fixture();
        let inputs = inputs("hi");
        let produced = produce(&fx, "v1");
        let previous = record(&inputs, &produced, true);

        fs::remove_file(fx.root.join("out.txt")).unwrap();
        let now = outputs(&fx.root);

        let decision = decide(&current(&inputs, &now), Some(&previous), &fx.registry).unwrap();
        let Decision::Execute { reason, cleanup } = decision else {
            panic!("expected an execution");
        };
        assert!(matches!(reason, ExecutionReason::OutputRemoved { .. }));
        assert!(cleanup.is_empty());
    }

    #[test]
    fn test_foreign_output_is_a_conflict() {
        let fx = fixture();
        let inputs = inputs("hi");
        fs::write(fx.root.join("out.txt"), "v1").unwrap();
        let produced = outputs(&fx.root);
        let previous = record(&inputs, &produced, true);

        fs::write(fx.root.join("out.txt"), "user data").unwrap();
        let now = outputs(&fx.root);

        let err = decide(&current(&inputs, &now), Some(&previous), &fx.registry).unwrap_err();
        assert_eq!(
            err,
            ConflictError::ForeignOutput {
                identity: ":write".to_string(),
                path: fx.root.join("out.txt"),
            }
        );
        assert_eq!(fs::read_to_string(fx.root.join("out.txt")).unwrap(), "user data");
    }

    #[test]
    fn test_moved_output_property() {
        let fx = fixture();
        let inputs = inputs("hi");
        let produced = produce(&fx, "v1");
        let previous = record(&inputs, &produced, true);

        let moved = vec![(
            ArcStr::from("out"),
            Snapshotter::default()
                .snapshot_located(&fx.root.join("elsewhere.txt"))
                .unwrap(),
        )];

        let decision = decide(&current(&inputs, &moved), Some(&previous), &fx.registry).unwrap();
        assert!(matches!(
            decision,
            Decision::Execute {
                reason: ExecutionReason::OutputPropertiesChanged,
                ..
            }
        ));
    }
}
