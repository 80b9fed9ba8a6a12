use std::collections::HashMap;
use std::fmt::{self, Display, Formatter, Write};
use std::time::Duration;

use crate::Project;
use crate::core::ArcStr;
use crate::engine::{Outcome, WorkOutcome};
use crate::error::{BuildError, WorkFailure};

/// What happened to every work item of a build.
///
/// Returned by [`BuildSession::run`](crate::BuildSession::run) even when some
/// items failed. Items are listed in dependency order.
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Outcomes of the items that were attempted.
    pub items: Vec<WorkOutcome>,
    /// Items never attempted, because an upstream item failed or the build
    /// was cancelled.
    pub not_run: Vec<ArcStr>,
    pub duration: Duration,
}

impl BuildReport {
    pub fn outcome(&self, identity: &str) -> Option<&WorkOutcome> {
        self.items.iter().find(|item| &*item.identity == identity)
    }

    fn with_outcome(&self, outcome: Outcome) -> Vec<&str> {
        self.items
            .iter()
            .filter(|item| item.outcome == outcome)
            .map(|item| &*item.identity)
            .collect()
    }

    pub fn executed(&self) -> Vec<&str> {
        self.with_outcome(Outcome::Executed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.with_outcome(Outcome::Skipped)
    }

    pub fn failures(&self) -> Vec<WorkFailure> {
        self.items
            .iter()
            .filter_map(|item| {
                item.failure.as_ref().map(|error| WorkFailure {
                    identity: item.identity.to_string(),
                    error: error.clone(),
                })
            })
            .collect()
    }

    /// Whether every item ran, and none of them failed.
    pub fn is_success(&self) -> bool {
        self.not_run.is_empty() && self.items.iter().all(|item| !item.is_failed())
    }

    pub fn into_result(self) -> Result<Self, BuildError> {
        let failures = self.failures();
        if failures.is_empty() {
            Ok(self)
        } else {
            Err(BuildError::Failed(failures))
        }
    }

    /// Renders the work graph as a Mermaid diagram, color-coded by outcome.
    ///
    /// * **Green to Red**: Executed, from fast to slow
    /// * **Blue**: Up to date
    /// * **Dark red**: Failed
    /// * **Grey**: Not run
    pub fn render_mermaid(&self, project: &Project) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let outcomes: HashMap<&str, &WorkOutcome> = self
            .items
            .iter()
            .map(|item| (&*item.identity, item))
            .collect();

        let executed = self
            .items
            .iter()
            .filter(|item| item.outcome == Outcome::Executed)
            .map(|item| item.duration.as_secs_f64());
        let min_time = executed.clone().fold(f64::MAX, f64::min);
        let max_time = executed.fold(f64::MIN, f64::max);

        let (min_time, max_time) = if min_time > max_time {
            (0.0, 1.0)
        } else if (max_time - min_time).abs() < f64::EPSILON {
            (min_time, min_time + 1.0)
        } else {
            (min_time, max_time)
        };

        for index in project.graph.node_indices() {
            let identity = &*project.graph[index].identity;
            let name = identity.replace('"', "\\\"");

            let (label, color) = match outcomes.get(identity) {
                Some(item) if item.outcome == Outcome::Executed => {
                    let t = (item.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", item.duration), gradient(t))
                }
                Some(item) if item.outcome == Outcome::Skipped => {
                    (item.outcome.to_string(), "#ADD8E6".to_string())
                }
                Some(item) => (item.outcome.to_string(), "#CD5C5C".to_string()),
                None => ("NOT RUN".to_string(), "#D3D3D3".to_string()),
            };

            let _ = writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {:?} fill:{}", index.index(), color);
        }

        for edge in project.graph.raw_edges() {
            let _ = writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            );
        }

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> String {
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{:02X}{:02X}00", r, g)
}

impl Display for BuildReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for item in &self.items {
            writeln!(
                f,
                "{:<11} {} ({:.2?})",
                item.outcome.to_string(),
                item.identity,
                item.duration
            )?;
            if let Some(error) = &item.failure {
                for line in error.to_string().lines() {
                    writeln!(f, "            {line}")?;
                }
            }
        }

        for identity in &self.not_run {
            writeln!(f, "{:<11} {}", "NOT RUN", identity)?;
        }

        write!(
            f,
            "{} executed, {} up to date, {} failed, {} not run in {:.2?}",
            self.executed().len(),
            self.skipped().len(),
            self.failures().len(),
            self.not_run.len(),
            self.duration
        )
    }
}
