mod report;

use std::collections::HashMap;
use std::sync::mpsc::channel;
use std::time::Instant;

use petgraph::graph::NodeIndex;
use rayon::ThreadPool;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::Project;
use crate::core::CancellationToken;
use crate::engine::{Executor, WorkOutcome};
use crate::io::{PROGRESS_STYLE, TASK_STYLE};

pub use report::BuildReport;

/// Runs every work item of the project on `pool`, each as soon as all of its
/// dependencies have completed successfully.
///
/// The algorithm works as follows:
/// 1. Items without dependencies are spawned on the pool.
/// 2. The calling thread waits for outcomes on a channel.
/// 3. When an item succeeds or is skipped, the dependency counts of its
///    dependents are decremented, and those reaching zero are spawned.
/// 4. A failed item never releases its dependents, they end up not run.
/// 5. Once cancelled, no new items are spawned and the loop drains the items
///    already running.
pub(crate) fn run_work_parallel(
    project: &Project,
    executor: &Executor<'_>,
    pool: &ThreadPool,
    fail_fast: bool,
    cancel: &CancellationToken,
) -> BuildReport {
    let graph = &project.graph;
    let start = Instant::now();

    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    let mut dependency_counts: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|i| {
            (
                i,
                graph
                    .neighbors_directed(i, petgraph::Direction::Incoming)
                    .count(),
            )
        })
        .collect();

    let total = graph.node_count() as u64;
    if total == 0 {
        return BuildReport::default();
    }

    let root_span = tracing::span!(Level::INFO, "build");
    root_span.pb_set_length(total);
    root_span.pb_set_style(&PROGRESS_STYLE);
    root_span.pb_set_message("Checking work...");
    let _enter = root_span.enter();

    let mut outcomes: HashMap<NodeIndex, WorkOutcome> = HashMap::new();

    // The scheduler loop runs on the calling thread, so a pool of one worker
    // can't deadlock on it.
    pool.in_place_scope(|s| {
        let (sender, receiver) = channel::<(NodeIndex, WorkOutcome)>();

        let spawn_item = |index: NodeIndex| {
            let item = &graph[index];
            let sender = sender.clone();

            s.spawn(move |_| {
                let span = tracing::span!(Level::INFO, "work", identity = &*item.identity);
                span.pb_set_style(&TASK_STYLE);
                span.pb_set_message(&format!("Checking {}", item.identity));
                let _enter = span.enter();

                let outcome = executor.execute(item, span.clone());

                // The receiver outlives every spawned item.
                let _ = sender.send((index, outcome));
            });
        };

        let mut running = 0;
        if !cancel.is_cancelled() {
            for index in graph.node_indices() {
                if dependency_counts.get(&index).copied().unwrap_or(0) == 0 {
                    spawn_item(index);
                    running += 1;
                }
            }
        }

        while running > 0 {
            let Ok((index, outcome)) = receiver.recv() else {
                break;
            };
            running -= 1;
            root_span.pb_inc(1);

            let failed = outcome.is_failed();
            if failed {
                tracing::error!("{} failed. {}", outcome.identity, outcome.reason);
                if fail_fast {
                    cancel.cancel();
                }
            } else {
                tracing::debug!("{} {}", outcome.identity, outcome.outcome);
            }
            outcomes.insert(index, outcome);

            if failed || cancel.is_cancelled() {
                continue;
            }

            if let Some(next) = dependents.get(&index) {
                for &dependent in next {
                    if let Some(count) = dependency_counts.get_mut(&dependent) {
                        *count -= 1;
                        if *count == 0 {
                            spawn_item(dependent);
                            running += 1;
                        }
                    }
                }
            }
        }
    });

    let mut items = Vec::with_capacity(outcomes.len());
    let mut not_run = Vec::new();
    for index in &project.order {
        match outcomes.remove(index) {
            Some(outcome) => items.push(outcome),
            None => not_run.push(graph[*index].identity.clone()),
        }
    }

    if !not_run.is_empty() {
        tracing::warn!("{} work item(s) did not run", not_run.len());
    }

    BuildReport {
        items,
        not_run,
        duration: start.elapsed(),
    }
}
