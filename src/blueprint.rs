use std::any::type_name;
use std::collections::{HashMap, HashSet};
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::config::Settings;
use crate::core::ArcStr;
use crate::engine::BuildReport;
use crate::error::{BuildError, ConflictError, KilnError, ProviderError};
use crate::provider::Provider;
use crate::session::BuildSession;
use crate::work::{
    FileInput, InputProperty, InputSource, OutputKind, OutputProperty, ValueInput, WorkContext,
    WorkItem, WorkResult,
};

/// The blueprint for a build.
///
/// `Blueprint` collects work items together with their declared inputs and
/// outputs. Items are wired together through their [`WorkHandle`]s: feeding
/// the output of one item into an input of another is enough to order them.
///
/// Once configured, [`finish`](Blueprint::finish) validates the graph and
/// turns it into a [`Project`] that can be built.
///
/// # Example
///
/// ```rust,no_run
/// use kiln::{Blueprint, Settings};
///
/// let mut blueprint = Blueprint::new();
///
/// let greeting = blueprint
///     .work(":greet")
///     .input_value("message", &kiln::Provider::of("hello".to_string()))
///     .output_file("out", "build/greeting.txt")
///     .run(|ctx| {
///         std::fs::write(ctx.output("out").unwrap(), "hello")?;
///         Ok(())
///     });
///
/// blueprint
///     .work(":shout")
///     .input_file("greeting", &greeting.output("out").unwrap())
///     .output_file("out", "build/shout.txt")
///     .run(|ctx| Ok(()));
///
/// let report = blueprint.finish()?.build(&Settings::default())?;
/// println!("{report}");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct Blueprint {
    items: Vec<WorkItem>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts declaring a work item named `identity`.
    pub fn work(&mut self, identity: impl Into<ArcStr>) -> WorkDef<'_> {
        WorkDef {
            blueprint: self,
            identity: identity.into(),
            implementation: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// Validates the declared work items and builds the work graph.
    ///
    /// Fails on duplicate identities, dependencies on unknown work items,
    /// cycles and outputs claimed by more than one work item.
    pub fn finish(self) -> Result<Project, BuildError> {
        let mut graph = Graph::new();
        let mut indices = HashMap::new();

        for item in self.items {
            let identity = item.identity.clone();
            if indices.contains_key(&identity) {
                return Err(ConflictError::DuplicateIdentity(identity.to_string()).into());
            }
            indices.insert(identity, graph.add_node(item));
        }

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let item: &WorkItem = &graph[index];

            if item.consumes_own_output() {
                return Err(BuildError::Cycle(item.identity.to_string()));
            }

            for dependency in item.upstream() {
                let Some(&source) = indices.get(&dependency) else {
                    return Err(BuildError::UnknownDependency {
                        identity: item.identity.to_string(),
                        dependency: dependency.to_string(),
                    });
                };
                edges.push((source, index));
            }
        }

        for (source, target) in edges {
            graph.add_edge(source, target, ());
        }

        let order = petgraph::algo::toposort(&graph, None)
            .map_err(|cycle| BuildError::Cycle(graph[cycle.node_id()].identity.to_string()))?;

        check_overlaps(&graph)?;

        Ok(Project { graph, order })
    }
}

/// Rejects output locations claimed by two different work items, including
/// one item writing inside another's output directory.
fn check_overlaps(graph: &Graph<WorkItem, ()>) -> Result<(), BuildError> {
    let mut claims = Vec::new();

    for item in graph.node_weights() {
        for output in &item.outputs {
            let etv = output
                .location
                .calculate_execution_time_value()
                .map_err(|e| {
                    BuildError::OutputLocation(item.identity.to_string(), output.name.to_string(), e)
                })?;

            if etv.is_missing() {
                return Err(BuildError::OutputLocation(
                    item.identity.to_string(),
                    output.name.to_string(),
                    ProviderError::Missing(vec![output.name.clone()]),
                ));
            }

            // Locations only known at execution time can't be checked here.
            if let Some(path) = etv.fixed_value() {
                let path = crate::io::absolute(path)
                    .unwrap_or_else(|_| crate::io::normalize_path(path));
                claims.push((path, &item.identity));
            }
        }
    }

    claims.sort();

    let mut ancestors: Vec<(&Utf8Path, &ArcStr)> = Vec::new();
    for (path, identity) in &claims {
        while let Some((top, _)) = ancestors.last() {
            if path.starts_with(top) {
                break;
            }
            ancestors.pop();
        }

        if let Some((_, owner)) = ancestors.iter().find(|(_, owner)| *owner != *identity) {
            return Err(ConflictError::OverlappingOutputs {
                first: owner.to_string(),
                second: identity.to_string(),
                path: path.clone(),
            }
            .into());
        }

        ancestors.push((path.as_path(), *identity));
    }

    Ok(())
}

/// Declaration of one work item, consumed by [`run`](WorkDef::run).
pub struct WorkDef<'a> {
    blueprint: &'a mut Blueprint,
    identity: ArcStr,
    implementation: Option<String>,
    inputs: Vec<InputProperty>,
    outputs: Vec<OutputProperty>,
    dependencies: Vec<ArcStr>,
}

impl<'a> WorkDef<'a> {
    /// Fingerprint of the code behind the action. Changing it forces the item
    /// to execute.
    ///
    /// Defaults to the type name of the action. For a closure that is a path
    /// like `my_crate::build::{{closure}}`, which stays the same when the body
    /// of the closure is edited. Pass a fingerprint that changes with the
    /// code, such as a version or a hash of the relevant sources, whenever
    /// edits to the action must invalidate its history.
    pub fn implementation(mut self, fingerprint: impl Into<String>) -> Self {
        self.implementation = Some(fingerprint.into());
        self
    }

    pub fn input(mut self, name: impl Into<ArcStr>, source: impl InputSource + 'static) -> Self {
        self.inputs.push(InputProperty {
            name: name.into(),
            source: Box::new(source),
        });
        self
    }

    /// A scalar input, compared by the digest of its serialized value.
    pub fn input_value<T>(self, name: impl Into<ArcStr>, value: &Provider<T>) -> Self
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        self.input(name, ValueInput::new(value.clone()))
    }

    pub fn input_file(self, name: impl Into<ArcStr>, path: &Provider<Utf8PathBuf>) -> Self {
        self.input(name, FileInput::new(path.map(|path| vec![path])))
    }

    pub fn input_files(self, name: impl Into<ArcStr>, paths: &Provider<Vec<Utf8PathBuf>>) -> Self {
        self.input(name, FileInput::new(paths.clone()))
    }

    pub fn input_path(self, name: impl Into<ArcStr>, path: impl Into<Utf8PathBuf>) -> Self {
        self.input(name, FileInput::new(Provider::of(vec![path.into()])))
    }

    /// Every file matching `pattern`, expanded anew before each check.
    pub fn input_glob(self, name: impl Into<ArcStr>, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let paths = Provider::from_fn(move || {
            let mut paths = Vec::new();
            for entry in glob::glob(&pattern)? {
                let path = entry?;
                let path = Utf8PathBuf::try_from(path)?;
                if path.is_file() {
                    paths.push(path);
                }
            }
            paths.sort();
            Ok(Some(paths))
        });
        self.input(name, FileInput::new(paths))
    }

    pub fn output_file(self, name: impl Into<ArcStr>, path: impl Into<Utf8PathBuf>) -> Self {
        let location = Provider::produced_by(self.identity.clone(), path.into());
        self.output_location(name, OutputKind::File, location)
    }

    pub fn output_dir(self, name: impl Into<ArcStr>, path: impl Into<Utf8PathBuf>) -> Self {
        let location = Provider::produced_by(self.identity.clone(), path.into());
        self.output_location(name, OutputKind::Directory, location)
    }

    /// An output whose location is computed by a provider.
    pub fn output_location(
        mut self,
        name: impl Into<ArcStr>,
        kind: OutputKind,
        location: Provider<Utf8PathBuf>,
    ) -> Self {
        self.outputs.push(OutputProperty {
            name: name.into(),
            kind,
            location,
        });
        self
    }

    pub fn depends_on(mut self, handle: &WorkHandle) -> Self {
        self.dependencies.push(handle.identity.clone());
        self
    }

    /// Depends on a work item by identity, for items declared later.
    pub fn depends_on_identity(mut self, identity: impl Into<ArcStr>) -> Self {
        self.dependencies.push(identity.into());
        self
    }

    pub fn run<F>(self, action: F) -> WorkHandle
    where
        F: Fn(&WorkContext<'_>) -> WorkResult + Send + Sync + 'static,
    {
        let handle = WorkHandle {
            identity: self.identity.clone(),
            outputs: self
                .outputs
                .iter()
                .map(|output| {
                    let location = output.location.clone();
                    (output.name.clone(), location)
                })
                .collect(),
        };

        self.blueprint.items.push(WorkItem {
            identity: self.identity,
            implementation: self
                .implementation
                .unwrap_or_else(|| type_name::<F>().to_string()),
            inputs: self.inputs,
            outputs: self.outputs,
            dependencies: self.dependencies,
            action: Box::new(action),
        });

        handle
    }
}

/// Reference to a declared work item.
#[derive(Debug, Clone)]
pub struct WorkHandle {
    identity: ArcStr,
    outputs: Vec<(ArcStr, Provider<Utf8PathBuf>)>,
}

impl WorkHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Location of the output `name`. Consuming it makes the consumer depend
    /// on this work item.
    pub fn output(&self, name: &str) -> Option<Provider<Utf8PathBuf>> {
        self.outputs
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, location)| location.clone())
    }
}

/// A validated work graph, ready to be built.
pub struct Project {
    pub(crate) graph: Graph<WorkItem, ()>,
    /// Topological order of the graph.
    pub(crate) order: Vec<NodeIndex>,
}

impl Project {
    /// Builds the project once in a fresh session.
    ///
    /// This will:
    /// 1. Lock the cache directory.
    /// 2. Check every work item in dependency order, in parallel.
    /// 3. Execute the items that are out of date and record their history.
    ///
    /// Failed items make the whole build fail. Use a [`BuildSession`]
    /// directly to inspect the report of a failed build.
    pub fn build(&self, settings: &Settings) -> Result<BuildReport, KilnError> {
        let mut session = BuildSession::open(settings.clone())?;
        let report = session.run(self)?;
        Ok(report.into_result()?)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn get(&self, identity: &str) -> Option<&WorkItem> {
        self.graph
            .node_weights()
            .find(|item| &*item.identity == identity)
    }

    /// Identities in the order they may run in.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|index| &*self.graph[*index].identity)
    }

    /// Work items `identity` directly depends on.
    pub fn dependencies_of(&self, identity: &str) -> Vec<&str> {
        let Some(index) = self
            .graph
            .node_indices()
            .find(|index| &*self.graph[*index].identity == identity)
        else {
            return Vec::new();
        };

        let mut dependencies: Vec<&str> = self
            .graph
            .neighbors_directed(index, petgraph::Direction::Incoming)
            .map(|dependency| &*self.graph[dependency].identity)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        dependencies.sort();
        dependencies
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].identity.replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
