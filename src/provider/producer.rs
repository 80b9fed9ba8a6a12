use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::ArcStr;

/// A single producer, as stored inside a [`ValueProducer::Composite`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Part {
    Unknown,
    External,
    Task { task: ArcStr, content: bool },
}

impl Part {
    fn into_producer(self) -> ValueProducer {
        match self {
            Part::Unknown => ValueProducer::Unknown,
            Part::External => ValueProducer::External,
            Part::Task { task, content } => ValueProducer::Task { task, content },
        }
    }
}

/// Union of two or more distinct producers, flattened.
#[derive(Debug, PartialEq, Eq)]
pub struct Composite {
    parts: BTreeSet<Part>,
    known: bool,
    has_unknown: bool,
    changing: bool,
}

impl Composite {
    fn new(parts: BTreeSet<Part>) -> Self {
        let has_unknown = parts.contains(&Part::Unknown);
        Self {
            known: parts.iter().any(|part| *part != Part::Unknown),
            changing: parts.contains(&Part::External),
            has_unknown,
            parts,
        }
    }
}

/// Who computes a value.
///
/// Producers tell the scheduler which work items must run before a value can
/// be read. They combine with [`plus`](ValueProducer::plus), which is
/// associative and commutative with [`ValueProducer::None`] as identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ValueProducer {
    /// The value is computed on the spot, nothing has to run first.
    #[default]
    None,
    /// Something produces the value but it can't be named. Dependents must be
    /// treated as always out of date.
    Unknown,
    /// The value comes from outside the build and may change between reads.
    External,
    /// A work item produces the value. With `content` the value is the
    /// item's output content, otherwise only its location or state.
    Task { task: ArcStr, content: bool },
    Composite(Arc<Composite>),
}

impl ValueProducer {
    pub fn none() -> Self {
        ValueProducer::None
    }

    pub fn unknown() -> Self {
        ValueProducer::Unknown
    }

    pub fn external() -> Self {
        ValueProducer::External
    }

    /// The value is the content produced by `task`.
    pub fn task(task: impl Into<ArcStr>) -> Self {
        ValueProducer::Task {
            task: task.into(),
            content: true,
        }
    }

    /// The value depends on `task` having run, but not on what it wrote.
    pub fn task_state(task: impl Into<ArcStr>) -> Self {
        ValueProducer::Task {
            task: task.into(),
            content: false,
        }
    }

    pub fn plus(&self, other: &ValueProducer) -> ValueProducer {
        match (self, other) {
            (ValueProducer::None, other) | (other, ValueProducer::None) => other.clone(),
            (a, b) if a == b => a.clone(),
            (a, b) => {
                let mut parts = BTreeSet::new();
                a.collect_parts(&mut parts);
                b.collect_parts(&mut parts);
                Self::from_parts(parts)
            }
        }
    }

    fn collect_parts(&self, parts: &mut BTreeSet<Part>) {
        match self {
            ValueProducer::None => {}
            ValueProducer::Unknown => {
                parts.insert(Part::Unknown);
            }
            ValueProducer::External => {
                parts.insert(Part::External);
            }
            ValueProducer::Task { task, content } => {
                parts.insert(Part::Task {
                    task: task.clone(),
                    content: *content,
                });
            }
            ValueProducer::Composite(composite) => {
                parts.extend(composite.parts.iter().cloned());
            }
        }
    }

    fn from_parts(mut parts: BTreeSet<Part>) -> Self {
        if parts.len() > 1 {
            return ValueProducer::Composite(Arc::new(Composite::new(parts)));
        }

        match parts.pop_first() {
            Some(part) => part.into_producer(),
            None => ValueProducer::None,
        }
    }

    /// Whether at least part of the producer can be named.
    pub fn is_known(&self) -> bool {
        match self {
            ValueProducer::Unknown => false,
            ValueProducer::Composite(composite) => composite.known,
            _ => true,
        }
    }

    /// Whether any part of the producer can't be named.
    pub fn has_unknown(&self) -> bool {
        match self {
            ValueProducer::Unknown => true,
            ValueProducer::Composite(composite) => composite.has_unknown,
            _ => false,
        }
    }

    pub fn is_fully_known(&self) -> bool {
        !self.has_unknown()
    }

    /// Whether the value may differ between two reads in the same build.
    pub fn changes_over_time(&self) -> bool {
        match self {
            ValueProducer::External => true,
            ValueProducer::Composite(composite) => composite.changing,
            _ => false,
        }
    }

    /// Visits every work item this value depends on.
    pub fn visit_producer_tasks(&self, visitor: &mut impl FnMut(&ArcStr)) {
        self.visit_tasks(false, visitor)
    }

    /// Visits the work items whose output content this value is.
    pub fn visit_content_producer_tasks(&self, visitor: &mut impl FnMut(&ArcStr)) {
        self.visit_tasks(true, visitor)
    }

    fn visit_tasks(&self, content_only: bool, visitor: &mut impl FnMut(&ArcStr)) {
        match self {
            ValueProducer::Task { task, content } if *content || !content_only => visitor(task),
            ValueProducer::Composite(composite) => {
                for part in &composite.parts {
                    if let Part::Task { task, content } = part
                        && (*content || !content_only)
                    {
                        visitor(task);
                    }
                }
            }
            _ => {}
        }
    }

    /// Every distinct work item this value depends on, in name order.
    pub fn producer_tasks(&self) -> Vec<ArcStr> {
        let mut tasks = BTreeSet::new();
        self.visit_producer_tasks(&mut |task| {
            tasks.insert(task.clone());
        });
        tasks.into_iter().collect()
    }
}
