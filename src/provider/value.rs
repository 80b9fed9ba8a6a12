use std::fmt;
use std::sync::{Arc, Once};

use crate::core::ArcStr;
use crate::error::ProviderError;

/// A deferred action attached to a value, run at most once when the value is
/// first consumed.
///
/// Clones share the same one-shot guard, so attaching one effect to a
/// provider and reading several values derived from it still runs it once.
pub struct SideEffect<T> {
    action: Arc<dyn Fn(&T) + Send + Sync>,
    once: Arc<Once>,
}

impl<T> SideEffect<T> {
    pub fn new<F>(action: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            action: Arc::new(action),
            once: Arc::new(Once::new()),
        }
    }

    pub fn has_run(&self) -> bool {
        self.once.is_completed()
    }
}

impl<T> Clone for SideEffect<T> {
    fn clone(&self) -> Self {
        Self {
            action: self.action.clone(),
            once: self.once.clone(),
        }
    }
}

/// A side effect bound to the value it was attached to.
#[derive(Clone)]
struct BoundEffect {
    action: Arc<dyn Fn() + Send + Sync>,
    once: Arc<Once>,
}

/// Ordered side effects of a value, run in attachment order.
#[derive(Clone, Default)]
pub struct SideEffects(Vec<BoundEffect>);

impl SideEffects {
    /// Appends `effect`, bound to `value`.
    pub(crate) fn attach<T>(&mut self, effect: &SideEffect<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        let action = effect.action.clone();
        self.0.push(BoundEffect {
            action: Arc::new(move || action(&value)),
            once: effect.once.clone(),
        });
    }

    pub(crate) fn extend(&mut self, other: SideEffects) {
        self.0.extend(other.0);
    }

    pub(crate) fn run(&self) {
        for effect in &self.0 {
            effect.once.call_once(|| (effect.action)());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for SideEffects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SideEffects({})", self.0.len())
    }
}

/// A realized value.
///
/// Consuming a present value with [`get`](Value::get) and friends runs its
/// side effects. Transforming it carries them along without running them.
#[derive(Debug, Clone)]
pub enum Value<T> {
    /// No value. The path names the chain of values that led to the absence,
    /// outermost first.
    Missing(Vec<ArcStr>),
    Present { value: T, effects: SideEffects },
}

impl<T> Value<T> {
    pub fn missing() -> Self {
        Value::Missing(Vec::new())
    }

    pub fn of(value: T) -> Self {
        Value::Present {
            value,
            effects: SideEffects::default(),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing(_))
    }

    pub fn is_present(&self) -> bool {
        !self.is_missing()
    }

    /// Borrows the value without consuming it. Side effects don't run.
    pub fn peek(&self) -> Option<&T> {
        match self {
            Value::Present { value, .. } => Some(value),
            Value::Missing(_) => None,
        }
    }

    pub fn get(self) -> Result<T, ProviderError> {
        match self {
            Value::Present { value, effects } => {
                effects.run();
                Ok(value)
            }
            Value::Missing(path) => Err(ProviderError::Missing(path)),
        }
    }

    pub fn or_none(self) -> Option<T> {
        self.get().ok()
    }

    pub fn or_else(self, default: T) -> T {
        self.or_none().unwrap_or(default)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Value<U> {
        match self {
            Value::Present { value, effects } => Value::Present {
                value: f(value),
                effects,
            },
            Value::Missing(path) => Value::Missing(path),
        }
    }

    /// Like [`map`](Value::map), `None` turns the value into a missing one.
    pub fn filter_map<U>(self, f: impl FnOnce(T) -> Option<U>) -> Value<U> {
        match self {
            Value::Present { value, effects } => match f(value) {
                Some(value) => Value::Present { value, effects },
                None => Value::Missing(Vec::new()),
            },
            Value::Missing(path) => Value::Missing(path),
        }
    }

    /// Chains a value computed from this one. Side effects of both are kept,
    /// this value's first.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Value<U>) -> Value<U> {
        match self {
            Value::Present { value, mut effects } => match f(value) {
                Value::Present {
                    value,
                    effects: more,
                } => {
                    effects.extend(more);
                    Value::Present { value, effects }
                }
                Value::Missing(path) => Value::Missing(path),
            },
            Value::Missing(path) => Value::Missing(path),
        }
    }

    pub fn side_effects(&self) -> Option<&SideEffects> {
        match self {
            Value::Present { effects, .. } => Some(effects),
            Value::Missing(_) => None,
        }
    }

    pub(crate) fn with_side_effects(self, more: SideEffects) -> Self {
        match self {
            Value::Present { value, mut effects } => {
                effects.extend(more);
                Value::Present { value, effects }
            }
            missing => missing,
        }
    }

    pub fn path_to_origin(&self) -> &[ArcStr] {
        match self {
            Value::Missing(path) => path,
            Value::Present { .. } => &[],
        }
    }

    /// Prepends `name` to the path of a missing value.
    pub fn push_when_missing(self, name: impl Into<ArcStr>) -> Self {
        match self {
            Value::Missing(mut path) => {
                path.insert(0, name.into());
                Value::Missing(path)
            }
            present => present,
        }
    }

    /// Appends the path of `other` to the path of this value, when both are
    /// missing.
    pub fn add_paths_from<U>(self, other: &Value<U>) -> Self {
        match (self, other) {
            (Value::Missing(mut path), Value::Missing(more)) => {
                path.extend(more.iter().cloned());
                Value::Missing(path)
            }
            (this, _) => this,
        }
    }
}

impl<T> Value<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Attaches `effect`, bound to the current value.
    pub fn with_side_effect(self, effect: &SideEffect<T>) -> Self {
        match self {
            Value::Present { value, mut effects } => {
                effects.attach(effect, value.clone());
                Value::Present { value, effects }
            }
            missing => missing,
        }
    }
}
