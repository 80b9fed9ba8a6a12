//! Lazily computed values that know who produces them.
//!
//! A [`Provider`] is wired into work items without being evaluated. The
//! scheduler reads its [`ValueProducer`] to order work items, and the executor
//! resolves it only when the owning item is checked.

mod execution_time;
mod producer;
mod value;

use std::fmt;
use std::sync::Arc;

use crate::core::ArcStr;
use crate::error::{LazyValueError, ProviderError};

pub use execution_time::ExecutionTimeValue;
pub use producer::{Composite, ValueProducer};
pub use value::{SideEffect, SideEffects, Value};

/// How a value is being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueConsumer {
    /// Refuse to evaluate values whose producer can't be fully named.
    Strict,
    /// Evaluate whatever is there.
    Lenient,
}

/// The computation behind a [`Provider`].
pub trait Supplier<T>: Send + Sync {
    fn producer(&self) -> ValueProducer;

    fn calculate_value(&self, consumer: ValueConsumer) -> Result<Value<T>, ProviderError>;

    /// Planning-time view of the value. `this` is the provider wrapping this
    /// supplier, returned as is for values only known at execution time.
    fn calculate_execution_time_value(
        &self,
        this: &Provider<T>,
    ) -> Result<ExecutionTimeValue<T>, ProviderError> {
        Ok(ExecutionTimeValue::Changing(this.clone()))
    }

    fn display_name(&self) -> Option<ArcStr> {
        None
    }
}

/// A shared, lazily computed value.
pub struct Provider<T>(Arc<dyn Supplier<T>>);

impl<T> Clone for Provider<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for Provider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.display_name() {
            Some(name) => write!(f, "Provider({name})"),
            None => f.write_str("Provider"),
        }
    }
}

impl<T> Provider<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(supplier: impl Supplier<T> + 'static) -> Self {
        Self(Arc::new(supplier))
    }

    pub fn of(value: T) -> Self {
        Self::new(Fixed {
            value,
            changing_content: false,
            effects: SideEffects::default(),
            producer: ValueProducer::None,
        })
    }

    pub fn not_defined() -> Self {
        Self::new(NotDefined)
    }

    /// A value read from outside the build, recomputed on every read.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Option<T>> + Send + Sync + 'static,
    {
        Self::new(Computed {
            f: Arc::new(f),
            producer: ValueProducer::External,
        })
    }

    /// A value whose producer can't be named. Strict reads refuse it and
    /// whatever consumes it is never considered up to date.
    pub fn untracked<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Option<T>> + Send + Sync + 'static,
    {
        Self::new(Computed {
            f: Arc::new(f),
            producer: ValueProducer::Unknown,
        })
    }

    /// A location owned by the work item `task`: known now, content written
    /// when the item runs.
    pub fn produced_by(task: impl Into<ArcStr>, value: T) -> Self {
        Self::new(Fixed {
            value,
            changing_content: true,
            effects: SideEffects::default(),
            producer: ValueProducer::task(task),
        })
    }

    pub(crate) fn from_fixed(value: T, changing_content: bool, effects: SideEffects) -> Self {
        Self::new(Fixed {
            value,
            changing_content,
            effects,
            producer: ValueProducer::None,
        })
    }

    pub fn producer(&self) -> ValueProducer {
        self.0.producer()
    }

    pub fn display_name(&self) -> Option<ArcStr> {
        self.0.display_name()
    }

    fn describe(&self) -> String {
        match self.0.display_name() {
            Some(name) => name.to_string(),
            None => "a value".to_string(),
        }
    }

    pub fn calculate_value(&self, consumer: ValueConsumer) -> Result<Value<T>, ProviderError> {
        if consumer == ValueConsumer::Strict && self.0.producer().has_unknown() {
            return Err(ProviderError::UnsafeRead(self.describe()));
        }
        self.0.calculate_value(consumer)
    }

    /// Whether the value is present, without running its side effects.
    pub fn calculate_presence(&self, consumer: ValueConsumer) -> Result<bool, ProviderError> {
        Ok(self.calculate_value(consumer)?.is_present())
    }

    pub fn calculate_execution_time_value(&self) -> Result<ExecutionTimeValue<T>, ProviderError> {
        self.0.calculate_execution_time_value(self)
    }

    /// Reads and consumes the value, failing when it is missing.
    pub fn get(&self) -> Result<T, ProviderError> {
        self.calculate_value(ValueConsumer::Lenient)?.get()
    }

    pub fn get_or_none(&self) -> Result<Option<T>, ProviderError> {
        Ok(self.calculate_value(ValueConsumer::Lenient)?.or_none())
    }

    pub fn map<U, F>(&self, f: F) -> Provider<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.filter_map(move |value| Some(f(value)))
    }

    /// Maps the value, `None` makes it missing.
    pub fn filter_map<U, F>(&self, f: F) -> Provider<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> Option<U> + Send + Sync + 'static,
    {
        Provider::new(Mapped {
            source: self.clone(),
            f: Arc::new(f),
        })
    }

    pub fn zip<B, U, F>(&self, other: &Provider<B>, f: F) -> Provider<U>
    where
        B: Clone + Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
        F: Fn(T, B) -> U + Send + Sync + 'static,
    {
        Provider::new(Zipped {
            left: self.clone(),
            right: other.clone(),
            f: Arc::new(f),
        })
    }

    /// Falls back to `fallback` when this value is missing.
    pub fn or(&self, fallback: &Provider<T>) -> Provider<T> {
        Provider::new(OrElse {
            primary: self.clone(),
            fallback: fallback.clone(),
        })
    }

    pub fn or_else(&self, default: T) -> Provider<T> {
        self.or(&Provider::of(default))
    }

    /// Runs `action` with the value the first time the value, or any value
    /// derived from it, is consumed.
    pub fn with_side_effect<F>(&self, action: F) -> Provider<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.attach_side_effect(SideEffect::new(action))
    }

    pub fn attach_side_effect(&self, effect: SideEffect<T>) -> Provider<T> {
        Provider::new(WithSideEffect {
            source: self.clone(),
            effect,
        })
    }

    /// Names the value. The name shows up in the path of a missing value and
    /// in unsafe read errors.
    pub fn named(&self, name: impl Into<ArcStr>) -> Provider<T> {
        Provider::new(Named {
            source: self.clone(),
            name: name.into(),
        })
    }
}

struct Fixed<T> {
    value: T,
    changing_content: bool,
    effects: SideEffects,
    producer: ValueProducer,
}

impl<T> Supplier<T> for Fixed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn producer(&self) -> ValueProducer {
        self.producer.clone()
    }

    fn calculate_value(&self, _: ValueConsumer) -> Result<Value<T>, ProviderError> {
        Ok(Value::Present {
            value: self.value.clone(),
            effects: self.effects.clone(),
        })
    }

    fn calculate_execution_time_value(
        &self,
        _: &Provider<T>,
    ) -> Result<ExecutionTimeValue<T>, ProviderError> {
        Ok(ExecutionTimeValue::Fixed {
            value: self.value.clone(),
            changing_content: self.changing_content,
            effects: self.effects.clone(),
        })
    }
}

struct NotDefined;

impl<T> Supplier<T> for NotDefined
where
    T: Clone + Send + Sync + 'static,
{
    fn producer(&self) -> ValueProducer {
        ValueProducer::None
    }

    fn calculate_value(&self, _: ValueConsumer) -> Result<Value<T>, ProviderError> {
        Ok(Value::missing())
    }

    fn calculate_execution_time_value(
        &self,
        _: &Provider<T>,
    ) -> Result<ExecutionTimeValue<T>, ProviderError> {
        Ok(ExecutionTimeValue::Missing)
    }
}

type ComputeFn<T> = Arc<dyn Fn() -> anyhow::Result<Option<T>> + Send + Sync>;

struct Computed<T> {
    f: ComputeFn<T>,
    producer: ValueProducer,
}

impl<T> Supplier<T> for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn producer(&self) -> ValueProducer {
        self.producer.clone()
    }

    fn calculate_value(&self, _: ValueConsumer) -> Result<Value<T>, ProviderError> {
        match (self.f)() {
            Ok(Some(value)) => Ok(Value::of(value)),
            Ok(None) => Ok(Value::missing()),
            Err(e) => Err(ProviderError::Compute(
                "a computed value".to_string(),
                LazyValueError::from(e),
            )),
        }
    }
}

struct Mapped<S, T> {
    source: Provider<S>,
    f: Arc<dyn Fn(S) -> Option<T> + Send + Sync>,
}

impl<S, T> Supplier<T> for Mapped<S, T>
where
    S: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn producer(&self) -> ValueProducer {
        self.source.producer()
    }

    fn calculate_value(&self, consumer: ValueConsumer) -> Result<Value<T>, ProviderError> {
        Ok(self
            .source
            .calculate_value(consumer)?
            .filter_map(|value| (self.f)(value)))
    }

    fn calculate_execution_time_value(
        &self,
        this: &Provider<T>,
    ) -> Result<ExecutionTimeValue<T>, ProviderError> {
        match self.source.calculate_execution_time_value()? {
            ExecutionTimeValue::Missing => Ok(ExecutionTimeValue::Missing),
            ExecutionTimeValue::Fixed {
                value,
                changing_content: false,
                effects,
            } => {
                let value = Value::Present { value, effects }.filter_map(|value| (self.f)(value));
                Ok(ExecutionTimeValue::from_value(value))
            }
            _ => Ok(ExecutionTimeValue::Changing(this.clone())),
        }
    }
}

struct Zipped<A, B, T> {
    left: Provider<A>,
    right: Provider<B>,
    f: Arc<dyn Fn(A, B) -> T + Send + Sync>,
}

impl<A, B, T> Supplier<T> for Zipped<A, B, T>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn producer(&self) -> ValueProducer {
        self.left.producer().plus(&self.right.producer())
    }

    fn calculate_value(&self, consumer: ValueConsumer) -> Result<Value<T>, ProviderError> {
        let left = self.left.calculate_value(consumer)?;
        let right = self.right.calculate_value(consumer)?;
        Ok(self.combine(left, right))
    }

    fn calculate_execution_time_value(
        &self,
        this: &Provider<T>,
    ) -> Result<ExecutionTimeValue<T>, ProviderError> {
        let left = self.left.calculate_execution_time_value()?;
        let right = self.right.calculate_execution_time_value()?;

        if left.is_missing() || right.is_missing() {
            return Ok(ExecutionTimeValue::Missing);
        }

        match (left, right) {
            (
                ExecutionTimeValue::Fixed {
                    value: a,
                    changing_content: false,
                    effects: ea,
                },
                ExecutionTimeValue::Fixed {
                    value: b,
                    changing_content: false,
                    effects: eb,
                },
            ) => {
                let left = Value::Present {
                    value: a,
                    effects: ea,
                };
                let right = Value::Present {
                    value: b,
                    effects: eb,
                };
                Ok(ExecutionTimeValue::from_value(self.combine(left, right)))
            }
            _ => Ok(ExecutionTimeValue::Changing(this.clone())),
        }
    }
}

impl<A, B, T> Zipped<A, B, T> {
    fn combine(&self, left: Value<A>, right: Value<B>) -> Value<T> {
        match (left, right) {
            (
                Value::Present {
                    value: a,
                    effects: ea,
                },
                Value::Present {
                    value: b,
                    effects: eb,
                },
            ) => Value::Present {
                value: (self.f)(a, b),
                effects: ea,
            }
            .with_side_effects(eb),
            (left, right) => Value::Missing(
                left.path_to_origin()
                    .iter()
                    .chain(right.path_to_origin())
                    .cloned()
                    .collect(),
            ),
        }
    }
}

struct OrElse<T> {
    primary: Provider<T>,
    fallback: Provider<T>,
}

impl<T> Supplier<T> for OrElse<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn producer(&self) -> ValueProducer {
        self.primary.producer().plus(&self.fallback.producer())
    }

    fn calculate_value(&self, consumer: ValueConsumer) -> Result<Value<T>, ProviderError> {
        let primary = self.primary.calculate_value(consumer)?;
        if primary.is_present() {
            return Ok(primary);
        }

        let fallback = self.fallback.calculate_value(consumer)?;
        if fallback.is_present() {
            return Ok(fallback);
        }

        Ok(primary.add_paths_from(&fallback))
    }

    fn calculate_execution_time_value(
        &self,
        this: &Provider<T>,
    ) -> Result<ExecutionTimeValue<T>, ProviderError> {
        match self.primary.calculate_execution_time_value()? {
            ExecutionTimeValue::Missing => self.fallback.calculate_execution_time_value(),
            fixed @ ExecutionTimeValue::Fixed { .. } => Ok(fixed),
            ExecutionTimeValue::Changing(_) => Ok(ExecutionTimeValue::Changing(this.clone())),
        }
    }
}

struct WithSideEffect<T> {
    source: Provider<T>,
    effect: SideEffect<T>,
}

impl<T> Supplier<T> for WithSideEffect<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn producer(&self) -> ValueProducer {
        self.source.producer()
    }

    fn calculate_value(&self, consumer: ValueConsumer) -> Result<Value<T>, ProviderError> {
        Ok(self
            .source
            .calculate_value(consumer)?
            .with_side_effect(&self.effect))
    }

    fn calculate_execution_time_value(
        &self,
        _: &Provider<T>,
    ) -> Result<ExecutionTimeValue<T>, ProviderError> {
        Ok(self
            .source
            .calculate_execution_time_value()?
            .with_side_effect(&self.effect))
    }

    fn display_name(&self) -> Option<ArcStr> {
        self.source.display_name()
    }
}

struct Named<T> {
    source: Provider<T>,
    name: ArcStr,
}

impl<T> Supplier<T> for Named<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn producer(&self) -> ValueProducer {
        self.source.producer()
    }

    fn calculate_value(&self, consumer: ValueConsumer) -> Result<Value<T>, ProviderError> {
        Ok(self
            .source
            .calculate_value(consumer)?
            .push_when_missing(self.name.clone()))
    }

    fn calculate_execution_time_value(
        &self,
        _: &Provider<T>,
    ) -> Result<ExecutionTimeValue<T>, ProviderError> {
        self.source.calculate_execution_time_value()
    }

    fn display_name(&self) -> Option<ArcStr> {
        Some(self.name.clone())
    }
}
