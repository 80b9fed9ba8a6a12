use std::fmt;

use super::{Provider, ValueConsumer};
use crate::error::ProviderError;
use crate::provider::value::{SideEffect, SideEffects, Value};

/// What is known about a value while the work graph is being planned.
pub enum ExecutionTimeValue<T> {
    /// The value is definitely absent.
    Missing,
    /// The value is known now. With `changing_content` it names something,
    /// such as an output location, whose content is only known once its
    /// producer ran.
    Fixed {
        value: T,
        changing_content: bool,
        effects: SideEffects,
    },
    /// The value can only be resolved while executing.
    Changing(Provider<T>),
}

impl<T> ExecutionTimeValue<T> {
    pub fn missing() -> Self {
        ExecutionTimeValue::Missing
    }

    pub fn fixed(value: T) -> Self {
        ExecutionTimeValue::Fixed {
            value,
            changing_content: false,
            effects: SideEffects::default(),
        }
    }

    pub fn changing(provider: Provider<T>) -> Self {
        ExecutionTimeValue::Changing(provider)
    }

    pub fn from_value(value: Value<T>) -> Self {
        match value {
            Value::Missing(_) => ExecutionTimeValue::Missing,
            Value::Present { value, effects } => ExecutionTimeValue::Fixed {
                value,
                changing_content: false,
                effects,
            },
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, ExecutionTimeValue::Missing)
    }

    pub fn is_fixed_value(&self) -> bool {
        matches!(self, ExecutionTimeValue::Fixed { .. })
    }

    pub fn is_changing_value(&self) -> bool {
        matches!(self, ExecutionTimeValue::Changing(_))
    }

    pub fn has_changing_content(&self) -> bool {
        matches!(
            self,
            ExecutionTimeValue::Fixed {
                changing_content: true,
                ..
            }
        )
    }

    pub fn fixed_value(&self) -> Option<&T> {
        match self {
            ExecutionTimeValue::Fixed { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn changing_value(&self) -> Option<&Provider<T>> {
        match self {
            ExecutionTimeValue::Changing(provider) => Some(provider),
            _ => None,
        }
    }

    /// Marks a fixed value as having content that is only known later.
    pub fn with_changing_content(self) -> Self {
        match self {
            ExecutionTimeValue::Fixed { value, effects, .. } => ExecutionTimeValue::Fixed {
                value,
                changing_content: true,
                effects,
            },
            other => other,
        }
    }
}

impl<T> ExecutionTimeValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Resolves to a concrete value, evaluating a changing one now.
    pub fn resolve(self, consumer: ValueConsumer) -> Result<Value<T>, ProviderError> {
        match self {
            ExecutionTimeValue::Missing => Ok(Value::missing()),
            ExecutionTimeValue::Fixed { value, effects, .. } => {
                Ok(Value::Present { value, effects })
            }
            ExecutionTimeValue::Changing(provider) => provider.calculate_value(consumer),
        }
    }

    pub fn with_side_effect(self, effect: &SideEffect<T>) -> Self {
        match self {
            ExecutionTimeValue::Fixed {
                value,
                changing_content,
                mut effects,
            } => {
                effects.attach(effect, value.clone());
                ExecutionTimeValue::Fixed {
                    value,
                    changing_content,
                    effects,
                }
            }
            ExecutionTimeValue::Changing(provider) => {
                ExecutionTimeValue::Changing(provider.attach_side_effect(effect.clone()))
            }
            missing => missing,
        }
    }

    /// Turns the planning-time view back into a provider.
    pub fn to_provider(self) -> Provider<T> {
        match self {
            ExecutionTimeValue::Missing => Provider::not_defined(),
            ExecutionTimeValue::Fixed {
                value,
                changing_content,
                effects,
            } => Provider::from_fixed(value, changing_content, effects),
            ExecutionTimeValue::Changing(provider) => provider,
        }
    }
}

impl<T> fmt::Display for ExecutionTimeValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionTimeValue::Missing => f.write_str("missing"),
            ExecutionTimeValue::Fixed {
                changing_content: false,
                ..
            } => f.write_str("fixed"),
            ExecutionTimeValue::Fixed { .. } => f.write_str("fixed with changing content"),
            ExecutionTimeValue::Changing(_) => f.write_str("changing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variants() {
        let fixed = ExecutionTimeValue::fixed(1);
        assert!(fixed.is_fixed_value());
        assert!(!fixed.has_changing_content());
        assert_eq!(fixed.to_string(), "fixed");

        let content = ExecutionTimeValue::fixed(1).with_changing_content();
        assert!(content.is_fixed_value());
        assert!(content.has_changing_content());
        assert_eq!(content.fixed_value(), Some(&1));

        let missing = ExecutionTimeValue::<i32>::from_value(Value::missing());
        assert!(missing.is_missing());
        assert!(missing.with_changing_content().is_missing());

        let changing = ExecutionTimeValue::changing(Provider::from_fn(|| Ok(Some(2))));
        assert!(changing.is_changing_value());
        assert!(changing.changing_value().is_some());
        assert_eq!(
            changing
                .resolve(ValueConsumer::Lenient)
                .unwrap()
                .get()
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_to_provider_keeps_changing_content() {
        let provider = ExecutionTimeValue::fixed("out".to_string())
            .with_changing_content()
            .to_provider();
        let etv = provider.calculate_execution_time_value().unwrap();
        assert!(etv.has_changing_content());
        assert_eq!(provider.get().unwrap(), "out");
    }
}
