//! Partial-override configuration primitives.
//!
//! Implements the tagged-union encoding suggested by the design notes: an update carries
//! `Set(value) | Clear | Unchanged`, and a built setting stores `Specified(value) | Inherited`
//! for the same field. Merging an update against the setting's current field and a fallback
//! base value yields the new effective field.

use serde::{Deserialize, Serialize};

/// Effective value of one configuration field inside a built [`crate::TraceSetting`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field<T> {
    /// Value is an explicit override on this setting.
    Specified(T),
    /// Value is inherited from the fallback setting.
    Inherited,
}

impl<T> Field<T> {
    /// Whether this field carries an explicit override.
    #[must_use]
    pub fn specified(&self) -> bool {
        matches!(self, Self::Specified(_))
    }
}

/// Requested change to one configuration field, as carried by a [`crate::TraceSettingUpdate`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldUpdate<T> {
    /// Set the field to a new explicit value.
    Set(T),
    /// Remove any override, reverting to inheritance from the fallback.
    Clear,
    /// Leave the field as it currently is.
    #[default]
    Unchanged,
}

impl<T: Clone> FieldUpdate<T> {
    /// Merge this update against the `current` effective field and the `fallback` base value.
    ///
    /// Returns the new effective field together with its resolved value. A field stays
    /// specified if it already was and this update doesn't clear it, or if this update sets it;
    /// its resolved value is the override when specified, or the fallback's value otherwise.
    pub fn merge(&self, current: Option<&Field<T>>, fallback: &T) -> (Field<T>, T) {
        match self {
            Self::Set(value) => (Field::Specified(value.clone()), value.clone()),
            Self::Clear => (Field::Inherited, fallback.clone()),
            Self::Unchanged => match current {
                Some(Field::Specified(value)) => {
                    (Field::Specified(value.clone()), value.clone())
                }
                _ => (Field::Inherited, fallback.clone()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_always_specifies() {
        let (field, value) = FieldUpdate::Set(4u32).merge(None, &1);
        assert!(field.specified());
        assert_eq!(value, 4);
    }

    #[test]
    fn clear_reverts_to_fallback() {
        let current = Field::Specified(4u32);
        let (field, value) = FieldUpdate::<u32>::Clear.merge(Some(&current), &1);
        assert!(!field.specified());
        assert_eq!(value, 1);
    }

    #[test]
    fn unchanged_keeps_prior_specified_value() {
        let current = Field::Specified(4u32);
        let (field, value) = FieldUpdate::<u32>::Unchanged.merge(Some(&current), &1);
        assert!(field.specified());
        assert_eq!(value, 4);
    }

    #[test]
    fn unchanged_keeps_prior_inherited_value() {
        let current = Field::<u32>::Inherited;
        let (field, value) = FieldUpdate::<u32>::Unchanged.merge(Some(&current), &1);
        assert!(!field.specified());
        assert_eq!(value, 1);
    }

    #[test]
    fn unchanged_with_no_prior_state_inherits() {
        let (field, value) = FieldUpdate::<u32>::Unchanged.merge(None, &7);
        assert!(!field.specified());
        assert_eq!(value, 7);
    }
}
