// Composable predicates over job and trigger keys
//
// Matchers select subsets of keys for bulk pause/resume, key queries and
// listener filtering. They are plain values: structural equality and
// hashing let them serve as map keys and make listener registration
// idempotent.

use crate::errors::MatcherError;
use crate::keys::GroupedKey;

/// Comparison applied to a key's name or group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringOperator {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
    Anything,
}

impl StringOperator {
    pub fn evaluate(&self, value: &str, compare_to: &str) -> bool {
        match self {
            StringOperator::Equals => value == compare_to,
            StringOperator::StartsWith => value.starts_with(compare_to),
            StringOperator::EndsWith => value.ends_with(compare_to),
            StringOperator::Contains => value.contains(compare_to),
            StringOperator::Anything => true,
        }
    }
}

/// A predicate over keys of type `K`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Matcher<K> {
    Everything,
    KeyEquals(K),
    Name {
        operator: StringOperator,
        value: String,
    },
    Group {
        operator: StringOperator,
        value: String,
    },
    And(Box<Matcher<K>>, Box<Matcher<K>>),
    Or(Box<Matcher<K>>, Box<Matcher<K>>),
    Not(Box<Matcher<K>>),
}

impl<K> Matcher<K>
where
    K: GroupedKey + PartialEq,
{
    pub fn is_match(&self, key: &K) -> bool {
        match self {
            Matcher::Everything => true,
            Matcher::KeyEquals(expected) => expected == key,
            Matcher::Name { operator, value } => operator.evaluate(key.name(), value),
            Matcher::Group { operator, value } => operator.evaluate(key.group(), value),
            Matcher::And(left, right) => left.is_match(key) && right.is_match(key),
            Matcher::Or(left, right) => left.is_match(key) || right.is_match(key),
            Matcher::Not(operand) => !operand.is_match(key),
        }
    }
}

impl<K> Matcher<K> {
    pub fn everything() -> Self {
        Matcher::Everything
    }

    pub fn key_equals(key: K) -> Self {
        Matcher::KeyEquals(key)
    }

    pub fn name_equals(value: impl Into<String>) -> Self {
        Self::name(StringOperator::Equals, value)
    }

    pub fn name_starts_with(value: impl Into<String>) -> Self {
        Self::name(StringOperator::StartsWith, value)
    }

    pub fn name_ends_with(value: impl Into<String>) -> Self {
        Self::name(StringOperator::EndsWith, value)
    }

    pub fn name_contains(value: impl Into<String>) -> Self {
        Self::name(StringOperator::Contains, value)
    }

    pub fn group_equals(value: impl Into<String>) -> Self {
        Self::group(StringOperator::Equals, value)
    }

    pub fn group_starts_with(value: impl Into<String>) -> Self {
        Self::group(StringOperator::StartsWith, value)
    }

    pub fn group_ends_with(value: impl Into<String>) -> Self {
        Self::group(StringOperator::EndsWith, value)
    }

    pub fn group_contains(value: impl Into<String>) -> Self {
        Self::group(StringOperator::Contains, value)
    }

    pub fn any_group() -> Self {
        Self::group(StringOperator::Anything, "")
    }

    pub fn and(left: Matcher<K>, right: Matcher<K>) -> Self {
        Matcher::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Matcher<K>, right: Matcher<K>) -> Self {
        Matcher::Or(Box::new(left), Box::new(right))
    }

    pub fn not(operand: Matcher<K>) -> Self {
        Matcher::Not(Box::new(operand))
    }

    /// Conjunction of operands that may be absent.
    ///
    /// # Errors
    /// `MatcherError::MissingOperand` if either side is `None`.
    pub fn try_and(
        left: Option<Matcher<K>>,
        right: Option<Matcher<K>>,
    ) -> Result<Self, MatcherError> {
        match (left, right) {
            (Some(left), Some(right)) => Ok(Self::and(left, right)),
            _ => Err(MatcherError::MissingOperand),
        }
    }

    /// Disjunction of operands that may be absent.
    ///
    /// # Errors
    /// `MatcherError::MissingOperand` if either side is `None`.
    pub fn try_or(
        left: Option<Matcher<K>>,
        right: Option<Matcher<K>>,
    ) -> Result<Self, MatcherError> {
        match (left, right) {
            (Some(left), Some(right)) => Ok(Self::or(left, right)),
            _ => Err(MatcherError::MissingOperand),
        }
    }

    /// The group this matcher pins down exactly, if it is a plain
    /// group-equals matcher.
    pub fn exact_group(&self) -> Option<&str> {
        match self {
            Matcher::Group {
                operator: StringOperator::Equals,
                value,
            } => Some(value),
            _ => None,
        }
    }

    fn name(operator: StringOperator, value: impl Into<String>) -> Self {
        Matcher::Name {
            operator,
            value: value.into(),
        }
    }

    fn group(operator: StringOperator, value: impl Into<String>) -> Self {
        Matcher::Group {
            operator,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{JobKey, TriggerKey};
    use std::collections::HashMap;

    #[test]
    fn test_leaf_matchers() {
        let key = JobKey::new("report-daily", "finance");
        assert!(Matcher::name_equals("report-daily").is_match(&key));
        assert!(Matcher::name_starts_with("report").is_match(&key));
        assert!(Matcher::name_ends_with("daily").is_match(&key));
        assert!(Matcher::name_contains("t-d").is_match(&key));
        assert!(Matcher::group_equals("finance").is_match(&key));
        assert!(!Matcher::group_equals("FINANCE").is_match(&key));
        assert!(Matcher::any_group().is_match(&key));
        assert!(Matcher::key_equals(key.clone()).is_match(&key));
    }

    #[test]
    fn test_and_requires_both() {
        let key = TriggerKey::new("t1", "g1");
        let both = Matcher::and(Matcher::name_equals("t1"), Matcher::group_equals("g1"));
        let one = Matcher::and(Matcher::name_equals("t1"), Matcher::group_equals("g2"));
        assert!(both.is_match(&key));
        assert!(!one.is_match(&key));
    }

    #[test]
    fn test_or_and_not() {
        let key = TriggerKey::new("t1", "g1");
        let either = Matcher::or(Matcher::name_equals("zz"), Matcher::group_equals("g1"));
        assert!(either.is_match(&key));
        assert!(!Matcher::not(either).is_match(&key));
    }

    #[test]
    fn test_try_and_rejects_missing_operand() {
        let result: Result<Matcher<JobKey>, _> =
            Matcher::try_and(Some(Matcher::everything()), None);
        assert_eq!(result, Err(MatcherError::MissingOperand));

        let result: Result<Matcher<JobKey>, _> = Matcher::try_or(None, None);
        assert_eq!(result, Err(MatcherError::MissingOperand));
    }

    #[test]
    fn test_structural_equality_usable_as_map_key() {
        let a: Matcher<JobKey> =
            Matcher::and(Matcher::group_equals("g"), Matcher::name_starts_with("x"));
        let b: Matcher<JobKey> =
            Matcher::and(Matcher::group_equals("g"), Matcher::name_starts_with("x"));
        let mut map = HashMap::new();
        map.insert(a, 1);
        map.insert(b, 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_exact_group() {
        let m: Matcher<TriggerKey> = Matcher::group_equals("reports");
        assert_eq!(m.exact_group(), Some("reports"));
        let m: Matcher<TriggerKey> = Matcher::group_starts_with("rep");
        assert_eq!(m.exact_group(), None);
    }
}
