// Identity tuples for jobs and triggers

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Group used when a key is created without one.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Group that holds one-shot triggers created for recovered jobs.
pub const RECOVERING_JOBS_GROUP: &str = "RECOVERING_JOBS";

/// Group that holds one-shot triggers created by manual `trigger_job` calls.
pub const MANUAL_TRIGGER_GROUP: &str = "MANUAL_TRIGGER";

/// Anything identified by a name within a group.
///
/// Matchers are written against this trait so the same predicate algebra
/// selects both jobs and triggers.
pub trait GroupedKey {
    fn name(&self) -> &str;
    fn group(&self) -> &str;
}

/// Identity of a job detail
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    name: String,
    group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Key in the `DEFAULT` group.
    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

/// Identity of a trigger
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerKey {
    name: String,
    group: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Key in the `DEFAULT` group.
    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

impl GroupedKey for JobKey {
    fn name(&self) -> &str {
        &self.name
    }

    fn group(&self) -> &str {
        &self.group
    }
}

impl GroupedKey for TriggerKey {
    fn name(&self) -> &str {
        &self.name
    }

    fn group(&self) -> &str {
        &self.group
    }
}

// Keys sort by group first so the default group leads, then by name.
impl Ord for JobKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.group
            .cmp(&other.group)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for JobKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TriggerKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.group
            .cmp(&other.group)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for TriggerKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_uses_name_and_group() {
        assert_eq!(JobKey::new("a", "g"), JobKey::new("a", "g"));
        assert_ne!(JobKey::new("a", "g"), JobKey::new("a", "h"));
        assert_ne!(TriggerKey::new("a", "g"), TriggerKey::new("b", "g"));
    }

    #[test]
    fn test_default_group() {
        let key = TriggerKey::with_default_group("nightly");
        assert_eq!(key.group(), DEFAULT_GROUP);
        assert_eq!(key.to_string(), "DEFAULT.nightly");
    }

    #[test]
    fn test_hash_set_dedupes() {
        let mut set = HashSet::new();
        set.insert(JobKey::new("a", "g"));
        set.insert(JobKey::new("a", "g"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_ordering_is_group_then_name() {
        let mut keys = vec![
            TriggerKey::new("b", "DEFAULT"),
            TriggerKey::new("a", "REPORTS"),
            TriggerKey::new("a", "DEFAULT"),
        ];
        keys.sort();
        assert_eq!(keys[0], TriggerKey::new("a", "DEFAULT"));
        assert_eq!(keys[1], TriggerKey::new("b", "DEFAULT"));
        assert_eq!(keys[2], TriggerKey::new("a", "REPORTS"));
    }
}
