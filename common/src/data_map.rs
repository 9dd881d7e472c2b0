// Case-insensitive typed key/value map attached to jobs and triggers

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// A primitive-typed value stored in a [`DataMap`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DataValue {
    String(String),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    Object(serde_json::Value),
}

impl DataValue {
    /// Textual rendering of primitive values; objects render as JSON.
    pub fn to_string_value(&self) -> String {
        match self {
            DataValue::String(s) => s.clone(),
            DataValue::Int(v) => v.to_string(),
            DataValue::Long(v) => v.to_string(),
            DataValue::Float(v) => v.to_string(),
            DataValue::Double(v) => v.to_string(),
            DataValue::Boolean(v) => v.to_string(),
            DataValue::Object(v) => v.to_string(),
        }
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        DataValue::String(value.to_string())
    }
}

impl From<String> for DataValue {
    fn from(value: String) -> Self {
        DataValue::String(value)
    }
}

impl From<i32> for DataValue {
    fn from(value: i32) -> Self {
        DataValue::Int(value)
    }
}

impl From<i64> for DataValue {
    fn from(value: i64) -> Self {
        DataValue::Long(value)
    }
}

impl From<f32> for DataValue {
    fn from(value: f32) -> Self {
        DataValue::Float(value)
    }
}

impl From<f64> for DataValue {
    fn from(value: f64) -> Self {
        DataValue::Double(value)
    }
}

impl From<bool> for DataValue {
    fn from(value: bool) -> Self {
        DataValue::Boolean(value)
    }
}

impl From<serde_json::Value> for DataValue {
    fn from(value: serde_json::Value) -> Self {
        DataValue::Object(value)
    }
}

/// Mapping from case-insensitive keys to [`DataValue`]s.
///
/// Every mutation sets the dirty flag; the store clears it when the map is
/// persisted, and a map read back from storage starts clean.
#[derive(Debug, Clone, Default)]
pub struct DataMap {
    // folded key -> (key as last written, value)
    entries: BTreeMap<String, (String, DataValue)>,
    dirty: bool,
}

fn fold(key: &str) -> String {
    key.to_lowercase()
}

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value, returning the previous one.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<DataValue>) -> Option<DataValue> {
        let key = key.into();
        self.dirty = true;
        self.entries
            .insert(fold(&key), (key, value.into()))
            .map(|(_, old)| old)
    }

    /// Copy every entry of `other` over this map.
    pub fn put_all(&mut self, other: &DataMap) {
        for (key, value) in other.iter() {
            self.put(key, value.clone());
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<DataValue> {
        let removed = self.entries.remove(&fold(key)).map(|(_, v)| v);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.dirty = true;
        }
        self.entries.clear();
    }

    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.entries.get(&fold(key)).map(|(_, v)| v)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(DataValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Value rendered as a string whatever its stored type.
    pub fn get_as_string(&self, key: &str) -> Option<String> {
        self.get(key).map(DataValue::to_string_value)
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.get(key) {
            Some(DataValue::Int(v)) => Some(*v),
            Some(DataValue::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(DataValue::Long(v)) => Some(*v),
            Some(DataValue::Int(v)) => Some(i64::from(*v)),
            Some(DataValue::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(DataValue::Double(v)) => Some(*v),
            Some(DataValue::Float(v)) => Some(f64::from(*v)),
            Some(DataValue::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(DataValue::Boolean(v)) => Some(*v),
            Some(DataValue::String(s)) => Some(s.eq_ignore_ascii_case("true")),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&fold(key))
    }

    /// Keys as they were last written.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DataValue)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

impl PartialEq for DataMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<K, V> FromIterator<(K, V)> for DataMap
where
    K: Into<String>,
    V: Into<DataValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = DataMap::new();
        for (k, v) in iter {
            map.put(k, v);
        }
        map
    }
}

impl Serialize for DataMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(self.iter())
    }
}

impl<'de> Deserialize<'de> for DataMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, DataValue>::deserialize(deserializer)?;
        let mut map: DataMap = raw.into_iter().collect();
        map.clear_dirty();
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_case_insensitive() {
        let mut map = DataMap::new();
        map.put("Color", "red");
        map.put("COLOR", "blue");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get_string("color"), Some("blue"));
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["COLOR"]);
    }

    #[test]
    fn test_dirty_flag_tracks_mutation() {
        let mut map = DataMap::new();
        assert!(!map.is_dirty());
        map.put("a", 1);
        assert!(map.is_dirty());
        map.clear_dirty();
        assert!(!map.is_dirty());
        assert!(map.remove("missing").is_none());
        assert!(!map.is_dirty());
        map.remove("A");
        assert!(map.is_dirty());
    }

    #[test]
    fn test_put_all_overlays() {
        let mut job: DataMap = [("a", 1)].into_iter().collect();
        let trigger: DataMap = [("a", 2), ("b", 3)].into_iter().collect();
        job.put_all(&trigger);
        assert_eq!(job.get_int("a"), Some(2));
        assert_eq!(job.get_int("b"), Some(3));
    }

    #[test]
    fn test_typed_getters() {
        let mut map = DataMap::new();
        map.put("count", "42");
        map.put("ratio", 0.5f64);
        map.put("flag", "TRUE");
        map.put("big", 7i64);
        assert_eq!(map.get_int("count"), Some(42));
        assert_eq!(map.get_double("ratio"), Some(0.5));
        assert_eq!(map.get_bool("flag"), Some(true));
        assert_eq!(map.get_long("big"), Some(7));
        assert_eq!(map.get_as_string("ratio").as_deref(), Some("0.5"));
        assert_eq!(map.get_string("ratio"), None);
    }

    #[test]
    fn test_deserialized_map_is_clean() {
        let mut map = DataMap::new();
        map.put("name", "nightly");
        map.put("retries", 3);
        let json = serde_json::to_value(&map).unwrap();
        let restored: DataMap = serde_json::from_value(json).unwrap();
        assert_eq!(restored, map);
        assert!(!restored.is_dirty());
    }
}
