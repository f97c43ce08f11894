//! The log entry data model.
//!
//! Entries are mutated only between pool acquisition and enqueue; workers and
//! sinks treat them as immutable. Label maps use copy-on-write so a batch
//! fanning out to several sinks shares one frozen map.

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// Maximum length of a label key.
pub const MAX_LABEL_KEY_LEN: usize = 63;

/// Heterogeneous scalar value carried in an entry's field map.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    // Uint before Int so non-negative integers keep their variant across a
    // serde round trip.
    Uint(u64),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Returns true if `key` matches `[A-Za-z][A-Za-z0-9_]*` and fits the length
/// limit.
pub fn is_valid_label_key(key: &str) -> bool {
    if key.is_empty() || key.len() > MAX_LABEL_KEY_LEN {
        return false;
    }
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Copy-on-write label map.
///
/// Cloning is a pointer copy; the first mutation after a clone copies the
/// underlying map, so frozen snapshots handed to sinks are never disturbed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSet {
    map: Arc<HashMap<String, String>>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an existing map, keeping only valid keys.
    ///
    /// Invalid keys are dropped with a debug log rather than failing the
    /// entry; producers own their key hygiene.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut out = HashMap::with_capacity(map.len());
        for (k, v) in map {
            if is_valid_label_key(k) {
                out.insert(k.clone(), v.clone());
            } else {
                tracing::debug!(key = %k, "dropping label with invalid key");
            }
        }
        Self { map: Arc::new(out) }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Insert a label. Returns false (and leaves the map untouched) for an
    /// invalid key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if !is_valid_label_key(&key) {
            return false;
        }
        Arc::make_mut(&mut self.map).insert(key, value.into());
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        if self.map.contains_key(key) {
            Arc::make_mut(&mut self.map).remove(key)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn clear(&mut self) {
        if !self.map.is_empty() {
            self.map = Arc::new(HashMap::new());
        }
    }

    /// True if both sets still share the same frozen storage.
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.map, &other.map)
    }
}

impl Serialize for LabelSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.map.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LabelSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = HashMap::<String, String>::deserialize(deserializer)?;
        Ok(Self { map: Arc::new(map) })
    }
}

/// Epoch-millisecond encoding for entry timestamps, so DLQ lines stay
/// readable and sortable.
pub(crate) mod ts_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(ts: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = ts
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}

/// The quantum of work moving through the pipeline.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    #[serde(with = "ts_millis")]
    pub timestamp: SystemTime,
    pub message: String,
    /// Advisory severity string; the pipeline does not interpret it.
    #[serde(default)]
    pub level: String,
    pub source_type: String,
    pub source_id: String,
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default)]
    pub fields: HashMap<String, FieldValue>,
}

impl LogEntry {
    pub fn new(
        source_type: impl Into<String>,
        source_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: SystemTime::now(),
            message: message.into(),
            level: String::new(),
            source_type: source_type.into(),
            source_id: source_id.into(),
            labels: LabelSet::new(),
            fields: HashMap::new(),
        }
    }

    /// Reset to an empty shell so the pool can hand the allocation back out.
    pub(crate) fn reset(&mut self) {
        self.timestamp = SystemTime::UNIX_EPOCH;
        self.message.clear();
        self.level.clear();
        self.source_type.clear();
        self.source_id.clear();
        self.labels.clear();
        self.fields.clear();
    }
}

impl Default for LogEntry {
    fn default() -> Self {
        Self {
            timestamp: SystemTime::UNIX_EPOCH,
            message: String::new(),
            level: String::new(),
            source_type: String::new(),
            source_id: String::new(),
            labels: LabelSet::new(),
            fields: HashMap::new(),
        }
    }
}
