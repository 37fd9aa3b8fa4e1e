use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod clock;
pub mod error;
pub mod ids;
pub mod index;
pub mod paths;
pub mod query;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, ThreadlinkError};
pub use ids::{IdGenerator, SlugGenerator, UuidGenerator};
pub use index::{Index, ReverseIndex};
pub use paths::PathNormalizer;
pub use query::{SearchFilters, TagMatch};

/// Schema version stamped on threads created by this build.
pub const PROTOCOL_VERSION: &str = "1";
pub const LEGACY_PROTOCOL_VERSION: &str = "0";
pub const DEFAULT_RELATIONSHIP: &str = "created";
pub const MAX_TAG_LEN: usize = 100;
pub const MAX_ID_ATTEMPTS: u32 = 8;

/// Metadata key holding the per-file relationship labels recorded by attach.
pub const FILE_RELATIONSHIPS_KEY: &str = "file_relationships";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ThreadRecord")]
pub struct Thread {
    #[serde(skip)]
    pub id: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_url: Option<String>,
    pub linked_files: Vec<String>,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
    pub auto_generated: bool,
    pub protocol_version: String,
    #[serde(skip_serializing_if = "ThreadMetadata::is_empty")]
    pub metadata: ThreadMetadata,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Thread {
    pub fn has_file(&self, path: &str) -> bool {
        self.linked_files.iter().any(|linked| linked == path)
    }

    pub fn to_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert("id".to_string(), Value::String(self.id.clone()));
        }
        value
    }
}

#[derive(Deserialize)]
struct ThreadRecord {
    #[serde(default)]
    summary: String,
    #[serde(default, deserialize_with = "deserialize_chat_url")]
    chat_url: Option<String>,
    #[serde(default)]
    linked_files: Vec<String>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    date_created: DateTime<Utc>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    date_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    auto_generated: bool,
    #[serde(default = "legacy_protocol_version")]
    protocol_version: String,
    #[serde(default, deserialize_with = "deserialize_metadata")]
    metadata: ThreadMetadata,
    #[serde(default, flatten)]
    extra: BTreeMap<String, Value>,
}

impl From<ThreadRecord> for Thread {
    fn from(record: ThreadRecord) -> Self {
        Self {
            id: String::new(),
            summary: record.summary,
            chat_url: record.chat_url,
            linked_files: record.linked_files,
            date_created: record.date_created,
            date_modified: record.date_modified.unwrap_or(record.date_created),
            auto_generated: record.auto_generated,
            protocol_version: record.protocol_version,
            metadata: record.metadata,
            extra: record.extra,
        }
    }
}

/// Reserved keys whose stored value does not fit the typed field are kept
/// in `extra` under the same key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Value>")]
pub struct ThreadMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub file_relationships: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl From<BTreeMap<String, Value>> for ThreadMetadata {
    fn from(mut raw: BTreeMap<String, Value>) -> Self {
        let platform = take_typed(&mut raw, "platform", from_value);
        let tags = take_typed(&mut raw, "tags", |value| tags_from_value(value).ok())
            .unwrap_or_default();
        let relationship = take_typed(&mut raw, "relationship", from_value);
        let confidence = take_typed(&mut raw, "confidence", from_value);
        let notes = take_typed(&mut raw, "notes", from_value);
        let file_relationships =
            take_typed(&mut raw, FILE_RELATIONSHIPS_KEY, from_value).unwrap_or_default();
        Self {
            platform,
            tags,
            relationship,
            confidence,
            notes,
            file_relationships,
            extra: raw,
        }
    }
}

fn from_value<T: DeserializeOwned>(value: Value) -> Option<T> {
    serde_json::from_value(value).ok()
}

// a null counts as absent
fn take_typed<T>(
    raw: &mut BTreeMap<String, Value>,
    key: &str,
    parse: impl FnOnce(Value) -> Option<T>,
) -> Option<T> {
    match raw.get(key)? {
        Value::Null => {
            raw.remove(key);
            None
        }
        value => {
            let parsed = parse(value.clone())?;
            raw.remove(key);
            Some(parsed)
        }
    }
}

impl ThreadMetadata {
    pub fn is_empty(&self) -> bool {
        self.platform.is_none()
            && self.tags.is_empty()
            && self.relationship.is_none()
            && self.confidence.is_none()
            && self.notes.is_none()
            && self.file_relationships.is_empty()
            && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewThread {
    pub id: Option<String>,
    pub summary: String,
    pub chat_url: Option<String>,
    pub metadata: ThreadMetadata,
}

impl NewThread {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_chat_url(mut self, url: impl Into<String>) -> Self {
        self.chat_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: ThreadMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Inner `None` clears a field. The immutable slots are only there to be
/// rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadPatch {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub chat_url: Option<Option<String>>,
    #[serde(default)]
    pub metadata: MetadataPatch,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub date_created: Option<Value>,
    #[serde(default)]
    pub date_modified: Option<Value>,
    #[serde(default)]
    pub protocol_version: Option<Value>,
}

impl ThreadPatch {
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|err| ThreadlinkError::invalid(format!("malformed thread patch: {err}")))
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn immutable_field(&self) -> Option<&'static str> {
        if self.id.is_some() {
            Some("id")
        } else if self.date_created.is_some() {
            Some("date_created")
        } else if self.date_modified.is_some() {
            Some("date_modified")
        } else if self.protocol_version.is_some() {
            Some("protocol_version")
        } else if self.metadata.extra.contains_key(FILE_RELATIONSHIPS_KEY) {
            Some("metadata.file_relationships")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataPatch {
    #[serde(default, deserialize_with = "deserialize_some")]
    pub platform: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_optional_tags")]
    pub tags: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub relationship: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub confidence: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub notes: Option<Option<String>>,
    /// Pass-through keys; a JSON `null` removes the key.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.platform.is_none()
            && self.tags.is_none()
            && self.relationship.is_none()
            && self.confidence.is_none()
            && self.notes.is_none()
            && self.extra.is_empty()
    }
}

fn legacy_protocol_version() -> String {
    LEGACY_PROTOCOL_VERSION.to_string()
}

fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

fn deserialize_chat_url<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|url| !url.trim().is_empty()))
}

/// RFC 3339, or an offset-less timestamp read as local time.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()?;
    Some(
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    )
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
}

fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'"))),
    }
}

fn tags_from_value(value: Value) -> Result<Vec<String>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(joined) => Ok(split_tags(&joined)),
        Value::Array(items) => {
            let mut tags = Vec::new();
            for item in items {
                match item {
                    Value::String(tag) => {
                        let tag = tag.trim();
                        if !tag.is_empty() {
                            tags.push(tag.to_string());
                        }
                    }
                    Value::Number(n) => tags.push(n.to_string()),
                    _ => return Err("expected string tags".to_string()),
                }
            }
            Ok(tags)
        }
        _ => Err("expected a list of tags or a comma separated string".to_string()),
    }
}

pub fn split_tags(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

fn deserialize_metadata<'de, D>(deserializer: D) -> Result<ThreadMetadata, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Value>> = Option::deserialize(deserializer)?;
    Ok(raw.map(ThreadMetadata::from).unwrap_or_default())
}

fn deserialize_optional_tags<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    tags_from_value(Value::deserialize(deserializer)?)
        .map(Some)
        .map_err(serde::de::Error::custom)
}
