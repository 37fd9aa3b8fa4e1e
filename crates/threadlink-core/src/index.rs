use crate::ids::validate_thread_id;
use crate::{
    IdGenerator, MetadataPatch, NewThread, Result, Thread, ThreadMetadata, ThreadPatch,
    ThreadlinkError, FILE_RELATIONSHIPS_KEY, MAX_ID_ATTEMPTS, PROTOCOL_VERSION,
};
use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;
use url::Url;

const TYPED_METADATA_KEYS: [&str; 6] = [
    "platform",
    "tags",
    "relationship",
    "confidence",
    "notes",
    FILE_RELATIONSHIPS_KEY,
];

/// Canonical path -> thread ids. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReverseIndex {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl ReverseIndex {
    pub fn build<'a>(threads: impl IntoIterator<Item = &'a Thread>) -> Self {
        let mut reverse = Self::default();
        for thread in threads {
            for path in &thread.linked_files {
                reverse.insert(path, &thread.id);
            }
        }
        reverse
    }

    pub fn thread_ids(&self, path: &str) -> impl Iterator<Item = &str> + '_ {
        self.entries
            .get(path)
            .into_iter()
            .flat_map(|ids| ids.iter().map(String::as_str))
    }

    pub fn contains(&self, path: &str, thread_id: &str) -> bool {
        self.entries
            .get(path)
            .map(|ids| ids.contains(thread_id))
            .unwrap_or(false)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, path: &str, thread_id: &str) {
        self.entries
            .entry(path.to_string())
            .or_default()
            .insert(thread_id.to_string());
    }

    fn remove(&mut self, path: &str, thread_id: &str) {
        if let Some(ids) = self.entries.get_mut(path) {
            ids.remove(thread_id);
            if ids.is_empty() {
                self.entries.remove(path);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Index {
    threads: Vec<Thread>,
    reverse: ReverseIndex,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_threads(threads: Vec<Thread>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut cleaned = Vec::with_capacity(threads.len());
        for mut thread in threads {
            if !seen.insert(thread.id.clone()) {
                return Err(ThreadlinkError::invalid(format!(
                    "thread id '{}' appears more than once",
                    thread.id
                )));
            }
            let before = thread.linked_files.len();
            let mut unique = BTreeSet::new();
            thread.linked_files.retain(|path| unique.insert(path.clone()));
            if thread.linked_files.len() != before {
                warn!(
                    thread_id = %thread.id,
                    dropped = before - thread.linked_files.len(),
                    "collapsed duplicate linked files"
                );
            }
            cleaned.push(thread);
        }
        let reverse = ReverseIndex::build(&cleaned);
        Ok(Self {
            threads: cleaned,
            reverse,
        })
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Thread> {
        self.threads.iter()
    }

    pub fn get(&self, thread_id: &str) -> Option<&Thread> {
        self.threads.iter().find(|thread| thread.id == thread_id)
    }

    pub fn contains(&self, thread_id: &str) -> bool {
        self.get(thread_id).is_some()
    }

    pub fn reverse(&self) -> &ReverseIndex {
        &self.reverse
    }

    fn position(&self, thread_id: &str) -> Result<usize> {
        self.threads
            .iter()
            .position(|thread| thread.id == thread_id)
            .ok_or_else(|| ThreadlinkError::NoSuchThread(thread_id.to_string()))
    }

    pub fn create_thread(
        &mut self,
        new: NewThread,
        ids: &dyn IdGenerator,
        now: DateTime<Utc>,
    ) -> Result<&Thread> {
        let chat_url = validate_chat_url(new.chat_url.as_deref())?;
        validate_metadata(&new.metadata)?;

        let (id, auto_generated) = match new.id {
            Some(id) => {
                validate_thread_id(&id)?;
                if self.contains(&id) {
                    return Err(ThreadlinkError::DuplicateId(id));
                }
                (id, false)
            }
            None => (self.generate_free_id(&new.summary, ids)?, true),
        };

        self.threads.push(Thread {
            id,
            summary: new.summary,
            chat_url,
            linked_files: Vec::new(),
            date_created: now,
            date_modified: now,
            auto_generated,
            protocol_version: PROTOCOL_VERSION.to_string(),
            metadata: new.metadata,
            extra: BTreeMap::new(),
        });
        let created = self.threads.len() - 1;
        Ok(&self.threads[created])
    }

    fn generate_free_id(&self, summary: &str, ids: &dyn IdGenerator) -> Result<String> {
        let seed = Some(summary).filter(|text| !text.trim().is_empty());
        for attempt in 0..MAX_ID_ATTEMPTS {
            let candidate = ids.generate_id(seed, attempt);
            validate_thread_id(&candidate)?;
            if !self.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ThreadlinkError::IdExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// Links an already canonical path to a thread.
    pub fn attach(
        &mut self,
        thread_id: &str,
        path: String,
        relationship: &str,
        now: DateTime<Utc>,
    ) -> Result<&Thread> {
        let relationship = relationship.trim();
        if relationship.is_empty() {
            return Err(ThreadlinkError::invalid("relationship label is empty"));
        }
        let idx = self.position(thread_id)?;
        let thread = &mut self.threads[idx];
        if thread.has_file(&path) {
            return Err(ThreadlinkError::DuplicateFile {
                thread_id: thread_id.to_string(),
                path,
            });
        }
        if let Some(unreadable) = thread.metadata.extra.remove(FILE_RELATIONSHIPS_KEY) {
            warn!(thread_id, %unreadable, "replacing malformed file relationships");
        }
        thread
            .metadata
            .file_relationships
            .insert(path.clone(), relationship.to_string());
        thread.date_modified = now;
        self.reverse.insert(&path, thread_id);
        thread.linked_files.push(path);
        Ok(&self.threads[idx])
    }

    pub fn detach(&mut self, thread_id: &str, path: &str, now: DateTime<Utc>) -> Result<&Thread> {
        let idx = self.position(thread_id)?;
        let thread = &mut self.threads[idx];
        if !thread.has_file(path) {
            return Err(ThreadlinkError::FileNotLinked {
                thread_id: thread_id.to_string(),
                path: path.to_string(),
            });
        }
        thread.linked_files.retain(|linked| linked != path);
        thread.metadata.file_relationships.remove(path);
        thread.date_modified = now;
        self.reverse.remove(path, thread_id);
        Ok(&self.threads[idx])
    }

    pub fn update_metadata(
        &mut self,
        thread_id: &str,
        patch: ThreadPatch,
        now: DateTime<Utc>,
    ) -> Result<&Thread> {
        if let Some(field) = patch.immutable_field() {
            return Err(ThreadlinkError::ImmutableField(field.to_string()));
        }
        let idx = self.position(thread_id)?;
        let chat_url = match &patch.chat_url {
            Some(url) => Some(validate_chat_url(url.as_deref())?),
            None => None,
        };
        if let Some(Some(confidence)) = patch.metadata.confidence {
            validate_confidence(confidence)?;
        }
        reject_shadowed_keys(&patch.metadata.extra)?;

        let thread = &mut self.threads[idx];
        if let Some(summary) = patch.summary {
            thread.summary = summary;
        }
        if let Some(chat_url) = chat_url {
            thread.chat_url = chat_url;
        }
        merge_metadata(&mut thread.metadata, patch.metadata);
        thread.date_modified = now;
        Ok(&self.threads[idx])
    }

    pub fn delete_thread(&mut self, thread_id: &str) -> Result<Thread> {
        let idx = self.position(thread_id)?;
        let removed = self.threads.remove(idx);
        for path in &removed.linked_files {
            self.reverse.remove(path, &removed.id);
        }
        Ok(removed)
    }
}

// Writing a typed field drops a same-named value that was kept in `extra`
// because it did not fit the type.
fn merge_metadata(metadata: &mut ThreadMetadata, patch: MetadataPatch) {
    if let Some(platform) = patch.platform {
        metadata.platform = platform;
        metadata.extra.remove("platform");
    }
    if let Some(tags) = patch.tags {
        metadata.tags = tags;
        metadata.extra.remove("tags");
    }
    if let Some(relationship) = patch.relationship {
        metadata.relationship = relationship;
        metadata.extra.remove("relationship");
    }
    if let Some(confidence) = patch.confidence {
        metadata.confidence = confidence;
        metadata.extra.remove("confidence");
    }
    if let Some(notes) = patch.notes {
        metadata.notes = notes;
        metadata.extra.remove("notes");
    }
    for (key, value) in patch.extra {
        if value.is_null() {
            metadata.extra.remove(&key);
        } else {
            metadata.extra.insert(key, value);
        }
    }
}

/// Empty means "no link". Anything else must be an http(s) URL.
pub fn validate_chat_url(raw: Option<&str>) -> Result<Option<String>> {
    let Some(raw) = raw.filter(|url| !url.trim().is_empty()) else {
        return Ok(None);
    };
    let parsed = Url::parse(raw.trim())
        .map_err(|err| ThreadlinkError::invalid(format!("chat url '{raw}' is not a URL: {err}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(Some(raw.to_string())),
        other => Err(ThreadlinkError::invalid(format!(
            "chat url scheme '{other}' is not allowed, use http or https"
        ))),
    }
}

fn validate_confidence(confidence: f64) -> Result<()> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(ThreadlinkError::invalid(format!(
            "confidence {confidence} is outside 0.0..=1.0"
        )))
    }
}

fn validate_metadata(metadata: &ThreadMetadata) -> Result<()> {
    if !metadata.file_relationships.is_empty() {
        return Err(ThreadlinkError::invalid(
            "file relationships are recorded by attach, not at creation",
        ));
    }
    if let Some(confidence) = metadata.confidence {
        validate_confidence(confidence)?;
    }
    reject_shadowed_keys(&metadata.extra)
}

fn reject_shadowed_keys(extra: &BTreeMap<String, serde_json::Value>) -> Result<()> {
    match extra.keys().find(|key| TYPED_METADATA_KEYS.contains(&key.as_str())) {
        Some(key) => Err(ThreadlinkError::invalid(format!(
            "metadata key '{key}' must be set through its typed field"
        ))),
        None => Ok(()),
    }
}

impl PartialEq for Index {
    // order ignored
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .threads
                .iter()
                .all(|thread| other.get(&thread.id) == Some(thread))
    }
}

impl Serialize for Index {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.threads.len()))?;
        for thread in &self.threads {
            map.serialize_entry(&thread.id, thread)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Index {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IndexVisitor;

        impl<'de> Visitor<'de> for IndexVisitor {
            type Value = Index;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping thread ids to thread records")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Index, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut threads = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((id, mut thread)) = access.next_entry::<String, Thread>()? {
                    thread.id = id;
                    threads.push(thread);
                }
                Index::from_threads(threads).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_map(IndexVisitor)
    }
}
