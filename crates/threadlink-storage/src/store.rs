use crate::{IndexPersistence, JsonIndexFile, LoadOutcome};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use threadlink_core::paths::validate_raw_path;
use threadlink_core::{
    query, Clock, IdGenerator, Index, NewThread, PathNormalizer, Result, SearchFilters,
    SystemClock, Thread, ThreadPatch, DEFAULT_RELATIONSHIP,
};
use tracing::info;

/// Mutations run as one locked load -> mutate -> save; nothing is cached.
pub struct ThreadStore<P = JsonIndexFile> {
    persistence: P,
    clock: Arc<dyn Clock>,
    normalizer: PathNormalizer,
}

impl ThreadStore<JsonIndexFile> {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(JsonIndexFile::new(path))
    }
}

impl<P: IndexPersistence> ThreadStore<P> {
    pub fn new(persistence: P) -> Self {
        Self {
            persistence,
            clock: Arc::new(SystemClock),
            normalizer: PathNormalizer::from_env(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_normalizer(mut self, normalizer: PathNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    pub fn normalizer(&self) -> &PathNormalizer {
        &self.normalizer
    }

    pub fn create_thread(&self, new: NewThread, ids: &dyn IdGenerator) -> Result<Thread> {
        let thread = self.mutate(|index, now| index.create_thread(new, ids, now).cloned())?;
        info!(thread_id = %thread.id, auto_generated = thread.auto_generated, "thread created");
        Ok(thread)
    }

    /// Links a file to a thread; `relationship` defaults to "created".
    pub fn attach(
        &self,
        thread_id: &str,
        raw_path: &str,
        relationship: Option<&str>,
    ) -> Result<Thread> {
        validate_raw_path(raw_path)?;
        let canonical = self.normalizer.normalize(raw_path);
        let relationship = relationship.unwrap_or(DEFAULT_RELATIONSHIP);
        let thread = self.mutate(|index, now| {
            index
                .attach(thread_id, canonical.clone(), relationship, now)
                .cloned()
        })?;
        info!(thread_id, path = %canonical, relationship, "file attached");
        Ok(thread)
    }

    pub fn detach(&self, thread_id: &str, raw_path: &str) -> Result<Thread> {
        validate_raw_path(raw_path)?;
        let canonical = self.normalizer.normalize(raw_path);
        let thread = self.mutate(|index, now| {
            // entries written by older tools may not be canonical
            let target = match index.get(thread_id) {
                Some(thread) if !thread.has_file(&canonical) && thread.has_file(raw_path) => {
                    raw_path.to_string()
                }
                _ => canonical.clone(),
            };
            index.detach(thread_id, &target, now).cloned()
        })?;
        info!(thread_id, path = %canonical, "file detached");
        Ok(thread)
    }

    pub fn update_metadata(&self, thread_id: &str, patch: ThreadPatch) -> Result<Thread> {
        let thread = self.mutate(|index, now| index.update_metadata(thread_id, patch, now).cloned())?;
        info!(thread_id, "thread updated");
        Ok(thread)
    }

    pub fn delete_thread(&self, thread_id: &str) -> Result<Thread> {
        let thread = self.mutate(|index, _now| index.delete_thread(thread_id))?;
        info!(thread_id, files = thread.linked_files.len(), "thread deleted");
        Ok(thread)
    }

    pub fn find_by_id(&self, thread_id: &str) -> Result<Option<Thread>> {
        self.read(|index| query::find_by_id(index, thread_id).cloned())
    }

    pub fn reverse_lookup(&self, raw_path: &str) -> Result<Vec<Thread>> {
        validate_raw_path(raw_path)?;
        let canonical = self.normalizer.normalize(raw_path);
        self.read(|index| {
            query::reverse_lookup(index, &canonical)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn search(&self, query_text: &str, filters: &SearchFilters) -> Result<Vec<Thread>> {
        self.read(|index| {
            query::search(index, query_text, filters)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn list(&self) -> Result<Vec<Thread>> {
        self.read(|index| index.threads().to_vec())
    }

    pub fn load_snapshot(&self) -> Result<LoadOutcome> {
        let _guard = self.persistence.lock_shared()?;
        self.persistence.load()
    }

    fn mutate<T>(&self, op: impl FnOnce(&mut Index, DateTime<Utc>) -> Result<T>) -> Result<T> {
        let _guard = self.persistence.lock_exclusive()?;
        let mut index = self.persistence.load()?.into_index()?;
        let outcome = op(&mut index, self.clock.now())?;
        self.persistence.save(&index)?;
        Ok(outcome)
    }

    fn read<T>(&self, op: impl FnOnce(&Index) -> T) -> Result<T> {
        let _guard = self.persistence.lock_shared()?;
        let index = self.persistence.load()?.into_index()?;
        Ok(op(&index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryPersistence;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use threadlink_core::{ManualClock, ReverseIndex, ThreadlinkError, UuidGenerator};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn memory_store() -> ThreadStore<MemoryPersistence> {
        ThreadStore::new(MemoryPersistence::new())
            .with_clock(Arc::new(ManualClock::with_step(start(), Duration::seconds(1))))
            .with_normalizer(PathNormalizer::new(
                Some(PathBuf::from("/home/dev")),
                "/home/dev/project",
            ))
    }

    #[test]
    fn create_attach_reverse_scenario() {
        let store = memory_store();
        store
            .create_thread(NewThread::new("API design").with_id("api_demo"), &UuidGenerator)
            .expect("create");
        store
            .attach("api_demo", "./spec.md", None)
            .expect("attach");

        let hits = store.reverse_lookup("./spec.md").expect("reverse");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "api_demo");
        assert_eq!(
            hits[0].linked_files,
            vec![store.normalizer().normalize("/home/dev/project/spec.md")]
        );

        // the same file spelled differently resolves to the same key
        let via_home = store.reverse_lookup("~/project/spec.md").expect("reverse");
        assert_eq!(via_home, hits);
    }

    #[test]
    fn every_mutation_persists() {
        let store = memory_store();
        store
            .create_thread(NewThread::new("x").with_id("a"), &UuidGenerator)
            .expect("create");
        store.attach("a", "/tmp/one", Some("informed")).expect("attach");
        store.detach("a", "/tmp/one").expect("detach");
        store
            .update_metadata("a", ThreadPatch::default().summary("y"))
            .expect("update");
        store.delete_thread("a").expect("delete");
        assert_eq!(store.persistence().save_count(), 5);
        assert_eq!(store.persistence().document().as_deref(), Some("{}\n"));
    }

    #[test]
    fn failed_save_discards_mutation() {
        let store = memory_store();
        store
            .create_thread(NewThread::new("x").with_id("a"), &UuidGenerator)
            .expect("create");
        store.persistence().fail_next_saves(1);
        let err = store.attach("a", "/tmp/one", None).expect_err("save fails");
        assert!(matches!(err, ThreadlinkError::Io { .. }));

        let thread = store.find_by_id("a").expect("read").expect("thread");
        assert!(thread.linked_files.is_empty());
        assert!(store.reverse_lookup("/tmp/one").expect("reverse").is_empty());
    }

    #[test]
    fn failed_operation_does_not_save() {
        let store = memory_store();
        let err = store.attach("ghost", "/tmp/one", None).expect_err("no thread");
        assert!(matches!(err, ThreadlinkError::NoSuchThread(_)));
        assert_eq!(store.persistence().save_count(), 0);

        let err = store.attach("ghost", "  ", None).expect_err("blank path");
        assert!(matches!(err, ThreadlinkError::InvalidInput(_)));
    }

    #[test]
    fn detach_accepts_literal_legacy_entries() {
        let persistence = MemoryPersistence::with_document(
            json!({
                "legacy": {
                    "summary": "old",
                    "linked_files": ["notes/../todo.md"],
                    "date_created": "2025-01-01T00:00:00Z"
                }
            })
            .to_string(),
        );
        let store = ThreadStore::new(persistence)
            .with_normalizer(PathNormalizer::new(None, "/nonexistent-root"));
        let thread = store.detach("legacy", "notes/../todo.md").expect("detach literal");
        assert!(thread.linked_files.is_empty());
    }

    #[test]
    fn corrupt_document_surfaces_once() {
        let store = ThreadStore::new(MemoryPersistence::with_document("{ broken"));
        let err = store.list().expect_err("corrupt");
        assert!(matches!(err, ThreadlinkError::CorruptIndex { .. }));
        assert_eq!(store.persistence().document().as_deref(), Some("{ broken"));
        assert!(store.list().expect("retry").is_empty());
        assert_eq!(store.persistence().backups().len(), 1);

        store
            .create_thread(NewThread::new("x").with_id("a"), &UuidGenerator)
            .expect("create replaces the document");
        assert!(store.list().expect("list").iter().any(|thread| thread.id == "a"));
        assert_eq!(store.persistence().backups().len(), 1);
    }

    #[test]
    fn schema_less_metadata_values_load_cleanly() {
        let document = json!({
            "odd": {
                "summary": "odd metadata",
                "date_created": "2025-01-01T00:00:00Z",
                "metadata": {"confidence": "high", "platform": 3}
            },
            "plain": {
                "summary": "plain",
                "date_created": "2025-01-02T00:00:00Z",
                "metadata": {"platform": "claude"}
            }
        })
        .to_string();
        let store = ThreadStore::new(MemoryPersistence::with_document(document.clone()));

        let threads = store.list().expect("list");
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].metadata.extra.get("confidence"), Some(&json!("high")));
        assert!(store.persistence().backups().is_empty());
        assert_eq!(store.persistence().document(), Some(document));

        store.attach("plain", "/tmp/one", None).expect("attach");
        let odd = store.find_by_id("odd").expect("read").expect("thread");
        assert_eq!(odd.metadata.extra.get("platform"), Some(&json!(3)));
    }

    #[test]
    fn load_snapshot_reports_without_failing() {
        let store = ThreadStore::new(MemoryPersistence::with_document("[]"));
        let outcome = store.load_snapshot().expect("snapshot");
        assert!(outcome.index.is_empty());
        assert!(outcome.recovered.is_some());
    }

    #[test]
    fn random_sequences_keep_reverse_index_consistent() {
        let store = memory_store();
        let threads = ["t0", "t1", "t2"];
        let files = ["/f/a", "/f/b", "/f/c", "/f/d"];
        for id in threads {
            store
                .create_thread(NewThread::new(id).with_id(id), &UuidGenerator)
                .expect("create");
        }
        // deterministic pseudo-random walk over attach/detach
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..60 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let thread = threads[(seed % threads.len() as u64) as usize];
            let file = files[((seed >> 8) % files.len() as u64) as usize];
            if (seed >> 16) % 2 == 0 {
                let _ = store.attach(thread, file, None);
            } else {
                let _ = store.detach(thread, file);
            }
        }
        store.delete_thread("t1").expect("delete");

        let outcome = store.load_snapshot().expect("snapshot");
        let index = outcome.index;
        assert_eq!(index.reverse(), &ReverseIndex::build(index.threads()));
        for file in files {
            let expected: Vec<String> = index
                .iter()
                .filter(|thread| thread.has_file(file))
                .map(|thread| thread.id.clone())
                .collect();
            let mut found: Vec<String> = store
                .reverse_lookup(file)
                .expect("reverse")
                .into_iter()
                .map(|thread| thread.id)
                .collect();
            found.sort();
            assert_eq!(found, expected, "file {file}");
        }
    }
}
