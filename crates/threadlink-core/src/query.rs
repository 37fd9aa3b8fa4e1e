use crate::{Index, Thread};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMatch {
    Exact,
    Substring,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub tags: Option<TagMatch>,
    pub platform: Option<String>,
}

impl SearchFilters {
    pub fn with_tags(mut self, mode: TagMatch) -> Self {
        self.tags = Some(mode);
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Relevance {
    Exact,
    Partial,
}

pub fn find_by_id<'a>(index: &'a Index, thread_id: &str) -> Option<&'a Thread> {
    index.get(thread_id)
}

/// Threads linking `canonical_path`, oldest first, ties by id.
pub fn reverse_lookup<'a>(index: &'a Index, canonical_path: &str) -> Vec<&'a Thread> {
    let mut hits: Vec<&Thread> = index
        .reverse()
        .thread_ids(canonical_path)
        .filter_map(|id| index.get(id))
        .collect();
    hits.sort_by(|a, b| {
        a.date_created
            .cmp(&b.date_created)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits
}

/// Exact hits first, then most recently modified, then id.
pub fn search<'a>(index: &'a Index, query: &str, filters: &SearchFilters) -> Vec<&'a Thread> {
    let needle = query.trim().to_lowercase();
    let platform = filters
        .platform
        .as_deref()
        .map(|platform| platform.trim().to_lowercase());

    let mut hits: Vec<(Relevance, &Thread)> = index
        .iter()
        .filter(|thread| match &platform {
            Some(wanted) => thread
                .metadata
                .platform
                .as_deref()
                .map(|have| have.to_lowercase() == *wanted)
                .unwrap_or(false),
            None => true,
        })
        .filter_map(|thread| relevance(thread, &needle, filters.tags).map(|rank| (rank, thread)))
        .collect();

    hits.sort_by(|(rank_a, a), (rank_b, b)| compare_hits(*rank_a, a, *rank_b, b));
    hits.into_iter().map(|(_, thread)| thread).collect()
}

fn relevance(thread: &Thread, needle: &str, tags: Option<TagMatch>) -> Option<Relevance> {
    let id = thread.id.to_lowercase();
    let lowered_tags: Vec<String> = match tags {
        Some(_) => thread.metadata.tags.iter().map(|tag| tag.to_lowercase()).collect(),
        None => Vec::new(),
    };

    if id == needle || lowered_tags.iter().any(|tag| tag == needle) {
        return Some(Relevance::Exact);
    }

    let tag_hit = matches!(tags, Some(TagMatch::Substring))
        && lowered_tags.iter().any(|tag| tag.contains(needle));
    if id.contains(needle) || thread.summary.to_lowercase().contains(needle) || tag_hit {
        return Some(Relevance::Partial);
    }
    None
}

fn compare_hits(rank_a: Relevance, a: &Thread, rank_b: Relevance, b: &Thread) -> Ordering {
    rank_a
        .cmp(&rank_b)
        .then_with(|| b.date_modified.cmp(&a.date_modified))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NewThread, ThreadMetadata, UuidGenerator};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::seconds(offset_secs)
    }

    fn create(index: &mut Index, id: &str, summary: &str, at: i64, metadata: ThreadMetadata) {
        index
            .create_thread(
                NewThread::new(summary).with_id(id).with_metadata(metadata),
                &UuidGenerator,
                ts(at),
            )
            .expect("create");
    }

    fn ids(threads: &[&Thread]) -> Vec<String> {
        threads.iter().map(|thread| thread.id.clone()).collect()
    }

    #[test]
    fn newer_modification_sorts_first() {
        let mut index = Index::new();
        create(&mut index, "auth_1", "login flow", 0, ThreadMetadata::default());
        create(&mut index, "auth_2", "auth tokens", 1, ThreadMetadata::default());
        let hits = search(&index, "auth", &SearchFilters::default());
        assert_eq!(ids(&hits), vec!["auth_2", "auth_1"]);
    }

    #[test]
    fn equal_modification_times_keep_creation_order() {
        let mut index = Index::new();
        create(&mut index, "auth_1", "login flow", 0, ThreadMetadata::default());
        create(&mut index, "auth_2", "auth tokens", 0, ThreadMetadata::default());
        let hits = search(&index, "AUTH", &SearchFilters::default());
        assert_eq!(ids(&hits), vec!["auth_1", "auth_2"]);
    }

    #[test]
    fn exact_id_beats_newer_partial_match() {
        let mut index = Index::new();
        create(&mut index, "deploy", "rollout plan", 0, ThreadMetadata::default());
        create(&mut index, "deploy_v2", "second deploy", 5, ThreadMetadata::default());
        create(&mut index, "unrelated", "cooking", 6, ThreadMetadata::default());
        let hits = search(&index, "Deploy", &SearchFilters::default());
        assert_eq!(ids(&hits), vec!["deploy", "deploy_v2"]);
    }

    #[test]
    fn tags_only_match_when_requested() {
        let mut index = Index::new();
        let tagged = ThreadMetadata {
            tags: vec!["Backend".to_string()],
            ..ThreadMetadata::default()
        };
        create(&mut index, "t1", "storage layer", 0, tagged);
        create(&mut index, "t2", "backend refactor", 1, ThreadMetadata::default());

        let plain = search(&index, "backend", &SearchFilters::default());
        assert_eq!(ids(&plain), vec!["t2"]);

        let exact = search(&index, "backend", &SearchFilters::default().with_tags(TagMatch::Exact));
        assert_eq!(ids(&exact), vec!["t1", "t2"]);

        let substring = search(&index, "back", &SearchFilters::default().with_tags(TagMatch::Substring));
        assert_eq!(ids(&substring), vec!["t2", "t1"]);

        let exact_only = search(&index, "back", &SearchFilters::default().with_tags(TagMatch::Exact));
        assert_eq!(ids(&exact_only), vec!["t2"]);
    }

    #[test]
    fn platform_filter_restricts_results() {
        let mut index = Index::new();
        let claude = ThreadMetadata {
            platform: Some("Claude".to_string()),
            ..ThreadMetadata::default()
        };
        create(&mut index, "a", "notes", 0, claude);
        create(&mut index, "b", "notes", 1, ThreadMetadata::default());
        let hits = search(&index, "notes", &SearchFilters::default().with_platform("claude"));
        assert_eq!(ids(&hits), vec!["a"]);
    }

    #[test]
    fn empty_query_lists_everything() {
        let mut index = Index::new();
        create(&mut index, "a", "x", 0, ThreadMetadata::default());
        create(&mut index, "b", "y", 1, ThreadMetadata::default());
        assert_eq!(ids(&search(&index, "  ", &SearchFilters::default())), vec!["b", "a"]);
    }

    #[test]
    fn reverse_lookup_orders_by_creation() {
        let mut index = Index::new();
        create(&mut index, "late", "x", 10, ThreadMetadata::default());
        create(&mut index, "early", "y", 1, ThreadMetadata::default());
        create(&mut index, "also_early", "z", 1, ThreadMetadata::default());
        for id in ["late", "early", "also_early"] {
            index
                .attach(id, "/w/spec.md".to_string(), "created", ts(20))
                .expect("attach");
        }
        let hits = reverse_lookup(&index, "/w/spec.md");
        assert_eq!(ids(&hits), vec!["also_early", "early", "late"]);
        assert!(reverse_lookup(&index, "/w/other.md").is_empty());
        assert_eq!(find_by_id(&index, "late").map(|t| t.id.as_str()), Some("late"));
        assert!(find_by_id(&index, "missing").is_none());
    }
}
