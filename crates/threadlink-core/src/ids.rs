use crate::{Result, ThreadlinkError, MAX_TAG_LEN};
use chrono::{Local, NaiveDate};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

const SLUG_MAX_WORDS: usize = 3;
const SLUG_MAX_CHARS: usize = 25;
const SLUG_FALLBACK: &str = "thread";

/// `attempt` counts previous collisions, starting at zero.
pub trait IdGenerator {
    fn generate_id(&self, seed_text: Option<&str>, attempt: u32) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate_id(&self, _seed_text: Option<&str>, _attempt: u32) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Readable ids of the form `<first_words>_<date>`, with `_2`, `_3`, ...
/// appended on collision.
#[derive(Debug, Clone, Copy)]
pub struct SlugGenerator {
    date: NaiveDate,
}

impl SlugGenerator {
    pub fn new(date: NaiveDate) -> Self {
        Self { date }
    }

    pub fn today() -> Self {
        Self::new(Local::now().date_naive())
    }
}

impl IdGenerator for SlugGenerator {
    fn generate_id(&self, seed_text: Option<&str>, attempt: u32) -> String {
        let base = format!(
            "{}_{}",
            slugify(seed_text.unwrap_or_default()),
            self.date.format("%Y-%m-%d")
        );
        if attempt == 0 {
            base
        } else {
            format!("{base}_{}", attempt + 1)
        }
    }
}

/// Non-ASCII characters are dropped before words are split.
pub fn slugify(text: &str) -> String {
    let lowered: String = text
        .chars()
        .filter(char::is_ascii)
        .collect::<String>()
        .to_ascii_lowercase();
    let words: Vec<&str> = word_regex()
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .take(SLUG_MAX_WORDS)
        .collect();
    let slug: String = words.join("_").chars().take(SLUG_MAX_CHARS).collect();
    if slug.is_empty() {
        SLUG_FALLBACK.to_string()
    } else {
        slug
    }
}

fn word_regex() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"[a-z0-9_]+").expect("word regex"))
}

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"^[a-z0-9_-]+$").expect("tag regex"))
}

pub fn is_tag(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_TAG_LEN && tag_regex().is_match(id)
}

pub fn is_uuid_v4(id: &str) -> bool {
    Uuid::parse_str(id)
        .map(|uuid| uuid.get_version_num() == 4)
        .unwrap_or(false)
}

pub fn validate_thread_id(id: &str) -> Result<()> {
    if is_tag(id) || is_uuid_v4(id) {
        return Ok(());
    }
    if id.len() > MAX_TAG_LEN {
        return Err(ThreadlinkError::invalid(format!(
            "thread tag is {} characters long, the limit is {MAX_TAG_LEN}",
            id.len()
        )));
    }
    Err(ThreadlinkError::invalid(format!(
        "thread id '{id}' must be lowercase letters, digits, '-' or '_', or a UUIDv4"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_takes_first_three_words() {
        assert_eq!(slugify("Refactor the API layer now"), "refactor_the_api");
        assert_eq!(slugify("  ...  "), SLUG_FALLBACK);
        assert_eq!(slugify("Ünïcode wörds"), "ncode_wrds");
        assert_eq!(slugify("日本語"), SLUG_FALLBACK);
        assert_eq!(
            slugify("internationalization localization globalization"),
            "internationalization_loca"
        );
    }

    #[test]
    fn slug_generator_suffixes_collisions() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).expect("date");
        let generator = SlugGenerator::new(date);
        assert_eq!(
            generator.generate_id(Some("Login flow"), 0),
            "login_flow_2026-10-16"
        );
        assert_eq!(
            generator.generate_id(Some("Login flow"), 2),
            "login_flow_2026-10-16_3"
        );
        assert!(validate_thread_id(&generator.generate_id(Some("Ünïcode wörds"), 0)).is_ok());
    }

    #[test]
    fn uuid_generator_yields_valid_ids() {
        let id = UuidGenerator.generate_id(None, 0);
        assert!(is_uuid_v4(&id));
        assert!(validate_thread_id(&id).is_ok());
    }

    #[test]
    fn validates_tag_shapes() {
        assert!(validate_thread_id("api_demo").is_ok());
        assert!(validate_thread_id("auth-2").is_ok());
        assert!(validate_thread_id("API").is_err());
        assert!(validate_thread_id("has space").is_err());
        assert!(validate_thread_id("").is_err());
        assert!(validate_thread_id(&"a".repeat(MAX_TAG_LEN)).is_ok());
        let err = validate_thread_id(&"a".repeat(MAX_TAG_LEN + 1)).expect_err("too long");
        assert!(err.to_string().contains("limit"));
        // v1 uuids are not accepted
        assert!(validate_thread_id("c232ab00-9414-11ec-b3c8-9f6bdeced846").is_err());
    }
}
