use crate::config::Settings;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};
use threadlink_core::{
    Index, NewThread, SearchFilters, SlugGenerator, TagMatch, Thread, ThreadMetadata,
    ThreadPatch, ThreadlinkError, UuidGenerator,
};
use threadlink_storage::{JsonIndexFile, ThreadStore};
use tracing::warn;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum ThreadCommand {
    /// Create a thread, with a random id unless --tag is given
    New(NewArgs),
    /// Create a thread whose id is derived from its summary and today's date
    Quick(QuickArgs),
    /// Link a file to a thread
    Attach(AttachArgs),
    /// Unlink a file from a thread
    Detach(DetachArgs),
    Show(ShowArgs),
    Search(SearchArgs),
    /// Find the threads a file is linked to
    Reverse(ReverseArgs),
    Edit(EditArgs),
    #[command(alias = "rm")]
    Delete(DeleteArgs),
    /// Print the whole index
    List,
}

#[derive(Args, Debug)]
pub struct NewArgs {
    #[arg(long)]
    pub tag: Option<String>,
    #[arg(long, default_value = "")]
    pub summary: String,
    #[arg(long, alias = "chat_url")]
    pub chat_url: Option<String>,
    #[arg(long)]
    pub platform: Option<String>,
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,
    #[arg(long)]
    pub notes: Option<String>,
}

#[derive(Args, Debug)]
pub struct QuickArgs {
    pub summary: String,
    pub chat_url: Option<String>,
}

#[derive(Args, Debug)]
pub struct AttachArgs {
    pub tag: String,
    pub file: String,
    #[arg(long)]
    pub relationship: Option<String>,
}

#[derive(Args, Debug)]
pub struct DetachArgs {
    pub tag: String,
    pub file: String,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub tag: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TagMode {
    Exact,
    Substring,
}

impl From<TagMode> for TagMatch {
    fn from(mode: TagMode) -> Self {
        match mode {
            TagMode::Exact => TagMatch::Exact,
            TagMode::Substring => TagMatch::Substring,
        }
    }
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    pub query: String,
    #[arg(long, value_enum)]
    pub tags: Option<TagMode>,
    #[arg(long)]
    pub platform: Option<String>,
}

#[derive(Args, Debug)]
pub struct ReverseArgs {
    pub file: String,
}

#[derive(Args, Debug, Default)]
pub struct EditArgs {
    pub tag: String,
    #[arg(long)]
    pub summary: Option<String>,
    #[arg(long, alias = "chat_url", conflicts_with = "clear_chat_url")]
    pub chat_url: Option<String>,
    #[arg(long)]
    pub clear_chat_url: bool,
    #[arg(long)]
    pub platform: Option<String>,
    #[arg(long)]
    pub notes: Option<String>,
    #[arg(long, value_delimiter = ',')]
    pub tags: Option<Vec<String>>,
    #[arg(long)]
    pub relationship: Option<String>,
    #[arg(long)]
    pub confidence: Option<f64>,
    /// Set a metadata key; the value is parsed as JSON when it can be
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
    /// Remove a metadata key
    #[arg(long = "unset", value_name = "KEY")]
    pub unset: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub tag: String,
}

struct ThreadContext {
    store: ThreadStore,
}

impl ThreadContext {
    fn new(settings: &Settings) -> Self {
        let persistence =
            JsonIndexFile::new(&settings.index_path).with_lock_timeout(settings.lock_timeout);
        Self {
            store: ThreadStore::new(persistence),
        }
    }
}

pub fn handle_thread_command(command: ThreadCommand, settings: &Settings) -> Result<()> {
    let ctx = ThreadContext::new(settings);

    match command {
        ThreadCommand::New(args) => new_thread(&ctx, args),
        ThreadCommand::Quick(args) => quick_thread(&ctx, args),
        ThreadCommand::Attach(args) => attach_file(&ctx, &args),
        ThreadCommand::Detach(args) => detach_file(&ctx, &args),
        ThreadCommand::Show(args) => show_thread(&ctx, &args),
        ThreadCommand::Search(args) => search_threads(&ctx, &args),
        ThreadCommand::Reverse(args) => reverse_lookup(&ctx, &args),
        ThreadCommand::Edit(args) => edit_thread(&ctx, &args),
        ThreadCommand::Delete(args) => delete_thread(&ctx, &args),
        ThreadCommand::List => list_threads(&ctx),
    }
}

// retried once: the second load sees the backup and starts empty
fn with_recovery<T>(op: impl Fn() -> threadlink_core::Result<T>) -> threadlink_core::Result<T> {
    match op() {
        Err(ThreadlinkError::CorruptIndex {
            backup_path,
            reason,
        }) => {
            warn!(backup = %backup_path.display(), %reason, "recovered from corrupt index");
            eprintln!(
                "Warning: the thread index could not be read ({reason}). A copy was saved to {}; continuing with an empty index.",
                backup_path.display()
            );
            op()
        }
        other => other,
    }
}

fn new_thread(ctx: &ThreadContext, args: NewArgs) -> Result<()> {
    let metadata = ThreadMetadata {
        platform: args.platform,
        tags: args
            .tags
            .into_iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect(),
        notes: args.notes,
        ..ThreadMetadata::default()
    };
    let mut new = NewThread::new(args.summary).with_metadata(metadata);
    if let Some(tag) = args.tag {
        new = new.with_id(tag);
    }
    if let Some(url) = args.chat_url {
        new = new.with_chat_url(url);
    }

    let thread = with_recovery(|| ctx.store.create_thread(new.clone(), &UuidGenerator))?;
    println!("New thread created: {}", thread.id);
    Ok(())
}

fn quick_thread(ctx: &ThreadContext, args: QuickArgs) -> Result<()> {
    let mut new = NewThread::new(args.summary);
    if let Some(url) = args.chat_url {
        new = new.with_chat_url(url);
    }
    let ids = SlugGenerator::today();

    let thread = with_recovery(|| ctx.store.create_thread(new.clone(), &ids))?;
    println!("Thread created: {}", thread.id);
    println!("Summary: {}", thread.summary);
    if let Some(url) = &thread.chat_url {
        println!("Chat URL: {url}");
    }
    Ok(())
}

fn attach_file(ctx: &ThreadContext, args: &AttachArgs) -> Result<()> {
    let thread = with_recovery(|| {
        ctx.store
            .attach(&args.tag, &args.file, args.relationship.as_deref())
    })?;
    let linked = thread
        .linked_files
        .last()
        .map(String::as_str)
        .unwrap_or(args.file.as_str());
    println!("Attached '{linked}' to thread '{}'.", thread.id);
    Ok(())
}

fn detach_file(ctx: &ThreadContext, args: &DetachArgs) -> Result<()> {
    let thread = with_recovery(|| ctx.store.detach(&args.tag, &args.file))?;
    println!(
        "Detached '{}' from thread '{}' ({} linked files left).",
        args.file,
        thread.id,
        thread.linked_files.len()
    );
    Ok(())
}

fn show_thread(ctx: &ThreadContext, args: &ShowArgs) -> Result<()> {
    let thread = with_recovery(|| ctx.store.find_by_id(&args.tag))?
        .ok_or_else(|| ThreadlinkError::NoSuchThread(args.tag.clone()))?;
    print_json(&thread.to_json())
}

fn search_threads(ctx: &ThreadContext, args: &SearchArgs) -> Result<()> {
    let mut filters = SearchFilters::default();
    if let Some(mode) = args.tags {
        filters = filters.with_tags(mode.into());
    }
    if let Some(platform) = &args.platform {
        filters = filters.with_platform(platform.clone());
    }

    let hits = with_recovery(|| ctx.store.search(&args.query, &filters))?;
    if hits.is_empty() {
        println!("No matching threads found.");
        return Ok(());
    }
    print_json(&Value::Array(hits.iter().map(Thread::to_json).collect()))
}

fn reverse_lookup(ctx: &ThreadContext, args: &ReverseArgs) -> Result<()> {
    let hits = with_recovery(|| ctx.store.reverse_lookup(&args.file))?;
    if hits.is_empty() {
        println!("No thread found for '{}'.", args.file);
        return Ok(());
    }
    let file_path = ctx.store.normalizer().normalize(&args.file);
    let rows = hits
        .iter()
        .map(|thread| {
            json!({
                "thread_id": thread.id,
                "summary": thread.summary,
                "chat_url": thread.chat_url.clone().unwrap_or_default(),
                "file_path": file_path,
                "relationship": thread.metadata.file_relationships.get(&file_path),
            })
        })
        .collect();
    print_json(&Value::Array(rows))
}

fn edit_thread(ctx: &ThreadContext, args: &EditArgs) -> Result<()> {
    let patch = build_patch(args)?;
    let thread = with_recovery(|| ctx.store.update_metadata(&args.tag, patch.clone()))?;
    println!("Updated thread '{}'.", thread.id);
    Ok(())
}

fn delete_thread(ctx: &ThreadContext, args: &DeleteArgs) -> Result<()> {
    let thread = with_recovery(|| ctx.store.delete_thread(&args.tag))?;
    println!(
        "Deleted thread '{}' ({} linked files released).",
        thread.id,
        thread.linked_files.len()
    );
    Ok(())
}

fn list_threads(ctx: &ThreadContext) -> Result<()> {
    let threads = with_recovery(|| ctx.store.list())?;
    let index = Index::from_threads(threads)?;
    let text = serde_json::to_string_pretty(&index).context("Failed to serialize index")?;
    println!("{text}");
    Ok(())
}

fn build_patch(args: &EditArgs) -> Result<ThreadPatch> {
    let mut root = Map::new();
    let mut metadata = Map::new();

    if let Some(summary) = &args.summary {
        root.insert("summary".to_string(), json!(summary));
    }
    if args.clear_chat_url {
        root.insert("chat_url".to_string(), Value::Null);
    } else if let Some(url) = &args.chat_url {
        root.insert("chat_url".to_string(), json!(url));
    }
    if let Some(platform) = &args.platform {
        metadata.insert("platform".to_string(), json!(platform));
    }
    if let Some(notes) = &args.notes {
        metadata.insert("notes".to_string(), json!(notes));
    }
    if let Some(tags) = &args.tags {
        metadata.insert("tags".to_string(), json!(tags));
    }
    if let Some(relationship) = &args.relationship {
        metadata.insert("relationship".to_string(), json!(relationship));
    }
    if let Some(confidence) = args.confidence {
        metadata.insert("confidence".to_string(), json!(confidence));
    }
    for assignment in &args.set {
        let (key, value) = parse_assignment(assignment)?;
        metadata.insert(key, value);
    }
    for key in &args.unset {
        metadata.insert(key.clone(), Value::Null);
    }

    if !metadata.is_empty() {
        root.insert("metadata".to_string(), Value::Object(metadata));
    }
    if root.is_empty() {
        bail!("Nothing to change; pass at least one field to edit");
    }
    Ok(ThreadPatch::from_json(Value::Object(root))?)
}

fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("Missing key in '{raw}'");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn print_json(value: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(tag: &str) -> EditArgs {
        EditArgs {
            tag: tag.to_string(),
            ..EditArgs::default()
        }
    }

    #[test]
    fn assignments_parse_json_or_fall_back_to_text() {
        assert_eq!(
            parse_assignment("ticket=T-1").expect("text"),
            ("ticket".to_string(), json!("T-1"))
        );
        assert_eq!(
            parse_assignment("priority=3").expect("number"),
            ("priority".to_string(), json!(3))
        );
        assert_eq!(
            parse_assignment("note=a=b").expect("split once"),
            ("note".to_string(), json!("a=b"))
        );
        assert!(parse_assignment("no-equals").is_err());
        assert!(parse_assignment("=value").is_err());
    }

    #[test]
    fn typed_keys_in_set_reach_typed_fields() {
        let mut args = edit("api_demo");
        args.set = vec!["platform=claude".to_string(), "ticket=T-1".to_string()];
        args.unset = vec!["notes".to_string()];
        let patch = build_patch(&args).expect("patch");
        assert_eq!(patch.metadata.platform, Some(Some("claude".to_string())));
        assert_eq!(patch.metadata.notes, Some(None));
        assert_eq!(patch.metadata.extra.get("ticket"), Some(&json!("T-1")));
        assert!(!patch.metadata.extra.contains_key("platform"));
    }

    #[test]
    fn clearing_chat_url_sends_null() {
        let mut args = edit("api_demo");
        args.clear_chat_url = true;
        args.summary = Some("renamed".to_string());
        let patch = build_patch(&args).expect("patch");
        assert_eq!(patch.chat_url, Some(None));
        assert_eq!(patch.summary.as_deref(), Some("renamed"));
    }

    #[test]
    fn empty_edit_is_rejected() {
        assert!(build_patch(&edit("api_demo")).is_err());
    }

    #[test]
    fn relationship_map_cannot_be_set_directly() {
        let mut args = edit("api_demo");
        args.set = vec![r#"file_relationships={"/a":"created"}"#.to_string()];
        let patch = build_patch(&args).expect("patch");
        assert_eq!(patch.immutable_field(), Some("metadata.file_relationships"));
    }
}
