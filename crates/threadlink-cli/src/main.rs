use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use threadlink_core::ThreadlinkError;
use tracing_subscriber::EnvFilter;

mod config;
mod thread;

use config::Settings;
use thread::ThreadCommand;

#[derive(Parser)]
#[command(name = "threadlink")]
#[command(about = "Link AI conversation threads to the files they produced", long_about = None)]
struct Cli {
    /// Index file to use instead of ~/.threadlink/thread_index.json
    #[arg(long, global = true, env = "THREADLINK_INDEX")]
    index: Option<PathBuf>,
    /// How long to wait for another process holding the index lock
    #[arg(long, global = true, env = "THREADLINK_LOCK_TIMEOUT_MS")]
    lock_timeout_ms: Option<u64>,
    #[command(subcommand)]
    command: ThreadCommand,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = Settings::resolve(cli.index, cli.lock_timeout_ms);
    init_logging(&settings.log_level);

    match thread::handle_thread_command(cli.command, &settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<ThreadlinkError>() {
            Some(failure) => {
                eprintln!("Error: {failure}");
                if let Some(hint) = hint(failure) {
                    eprintln!("{hint}");
                }
                ExitCode::from(failure.exit_code())
            }
            None => {
                eprintln!("Error: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_env("THREADLINK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn hint(failure: &ThreadlinkError) -> Option<String> {
    let hint = match failure {
        ThreadlinkError::NoSuchThread(_) => {
            "Use `threadlink search <text>` or `threadlink list` to find the thread id.".to_string()
        }
        ThreadlinkError::DuplicateId(_) => {
            "Pick another --tag, or leave it out to get a generated id.".to_string()
        }
        ThreadlinkError::DuplicateFile { .. } => "Nothing to do; the link already exists.".to_string(),
        ThreadlinkError::FileNotLinked { thread_id, .. } => {
            format!("`threadlink show {thread_id}` lists the files linked to it.")
        }
        ThreadlinkError::ImmutableField(_) => {
            "Ids, timestamps and file relationships are managed by threadlink itself.".to_string()
        }
        ThreadlinkError::IdExhausted { .. } => "Pass an explicit id with `threadlink new --tag`.".to_string(),
        ThreadlinkError::Locked { .. } => {
            "Another threadlink command is still running; retry, or raise --lock-timeout-ms.".to_string()
        }
        ThreadlinkError::Io { .. } => {
            "Check that the index directory exists and is writable, or point --index elsewhere."
                .to_string()
        }
        ThreadlinkError::CorruptIndex { .. } | ThreadlinkError::InvalidInput(_) => return None,
    };
    Some(hint)
}
