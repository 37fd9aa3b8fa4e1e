use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThreadlinkError {
    #[error("no thread with id '{0}'")]
    NoSuchThread(String),
    #[error("thread id '{0}' already exists")]
    DuplicateId(String),
    #[error("file '{path}' is already linked to thread '{thread_id}'")]
    DuplicateFile { thread_id: String, path: String },
    #[error("file '{path}' is not linked to thread '{thread_id}'")]
    FileNotLinked { thread_id: String, path: String },
    #[error("field '{0}' cannot be modified")]
    ImmutableField(String),
    #[error("could not generate a free thread id after {attempts} attempts")]
    IdExhausted { attempts: u32 },
    #[error("index is locked by another process ({path}), gave up after {waited_ms}ms")]
    Locked { path: PathBuf, waited_ms: u64 },
    #[error("index file was corrupt ({reason}); a backup was saved to {backup_path}")]
    CorruptIndex { backup_path: PathBuf, reason: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ThreadlinkError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ThreadlinkError::NoSuchThread(_) => "no_such_thread",
            ThreadlinkError::DuplicateId(_) => "duplicate_id",
            ThreadlinkError::DuplicateFile { .. } => "duplicate_file",
            ThreadlinkError::FileNotLinked { .. } => "file_not_linked",
            ThreadlinkError::ImmutableField(_) => "immutable_field",
            ThreadlinkError::IdExhausted { .. } => "id_exhausted",
            ThreadlinkError::Locked { .. } => "locked",
            ThreadlinkError::CorruptIndex { .. } => "corrupt_index",
            ThreadlinkError::Io { .. } => "io_failure",
            ThreadlinkError::InvalidInput(_) => "invalid_input",
        }
    }

    /// Process exit code a command-line caller should use for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            ThreadlinkError::InvalidInput(_) => 2,
            ThreadlinkError::NoSuchThread(_) => 3,
            ThreadlinkError::DuplicateId(_) => 4,
            ThreadlinkError::DuplicateFile { .. } => 5,
            ThreadlinkError::FileNotLinked { .. } => 6,
            ThreadlinkError::ImmutableField(_) => 7,
            ThreadlinkError::IdExhausted { .. } => 8,
            ThreadlinkError::Locked { .. } => 9,
            ThreadlinkError::CorruptIndex { .. } => 10,
            ThreadlinkError::Io { .. } => 11,
        }
    }
}

pub type Result<T, E = ThreadlinkError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn every_kind_has_a_distinct_exit_code() {
        let errors = vec![
            ThreadlinkError::NoSuchThread("a".into()),
            ThreadlinkError::DuplicateId("a".into()),
            ThreadlinkError::DuplicateFile {
                thread_id: "a".into(),
                path: "/x".into(),
            },
            ThreadlinkError::FileNotLinked {
                thread_id: "a".into(),
                path: "/x".into(),
            },
            ThreadlinkError::ImmutableField("id".into()),
            ThreadlinkError::IdExhausted { attempts: 8 },
            ThreadlinkError::Locked {
                path: PathBuf::from("/tmp/x.lock"),
                waited_ms: 10,
            },
            ThreadlinkError::CorruptIndex {
                backup_path: PathBuf::from("/tmp/x.bak"),
                reason: "eof".into(),
            },
            ThreadlinkError::io("read", std::io::Error::other("boom")),
            ThreadlinkError::invalid("bad"),
        ];
        let codes: BTreeSet<u8> = errors.iter().map(|err| err.exit_code()).collect();
        let kinds: BTreeSet<&str> = errors.iter().map(|err| err.kind()).collect();
        assert_eq!(codes.len(), errors.len());
        assert_eq!(kinds.len(), errors.len());
        assert!(!codes.contains(&0));
        assert!(!codes.contains(&1));
    }
}
