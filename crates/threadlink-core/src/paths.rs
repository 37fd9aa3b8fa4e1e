use crate::{Result, ThreadlinkError};
use std::path::{Component, Path, PathBuf};

/// Canonical `/`-separated key for a file reference. Never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathNormalizer {
    home: Option<PathBuf>,
    cwd: PathBuf,
}

impl PathNormalizer {
    pub fn new(home: Option<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            home,
            cwd: cwd.into(),
        }
    }

    pub fn from_env() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self::new(dirs::home_dir(), cwd)
    }

    pub fn home(&self) -> Option<&Path> {
        self.home.as_deref()
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn normalize(&self, raw: &str) -> String {
        let expanded = self.expand_home(raw);
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            self.cwd.join(expanded)
        };
        let lexical = lexical_clean(&absolute);
        let resolved = resolve_existing_prefix(&lexical);
        path_to_key(&resolved)
    }

    fn expand_home(&self, raw: &str) -> PathBuf {
        let Some(home) = self.home.as_ref() else {
            return PathBuf::from(raw);
        };
        if raw == "~" {
            return home.clone();
        }
        let rest = raw
            .strip_prefix("~/")
            .or_else(|| raw.strip_prefix("~\\").filter(|_| cfg!(windows)));
        match rest {
            Some(rest) => home.join(rest),
            None => PathBuf::from(raw),
        }
    }
}

/// Rejects inputs that cannot name a file at all.
pub fn validate_raw_path(raw: &str) -> Result<()> {
    if raw.trim().is_empty() {
        return Err(ThreadlinkError::invalid("file path is empty"));
    }
    if raw.contains('\0') {
        return Err(ThreadlinkError::invalid("file path contains a NUL byte"));
    }
    Ok(())
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => cleaned.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                if depth > 0 {
                    cleaned.pop();
                    depth -= 1;
                }
            }
            Component::Normal(part) => {
                cleaned.push(part);
                depth += 1;
            }
        }
    }
    cleaned
}

fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    let mut cursor = Some(path);
    while let Some(candidate) = cursor {
        if let Ok(real) = std::fs::canonicalize(candidate) {
            let mut resolved = strip_verbatim(real);
            for part in tail.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        if let Some(name) = candidate.file_name() {
            tail.push(name);
        }
        cursor = candidate.parent();
    }
    path.to_path_buf()
}

fn strip_verbatim(path: PathBuf) -> PathBuf {
    if !cfg!(windows) {
        return path;
    }
    let text = path.to_string_lossy();
    if let Some(rest) = text.strip_prefix(r"\\?\UNC\") {
        return PathBuf::from(format!(r"\\{rest}"));
    }
    if let Some(rest) = text.strip_prefix(r"\\?\") {
        return PathBuf::from(rest);
    }
    path
}

fn path_to_key(path: &Path) -> String {
    let mut key = path.to_string_lossy().into_owned();
    if cfg!(windows) {
        key = key.replace('\\', "/");
    }
    while key.len() > 1 && key.ends_with('/') && !key.ends_with(":/") {
        key.pop();
    }
    key
}
