//! Pipe naming convention and stale pipe cleanup.
//!
//! Every directed channel of every section lives in the pipe directory as
//! `gphpthread_{section}_s{sender}-d{receiver}`. Processes that die without
//! running their destructors leave these files behind; [`clean_pipe_garbage`]
//! removes the ones whose endpoints are both gone.

use crate::error::Result;
use crate::observability::record_pipes_collected;
use crate::process::{Pid, is_alive};
use std::fmt;
use std::path::{Path, PathBuf};

/// File name prefix shared by all pipes.
pub const PIPE_PREFIX: &str = "gphpthread";

/// Parsed name of one directed pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipeName {
    /// Section id.
    pub section: u64,
    /// Writing process.
    pub sender: Pid,
    /// Reading process.
    pub receiver: Pid,
}

impl PipeName {
    /// Create a pipe name.
    pub const fn new(section: u64, sender: Pid, receiver: Pid) -> Self {
        Self {
            section,
            sender,
            receiver,
        }
    }

    /// File name without directory.
    pub fn file_name(&self) -> String {
        self.to_string()
    }

    /// Full path inside `dir`.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Parse a file name. Returns `None` for anything not following the
    /// convention exactly.
    pub fn parse(file_name: &str) -> Option<Self> {
        let rest = file_name.strip_prefix(PIPE_PREFIX)?.strip_prefix('_')?;
        let (section, rest) = rest.split_once("_s")?;
        let (sender, receiver) = rest.split_once("-d")?;

        Some(Self {
            section: parse_number(section)?,
            sender: parse_number(sender)?,
            receiver: parse_number(receiver)?,
        })
    }
}

fn parse_number<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for PipeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PIPE_PREFIX}_{}_s{}-d{}",
            self.section, self.sender, self.receiver
        )
    }
}

/// Remove pipe files in `dir` whose sender and receiver are both dead.
///
/// Files referencing any live process, and files not following the naming
/// convention, are left alone. Returns the removed paths.
pub fn clean_pipe_garbage(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut removed = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(pipe) = file_name.to_str().and_then(PipeName::parse) else {
            continue;
        };
        if is_alive(pipe.sender) || is_alive(pipe.receiver) {
            continue;
        }

        let path = entry.path();
        match std::fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            // Raced with the owner's own cleanup.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale pipe");
            }
        }
    }

    record_pipes_collected(removed.len());
    tracing::debug!(dir = %dir.display(), removed = removed.len(), "pipe garbage collected");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::current_pid;
    use tempfile::tempdir;

    #[test]
    fn test_pipe_name_format() {
        let name = PipeName::new(3, 100, 200);
        assert_eq!(name.file_name(), "gphpthread_3_s100-d200");
        assert_eq!(
            name.path_in(Path::new("/dev/shm")),
            PathBuf::from("/dev/shm/gphpthread_3_s100-d200")
        );
    }

    #[test]
    fn test_pipe_name_parse() {
        assert_eq!(
            PipeName::parse("gphpthread_3_s100-d200"),
            Some(PipeName::new(3, 100, 200))
        );
        assert_eq!(PipeName::parse("gphpthread_3_s100-d"), None);
        assert_eq!(PipeName::parse("gphpthread_x_s1-d2"), None);
        assert_eq!(PipeName::parse("gphpthread_3_s+1-d2"), None);
        assert_eq!(PipeName::parse("other_3_s1-d2"), None);
        assert_eq!(PipeName::parse("gphpthread_3_s1-d2.bak"), None);
    }

    #[test]
    fn test_clean_removes_only_dead_pairs() {
        let dir = tempdir().unwrap();
        let me = current_pid();
        let dead = u32::MAX - 1;

        let stale = PipeName::new(1, dead, u32::MAX).path_in(dir.path());
        let half_live = PipeName::new(1, me, dead).path_in(dir.path());
        let live = PipeName::new(2, me, me).path_in(dir.path());
        let unrelated = dir.path().join("notes.txt");
        for path in [&stale, &half_live, &live, &unrelated] {
            std::fs::write(path, b"").unwrap();
        }

        let removed = clean_pipe_garbage(dir.path()).unwrap();
        assert_eq!(removed, vec![stale.clone()]);
        assert!(!stale.exists());
        assert!(half_live.exists());
        assert!(live.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_clean_missing_directory_fails() {
        let dir = tempdir().unwrap();
        assert!(clean_pipe_garbage(dir.path().join("missing")).is_err());
    }
}
