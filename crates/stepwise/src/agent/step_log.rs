//! Per-step persistence of the conversation.
//!
//! The live view of the history is rewritten to `step_NNNN.xml` after every
//! mutation, so the file for a turn always holds the conversation as it
//! stood at the end of that turn (or at the moment the session stopped).

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::history::{History, MarkupError};

/// Errors reading or writing the step log.
#[derive(Debug, Error)]
pub enum StepLogError {
    /// IO error on a log file or directory.
    #[error("IO error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A step document could not be rendered or parsed.
    #[error(transparent)]
    Markup(#[from] MarkupError),
    /// The requested step has no file.
    #[error("no log for step {0}")]
    NoSuchStep(usize),
}

/// Directory of step documents.
#[derive(Debug, Clone)]
pub struct StepLog {
    dir: PathBuf,
}

impl StepLog {
    /// Use `dir` as the log directory, creating it if needed.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, StepLogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StepLogError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Open an existing log directory.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `step`.
    pub fn path(&self, step: usize) -> PathBuf {
        self.dir.join(format!("step_{step:04}.xml"))
    }

    /// Write the live view of `history` as the document for `step`.
    pub fn write(&self, step: usize, history: &History) -> Result<(), StepLogError> {
        let xml = history.to_markup(step)?;
        let path = self.path(step);
        fs::write(&path, xml).map_err(|source| StepLogError::Io { path, source })
    }

    /// Read back the history written for `step`.
    pub fn load(&self, step: usize) -> Result<History, StepLogError> {
        let path = self.path(step);
        if !path.exists() {
            return Err(StepLogError::NoSuchStep(step));
        }
        let xml = fs::read_to_string(&path).map_err(|source| StepLogError::Io { path, source })?;
        Ok(History::from_markup(&xml)?)
    }

    /// Steps that have a document, in ascending order.
    pub fn steps(&self) -> Result<Vec<usize>, StepLogError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StepLogError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut steps: Vec<usize> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                name.strip_prefix("step_")?
                    .strip_suffix(".xml")?
                    .parse()
                    .ok()
            })
            .collect();
        steps.sort_unstable();
        Ok(steps)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::history::{Message, Tag};

    #[test]
    fn test_write_load_steps() {
        let dir = tempfile::tempdir().unwrap();
        let log = StepLog::create(dir.path().join("steps")).unwrap();

        let mut history = History::new();
        history.add_message(Message::system("briefing").with_tag(Tag::Briefing));
        log.write(1, &history).unwrap();
        history.add_message(Message::user("observation\nline 2").with_tag(Tag::Observation));
        log.write(1, &history).unwrap();
        log.write(2, &history).unwrap();

        assert_eq!(log.steps().unwrap(), [1, 2]);
        assert_eq!(log.load(1).unwrap(), history);
        assert!(log.path(12).ends_with("step_0012.xml"));
    }

    #[test]
    fn test_load_writes_live_view() {
        let dir = tempfile::tempdir().unwrap();
        let log = StepLog::create(dir.path()).unwrap();

        let mut history = History::new();
        history.add_message(Message::user("reminder").with_tag(Tag::InstructionReminder));
        history.add_message(Message::user("kept"));
        history.mark_messages_outdated(&[Tag::InstructionReminder]);
        log.write(1, &history).unwrap();

        let loaded = log.load(1).unwrap();
        assert_eq!(loaded.messages(), history.get_messages().as_slice());
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_missing_step() {
        let dir = tempfile::tempdir().unwrap();
        let log = StepLog::create(dir.path()).unwrap();
        assert!(matches!(log.load(3), Err(StepLogError::NoSuchStep(3))));
        assert!(log.steps().unwrap().is_empty());
    }
}
