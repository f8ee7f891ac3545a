//! Append-only training trace.
//!
//! A [`Trajectory`] records, per step, the raw model responses and the
//! feedback they produced. It is kept apart from the [`History`](crate::history::History):
//! the history is the live, compacted context, while the trajectory keeps
//! everything verbatim for later extraction of training data.
//!
//! When backed by a file, each record is appended as one JSON line as soon
//! as it is made.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reading or writing a trajectory file.
#[derive(Debug, Error)]
pub enum TrajectoryError {
    /// IO error on the trajectory file.
    #[error("IO error on {path}: {source}")]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A line is not a valid record.
    #[error("invalid record on line {line}: {source}")]
    Json {
        /// 1-based line number.
        line: usize,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// A record could not be encoded.
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Raw response to the reasoning call.
    Reasoning,
    /// Raw response to the action-proposal call, before parsing.
    Proposal,
    /// Observation fed back to the model.
    Feedback,
    /// How the session ended.
    Outcome,
}

/// One trajectory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    /// Sandbox step the record belongs to.
    pub step: u64,
    /// Record kind.
    pub kind: RecordKind,
    /// Verbatim text.
    pub text: String,
    /// When the record was made.
    pub at: DateTime<Utc>,
}

/// Per-session trace of raw responses and feedback.
#[derive(Debug, Default)]
pub struct Trajectory {
    records: Vec<TrajectoryRecord>,
    path: Option<PathBuf>,
}

impl Trajectory {
    /// An in-memory trajectory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A trajectory that also appends every record to `path`.
    ///
    /// The file is truncated.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, TrajectoryError> {
        let path = path.into();
        File::create(&path).map_err(|source| TrajectoryError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            records: Vec::new(),
            path: Some(path),
        })
    }

    /// Append a record.
    pub fn record(
        &mut self,
        step: u64,
        kind: RecordKind,
        text: impl Into<String>,
    ) -> Result<(), TrajectoryError> {
        let record = TrajectoryRecord {
            step,
            kind,
            text: text.into(),
            at: Utc::now(),
        };

        if let Some(path) = &self.path {
            let line = serde_json::to_string(&record)?;
            let io = |source| TrajectoryError::Io {
                path: path.clone(),
                source,
            };
            let mut file = OpenOptions::new().append(true).open(path).map_err(io)?;
            writeln!(file, "{line}").map_err(io)?;
        }

        self.records.push(record);
        Ok(())
    }

    /// All records in order.
    pub fn records(&self) -> &[TrajectoryRecord] {
        &self.records
    }

    /// Raw model responses (reasoning and proposals) in call order.
    pub fn responses(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| matches!(r.kind, RecordKind::Reasoning | RecordKind::Proposal))
            .map(|r| r.text.clone())
            .collect()
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read a trajectory file. The result is in-memory only.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrajectoryError> {
        let path = path.as_ref();
        let io = |source| TrajectoryError::Io {
            path: path.to_path_buf(),
            source,
        };
        let reader = BufReader::new(File::open(path).map_err(io)?);

        let mut records = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(io)?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .map_err(|source| TrajectoryError::Json { line: i + 1, source })?;
            records.push(record);
        }

        Ok(Self {
            records,
            path: None,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_records() {
        let mut trajectory = Trajectory::new();
        trajectory.record(1, RecordKind::Reasoning, "think").unwrap();
        trajectory.record(1, RecordKind::Proposal, "<run_script>").unwrap();
        trajectory.record(1, RecordKind::Feedback, "<observation>").unwrap();
        trajectory.record(2, RecordKind::Proposal, "again").unwrap();

        assert_eq!(trajectory.records().len(), 4);
        assert_eq!(trajectory.responses(), ["think", "<run_script>", "again"]);
        assert!(trajectory.path().is_none());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectory.jsonl");

        let mut trajectory = Trajectory::create(&path).unwrap();
        trajectory.record(1, RecordKind::Proposal, "line one\nline two").unwrap();
        trajectory.record(1, RecordKind::Outcome, "success").unwrap();

        let loaded = Trajectory::load(&path).unwrap();
        assert_eq!(loaded.records(), trajectory.records());

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\"kind\":\"proposal\""));
    }

    #[test]
    fn test_load_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "\nnot json\n").unwrap();

        let err = Trajectory::load(&path).unwrap_err();
        assert!(matches!(err, TrajectoryError::Json { line: 2, .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Trajectory::load("/nonexistent/trajectory.jsonl").unwrap_err();
        assert!(matches!(err, TrajectoryError::Io { .. }));
    }
}
