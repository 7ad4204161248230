//! Append-only NDJSON log of terminal job outcomes.
//!
//! Every entry is one newline-terminated JSON line. On resume, ids with a
//! `success` line are exempt from re-execution; `failure` lines are kept for
//! the record but never exempt an id. A final line without its newline is the
//! remains of an interrupted write: it is ignored when reading and cut off
//! before the store appends again.

use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind as IoErrorKind};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::BatchError;

/// File name of the checkpoint inside the output directory.
pub const CHECKPOINT_FILE_NAME: &str = "_batch_state.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Success,
    Failure,
}

/// Durable record of one job's terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub request_id: String,
    pub status: CheckpointStatus,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub processing_time_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl CheckpointEntry {
    pub fn success(
        request_id: impl Into<String>,
        output_path: impl Into<String>,
        processing_time_seconds: f64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status: CheckpointStatus::Success,
            output_path: Some(output_path.into()),
            error_message: None,
            processing_time_seconds,
            file_size_bytes: None,
            attempts: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn failure(
        request_id: impl Into<String>,
        error_message: impl Into<String>,
        processing_time_seconds: f64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status: CheckpointStatus::Failure,
            output_path: None,
            error_message: Some(error_message.into()),
            processing_time_seconds,
            file_size_bytes: None,
            attempts: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_file_size(mut self, bytes: Option<u64>) -> Self {
        self.file_size_bytes = bytes;
        self
    }
}

/// What an existing checkpoint file says about a previous run.
#[derive(Debug, Clone, Default)]
pub struct CheckpointReport {
    /// Ids with at least one success line.
    pub completed: HashSet<String>,
    /// Status of the last line seen for each id.
    pub latest: HashMap<String, CheckpointStatus>,
    /// Complete lines parsed.
    pub entries: usize,
    /// Whether the file ended in a partial line.
    pub torn_tail: bool,
    /// Byte length covered by complete lines.
    valid_len: u64,
}

impl CheckpointReport {
    pub fn succeeded(&self) -> usize {
        self.completed.len()
    }

    /// Ids whose failures were never followed, or preceded, by a success.
    pub fn failed(&self) -> usize {
        self.latest
            .iter()
            .filter(|(id, status)| {
                **status == CheckpointStatus::Failure && !self.completed.contains(*id)
            })
            .count()
    }
}

/// Serialized, append-only writer for the checkpoint file.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    appender: Mutex<Appender>,
    completed: HashSet<String>,
}

/// Append handle plus the length of the file up to its last whole line.
#[derive(Debug)]
struct Appender {
    file: File,
    len: u64,
    poisoned: bool,
}

impl Appender {
    async fn append(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        self.len += line.len() as u64;
        Ok(())
    }
}

impl CheckpointStore {
    /// Checkpoint location for `output_dir`.
    pub fn path_in(output_dir: &Path) -> PathBuf {
        output_dir.join(CHECKPOINT_FILE_NAME)
    }

    /// Opens the checkpoint at `path` for this run.
    ///
    /// With `resume`, the existing file is read (a corrupt line is fatal), a
    /// torn final line is truncated away and new entries are appended.
    /// Without it, any existing file is truncated.
    pub async fn open(path: impl Into<PathBuf>, resume: bool) -> Result<Self, BatchError> {
        let path = path.into();
        let (file, len, completed) = if resume {
            let report = Self::load_report(&path).await?;
            let write_err = |source| BatchError::CheckpointWrite {
                path: path.clone(),
                source,
            };
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(write_err)?;
            if report.torn_tail {
                warn!(
                    path = %path.display(),
                    "Discarding partial final line left by an interrupted run"
                );
                file.set_len(report.valid_len).await.map_err(write_err)?;
            }
            let len = if report.torn_tail {
                report.valid_len
            } else {
                file.metadata().await.map_err(write_err)?.len()
            };
            debug!(
                completed = report.completed.len(),
                entries = report.entries,
                "Loaded checkpoint"
            );
            (file, len, report.completed)
        } else {
            let file = File::create(&path)
                .await
                .map_err(|source| BatchError::CheckpointWrite {
                    path: path.clone(),
                    source,
                })?;
            (file, 0, HashSet::new())
        };

        Ok(Self {
            path,
            appender: Mutex::new(Appender {
                file,
                len,
                poisoned: false,
            }),
            completed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ids exempt from re-execution, as loaded when the store was opened.
    pub fn completed_ids(&self) -> &HashSet<String> {
        &self.completed
    }

    /// Reads the completed ids from `path` without opening it for writing.
    /// A missing file yields an empty set.
    pub async fn load_completed_ids(path: &Path) -> Result<HashSet<String>, BatchError> {
        Ok(Self::load_report(path).await?.completed)
    }

    /// Scans `path` line by line. A missing file yields an empty report.
    pub async fn load_report(path: &Path) -> Result<CheckpointReport, BatchError> {
        let read_err = |source| BatchError::CheckpointRead {
            path: path.to_path_buf(),
            source,
        };
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(CheckpointReport::default()),
            Err(e) => return Err(read_err(e)),
        };

        let mut reader = BufReader::new(file);
        let mut report = CheckpointReport::default();
        let mut buf = Vec::new();
        let mut line_no = 0;
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).await.map_err(read_err)?;
            if n == 0 {
                break;
            }
            line_no += 1;
            if buf.last() != Some(&b'\n') {
                report.torn_tail = true;
                break;
            }
            report.valid_len += n as u64;

            let line = buf.trim_ascii();
            if line.is_empty() {
                continue;
            }
            let entry: CheckpointEntry =
                serde_json::from_slice(line).map_err(|source| BatchError::CheckpointCorrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    source,
                })?;
            report.entries += 1;
            if entry.status == CheckpointStatus::Success {
                report.completed.insert(entry.request_id.clone());
            }
            report.latest.insert(entry.request_id, entry.status);
        }
        Ok(report)
    }

    /// Appends `entry` as one line and syncs it to disk.
    ///
    /// Writers are serialized, so lines never interleave. A failed append
    /// cuts the file back to its last whole line and poisons the store: every
    /// later call fails without writing.
    pub async fn record(&self, entry: &CheckpointEntry) -> Result<(), BatchError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let write_err = |source| BatchError::CheckpointWrite {
            path: self.path.clone(),
            source,
        };
        let mut appender = self.appender.lock().await;
        if appender.poisoned {
            return Err(write_err(io::Error::other(
                "an earlier append failed; the checkpoint is closed to writes",
            )));
        }
        if let Err(e) = appender.append(&line).await {
            appender.poisoned = true;
            self.roll_back(appender.len).await;
            return Err(write_err(e));
        }
        Ok(())
    }

    /// Drops whatever a failed append left past `len`. Goes through a new
    /// handle since the append handle may be the one that broke.
    async fn roll_back(&self, len: u64) {
        let truncated = match OpenOptions::new().write(true).open(&self.path).await {
            Ok(file) => file.set_len(len).await,
            Err(e) => Err(e),
        };
        if let Err(e) = truncated {
            warn!(
                path = %self.path.display(),
                error = %e,
                "Cannot cut a failed append out of the checkpoint"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn write_lines(path: &Path, lines: &[&str]) {
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn missing_file_has_no_completed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let ids = CheckpointStore::load_completed_ids(&dir.path().join("absent.jsonl"))
            .await
            .unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn only_success_entries_are_completed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        write_lines(
            &path,
            &[
                r#"{"request_id": "req1", "status": "success", "output_path": "/path1"}"#,
                r#"{"request_id": "req2", "status": "failure", "error_message": "Error"}"#,
                r#"{"request_id": "req3", "status": "success", "output_path": "/path3"}"#,
            ],
        );

        let ids = CheckpointStore::load_completed_ids(&path).await.unwrap();
        assert_eq!(ids, HashSet::from(["req1".to_string(), "req3".to_string()]));
    }

    #[tokio::test]
    async fn failure_then_success_is_completed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        write_lines(
            &path,
            &[
                r#"{"request_id": "req1", "status": "failure", "error_message": "timeout"}"#,
                r#"{"request_id": "req1", "status": "success", "output_path": "/p"}"#,
                r#"{"request_id": "req2", "status": "failure", "error_message": "bad key"}"#,
            ],
        );

        let report = CheckpointStore::load_report(&path).await.unwrap();
        assert_eq!(report.entries, 3);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert!(report.completed.contains("req1"));
        assert!(!report.torn_tail);
    }

    #[tokio::test]
    async fn corrupt_line_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        write_lines(
            &path,
            &[
                r#"{"request_id": "req1", "status": "success"}"#,
                "invalid json line",
            ],
        );

        let err = CheckpointStore::load_completed_ids(&path).await.unwrap_err();
        assert!(matches!(err, BatchError::CheckpointCorrupt { line: 2, .. }), "{err}");
    }

    #[tokio::test]
    async fn torn_final_line_is_ignored_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        std::fs::write(
            &path,
            "{\"request_id\": \"req1\", \"status\": \"success\"}\n{\"request_id\": \"req2\", \"sta",
        )
        .unwrap();

        let report = CheckpointStore::load_report(&path).await.unwrap();
        assert!(report.torn_tail);
        assert_eq!(report.entries, 1);

        let store = CheckpointStore::open(&path, true).await.unwrap();
        assert_eq!(store.completed_ids().len(), 1);
        store
            .record(&CheckpointEntry::success("req2", "/out/req2.png", 1.0))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            serde_json::from_str::<CheckpointEntry>(line).unwrap();
        }
    }

    #[tokio::test]
    async fn fresh_open_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        write_lines(&path, &[r#"{"request_id": "old", "status": "success"}"#]);

        let store = CheckpointStore::open(&path, false).await.unwrap();
        assert!(store.completed_ids().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn record_writes_expected_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        let store = CheckpointStore::open(&path, false).await.unwrap();
        store
            .record(&CheckpointEntry::failure("req9", "Network timeout", 10.0).with_attempts(4))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(content.trim_end()).unwrap();
        assert_eq!(value["request_id"], "req9");
        assert_eq!(value["status"], "failure");
        assert!(value["output_path"].is_null());
        assert_eq!(value["error_message"], "Network timeout");
        assert_eq!(value["processing_time_seconds"], 10.0);
        assert_eq!(value["attempts"], 4);
    }

    #[tokio::test]
    async fn failed_append_is_rolled_back_and_poisons_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        let store = CheckpointStore::open(&path, false).await.unwrap();
        store
            .record(&CheckpointEntry::success("req1", "/out/req1.png", 1.0))
            .await
            .unwrap();
        let whole = std::fs::read_to_string(&path).unwrap();

        // Leave a fragment behind and swap in a handle that cannot write.
        {
            use std::io::Write;
            let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            raw.write_all(b"{\"request_id\": \"req2\", \"sta").unwrap();
        }
        store.appender.lock().await.file = File::open(&path).await.unwrap();

        let err = store
            .record(&CheckpointEntry::success("req2", "/out/req2.png", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::CheckpointWrite { .. }), "{err}");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), whole);

        store.appender.lock().await.file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        let err = store
            .record(&CheckpointEntry::success("req3", "/out/req3.png", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::CheckpointWrite { .. }), "{err}");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), whole);

        let report = CheckpointStore::load_report(&path).await.unwrap();
        assert_eq!(report.entries, 1);
        assert!(!report.torn_tail);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn full_device_fails_every_record() {
        let path = Path::new("/dev/full");
        if !path.exists() {
            return;
        }
        let store = CheckpointStore::open(path, false).await.unwrap();
        for id in ["req1", "req2"] {
            let err = store
                .record(&CheckpointEntry::success(id, "/out/x.png", 1.0))
                .await
                .unwrap_err();
            assert!(matches!(err, BatchError::CheckpointWrite { .. }), "{err}");
        }
    }

    #[tokio::test]
    async fn resumed_store_tracks_existing_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        write_lines(&path, &[r#"{"request_id": "old", "status": "success"}"#]);
        let existing = std::fs::metadata(&path).unwrap().len();

        let store = CheckpointStore::open(&path, true).await.unwrap();
        assert_eq!(store.appender.lock().await.len, existing);
        store
            .record(&CheckpointEntry::success("new", "/out/new.png", 1.0))
            .await
            .unwrap();
        let grown = std::fs::metadata(&path).unwrap().len();
        assert_eq!(store.appender.lock().await.len, grown);
    }

    #[tokio::test]
    async fn concurrent_records_produce_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        let store = Arc::new(CheckpointStore::open(&path, false).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let entry = CheckpointEntry::success(format!("req{i}"), format!("/path{i}"), 0.5);
                store.record(&entry).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let report = CheckpointStore::load_report(&path).await.unwrap();
        assert_eq!(report.entries, 50);
        assert_eq!(report.completed.len(), 50);
        assert!(!report.torn_tail);
    }
}
