//! Append-only history log with file-based persistence.
//!
//! Each instance gets its own directory holding a `history.jsonl` file,
//! one JSON event per line. Appends take an exclusive file lock so that an
//! out-of-band writer (e.g. `showrunner approve` in another process) can
//! safely add an `EventRaised` line while the hosting runtime owns the
//! replay passes.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::domain::HistoryEvent;

const HISTORY_FILE: &str = "history.jsonl";

/// File-backed history log for one instance.
pub struct HistoryLog {
    instance_dir: PathBuf,
    history_path: PathBuf,
}

impl HistoryLog {
    /// Create or open the history log for an instance under `root`.
    pub fn open(root: &Path, instance: &str) -> Result<Self> {
        let instance_dir = root.join(instance);

        std::fs::create_dir_all(&instance_dir).with_context(|| {
            format!(
                "Failed to create instance directory: {}",
                instance_dir.display()
            )
        })?;

        let history_path = instance_dir.join(HISTORY_FILE);

        Ok(Self {
            instance_dir,
            history_path,
        })
    }

    /// Whether an instance has any recorded history under `root`.
    pub fn exists(root: &Path, instance: &str) -> bool {
        let path = root.join(instance).join(HISTORY_FILE);
        std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false)
    }

    /// Path to the history file
    pub fn path(&self) -> &Path {
        &self.history_path
    }

    /// Directory holding this instance's state
    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    /// Append an event to the log.
    ///
    /// Atomic and ordered relative to all prior appends for this instance:
    /// the write happens as a single line under an exclusive lock.
    pub fn append(&self, event: &HistoryEvent) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .with_context(|| {
                format!(
                    "Failed to open history file: {}",
                    self.history_path.display()
                )
            })?;

        file.lock_exclusive()
            .context("Failed to acquire history file lock")?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;

        let mut file = file;
        let result = writeln!(file, "{}", json)
            .and_then(|_| file.flush())
            .context("Failed to write event");

        let _ = file.unlock();
        result
    }

    /// Read the full ordered event sequence for replay.
    pub fn read(&self) -> Result<Vec<HistoryEvent>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.history_path).with_context(|| {
            format!(
                "Failed to open history file: {}",
                self.history_path.display()
            )
        })?;

        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.context("Failed to read history line")?;
            if line.trim().is_empty() {
                continue;
            }
            let event: HistoryEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse history event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// List all instance ids with state under `root`.
    pub fn list_instances(root: &Path) -> Result<Vec<String>> {
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut instances = Vec::new();

        for entry in std::fs::read_dir(root)
            .with_context(|| format!("Failed to read instances directory: {}", root.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if entry.path().join(HISTORY_FILE).exists() {
                        instances.push(name.to_string());
                    }
                }
            }
        }

        instances.sort();
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventKind;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read_preserve_order() {
        let temp = TempDir::new().unwrap();
        let log = HistoryLog::open(temp.path(), "i-1").unwrap();

        for seq in 1..=5 {
            log.append(&HistoryEvent::new(EventKind::TaskScheduled {
                seq,
                name: format!("A_Step{}", seq),
                input: json!(null),
            }))
            .unwrap();
        }

        let events = log.read().unwrap();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.kind.seq(), Some(i as u64 + 1));
        }
    }

    #[test]
    fn test_read_missing_log_is_empty() {
        let temp = TempDir::new().unwrap();
        let log = HistoryLog::open(temp.path(), "i-1").unwrap();
        assert!(log.read().unwrap().is_empty());
        assert!(!HistoryLog::exists(temp.path(), "i-1"));
    }

    #[test]
    fn test_exists_after_first_append() {
        let temp = TempDir::new().unwrap();
        let log = HistoryLog::open(temp.path(), "i-1").unwrap();

        log.append(&HistoryEvent::new(EventKind::OrchestrationStarted {
            orchestration: "O_ProcessVideo".to_string(),
            input: json!("raw/video1.mp4"),
            parent: None,
        }))
        .unwrap();

        assert!(HistoryLog::exists(temp.path(), "i-1"));
    }

    #[test]
    fn test_list_instances() {
        let temp = TempDir::new().unwrap();

        for id in ["b-2", "a-1"] {
            let log = HistoryLog::open(temp.path(), id).unwrap();
            log.append(&HistoryEvent::new(EventKind::TimerFired { seq: 1 }))
                .unwrap();
        }

        // A directory without a history file is not an instance
        HistoryLog::open(temp.path(), "empty").unwrap();

        let instances = HistoryLog::list_instances(temp.path()).unwrap();
        assert_eq!(instances, vec!["a-1".to_string(), "b-2".to_string()]);
    }
}
