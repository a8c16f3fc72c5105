use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::now_utc_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Queued,
    Started,
    Progress,
    Completed,
    Failed,
    Rejected,
}

impl NotificationKind {
    pub fn name(self) -> &'static str {
        match self {
            NotificationKind::Queued => "queued",
            NotificationKind::Started => "started",
            NotificationKind::Progress => "progress",
            NotificationKind::Completed => "completed",
            NotificationKind::Failed => "failed",
            NotificationKind::Rejected => "rejected",
        }
    }

    /// Completed, failed and rejected notifications end a task's run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NotificationKind::Completed | NotificationKind::Failed | NotificationKind::Rejected
        )
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageProgress {
    pub done: usize,
    pub total: usize,
}

/// One line of `notifications.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Stable per gallery; a later record with the same id replaces the earlier one.
    pub notification_id: u64,
    pub channel: String,
    pub kind: NotificationKind,
    pub gallery_id: u64,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<PageProgress>,
    pub ts: String,
}

/// Append-only notification log. Clones share one lock so the coordinator and its worker can
/// both append without interleaving lines.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `record`, stamping it with the current time when it carries none.
    pub fn append(&self, mut record: NotificationRecord) -> anyhow::Result<NotificationRecord> {
        if record.ts.is_empty() {
            record.ts = now_utc_iso();
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&record)?;

        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("notification journal lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed opening {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(record)
    }

    /// Every record in write order. Lines that do not parse (a torn final write) are skipped.
    pub fn read_all(&self) -> anyhow::Result<Vec<NotificationRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", self.path.display()))
            }
        };
        let mut records = Vec::new();
        for (number, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(err) => log::warn!(
                    "skipping line {} of {}: {err}",
                    number + 1,
                    self.path.display()
                ),
            }
        }
        Ok(records)
    }

    /// What a notification shade would show: the newest record per notification id, ordered by
    /// when each was last updated.
    pub fn current(&self) -> anyhow::Result<Vec<NotificationRecord>> {
        let records = self.read_all()?;
        let mut last_position = HashMap::new();
        for (position, record) in records.iter().enumerate() {
            last_position.insert(record.notification_id, position);
        }
        Ok(records
            .into_iter()
            .enumerate()
            .filter(|(position, record)| {
                last_position.get(&record.notification_id) == Some(position)
            })
            .map(|(_, record)| record)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    fn record(notification_id: u64, kind: NotificationKind, message: &str) -> NotificationRecord {
        NotificationRecord {
            notification_id,
            channel: "ai-gemini".to_string(),
            kind,
            gallery_id: notification_id % 1000,
            title: "Coloring Tide".to_string(),
            message: message.to_string(),
            progress: None,
            ts: String::new(),
        }
    }

    #[test]
    fn records_are_stamped_and_written_as_snake_case_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let journal = Journal::new(temp.path().join("state/notifications.jsonl"));

        let mut progress = record(70_012, NotificationKind::Progress, "page 1 of 3");
        progress.progress = Some(PageProgress { done: 1, total: 3 });
        let written = journal.append(progress)?;
        DateTime::parse_from_rfc3339(&written.ts)?;

        let raw = fs::read_to_string(journal.path())?;
        let line: serde_json::Value = serde_json::from_str(raw.trim_end())?;
        assert_eq!(line["kind"], "progress");
        assert_eq!(line["notification_id"], 70_012);
        assert_eq!(line["progress"]["total"], 3);

        journal.append(record(70_012, NotificationKind::Completed, "done"))?;
        let records = journal.read_all()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], written);
        assert_eq!(records[1].progress, None);
        Ok(())
    }

    #[test]
    fn current_keeps_the_latest_record_per_notification_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let journal = Journal::new(temp.path().join("notifications.jsonl"));
        journal.append(record(70_012, NotificationKind::Started, "starting"))?;
        journal.append(record(70_020, NotificationKind::Queued, "waiting"))?;
        journal.append(record(70_012, NotificationKind::Failed, "offline"))?;

        let current = journal.current()?;
        let shown: Vec<(u64, NotificationKind)> = current
            .iter()
            .map(|record| (record.notification_id, record.kind))
            .collect();
        assert_eq!(
            shown,
            vec![
                (70_020, NotificationKind::Queued),
                (70_012, NotificationKind::Failed)
            ]
        );
        assert!(current[1].kind.is_terminal());
        assert!(!current[0].kind.is_terminal());
        Ok(())
    }

    #[test]
    fn torn_lines_are_skipped_and_missing_file_is_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let journal = Journal::new(temp.path().join("notifications.jsonl"));
        assert!(journal.read_all()?.is_empty());

        journal.append(record(70_001, NotificationKind::Queued, "waiting"))?;
        let mut file = OpenOptions::new().append(true).open(journal.path())?;
        write!(file, "{{\"notification_id\": 70001, \"chan")?;

        let records = journal.read_all()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, NotificationKind::Queued);
        Ok(())
    }

    #[test]
    fn clones_share_the_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let journal = Journal::new(temp.path().join("notifications.jsonl"));
        let worker = journal.clone();
        journal.append(record(70_001, NotificationKind::Queued, "waiting"))?;
        worker.append(record(70_001, NotificationKind::Started, "running"))?;
        assert_eq!(journal.current()?.len(), 1);
        assert_eq!(journal.read_all()?.len(), 2);
        Ok(())
    }
}
