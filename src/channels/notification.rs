//! Notification channel: an append-only JSONL event log.
//!
//! Workers append events; the manager tails the file with a byte-offset
//! cursor. Several workers may append concurrently (one line per `write`
//! with `O_APPEND`), and the reader must tolerate events for issues it is
//! not tracking, e.g. after a manager restart.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Event types a worker can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    StatusUpdate,
    PermissionRequest,
    Blocked,
    Completed,
    Failed,
    MainBranchFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusUpdate => "status_update",
            Self::PermissionRequest => "permission_request",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::MainBranchFailed => "main_branch_failed",
        }
    }

    /// Whether the event needs a human to look at it.
    pub fn requires_response(&self) -> bool {
        matches!(
            self,
            Self::PermissionRequest | Self::Blocked | Self::Failed | Self::MainBranchFailed
        )
    }
}

/// One line of the notification log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub issue_id: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    /// Build an event whose payload carries `message` plus any extra fields.
    pub fn new(kind: NotificationKind, issue_id: u64, message: impl Into<String>) -> Self {
        Self {
            kind,
            issue_id,
            payload: serde_json::json!({
                "message": message.into(),
                "requiresResponse": kind.requires_response(),
            }),
            timestamp: Utc::now(),
        }
    }

    /// Attach an extra payload field.
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let Some(obj) = self.payload.as_object_mut() {
            obj.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn message(&self) -> &str {
        self.payload
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("")
    }

    /// One-line console rendering.
    pub fn summary_line(&self) -> String {
        format!(
            "{} #{:<5} {:<18} {}",
            kind_emoji(self.kind),
            self.issue_id,
            self.kind.as_str(),
            self.message()
        )
    }
}

fn kind_emoji(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::StatusUpdate => "🔄",
        NotificationKind::PermissionRequest => "❓",
        NotificationKind::Blocked => "🚫",
        NotificationKind::Completed => "✅",
        NotificationKind::Failed => "❌",
        NotificationKind::MainBranchFailed => "🔥",
    }
}

/// Read position inside a notification log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailCursor {
    pub offset: u64,
}

/// Append/tail access to the notification log.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn append(&self, event: &NotificationEvent) -> anyhow::Result<()>;

    /// Events written after `cursor`; advances the cursor past every
    /// complete line that was read.
    async fn tail(&self, cursor: &mut TailCursor) -> anyhow::Result<Vec<NotificationEvent>>;
}

/// JSONL file implementation of [`NotificationSink`].
#[derive(Debug, Clone)]
pub struct JsonlNotificationSink {
    path: PathBuf,
}

impl JsonlNotificationSink {
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cursor positioned at the current end of the log (skip history).
    pub fn end_cursor(&self) -> TailCursor {
        let offset = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        TailCursor { offset }
    }
}

#[async_trait]
impl NotificationSink for JsonlNotificationSink {
    async fn append(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", self.path.display()))?;
        Ok(())
    }

    async fn tail(&self, cursor: &mut TailCursor) -> anyhow::Result<Vec<NotificationEvent>> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("opening {}", self.path.display())),
        };

        let len = file.metadata()?.len();
        if len < cursor.offset {
            // truncated or rotated underneath us
            tracing::warn!(path = %self.path.display(), "notification log shrank, rewinding");
            cursor.offset = 0;
        }

        file.seek(SeekFrom::Start(cursor.offset))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;

        let mut events = Vec::new();
        let mut consumed = 0usize;
        for line in buf.split_inclusive('\n') {
            if !line.ends_with('\n') {
                // partial write, pick it up next time
                break;
            }
            consumed += line.len();
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<NotificationEvent>(trimmed) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(?e, "skipping malformed notification line"),
            }
        }
        cursor.offset += consumed as u64;
        Ok(events)
    }
}

/// Format seconds into a short human-readable duration.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.0}s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.0}m {:.0}s", (seconds / 60.0).floor(), seconds % 60.0)
    } else {
        let hours = (seconds / 3600.0).floor();
        let mins = ((seconds % 3600.0) / 60.0).floor();
        format!("{:.0}h {:.0}m", hours, mins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tail_returns_only_new_events() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlNotificationSink::new(dir.path().join("n.jsonl")).unwrap();
        let mut cursor = TailCursor::default();

        assert!(sink.tail(&mut cursor).await.unwrap().is_empty());

        sink.append(&NotificationEvent::new(NotificationKind::StatusUpdate, 1, "phase: implement"))
            .await
            .unwrap();
        sink.append(&NotificationEvent::new(NotificationKind::Completed, 2, "done"))
            .await
            .unwrap();

        let first = sink.tail(&mut cursor).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].kind, NotificationKind::Completed);

        sink.append(&NotificationEvent::new(NotificationKind::Failed, 3, "boom"))
            .await
            .unwrap();
        let second = sink.tail(&mut cursor).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].issue_id, 3);
    }

    #[tokio::test]
    async fn partial_line_is_left_for_next_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.jsonl");
        let sink = JsonlNotificationSink::new(&path).unwrap();
        sink.append(&NotificationEvent::new(NotificationKind::Blocked, 4, "conflict"))
            .await
            .unwrap();
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"type":"completed","issueId":5"#).unwrap();

        let mut cursor = TailCursor::default();
        let events = sink.tail(&mut cursor).await.unwrap();
        assert_eq!(events.len(), 1);

        f.write_all(b",\"payload\":{},\"timestamp\":\"2026-01-01T00:00:00Z\"}\n")
            .unwrap();
        let events = sink.tail(&mut cursor).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].issue_id, 5);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.jsonl");
        std::fs::write(&path, "garbage\n").unwrap();
        let sink = JsonlNotificationSink::new(&path).unwrap();
        sink.append(&NotificationEvent::new(NotificationKind::Completed, 8, "ok"))
            .await
            .unwrap();

        let mut cursor = TailCursor::default();
        let events = sink.tail(&mut cursor).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].issue_id, 8);
    }

    #[tokio::test]
    async fn end_cursor_skips_history() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlNotificationSink::new(dir.path().join("n.jsonl")).unwrap();
        sink.append(&NotificationEvent::new(NotificationKind::Completed, 1, "old"))
            .await
            .unwrap();
        let mut cursor = sink.end_cursor();
        assert!(sink.tail(&mut cursor).await.unwrap().is_empty());
    }

    #[test]
    fn event_wire_shape() {
        let event = NotificationEvent::new(NotificationKind::MainBranchFailed, 12, "main is red")
            .with("prNumber", 99);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "main_branch_failed");
        assert_eq!(value["issueId"], 12);
        assert_eq!(value["payload"]["message"], "main is red");
        assert_eq!(value["payload"]["prNumber"], 99);
        assert_eq!(value["payload"]["requiresResponse"], true);
    }

    #[test]
    fn summary_line_includes_kind_and_message() {
        let line = NotificationEvent::new(NotificationKind::Completed, 3, "merged").summary_line();
        assert!(line.contains("✅"));
        assert!(line.contains("#3"));
        assert!(line.contains("completed"));
        assert!(line.contains("merged"));
    }

    #[test]
    fn format_duration_ranges() {
        assert_eq!(format_duration(30.0), "30s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(5400.0), "1h 30m");
    }
}
