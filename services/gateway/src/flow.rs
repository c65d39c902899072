//! Flow event log (§5, §6) — a bounded in-memory ring plus a dedicated
//! serial-writer task that appends daily NDJSON files.
//!
//! The core only *emits* flow events (§1 Out of scope: "the flow-monitor
//! persistence layer"); this module is the concrete default writer a port
//! needs to exist at all, per §9's "a port expresses this as a dedicated
//! serial writer" guidance. `DELETE /api/flows` and file-backed export are
//! a thin concrete implementation, not the full dashboard/monitor product.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

const RETENTION_DAYS: u64 = 7;
const DAY_MILLIS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum FlowStage {
    Start {
        protocol: String,
        route: String,
        model: String,
        stream: bool,
        request_snapshot: serde_json::Value,
    },
    Chunk {
        bytes: usize,
    },
    Complete {
        usage: serde_json::Value,
    },
    Error {
        error_type: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub flow_id: String,
    pub at: u64,
    #[serde(flatten)]
    pub stage: FlowStage,
}

struct FlowWriterHandle {
    tx: mpsc::UnboundedSender<FlowEvent>,
}

/// Bounded in-memory ring plus a serial NDJSON writer.
pub struct FlowLog {
    ring: RwLock<VecDeque<FlowEvent>>,
    capacity: RwLock<usize>,
    dir: PathBuf,
    writer: FlowWriterHandle,
}

impl FlowLog {
    /// Spawn the serial writer task and return a handle. `capacity` is the
    /// in-memory ring size, driven by the admin-editable `maxFlowEntries`.
    pub fn spawn(dir: PathBuf, capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FlowEvent>();
        let writer_dir = dir.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = append_to_daily_file(&writer_dir, &event).await {
                    warn!(error = %e, "failed to persist flow event");
                }
            }
        });

        let dir_for_purge = dir.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                purge_old_files(&dir_for_purge).await;
            }
        });

        Arc::new(Self {
            ring: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: RwLock::new(capacity),
            dir,
            writer: FlowWriterHandle { tx },
        })
    }

    pub async fn set_capacity(&self, capacity: usize) {
        *self.capacity.write().await = capacity;
        let mut ring = self.ring.write().await;
        while ring.len() > capacity {
            ring.pop_front();
        }
    }

    /// Record an event: push onto the in-memory ring and hand off to the
    /// serial writer. Never blocks the caller on disk I/O.
    pub async fn emit(&self, flow_id: impl Into<String>, stage: FlowStage) {
        let event = FlowEvent {
            flow_id: flow_id.into(),
            at: common::now_millis(),
            stage,
        };

        {
            let capacity = *self.capacity.read().await;
            let mut ring = self.ring.write().await;
            if ring.len() >= capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        if self.writer.tx.send(event).is_err() {
            warn!("flow writer task is gone, event dropped from persistence");
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<FlowEvent> {
        let ring = self.ring.read().await;
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub async fn clear(&self) {
        self.ring.write().await.clear();
    }

    /// Read a persisted day's NDJSON file (`GET /api/flows?day=YYYY-MM-DD`).
    pub async fn read_day(&self, day: &str) -> Vec<FlowEvent> {
        let path = self.dir.join(format!("{day}.ndjson"));
        let Ok(contents) = tokio::fs::read_to_string(&path).await else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Read the last `days` persisted daily files (`GET /api/flows?days=N`).
    pub async fn read_last_days(&self, days: u32) -> Vec<FlowEvent> {
        let now = common::now_millis();
        let mut events = Vec::new();
        for offset in 0..days as u64 {
            let millis = now.saturating_sub(offset * DAY_MILLIS);
            let path = self.dir.join(format!("{}.ndjson", day_string(millis)));
            let Ok(contents) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            events.extend(contents.lines().filter_map(|line| serde_json::from_str(line).ok()));
        }
        events
    }
}

fn day_string(millis: u64) -> String {
    let days_since_epoch = millis / DAY_MILLIS;
    // Avoids pulling in a date-time crate for a single daily bucket: a
    // y/m/d-free monotonic day index sorts and groups identically to a
    // calendar date for retention purposes.
    format!("day-{days_since_epoch}")
}

async fn append_to_daily_file(dir: &Path, event: &FlowEvent) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.ndjson", day_string(event.at)));
    let line = serde_json::to_string(event).unwrap_or_default();

    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

async fn purge_old_files(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    let now = common::now_millis();
    let cutoff_day = now / DAY_MILLIS - RETENTION_DAYS;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(day_str) = name.strip_prefix("day-").and_then(|s| s.strip_suffix(".ndjson"))
            && let Ok(day) = day_str.parse::<u64>()
            && day < cutoff_day
        {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_respects_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let log = FlowLog::spawn(dir.path().to_path_buf(), 2);
        log.emit("a", FlowStage::Chunk { bytes: 1 }).await;
        log.emit("b", FlowStage::Chunk { bytes: 2 }).await;
        log.emit("c", FlowStage::Chunk { bytes: 3 }).await;

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].flow_id, "c");
        assert_eq!(recent[1].flow_id, "b");
    }

    #[tokio::test]
    async fn clear_empties_ring() {
        let dir = tempfile::tempdir().unwrap();
        let log = FlowLog::spawn(dir.path().to_path_buf(), 10);
        log.emit("a", FlowStage::Chunk { bytes: 1 }).await;
        log.clear().await;
        assert!(log.recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn set_capacity_shrinks_ring() {
        let dir = tempfile::tempdir().unwrap();
        let log = FlowLog::spawn(dir.path().to_path_buf(), 10);
        for i in 0..5 {
            log.emit(format!("f{i}"), FlowStage::Chunk { bytes: i }).await;
        }
        log.set_capacity(2).await;
        assert_eq!(log.recent(10).await.len(), 2);
    }

    #[tokio::test]
    async fn emitted_event_eventually_persists_to_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = FlowLog::spawn(dir.path().to_path_buf(), 10);
        log.emit(
            "flow-1",
            FlowStage::Start {
                protocol: "messages".to_string(),
                route: "/v1/messages".to_string(),
                model: "claude-sonnet-4-5".to_string(),
                stream: false,
                request_snapshot: serde_json::json!({}),
            },
        )
        .await;

        // Give the serial writer a chance to drain the channel.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let today = day_string(common::now_millis());
        let events = log.read_day(&today).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].flow_id, "flow-1");
    }

    #[tokio::test]
    async fn read_last_days_covers_todays_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = FlowLog::spawn(dir.path().to_path_buf(), 10);
        log.emit("flow-2", FlowStage::Chunk { bytes: 7 }).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let events = log.read_last_days(3).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].flow_id, "flow-2");
    }
}
