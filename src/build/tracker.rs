//! In-memory build history: a newest-first ring of build entries with
//! optional retention, plus subscription fan-out for the SSE stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ids::generate_call_id;

const SUBSCRIBER_BUFFER: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Running,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildEntry {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub image: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub source_type: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub runtime: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub git_url: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub git_ref: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub source_path: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub zip_name: String,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<i64>,
    pub deployed: bool,
    pub updated: bool,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub output: String,
    pub truncated: bool,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub error: String,
}

impl BuildEntry {
    pub fn started(name: &str, source_type: &str, runtime: &str) -> Self {
        BuildEntry {
            id: String::new(),
            name: name.to_string(),
            image: String::new(),
            source_type: source_type.to_string(),
            runtime: runtime.to_string(),
            git_url: String::new(),
            git_ref: String::new(),
            source_path: String::new(),
            zip_name: String::new(),
            status: BuildStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            deployed: false,
            updated: false,
            output: String::new(),
            truncated: false,
            error: String::new(),
        }
    }
}

/// Field-wise patch applied by `BuildTracker::update`; only set fields
/// overwrite.
#[derive(Debug, Clone, Default)]
pub struct BuildUpdate {
    pub name: Option<String>,
    pub image: Option<String>,
    pub runtime: Option<String>,
    pub status: Option<BuildStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub deployed: Option<bool>,
    pub updated: Option<bool>,
    pub output: Option<String>,
    pub truncated: Option<bool>,
    pub error: Option<String>,
}

struct TrackerInner {
    entries: Vec<BuildEntry>,
    subs: HashMap<u64, mpsc::Sender<BuildEntry>>,
    next_sub_id: u64,
}

pub struct BuildTracker {
    limit: usize,
    retention: Option<Duration>,
    inner: Mutex<TrackerInner>,
}

impl BuildTracker {
    pub fn new(limit: usize, retention: Option<Duration>) -> Self {
        let limit = if limit == 0 { 100 } else { limit };
        Self {
            limit,
            retention,
            inner: Mutex::new(TrackerInner {
                entries: Vec::new(),
                subs: HashMap::new(),
                next_sub_id: 0,
            }),
        }
    }

    /// Record a new build, assigning an id when blank. The entry is
    /// prepended (newest first), the ring pruned and trimmed, and every
    /// subscriber notified.
    pub fn add(&self, mut entry: BuildEntry) -> BuildEntry {
        if entry.id.is_empty() {
            entry.id = generate_call_id();
        }
        let mut inner = self.inner.lock().unwrap();
        Self::prune(&mut inner.entries, self.retention);
        inner.entries.insert(0, entry.clone());
        if inner.entries.len() > self.limit {
            inner.entries.truncate(self.limit);
        }
        Self::broadcast(&mut inner, &entry);
        entry
    }

    /// Apply a patch to an entry. Status only moves out of `running` once;
    /// later status patches on a finished entry are ignored.
    pub fn update(&self, id: &str, update: BuildUpdate) -> Option<BuildEntry> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.entries.iter().position(|e| e.id == id)?;
        {
            let entry = &mut inner.entries[index];
            if let Some(name) = update.name {
                entry.name = name;
            }
            if let Some(image) = update.image {
                entry.image = image;
            }
            if let Some(runtime) = update.runtime {
                entry.runtime = runtime;
            }
            if let Some(status) = update.status {
                if entry.status == BuildStatus::Running {
                    entry.status = status;
                }
            }
            if let Some(finished_at) = update.finished_at {
                entry.finished_at = Some(finished_at);
            }
            if let Some(duration_ms) = update.duration_ms {
                entry.duration_ms = Some(duration_ms);
            }
            if let Some(deployed) = update.deployed {
                entry.deployed = deployed;
            }
            if let Some(updated) = update.updated {
                entry.updated = updated;
            }
            if let Some(output) = update.output {
                entry.output = output;
            }
            if let Some(truncated) = update.truncated {
                entry.truncated = truncated;
            }
            if let Some(error) = update.error {
                entry.error = error;
            }
        }
        Self::prune(&mut inner.entries, self.retention);
        let entry = inner.entries.iter().find(|e| e.id == id).cloned()?;
        Self::broadcast(&mut inner, &entry);
        Some(entry)
    }

    pub fn list(&self) -> Vec<BuildEntry> {
        let mut inner = self.inner.lock().unwrap();
        Self::prune(&mut inner.entries, self.retention);
        inner.entries.clone()
    }

    pub fn get(&self, id: &str) -> Option<BuildEntry> {
        let mut inner = self.inner.lock().unwrap();
        Self::prune(&mut inner.entries, self.retention);
        inner.entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    /// Subscribe to post-mutation snapshots. The channel is bounded; a slow
    /// subscriber loses events instead of blocking publishers. Dropping the
    /// subscription unregisters it.
    pub fn subscribe(self: &Arc<Self>) -> BuildSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner.subs.insert(id, tx);
        BuildSubscription {
            id,
            rx,
            tracker: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.lock().unwrap().subs.remove(&id);
    }

    fn broadcast(inner: &mut TrackerInner, entry: &BuildEntry) {
        inner.subs.retain(|_, tx| {
            match tx.try_send(entry.clone()) {
                Ok(()) => true,
                // full buffer drops this event but keeps the subscriber
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn prune(entries: &mut Vec<BuildEntry>, retention: Option<Duration>) {
        let Some(retention) = retention else {
            return;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return;
        };
        let cutoff = Utc::now() - retention;
        entries.retain(|entry| entry.finished_at.unwrap_or(entry.started_at) > cutoff);
    }
}

pub struct BuildSubscription {
    id: u64,
    rx: mpsc::Receiver<BuildEntry>,
    tracker: Arc<BuildTracker>,
}

impl BuildSubscription {
    pub async fn recv(&mut self) -> Option<BuildEntry> {
        self.rx.recv().await
    }
}

impl Drop for BuildSubscription {
    fn drop(&mut self) {
        self.tracker.unsubscribe(self.id);
    }
}
