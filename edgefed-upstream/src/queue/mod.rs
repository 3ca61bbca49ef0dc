//! Durable outbound queues and the upstream dispatch consumer.
//!
//! Entries are written locally first and forwarded upstream later, in
//! batches, whenever upstream is reachable. A batch that upstream rejects is
//! moved whole to the queue's dead-letter queue for an operator to resubmit.

mod dispatch;

pub use dispatch::{
    dead_letter_queue, requeue_dead_letters, DispatchQueue, DispatchReport, DEAD_LETTER_SUFFIX,
    DISPATCH_BATCH_SIZE,
};

use crate::config::write_json_atomic;
use crate::error::ClientResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use uuid::Uuid;

/// One queued payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// Queue the entry was dead-lettered from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Why delivery failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl QueueEntry {
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue: queue.into(),
            payload,
            enqueued_at: Utc::now(),
            origin: None,
            reason: None,
        }
    }

    /// This entry moved to `dead_queue`, remembering where it came from.
    pub fn into_dead_letter(self, dead_queue: &str, reason: impl Into<String>) -> Self {
        Self {
            origin: Some(self.queue.clone()),
            queue: dead_queue.to_string(),
            reason: Some(reason.into()),
            ..self
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        self.origin.is_some()
    }
}

/// A set of named FIFO queues that survive restarts.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Appends `entry` to the queue it names and notifies subscribers.
    async fn enqueue(&self, entry: QueueEntry) -> ClientResult<()>;

    /// Appends every entry in one write. Either all are stored or none are.
    async fn enqueue_all(&self, entries: Vec<QueueEntry>) -> ClientResult<()>;

    /// Removes and returns up to `max` entries from the head of `queue`.
    async fn dequeue(&self, queue: &str, max: usize) -> ClientResult<Vec<QueueEntry>>;

    /// Number of entries waiting in `queue`.
    async fn count(&self, queue: &str) -> ClientResult<usize>;

    /// Names of queues as entries are enqueued on them.
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

fn append(queues: &mut HashMap<String, VecDeque<QueueEntry>>, entries: Vec<QueueEntry>) -> BTreeSet<String> {
    let mut touched = BTreeSet::new();
    for entry in entries {
        touched.insert(entry.queue.clone());
        queues.entry(entry.queue.clone()).or_default().push_back(entry);
    }
    touched
}

/// Queues held in process memory.
#[derive(Debug)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<QueueEntry>>>,
    notify: broadcast::Sender<String>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        let (notify, _) = broadcast::channel(256);
        Self {
            queues: Mutex::new(HashMap::new()),
            notify,
        }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of `queue` without removing anything.
    pub fn entries(&self, queue: &str) -> Vec<QueueEntry> {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn enqueue(&self, entry: QueueEntry) -> ClientResult<()> {
        let name = entry.queue.clone();
        self.queues
            .lock()
            .entry(name.clone())
            .or_default()
            .push_back(entry);
        // No subscribers is fine.
        let _ = self.notify.send(name);
        Ok(())
    }

    async fn enqueue_all(&self, entries: Vec<QueueEntry>) -> ClientResult<()> {
        let touched = append(&mut self.queues.lock(), entries);
        for name in touched {
            let _ = self.notify.send(name);
        }
        Ok(())
    }

    async fn dequeue(&self, queue: &str, max: usize) -> ClientResult<Vec<QueueEntry>> {
        let mut queues = self.queues.lock();
        let Some(entries) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let n = max.min(entries.len());
        Ok(entries.drain(..n).collect())
    }

    async fn count(&self, queue: &str) -> ClientResult<usize> {
        Ok(self.queues.lock().get(queue).map_or(0, VecDeque::len))
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.notify.subscribe()
    }
}

/// Queues persisted as one JSON file, rewritten on every change.
#[derive(Debug)]
pub struct JsonQueue {
    path: PathBuf,
    queues: Mutex<HashMap<String, VecDeque<QueueEntry>>>,
    notify: broadcast::Sender<String>,
}

impl JsonQueue {
    /// Opens the queue file at `path`, starting empty when it is missing.
    pub fn open(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref().to_path_buf();
        let queues = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            HashMap::new()
        };
        let (notify, _) = broadcast::channel(256);
        Ok(Self {
            path,
            queues: Mutex::new(queues),
            notify,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DurableQueue for JsonQueue {
    async fn enqueue(&self, entry: QueueEntry) -> ClientResult<()> {
        let name = entry.queue.clone();
        {
            let mut queues = self.queues.lock();
            let mut next = queues.clone();
            next.entry(name.clone()).or_default().push_back(entry);
            write_json_atomic(&self.path, &next)?;
            *queues = next;
        }
        let _ = self.notify.send(name);
        Ok(())
    }

    async fn enqueue_all(&self, entries: Vec<QueueEntry>) -> ClientResult<()> {
        let touched = {
            let mut queues = self.queues.lock();
            let mut next = queues.clone();
            let touched = append(&mut next, entries);
            write_json_atomic(&self.path, &next)?;
            *queues = next;
            touched
        };
        for name in touched {
            let _ = self.notify.send(name);
        }
        Ok(())
    }

    async fn dequeue(&self, queue: &str, max: usize) -> ClientResult<Vec<QueueEntry>> {
        let mut queues = self.queues.lock();
        let mut next = queues.clone();
        let taken: Vec<QueueEntry> = match next.get_mut(queue) {
            Some(entries) => {
                let n = max.min(entries.len());
                entries.drain(..n).collect()
            }
            None => Vec::new(),
        };
        if !taken.is_empty() {
            write_json_atomic(&self.path, &next)?;
            *queues = next;
        }
        Ok(taken)
    }

    async fn count(&self, queue: &str) -> ClientResult<usize> {
        Ok(self.queues.lock().get(queue).map_or(0, VecDeque::len))
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.notify.subscribe()
    }
}
