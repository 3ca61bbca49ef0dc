use super::{DurableQueue, QueueEntry};
use crate::availability::AvailabilityProbe;
use crate::context::AuthContext;
use crate::error::{ClientError, ClientResult};
use crate::model::Resource;
use crate::repository::UpstreamRepository;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Entries submitted to upstream per bundle.
pub const DISPATCH_BATCH_SIZE: usize = 20;

/// Suffix of a queue's dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = ".dead";

/// Name of the dead-letter queue for `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// Moves the dead letters of `queue` back onto their origin queue.
///
/// Entries are re-enqueued as new entries; the failure reason is dropped.
pub async fn requeue_dead_letters(queue: &dyn DurableQueue, name: &str) -> ClientResult<usize> {
    let dead = dead_letter_queue(name);
    let mut moved = 0;
    loop {
        let batch = queue.dequeue(&dead, DISPATCH_BATCH_SIZE).await?;
        if batch.is_empty() {
            break;
        }
        let size = batch.len();
        let revived = batch
            .iter()
            .map(|entry| {
                let origin = entry.origin.clone().unwrap_or_else(|| name.to_string());
                QueueEntry::new(origin, entry.payload.clone())
            })
            .collect();
        if let Err(e) = queue.enqueue_all(revived).await {
            warn!("Could not requeue {} dead letters from {}: {}", size, dead, e);
            restore(queue, batch).await;
            return Err(e);
        }
        moved += size;
    }
    info!("Requeued {} dead letters from {}", moved, dead);
    Ok(moved)
}

/// Puts dequeued entries back where they came from after a failed move.
async fn restore(queue: &dyn DurableQueue, entries: Vec<QueueEntry>) {
    let size = entries.len();
    if let Err(e) = queue.enqueue_all(entries).await {
        error!("Lost {} queue entries that could not be restored: {}", size, e);
    }
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub dead_lettered: usize,
    pub batches: usize,
}

/// Forwards one named queue to upstream.
pub struct DispatchQueue<T> {
    name: String,
    queue: Arc<dyn DurableQueue>,
    repository: UpstreamRepository<T>,
    probe: Arc<dyn AvailabilityProbe>,
    draining: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Resource> DispatchQueue<T> {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn DurableQueue>,
        repository: UpstreamRepository<T>,
        probe: Arc<dyn AvailabilityProbe>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            repository,
            probe,
            draining: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dead_letter_name(&self) -> String {
        dead_letter_queue(&self.name)
    }

    /// Queues `payload` for delivery. Never touches the network.
    pub async fn insert(&self, payload: &T) -> ClientResult<Uuid> {
        let entry = QueueEntry::new(self.name.clone(), serde_json::to_value(payload)?);
        let id = entry.id;
        self.queue.enqueue(entry).await?;
        debug!("Queued {} on {}", id, self.name);
        Ok(id)
    }

    /// Drains the queue to upstream.
    ///
    /// Does nothing while the realm is unconfigured or upstream is
    /// unreachable. A rejected batch is dead-lettered as a whole.
    pub async fn on_enqueued(&self) -> ClientResult<DispatchReport> {
        let _guard = self.draining.lock().await;
        let mut report = DispatchReport::default();

        if !self.repository.is_configured() {
            debug!("Realm not configured, leaving {} queued", self.name);
            return Ok(report);
        }
        if !self.probe.is_available(self.repository.service()).await {
            debug!("Upstream unreachable, leaving {} queued", self.name);
            return Ok(report);
        }

        let dead = self.dead_letter_name();
        loop {
            let batch = self.queue.dequeue(&self.name, DISPATCH_BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            report.batches += 1;
            let size = batch.len();

            match self.submit(&batch).await {
                Ok(()) => report.delivered += size,
                Err(e) => {
                    warn!(
                        "Batch of {} from {} rejected, moving to {}: {}",
                        size, self.name, dead, e
                    );
                    let reason = e.to_string();
                    let dead_letters = batch
                        .iter()
                        .cloned()
                        .map(|entry| entry.into_dead_letter(&dead, reason.clone()))
                        .collect();
                    if let Err(write) = self.queue.enqueue_all(dead_letters).await {
                        warn!("Could not dead-letter batch from {}: {}", self.name, write);
                        restore(self.queue.as_ref(), batch).await;
                        return Err(write);
                    }
                    report.dead_lettered += size;
                }
            }
        }

        if report.batches > 0 {
            info!(
                "Drained {}: {} delivered, {} dead-lettered",
                self.name, report.delivered, report.dead_lettered
            );
        }
        Ok(report)
    }

    async fn submit(&self, batch: &[QueueEntry]) -> ClientResult<()> {
        let items = batch
            .iter()
            .map(|entry| serde_json::from_value::<T>(entry.payload.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ClientError::from)?;
        AuthContext::as_system(self.repository.insert_all(items)).await?;
        Ok(())
    }

    /// Moves every dead letter back onto its origin queue.
    pub async fn requeue_dead_letters(&self) -> ClientResult<usize> {
        requeue_dead_letters(self.queue.as_ref(), &self.name).await
    }

    /// Runs [`on_enqueued`](Self::on_enqueued) whenever this queue is
    /// written to. Notifications are handled one at a time.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut notifications = this.queue.subscribe();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(name) if name == this.name => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Listener for {} skipped {} notifications", this.name, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
                if let Err(e) = this.on_enqueued().await {
                    warn!("Dispatch of {} failed: {}", this.name, e);
                }
            }
        })
    }
}
