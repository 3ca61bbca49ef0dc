mod common;

use async_trait::async_trait;
use common::{Patient, StaticProbe};
use edgefed_upstream::queue::{dead_letter_queue, QueueEntry};
use edgefed_upstream::{
    ClientError, ClientResult, DispatchQueue, DispatchReport, DurableQueue, MemoryQueue,
    MemoryResourceCache, TemplateKeyCache, TransportFactory, UpstreamRepository,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const QUEUE: &str = "outbound.patient";

fn dispatcher(
    factory: Arc<TransportFactory>,
    available: bool,
) -> (Arc<DispatchQueue<Patient>>, Arc<MemoryQueue>, Arc<StaticProbe>) {
    let repo = UpstreamRepository::new(
        factory,
        Arc::new(MemoryResourceCache::new()),
        Arc::new(TemplateKeyCache::new()),
    );
    let queue = Arc::new(MemoryQueue::new());
    let probe = StaticProbe::new(available);
    let dispatch = DispatchQueue::new(QUEUE, queue.clone(), repo, probe.clone());
    (Arc::new(dispatch), queue, probe)
}

/// Memory queue whose dead-letter queues refuse writes.
struct ReadOnlyDeadLetters(MemoryQueue);

impl ReadOnlyDeadLetters {
    fn refuses(entry: &QueueEntry) -> bool {
        entry.queue.ends_with(".dead")
    }
}

#[async_trait]
impl DurableQueue for ReadOnlyDeadLetters {
    async fn enqueue(&self, entry: QueueEntry) -> ClientResult<()> {
        if Self::refuses(&entry) {
            return Err(ClientError::Queue("disk full".into()));
        }
        self.0.enqueue(entry).await
    }

    async fn enqueue_all(&self, entries: Vec<QueueEntry>) -> ClientResult<()> {
        if entries.iter().any(Self::refuses) {
            return Err(ClientError::Queue("disk full".into()));
        }
        self.0.enqueue_all(entries).await
    }

    async fn dequeue(&self, queue: &str, max: usize) -> ClientResult<Vec<QueueEntry>> {
        self.0.dequeue(queue, max).await
    }

    async fn count(&self, queue: &str) -> ClientResult<usize> {
        self.0.count(queue).await
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.0.subscribe()
    }
}

fn echo_bundle(req: &Request) -> ResponseTemplate {
    let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
    ResponseTemplate::new(200).set_body_json(body)
}

async fn fill(dispatch: &DispatchQueue<Patient>, n: usize) {
    for i in 0..n {
        dispatch.insert(&Patient::named(&format!("p{i}"))).await.unwrap();
    }
}

// ── Enqueue ─────────────────────────────────────────────────────

#[tokio::test]
async fn insert_only_enqueues() {
    let server = MockServer::start().await;
    let (factory, _) = common::joined_factory(&server.uri());
    let (dispatch, queue, _) = dispatcher(factory, true);

    fill(&dispatch, 3).await;

    assert_eq!(queue.count(QUEUE).await.unwrap(), 3);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_upstream_leaves_entries_queued() {
    let server = MockServer::start().await;
    let (factory, _) = common::joined_factory(&server.uri());
    let (dispatch, queue, _) = dispatcher(factory, false);
    fill(&dispatch, 2).await;

    let report = dispatch.on_enqueued().await.unwrap();

    assert_eq!(report, DispatchReport::default());
    assert_eq!(queue.count(QUEUE).await.unwrap(), 2);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unconfigured_realm_leaves_entries_queued() {
    let (factory, _, _) = common::unjoined_factory();
    let (dispatch, queue, _) = dispatcher(factory, true);
    fill(&dispatch, 1).await;

    assert_eq!(dispatch.on_enqueued().await.unwrap(), DispatchReport::default());
    assert_eq!(queue.count(QUEUE).await.unwrap(), 1);
}

// ── Drain ───────────────────────────────────────────────────────

#[tokio::test]
async fn drains_in_batches_of_twenty() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hdsi/Bundle"))
        .respond_with(echo_bundle)
        .expect(3)
        .mount(&server)
        .await;
    let (factory, _) = common::joined_factory(&server.uri());
    let (dispatch, queue, _) = dispatcher(factory, true);
    fill(&dispatch, 45).await;

    let report = dispatch.on_enqueued().await.unwrap();

    assert_eq!(
        report,
        DispatchReport {
            delivered: 45,
            dead_lettered: 0,
            batches: 3
        }
    );
    assert_eq!(queue.count(QUEUE).await.unwrap(), 0);

    let sizes: Vec<usize> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            body["resource"].as_array().unwrap().len()
        })
        .collect();
    assert_eq!(sizes, vec![20, 20, 5]);
}

#[tokio::test]
async fn rejected_batch_is_dead_lettered_whole() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hdsi/Bundle"))
        .respond_with(ResponseTemplate::new(422).set_body_string("invalid record"))
        .mount(&server)
        .await;
    let (factory, _) = common::joined_factory(&server.uri());
    let (dispatch, queue, _) = dispatcher(factory, true);
    fill(&dispatch, 25).await;

    let report = dispatch.on_enqueued().await.unwrap();

    assert_eq!(report.delivered, 0);
    assert_eq!(report.dead_lettered, 25);
    assert_eq!(queue.count(QUEUE).await.unwrap(), 0);

    let dead = queue.entries(&dead_letter_queue(QUEUE));
    assert_eq!(dead.len(), 25);
    assert!(dead.iter().all(|e| e.origin.as_deref() == Some(QUEUE)));
    assert!(dead
        .iter()
        .all(|e| e.reason.as_deref().is_some_and(|r| r.contains("422"))));
}

#[tokio::test]
async fn failed_dead_letter_write_keeps_batch_queued() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hdsi/Bundle"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let (factory, _) = common::joined_factory(&server.uri());
    let repo = UpstreamRepository::new(
        factory,
        Arc::new(MemoryResourceCache::new()),
        Arc::new(TemplateKeyCache::new()),
    );
    let queue = Arc::new(ReadOnlyDeadLetters(MemoryQueue::new()));
    let dispatch = DispatchQueue::<Patient>::new(QUEUE, queue.clone(), repo, StaticProbe::new(true));
    fill(&dispatch, 5).await;

    let err = dispatch.on_enqueued().await.unwrap_err();

    assert!(matches!(err, ClientError::Queue(_)));
    assert_eq!(queue.count(QUEUE).await.unwrap(), 5);
    assert_eq!(queue.count(&dead_letter_queue(QUEUE)).await.unwrap(), 0);
    assert!(queue.0.entries(QUEUE).iter().all(|e| !e.is_dead_letter()));
}

#[tokio::test]
async fn requeued_dead_letters_are_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hdsi/Bundle"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hdsi/Bundle"))
        .respond_with(echo_bundle)
        .mount(&server)
        .await;
    let (factory, _) = common::joined_factory(&server.uri());
    let (dispatch, queue, _) = dispatcher(factory, true);
    fill(&dispatch, 4).await;

    assert_eq!(dispatch.on_enqueued().await.unwrap().dead_lettered, 4);

    assert_eq!(dispatch.requeue_dead_letters().await.unwrap(), 4);
    assert_eq!(queue.count(&dispatch.dead_letter_name()).await.unwrap(), 0);
    let requeued = queue.entries(QUEUE);
    assert!(requeued.iter().all(|e| !e.is_dead_letter()));

    assert_eq!(dispatch.on_enqueued().await.unwrap().delivered, 4);
    assert_eq!(queue.count(QUEUE).await.unwrap(), 0);
}

// ── Listener ────────────────────────────────────────────────────

#[tokio::test]
async fn listener_drains_after_enqueue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hdsi/Bundle"))
        .respond_with(echo_bundle)
        .mount(&server)
        .await;
    let (factory, _) = common::joined_factory(&server.uri());
    let (dispatch, queue, _) = dispatcher(factory, true);
    let listener = dispatch.spawn_listener();

    fill(&dispatch, 3).await;

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while queue.count(QUEUE).await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(drained.is_ok());
    assert!(queue.entries(&dead_letter_queue(QUEUE)).is_empty());

    listener.abort();
}

// ── File-backed queue ───────────────────────────────────────────

#[tokio::test]
async fn json_queue_survives_reopen_and_requeues() {
    use edgefed_upstream::queue::requeue_dead_letters;
    use edgefed_upstream::{JsonQueue, QueueEntry};
    use serde_json::json;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("queues.json");
    let dead = dead_letter_queue(QUEUE);

    {
        let queue = JsonQueue::open(&path).unwrap();
        queue.enqueue(QueueEntry::new(QUEUE, json!({ "n": 1 }))).await.unwrap();
        queue
            .enqueue(QueueEntry::new(QUEUE, json!({ "n": 2 })).into_dead_letter(&dead, "boom"))
            .await
            .unwrap();
    }

    let queue = JsonQueue::open(&path).unwrap();
    assert_eq!(queue.count(QUEUE).await.unwrap(), 1);
    assert_eq!(queue.count(&dead).await.unwrap(), 1);

    assert_eq!(requeue_dead_letters(&queue, QUEUE).await.unwrap(), 1);
    let reopened = JsonQueue::open(&path).unwrap();
    assert_eq!(reopened.count(QUEUE).await.unwrap(), 2);
    assert_eq!(reopened.count(&dead).await.unwrap(), 0);

    let drained = reopened.dequeue(QUEUE, 10).await.unwrap();
    let payloads: Vec<_> = drained.iter().map(|e| e.payload["n"].clone()).collect();
    assert_eq!(payloads, vec![json!(1), json!(2)]);
}
