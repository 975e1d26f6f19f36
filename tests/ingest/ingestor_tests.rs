use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cdc_connectors::RetryPolicy;
use cdc_connectors::ingest::{
    ChangeEvent, ChangeKind, ChangeStream, CommitPosition, EventIngestor, EventStore, IngestConf,
    IngestError, IngestResult, IngestorState, StartOutcome, TransportConnector, TransportMessage,
};
use serde_json::json;

const CUSTOMERS: &str = "orders.public.customers";

/// In-memory broker shared by the fake transport, its streams and the test.
#[derive(Default)]
struct Bus {
    queue: Mutex<VecDeque<TransportMessage>>,
    commits: Mutex<Vec<CommitPosition>>,
    subscriptions: Mutex<Vec<Vec<String>>>,
    /// Delivered since the last successful commit; redelivered on reconnect.
    inflight: Mutex<Vec<TransportMessage>>,
    connects: AtomicUsize,
    refuse_connects: AtomicBool,
    failing_polls: AtomicBool,
    /// Number of upcoming commits that fail.
    failing_commits: AtomicUsize,
    /// Ordered record of persist/commit calls.
    journal: Mutex<Vec<String>>,
}

impl Bus {
    fn push(&self, msg: TransportMessage) {
        self.queue.lock().unwrap().push_back(msg);
    }

    fn commits(&self) -> Vec<CommitPosition> {
        self.commits.lock().unwrap().clone()
    }

    fn last_subscription(&self) -> Option<Vec<String>> {
        self.subscriptions.lock().unwrap().last().cloned()
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }
}

struct FakeTransport(Arc<Bus>);

struct FakeStream(Arc<Bus>);

#[async_trait]
impl TransportConnector for FakeTransport {
    async fn connect(&self, topics: &[String]) -> IngestResult<Box<dyn ChangeStream>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if self.0.refuse_connects.load(Ordering::SeqCst) {
            return Err(IngestError::Transport("broker unreachable".into()));
        }
        self.0.subscriptions.lock().unwrap().push(topics.to_vec());
        let redeliver: Vec<_> = self.0.inflight.lock().unwrap().drain(..).collect();
        {
            let mut queue = self.0.queue.lock().unwrap();
            for msg in redeliver.into_iter().rev() {
                queue.push_front(msg);
            }
        }
        Ok(Box::new(FakeStream(self.0.clone())))
    }
}

#[async_trait]
impl ChangeStream for FakeStream {
    async fn poll(&mut self, timeout: Duration) -> IngestResult<Option<TransportMessage>> {
        if self.0.failing_polls.load(Ordering::SeqCst) {
            return Err(IngestError::Transport("all brokers down".into()));
        }
        let next = self.0.queue.lock().unwrap().pop_front();
        match &next {
            Some(msg) => {
                self.0.inflight.lock().unwrap().push(msg.clone());
            }
            None => tokio::time::sleep(timeout).await,
        }
        Ok(next)
    }

    fn subscribe(&mut self, topics: &[String]) -> IngestResult<()> {
        self.0.subscriptions.lock().unwrap().push(topics.to_vec());
        Ok(())
    }

    async fn commit(&mut self, positions: &[CommitPosition]) -> IngestResult<()> {
        let failing = self
            .0
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.0.journal.lock().unwrap().push("commit failed".into());
            return Err(IngestError::Commit("coordinator moved".into()));
        }
        self.0.journal.lock().unwrap().push("commit".into());
        self.0.inflight.lock().unwrap().clear();
        self.0.commits.lock().unwrap().extend_from_slice(positions);
        Ok(())
    }
}

struct FakeStore {
    bus: Arc<Bus>,
    events: Mutex<Vec<ChangeEvent>>,
    failing: AtomicBool,
}

impl FakeStore {
    fn new(bus: Arc<Bus>) -> Self {
        Self {
            bus,
            events: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStore for FakeStore {
    async fn persist(&self, events: &[ChangeEvent]) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("warehouse unavailable");
        }
        self.events.lock().unwrap().extend_from_slice(events);
        self.bus
            .journal
            .lock()
            .unwrap()
            .push(format!("persist {}", events.len()));
        Ok(())
    }
}

fn conf(batch_size: usize, batch_max_age_ms: u64) -> IngestConf {
    let _ = env_logger::builder().is_test(true).try_init();
    IngestConf {
        batch_size,
        batch_max_age_ms,
        poll_timeout_ms: 20,
        failure_pause_ms: 30,
        join_timeout_ms: 2_000,
        reconnect: RetryPolicy::fixed(3, Duration::from_millis(10)),
        ..IngestConf::default()
    }
}

fn insert(topic: &str, offset: i64) -> TransportMessage {
    let payload = json!({
        "op": "c",
        "after": {"id": offset, "name": format!("customer-{offset}")},
        "source": {"schema": "public", "table": "customers", "lsn": 1000 + offset},
        "ts_ms": 1_700_000_000_000i64
    });
    TransportMessage::new(topic, 0, offset, payload.to_string())
}

fn setup(conf: IngestConf) -> (Arc<Bus>, Arc<FakeStore>, EventIngestor) {
    let bus = Arc::new(Bus::default());
    let store = Arc::new(FakeStore::new(bus.clone()));
    let ingestor = EventIngestor::new(
        conf,
        Some(Arc::new(FakeTransport(bus.clone()))),
        store.clone(),
    );
    (bus, store, ingestor)
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn position(topic: &str, partition: i32, offset: i64) -> CommitPosition {
    CommitPosition {
        topic: topic.to_string(),
        partition,
        offset,
    }
}

#[tokio::test]
async fn disabled_without_transport() {
    let bus = Arc::new(Bus::default());
    let ingestor = EventIngestor::new(conf(10, 1_000), None, Arc::new(FakeStore::new(bus)));
    assert_eq!(ingestor.state(), IngestorState::Idle);
    assert_eq!(ingestor.start(), StartOutcome::Disabled);
    assert_eq!(ingestor.state(), IngestorState::Disabled);
    ingestor.stop().await;
}

#[tokio::test]
async fn full_batch_is_persisted_then_committed() {
    let (bus, store, ingestor) = setup(conf(3, 60_000));
    assert!(ingestor.add_topic(CUSTOMERS, "orders"));
    assert_eq!(ingestor.start(), StartOutcome::Started);
    assert_eq!(ingestor.start(), StartOutcome::AlreadyRunning);
    assert_eq!(ingestor.state(), IngestorState::Running);

    for offset in 0..3 {
        bus.push(insert(CUSTOMERS, offset));
    }
    eventually("commit", || !bus.commits().is_empty()).await;

    let events = store.events();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.pipeline_id == "orders"));
    assert_eq!(events[0].kind, ChangeKind::Insert);
    assert_eq!(events[0].table, "customers");
    assert_eq!(events[2].position.as_deref(), Some("1002"));
    assert_eq!(bus.commits(), vec![position(CUSTOMERS, 0, 2)]);
    assert_eq!(bus.journal(), vec!["persist 3", "commit"]);

    ingestor.stop().await;
    assert_eq!(ingestor.state(), IngestorState::Stopped);
    let stats = ingestor.stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.persisted, 3);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.flush_failures, 0);
}

#[tokio::test]
async fn aged_batch_is_flushed_before_it_fills() {
    let (bus, store, ingestor) = setup(conf(100, 100));
    ingestor.add_topic(CUSTOMERS, "orders");
    ingestor.start();

    let started = Instant::now();
    bus.push(insert(CUSTOMERS, 7));
    eventually("aged flush", || !bus.commits().is_empty()).await;
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(store.events().len(), 1);
    assert_eq!(bus.commits(), vec![position(CUSTOMERS, 0, 7)]);
    ingestor.stop().await;
}

#[tokio::test]
async fn failed_persist_keeps_the_batch_and_commits_nothing() {
    let (bus, store, ingestor) = setup(conf(2, 60_000));
    store.failing.store(true, Ordering::SeqCst);
    ingestor.add_topic(CUSTOMERS, "orders");
    ingestor.start();

    bus.push(insert(CUSTOMERS, 0));
    bus.push(insert(CUSTOMERS, 1));
    eventually("repeated failures", || ingestor.stats().flush_failures >= 2).await;
    assert!(bus.commits().is_empty());
    assert!(store.events().is_empty());

    store.failing.store(false, Ordering::SeqCst);
    eventually("recovery", || !bus.commits().is_empty()).await;
    assert_eq!(store.events().len(), 2, "same batch, nothing lost or doubled");
    assert_eq!(bus.commits(), vec![position(CUSTOMERS, 0, 1)]);
    assert_eq!(bus.journal(), vec!["persist 2", "commit"]);
    ingestor.stop().await;
}

#[tokio::test]
async fn undecodable_and_unmapped_messages_are_dropped_but_committed() {
    let (bus, store, ingestor) = setup(conf(100, 100));
    ingestor.add_topic(CUSTOMERS, "orders");
    ingestor.start();

    bus.push(TransportMessage::tombstone(CUSTOMERS, 0, 0));
    bus.push(insert("billing.public.invoices", 0));
    bus.push(TransportMessage::new(CUSTOMERS, 0, 1, "not json"));
    bus.push(insert(CUSTOMERS, 2));
    bus.push(insert("orders.public.items", 4));

    eventually("all received", || ingestor.stats().received == 5).await;
    eventually("everything committed", || {
        let commits = bus.commits();
        commits.contains(&position(CUSTOMERS, 0, 2))
            && commits.contains(&position("billing.public.invoices", 0, 0))
            && commits.contains(&position("orders.public.items", 0, 4))
    })
    .await;

    let events = store.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.pipeline_id == "orders"));
    let stats = ingestor.stats();
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.persisted, 2);
    ingestor.stop().await;
}

#[tokio::test]
async fn topic_changes_trigger_resubscription() {
    let (bus, _store, ingestor) = setup(conf(10, 1_000));
    ingestor.add_topic(CUSTOMERS, "orders");
    ingestor.start();
    eventually("initial subscription", || {
        bus.last_subscription() == Some(vec![CUSTOMERS.to_string()])
    })
    .await;

    assert!(ingestor.add_topic("orders.public.items", "orders"));
    eventually("resubscribed with both topics", || {
        bus.last_subscription()
            == Some(vec![CUSTOMERS.to_string(), "orders.public.items".to_string()])
    })
    .await;

    assert!(ingestor.remove_topic(CUSTOMERS));
    assert!(!ingestor.remove_topic(CUSTOMERS));
    eventually("resubscribed without removed topic", || {
        bus.last_subscription() == Some(vec!["orders.public.items".to_string()])
    })
    .await;
    assert_eq!(ingestor.topics(), vec!["orders.public.items".to_string()]);
    assert_eq!(bus.connects.load(Ordering::SeqCst), 1);
    ingestor.stop().await;
}

#[tokio::test]
async fn gives_up_after_reconnect_budget() {
    let (bus, _store, ingestor) = setup(conf(10, 1_000));
    bus.refuse_connects.store(true, Ordering::SeqCst);
    ingestor.add_topic(CUSTOMERS, "orders");
    ingestor.start();

    eventually("give up", || {
        matches!(ingestor.state(), IngestorState::GaveUp(_))
    })
    .await;
    assert_eq!(bus.connects.load(Ordering::SeqCst), 3);

    ingestor.stop().await;
    match ingestor.state() {
        IngestorState::GaveUp(reason) => assert!(reason.contains("broker unreachable")),
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn failing_polls_exhaust_the_reconnect_budget() {
    let (bus, _store, ingestor) = setup(conf(10, 1_000));
    bus.failing_polls.store(true, Ordering::SeqCst);
    ingestor.add_topic(CUSTOMERS, "orders");
    ingestor.start();

    eventually("give up", || {
        matches!(ingestor.state(), IngestorState::GaveUp(_))
    })
    .await;
    assert_eq!(bus.connects.load(Ordering::SeqCst), 3);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bus.connects.load(Ordering::SeqCst), 3, "no reconnects after giving up");

    ingestor.stop().await;
    match ingestor.state() {
        IngestorState::GaveUp(reason) => assert!(reason.contains("all brokers down")),
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn poll_errors_back_off_before_reconnecting() {
    let mut c = conf(10, 1_000);
    c.reconnect = RetryPolicy::fixed(100, Duration::from_millis(50));
    let (bus, _store, ingestor) = setup(c);
    bus.failing_polls.store(true, Ordering::SeqCst);
    ingestor.add_topic(CUSTOMERS, "orders");
    ingestor.start();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let connects = bus.connects.load(Ordering::SeqCst);
    assert!((1..=8).contains(&connects), "reconnected {connects} times in 300ms");
    assert_eq!(ingestor.state(), IngestorState::Running);

    bus.failing_polls.store(false, Ordering::SeqCst);
    bus.push(insert(CUSTOMERS, 0));
    eventually("received after recovery", || ingestor.stats().received == 1).await;
    assert!(ingestor.stats().reconnects >= 1);
    ingestor.stop().await;
    assert_eq!(ingestor.state(), IngestorState::Stopped);
}

#[tokio::test]
async fn commit_failure_reopens_the_stream_and_redelivers() {
    let (bus, store, ingestor) = setup(conf(2, 60_000));
    bus.failing_commits.store(1, Ordering::SeqCst);
    ingestor.add_topic(CUSTOMERS, "orders");
    ingestor.start();

    bus.push(insert(CUSTOMERS, 0));
    bus.push(insert(CUSTOMERS, 1));
    eventually("commit after redelivery", || !bus.commits().is_empty()).await;

    assert_eq!(
        bus.journal(),
        vec!["persist 2", "commit failed", "persist 2", "commit"]
    );
    let offsets: Vec<i64> = store.events().iter().map(|e| e.offset).collect();
    assert_eq!(offsets, vec![0, 1, 0, 1], "first write kept, redelivery written again");
    assert_eq!(bus.commits(), vec![position(CUSTOMERS, 0, 1)]);
    assert_eq!(bus.connects.load(Ordering::SeqCst), 2);
    assert_eq!(ingestor.state(), IngestorState::Running);
    ingestor.stop().await;
}

#[tokio::test]
async fn stop_flushes_the_partial_batch() {
    let (bus, store, ingestor) = setup(conf(100, 60_000));
    ingestor.add_topic(CUSTOMERS, "orders");
    ingestor.start();

    bus.push(insert(CUSTOMERS, 0));
    bus.push(insert(CUSTOMERS, 1));
    eventually("received", || ingestor.stats().received == 2).await;
    assert!(store.events().is_empty());

    ingestor.stop().await;
    assert_eq!(store.events().len(), 2);
    assert_eq!(bus.commits(), vec![position(CUSTOMERS, 0, 1)]);
    assert_eq!(ingestor.state(), IngestorState::Stopped);
}

#[tokio::test]
async fn restart_after_stop_resumes_consuming() {
    let (bus, store, ingestor) = setup(conf(1, 60_000));
    ingestor.add_topic(CUSTOMERS, "orders");
    ingestor.start();
    ingestor.stop().await;

    assert_eq!(ingestor.start(), StartOutcome::Started);
    bus.push(insert(CUSTOMERS, 3));
    eventually("persisted after restart", || store.events().len() == 1).await;
    ingestor.stop().await;
    assert_eq!(bus.connects.load(Ordering::SeqCst), 2);
}
