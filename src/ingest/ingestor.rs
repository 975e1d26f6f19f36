//! Long-running change-event consumer.
//!
//! 工作线程循环：连接（带退避）→ 按版本号重订阅 → 到期则落库并提交 → 拉取消息。
//! 提交永远发生在落库成功之后；落库失败时批次原样保留并暂停重试。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::batch::Batch;
use super::config::IngestConf;
use super::envelope;
use super::membership::Membership;
use super::transport::{ChangeStream, EventStore, TransportConnector, TransportMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// No transport available; nothing was spawned.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestorState {
    Idle,
    Running,
    Stopped,
    Disabled,
    /// Reconnect budget exhausted; the worker stopped itself.
    GaveUp(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub received: u64,
    pub persisted: u64,
    pub dropped: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    persisted: AtomicU64,
    dropped: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    reconnects: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> IngestStats {
        IngestStats {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    membership: Mutex<Membership>,
    state: Mutex<IngestorState>,
    stop: watch::Sender<bool>,
    counters: Counters,
}

impl Shared {
    fn membership(&self) -> MutexGuard<'_, Membership> {
        self.membership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: IngestorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> IngestorState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

pub struct EventIngestor {
    conf: IngestConf,
    transport: Option<Arc<dyn TransportConnector>>,
    store: Arc<dyn EventStore>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventIngestor {
    pub fn new(
        conf: IngestConf,
        transport: Option<Arc<dyn TransportConnector>>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            conf,
            transport,
            store,
            shared: Arc::new(Shared {
                membership: Mutex::new(Membership::default()),
                state: Mutex::new(IngestorState::Idle),
                stop,
                counters: Counters::default(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Kafka transport when compiled in, otherwise an ingestor that reports `Disabled`.
    pub fn with_default_transport(conf: IngestConf, store: Arc<dyn EventStore>) -> Self {
        #[cfg(feature = "kafka")]
        let transport: Option<Arc<dyn TransportConnector>> =
            Some(Arc::new(super::kafka::KafkaTransport::new(conf.clone())));
        #[cfg(not(feature = "kafka"))]
        let transport: Option<Arc<dyn TransportConnector>> = None;
        Self::new(conf, transport, store)
    }

    /// Spawn the worker on the current tokio runtime.
    pub fn start(&self) -> StartOutcome {
        let Some(transport) = self.transport.clone() else {
            warn!("[ingest] no transport available, ingestion disabled");
            self.shared.set_state(IngestorState::Disabled);
            return StartOutcome::Disabled;
        };
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return StartOutcome::AlreadyRunning;
        }
        self.shared.stop.send_replace(false);
        self.shared.set_state(IngestorState::Running);
        let run = Worker {
            conf: self.conf.clone(),
            transport,
            store: self.store.clone(),
            shared: self.shared.clone(),
            stop: self.shared.stop.subscribe(),
        };
        *worker = Some(tokio::spawn(run.run()));
        info!("[ingest] started, group_id: {}", self.conf.group_id);
        StartOutcome::Started
    }

    /// Ask the worker to finish, wait up to `join_timeout`, then abort it.
    pub async fn stop(&self) {
        self.shared.stop.send_replace(true);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return;
        };
        match tokio::time::timeout(self.conf.join_timeout(), &mut handle).await {
            Ok(Ok(())) => debug!("[ingest] worker joined"),
            Ok(Err(err)) => warn!("[ingest] worker ended abnormally: {}", err),
            Err(_) => {
                warn!(
                    "[ingest] worker did not stop within {:?}, aborting",
                    self.conf.join_timeout()
                );
                handle.abort();
            }
        }
        if !matches!(self.shared.state(), IngestorState::GaveUp(_)) {
            self.shared.set_state(IngestorState::Stopped);
        }
        info!("[ingest] stopped");
    }

    /// Map `topic` to `pipeline_id`; picked up by the worker on its next cycle.
    pub fn add_topic(&self, topic: &str, pipeline_id: &str) -> bool {
        let changed = self.shared.membership().add(topic, pipeline_id);
        if changed {
            info!("[ingest] topic {} -> pipeline {}", topic, pipeline_id);
        }
        changed
    }

    pub fn remove_topic(&self, topic: &str) -> bool {
        let removed = self.shared.membership().remove(topic);
        if removed {
            info!("[ingest] topic {} removed", topic);
        }
        removed
    }

    pub fn topics(&self) -> Vec<String> {
        self.shared.membership().topics()
    }

    pub fn state(&self) -> IngestorState {
        self.shared.state()
    }

    pub fn stats(&self) -> IngestStats {
        self.shared.counters.snapshot()
    }
}

/// What a flush achieved.
enum Flushed {
    Committed,
    /// Persistence did not succeed before stop; the batch is kept.
    Pending,
    /// Persisted but not committed; the stream must be reopened.
    CommitFailed(String),
}

struct Worker {
    conf: IngestConf,
    transport: Arc<dyn TransportConnector>,
    store: Arc<dyn EventStore>,
    shared: Arc<Shared>,
    stop: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let mut batch = Batch::default();
        let mut stream: Option<Box<dyn ChangeStream>> = None;
        let mut subscribed = 0u64;
        // 连续的传输失败次数（连接/拉取/重订阅/提交），成功拉到消息或提交后清零
        let mut failures = 0u32;

        while !self.stopping() {
            if stream.is_none() {
                let (topics, version) = self.membership_snapshot();
                match self.transport.connect(&topics).await {
                    Ok(opened) => {
                        if failures > 0 {
                            Counters::bump(&self.shared.counters.reconnects, 1);
                        }
                        subscribed = version;
                        stream = Some(opened);
                    }
                    Err(err) => {
                        let failure = format!("connect failed: {}", err);
                        if !self.back_off(&mut failures, &failure).await {
                            break;
                        }
                    }
                }
                continue;
            }
            let Some(active) = stream.as_mut() else {
                continue;
            };

            let version = self.shared.membership().version();
            if version != subscribed {
                let topics = self.shared.membership().topics();
                match active.subscribe(&topics) {
                    Ok(()) => {
                        info!("[ingest] resubscribed to {:?}", topics);
                        subscribed = version;
                    }
                    Err(err) => {
                        stream = None;
                        let failure = format!("resubscribe failed: {}", err);
                        if !self.back_off(&mut failures, &failure).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            if batch.is_due(self.conf.batch_size, self.conf.batch_max_age()) {
                match self.flush(&mut **active, &mut batch, true).await {
                    Flushed::Committed => failures = 0,
                    Flushed::Pending => {}
                    Flushed::CommitFailed(failure) => {
                        stream = None;
                        if !self.back_off(&mut failures, &failure).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let polled = tokio::select! {
                polled = active.poll(self.conf.poll_timeout()) => polled,
                _ = self.stop.wait_for(|stop| *stop) => break,
            };
            match polled {
                Ok(Some(msg)) => {
                    failures = 0;
                    self.accept(&msg, &mut batch);
                }
                Ok(None) => {}
                Err(err) => {
                    stream = None;
                    let failure = format!("poll failed: {}", err);
                    if !self.back_off(&mut failures, &failure).await {
                        break;
                    }
                }
            }
        }

        if !batch.is_empty() {
            match stream.as_mut() {
                Some(active) => {
                    self.flush(&mut **active, &mut batch, false).await;
                }
                None => {
                    // 没有可用连接，只落库不提交，重启后会重复投递
                    if batch.len() > 0 && self.persist_once(&batch).await {
                        warn!(
                            "[ingest] persisted {} events without committing on shutdown",
                            batch.len()
                        );
                    }
                }
            }
        }
        debug!("[ingest] worker loop exit");
    }

    /// Count a transport failure and sleep the reconnect delay.
    /// Returns `false` once the reconnect budget is spent; the state is then `GaveUp`.
    async fn back_off(&mut self, failures: &mut u32, failure: &str) -> bool {
        *failures += 1;
        let policy = &self.conf.reconnect;
        if !policy.should_retry(*failures) {
            let reason = format!(
                "transport unavailable after {} attempts: {}",
                failures, failure
            );
            error!("[ingest] {}, giving up", reason);
            self.shared.set_state(IngestorState::GaveUp(reason));
            return false;
        }
        let delay = policy.delay_for(*failures);
        warn!(
            "[ingest] {}, attempt {}/{}, reconnecting in {:?}",
            failure, failures, policy.max_attempts, delay
        );
        self.pause(delay).await;
        true
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    fn membership_snapshot(&self) -> (Vec<String>, u64) {
        let membership = self.shared.membership();
        (membership.topics(), membership.version())
    }

    /// Sleep, waking early on stop.
    async fn pause(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stop.wait_for(|stop| *stop) => {}
        }
    }

    fn accept(&self, msg: &TransportMessage, batch: &mut Batch) {
        let counters = &self.shared.counters;
        Counters::bump(&counters.received, 1);
        let pipeline = self.shared.membership().resolve(&msg.topic);
        let event = match pipeline {
            None => {
                debug!("[ingest] no pipeline for topic {}, dropping", msg.topic);
                None
            }
            Some(pipeline) => match envelope::decode(msg, &pipeline) {
                Ok(event) => event,
                Err(err) => {
                    warn!(
                        "[ingest] drop {}[{}]@{}: {}",
                        msg.topic, msg.partition, msg.offset, err
                    );
                    None
                }
            },
        };
        if event.is_none() {
            Counters::bump(&counters.dropped, 1);
        }
        batch.track(msg, event);
    }

    /// Persist (retrying while `retry` and not stopping), then commit.
    async fn flush(
        &mut self,
        stream: &mut dyn ChangeStream,
        batch: &mut Batch,
        retry: bool,
    ) -> Flushed {
        loop {
            if self.persist_once(batch).await {
                break;
            }
            if !retry || self.stopping() {
                return Flushed::Pending;
            }
            self.pause(self.conf.failure_pause()).await;
            if self.stopping() {
                return Flushed::Pending;
            }
        }

        let positions = batch.positions();
        let outcome = match stream.commit(&positions).await {
            Ok(()) => {
                debug!(
                    "[ingest] flushed {} events over {} partitions",
                    batch.len(),
                    positions.len()
                );
                Flushed::Committed
            }
            // 已落库的事件保留，未提交的消息在重连后会重新投递
            Err(err) => Flushed::CommitFailed(format!(
                "{} after persisting {} events",
                err,
                batch.len()
            )),
        };
        batch.clear();
        outcome
    }

    async fn persist_once(&self, batch: &Batch) -> bool {
        let counters = &self.shared.counters;
        if !batch.events().is_empty() {
            if let Err(err) = self.store.persist(batch.events()).await {
                Counters::bump(&counters.flush_failures, 1);
                warn!(
                    "[ingest] persist {} events failed: {:#}, keeping batch",
                    batch.len(),
                    err
                );
                return false;
            }
            Counters::bump(&counters.persisted, batch.len() as u64);
        }
        Counters::bump(&counters.flushes, 1);
        true
    }
}
