use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cdc_connectors::connect::{
    ConnectError, ConnectResult, ConnectorApi, ConnectorConfig, ConnectorInfo, ConnectorKind,
    ConnectorLifecycleManager, ConnectorState, ConnectorStatus, LifecycleConf, LifecycleError,
    StatusLookup, TaskStatus,
};

#[derive(Clone)]
struct Entry {
    state: ConnectorState,
    config: ConnectorConfig,
    tasks: Vec<TaskStatus>,
}

#[derive(Default)]
struct Inner {
    connectors: HashMap<String, Entry>,
    calls: Vec<(String, String)>,
    /// Status polls left before a connector turns RUNNING on its own.
    settle_after: HashMap<String, u32>,
    active: HashMap<String, usize>,
    max_same_name: usize,
    active_total: usize,
    max_total: usize,
}

/// Scripted management API that records every call.
#[derive(Default)]
struct FakeConnect {
    inner: Mutex<Inner>,
    restart_recovers: bool,
    delete_is_ignored: bool,
    create_delay: Duration,
}

impl FakeConnect {
    fn with_connector(self, name: &str, state: ConnectorState) -> Self {
        self.inner.lock().unwrap().connectors.insert(
            name.to_string(),
            Entry {
                state,
                config: config("old"),
                tasks: vec![TaskStatus {
                    id: 0,
                    state,
                    worker_id: Some("worker-1:8083".into()),
                    trace: (state == ConnectorState::Failed).then(|| "boom".to_string()),
                }],
            },
        );
        self
    }

    fn settling_after(self, name: &str, polls: u32) -> Self {
        self.inner
            .lock()
            .unwrap()
            .settle_after
            .insert(name.to_string(), polls);
        self
    }

    fn record(&self, op: &str, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push((op.to_string(), name.to_string()));
    }

    fn count(&self, op: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(o, _)| o == op)
            .count()
    }

    fn state_of(&self, name: &str) -> Option<ConnectorState> {
        self.inner
            .lock()
            .unwrap()
            .connectors
            .get(name)
            .map(|e| e.state)
    }

    fn info_of(name: &str, entry: &Entry) -> ConnectorInfo {
        ConnectorInfo {
            name: name.to_string(),
            config: entry.config.clone(),
            tasks: Vec::new(),
            kind: Some(ConnectorKind::Sink),
        }
    }

    fn set_all(entry: &mut Entry, state: ConnectorState) {
        entry.state = state;
        for task in &mut entry.tasks {
            task.state = state;
            task.trace = None;
        }
    }
}

fn config(marker: &str) -> ConnectorConfig {
    let mut cfg = ConnectorConfig::new();
    cfg.insert(
        "connector.class".into(),
        "io.debezium.connector.jdbc.JdbcSinkConnector".into(),
    );
    cfg.insert("marker".into(), marker.into());
    cfg
}

#[async_trait]
impl ConnectorApi for FakeConnect {
    async fn list(&self) -> BTreeSet<String> {
        self.inner.lock().unwrap().connectors.keys().cloned().collect()
    }

    async fn status(&self, name: &str) -> ConnectResult<StatusLookup> {
        self.record("status", name);
        let mut inner = self.inner.lock().unwrap();
        let settle = match inner.settle_after.get_mut(name) {
            Some(0) => true,
            Some(left) => {
                *left -= 1;
                false
            }
            None => false,
        };
        let Some(entry) = inner.connectors.get_mut(name) else {
            return Ok(StatusLookup::Absent);
        };
        if settle && entry.state != ConnectorState::Running {
            FakeConnect::set_all(entry, ConnectorState::Running);
        }
        Ok(StatusLookup::Present(ConnectorStatus {
            name: name.to_string(),
            state: entry.state,
            worker_id: Some("worker-1:8083".into()),
            trace: (entry.state == ConnectorState::Failed).then(|| "boom".to_string()),
            tasks: entry.tasks.clone(),
            kind: Some(ConnectorKind::Sink),
        }))
    }

    async fn info(&self, name: &str) -> ConnectResult<ConnectorInfo> {
        self.record("info", name);
        let inner = self.inner.lock().unwrap();
        match inner.connectors.get(name) {
            Some(entry) => Ok(FakeConnect::info_of(name, entry)),
            None => Err(ConnectError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn config(&self, name: &str) -> ConnectResult<ConnectorConfig> {
        Ok(self.info(name).await?.config)
    }

    async fn create(&self, name: &str, config: &ConnectorConfig) -> ConnectResult<ConnectorInfo> {
        self.record("create", name);
        {
            let mut inner = self.inner.lock().unwrap();
            let same = {
                let active = inner.active.entry(name.to_string()).or_default();
                *active += 1;
                *active
            };
            inner.max_same_name = inner.max_same_name.max(same);
            inner.active_total += 1;
            inner.max_total = inner.max_total.max(inner.active_total);
        }
        tokio::time::sleep(self.create_delay).await;
        let mut inner = self.inner.lock().unwrap();
        if let Some(active) = inner.active.get_mut(name) {
            *active -= 1;
        }
        inner.active_total -= 1;
        if inner.connectors.contains_key(name) {
            return Err(ConnectError::Conflict {
                name: name.to_string(),
            });
        }
        let entry = Entry {
            state: ConnectorState::Running,
            config: config.clone(),
            tasks: vec![TaskStatus {
                id: 0,
                state: ConnectorState::Running,
                worker_id: None,
                trace: None,
            }],
        };
        let info = FakeConnect::info_of(name, &entry);
        inner.connectors.insert(name.to_string(), entry);
        Ok(info)
    }

    async fn update(&self, name: &str, config: &ConnectorConfig) -> ConnectResult<ConnectorInfo> {
        self.record("update", name);
        let mut inner = self.inner.lock().unwrap();
        match inner.connectors.get_mut(name) {
            Some(entry) => {
                entry.config = config.clone();
                Ok(FakeConnect::info_of(name, entry))
            }
            None => Err(ConnectError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn delete(&self, name: &str) -> ConnectResult<()> {
        self.record("delete", name);
        if !self.delete_is_ignored {
            self.inner.lock().unwrap().connectors.remove(name);
        }
        Ok(())
    }

    async fn pause(&self, name: &str) -> ConnectResult<()> {
        self.record("pause", name);
        self.transition(name, ConnectorState::Paused)
    }

    async fn resume(&self, name: &str) -> ConnectResult<()> {
        self.record("resume", name);
        self.transition(name, ConnectorState::Running)
    }

    async fn restart(&self, name: &str) -> ConnectResult<()> {
        self.record("restart", name);
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.connectors.get_mut(name) else {
            return Err(ConnectError::NotFound {
                name: name.to_string(),
            });
        };
        if self.restart_recovers {
            entry.state = ConnectorState::Running;
        }
        Ok(())
    }

    async fn restart_task(&self, name: &str, task: u32) -> ConnectResult<()> {
        self.record("restart_task", name);
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.connectors.get_mut(name) {
            for t in entry.tasks.iter_mut().filter(|t| t.id == task) {
                t.state = ConnectorState::Running;
                t.trace = None;
            }
        }
        Ok(())
    }
}

impl FakeConnect {
    fn transition(&self, name: &str, state: ConnectorState) -> ConnectResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.connectors.get_mut(name) {
            Some(entry) => {
                FakeConnect::set_all(entry, state);
                Ok(())
            }
            None => Err(ConnectError::NotFound {
                name: name.to_string(),
            }),
        }
    }
}

fn lifecycle_conf(restart_wait_ms: u64) -> LifecycleConf {
    LifecycleConf {
        restart_wait_ms,
        settle_wait_ms: 500,
        delete_wait_ms: 500,
        poll_interval_ms: 10,
    }
}

fn manager(api: Arc<FakeConnect>, restart_wait_ms: u64) -> ConnectorLifecycleManager {
    let _ = env_logger::builder().is_test(true).try_init();
    ConnectorLifecycleManager::new(api, lifecycle_conf(restart_wait_ms))
}

#[tokio::test]
async fn absent_connector_is_created_once() {
    let api = Arc::new(FakeConnect::default());
    let mgr = manager(api.clone(), 1_000);
    let info = mgr.ensure_created("cdc-new", &config("v1")).await.expect("created");
    assert_eq!(info.name, "cdc-new");
    assert_eq!(info.config["marker"], "v1");
    assert_eq!(api.count("create"), 1);
    assert_eq!(api.count("status"), 0);
}

#[tokio::test]
async fn running_connector_is_reused_without_restart_or_delete() {
    let api = Arc::new(FakeConnect::default().with_connector("cdc-x", ConnectorState::Running));
    let mgr = manager(api.clone(), 1_000);

    for _ in 0..2 {
        let info = mgr.ensure_created("cdc-x", &config("new")).await.expect("reused");
        assert_eq!(info.name, "cdc-x");
        assert_eq!(info.config["marker"], "old", "existing connector is returned as is");
    }
    assert_eq!(api.count("restart"), 0);
    assert_eq!(api.count("delete"), 0);
    assert_eq!(api.count("create"), 2);
}

#[tokio::test]
async fn failed_connector_that_stays_failed_is_recreated_once() {
    let api = Arc::new(FakeConnect::default().with_connector("cdc-x", ConnectorState::Failed));
    let mgr = manager(api.clone(), 1_000);

    let started = Instant::now();
    let info = mgr.ensure_created("cdc-x", &config("new")).await.expect("recreated");
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1_000),
        "restart_wait must be spent before deleting, took {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(5));

    assert_eq!(api.count("restart"), 1);
    assert_eq!(api.count("delete"), 1);
    assert_eq!(api.count("create"), 2, "initial attempt plus exactly one more");
    assert_eq!(info.config["marker"], "new");
    assert_eq!(api.state_of("cdc-x"), Some(ConnectorState::Running));
}

#[tokio::test]
async fn failed_connector_recovering_after_restart_is_reused() {
    let api = Arc::new(FakeConnect {
        restart_recovers: true,
        ..FakeConnect::default()
    }
    .with_connector("cdc-x", ConnectorState::Failed));
    let mgr = manager(api.clone(), 1_000);

    let info = mgr.ensure_created("cdc-x", &config("new")).await.expect("reused");
    assert_eq!(info.config["marker"], "old");
    assert_eq!(api.count("restart"), 1);
    assert_eq!(api.count("delete"), 0);
    assert_eq!(api.count("create"), 1);
}

#[tokio::test]
async fn slow_restart_is_given_the_whole_wait() {
    // still FAILED for the first polls after the restart call
    let api = Arc::new(
        FakeConnect::default()
            .with_connector("cdc-slow", ConnectorState::Failed)
            .settling_after("cdc-slow", 5),
    );
    let mgr = manager(api.clone(), 2_000);

    let info = mgr.ensure_created("cdc-slow", &config("new")).await.expect("reused");
    assert_eq!(info.config["marker"], "old");
    assert_eq!(api.count("restart"), 1);
    assert_eq!(api.count("delete"), 0);
    assert_eq!(api.count("create"), 1);
}

#[tokio::test]
async fn paused_connector_goes_through_restart() {
    let api = Arc::new(FakeConnect {
        restart_recovers: true,
        ..FakeConnect::default()
    }
    .with_connector("cdc-p", ConnectorState::Paused));
    let mgr = manager(api.clone(), 1_000);
    mgr.ensure_created("cdc-p", &config("new")).await.expect("ok");
    assert_eq!(api.count("restart"), 1);
    assert_eq!(api.count("delete"), 0);
}

#[tokio::test]
async fn unassigned_connector_gets_a_grace_period() {
    let api = Arc::new(
        FakeConnect::default()
            .with_connector("cdc-u", ConnectorState::Unassigned)
            .settling_after("cdc-u", 3),
    );
    let mgr = manager(api.clone(), 1_000);
    mgr.ensure_created("cdc-u", &config("new")).await.expect("settled");
    assert_eq!(api.count("restart"), 0, "settled on its own");
    assert_eq!(api.count("delete"), 0);
}

#[tokio::test]
async fn unassigned_connector_that_never_settles_is_restarted() {
    let api = Arc::new(FakeConnect {
        restart_recovers: true,
        ..FakeConnect::default()
    }
    .with_connector("cdc-u", ConnectorState::Unassigned));
    let mgr = manager(api.clone(), 1_000);
    mgr.ensure_created("cdc-u", &config("new")).await.expect("restarted");
    assert_eq!(api.count("restart"), 1);
    assert_eq!(api.count("delete"), 0);
}

#[tokio::test]
async fn undeletable_connector_exhausts_strategies() {
    let api = Arc::new(FakeConnect {
        delete_is_ignored: true,
        ..FakeConnect::default()
    }
    .with_connector("cdc-z", ConnectorState::Failed));
    let mgr = manager(api.clone(), 200);

    let err = mgr
        .ensure_created("cdc-z", &config("new"))
        .await
        .expect_err("exhausted");
    match err {
        LifecycleError::Exhausted {
            name, last_status, ..
        } => {
            assert_eq!(name, "cdc-z");
            let status = last_status.expect("status attached");
            assert_eq!(status.state, ConnectorState::Failed);
            assert_eq!(status.first_trace(), Some("boom"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(api.count("create"), 2);
}

#[tokio::test]
async fn same_name_operations_are_serialized() {
    let api = Arc::new(FakeConnect {
        create_delay: Duration::from_millis(100),
        ..FakeConnect::default()
    });
    let mgr = Arc::new(manager(api.clone(), 1_000));

    let a = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.ensure_created("cdc-s", &config("a")).await }
    });
    let b = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.ensure_created("cdc-s", &config("b")).await }
    });
    let (a, b) = (a.await.expect("join"), b.await.expect("join"));
    assert!(a.is_ok() && b.is_ok());

    let inner = api.inner.lock().unwrap();
    assert_eq!(inner.max_same_name, 1);
    assert_eq!(inner.connectors.len(), 1);
}

#[tokio::test]
async fn different_names_run_in_parallel() {
    let api = Arc::new(FakeConnect {
        create_delay: Duration::from_millis(200),
        ..FakeConnect::default()
    });
    let mgr = Arc::new(manager(api.clone(), 1_000));

    let started = Instant::now();
    let handles: Vec<_> = ["cdc-1", "cdc-2"]
        .into_iter()
        .map(|name| {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.ensure_created(name, &config(name)).await })
        })
        .collect();
    for h in handles {
        h.await.expect("join").expect("created");
    }
    assert!(started.elapsed() < Duration::from_millis(390));
    assert_eq!(api.inner.lock().unwrap().max_total, 2);
}

#[tokio::test]
async fn apply_config_repairs_drift() {
    let api = Arc::new(FakeConnect::default().with_connector("cdc-d", ConnectorState::Running));
    let mgr = manager(api.clone(), 1_000);

    let info = mgr.apply_config("cdc-d", &config("new")).await.expect("updated");
    assert_eq!(info.config["marker"], "new");
    assert_eq!(api.count("update"), 1);

    mgr.apply_config("cdc-d", &config("new")).await.expect("in sync");
    assert_eq!(api.count("update"), 1, "no update when configs match");
}

#[tokio::test]
async fn pause_resume_remove_and_recreate() {
    let api = Arc::new(FakeConnect::default().with_connector("cdc-l", ConnectorState::Running));
    let mgr = manager(api.clone(), 1_000);

    mgr.pause("cdc-l").await.expect("paused");
    assert_eq!(api.state_of("cdc-l"), Some(ConnectorState::Paused));
    mgr.resume("cdc-l").await.expect("resumed");
    assert_eq!(api.state_of("cdc-l"), Some(ConnectorState::Running));

    let info = mgr.recreate("cdc-l", &config("fresh")).await.expect("recreated");
    assert_eq!(info.config["marker"], "fresh");
    assert_eq!(api.count("delete"), 1);

    mgr.remove("cdc-l").await.expect("removed");
    mgr.remove("cdc-l").await.expect("idempotent");
    assert_eq!(api.state_of("cdc-l"), None);
    assert_eq!(
        mgr.status("cdc-l").await.expect("lookup"),
        StatusLookup::Absent
    );
}

#[tokio::test]
async fn restart_also_restarts_failed_tasks() {
    let api = Arc::new(FakeConnect {
        restart_recovers: true,
        ..FakeConnect::default()
    }
    .with_connector("cdc-t", ConnectorState::Failed));
    let mgr = manager(api.clone(), 1_000);

    let status = mgr.restart("cdc-t").await.expect("restarted");
    assert_eq!(status.state, ConnectorState::Running);
    assert!(status.is_healthy());
    assert_eq!(api.count("restart_task"), 1);
}

#[tokio::test]
async fn pause_of_missing_connector_is_an_error() {
    let api = Arc::new(FakeConnect::default());
    let mgr = manager(api, 100);
    let err = mgr.pause("ghost").await.expect_err("missing");
    assert!(matches!(
        err,
        LifecycleError::Connect(ConnectError::NotFound { .. })
    ));
}
