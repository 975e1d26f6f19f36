//! Connector lifecycle workflows on top of [`ConnectorApi`].
//!
//! Conflict policy for `ensure_created`: reuse a healthy connector, restart a
//! broken one, and only delete + recreate when the restart does not bring it back
//! within `restart_wait`. Workflows for the same connector name never overlap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Instant;

use log::{debug, info, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::client::{ConnectorApi, ConnectorClient};
use super::config::{ConnectConf, LifecycleConf};
use super::error::{ConnectError, ConnectResult, LifecycleError, LifecycleResult};
use super::types::{ConnectorConfig, ConnectorInfo, ConnectorState, ConnectorStatus, StatusLookup};

/// One async mutex per connector name, dropped once nobody holds or awaits it.
#[derive(Default)]
struct NameLocks {
    inner: StdMutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl NameLocks {
    async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, lock| lock.strong_count() > 0);
            match map.get(name).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    map.insert(name.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

pub struct ConnectorLifecycleManager {
    api: Arc<dyn ConnectorApi>,
    conf: LifecycleConf,
    locks: NameLocks,
}

impl ConnectorLifecycleManager {
    pub fn new(api: Arc<dyn ConnectorApi>, conf: LifecycleConf) -> Self {
        Self {
            api,
            conf,
            locks: NameLocks::default(),
        }
    }

    pub fn from_conf(connect: &ConnectConf, conf: LifecycleConf) -> ConnectResult<Self> {
        let client = ConnectorClient::new(connect)?;
        Ok(Self::new(Arc::new(client), conf))
    }

    pub fn api(&self) -> &Arc<dyn ConnectorApi> {
        &self.api
    }

    pub async fn status(&self, name: &str) -> ConnectResult<StatusLookup> {
        self.api.status(name).await
    }

    /// Create `name`, or converge an existing connector of that name to RUNNING.
    pub async fn ensure_created(
        &self,
        name: &str,
        config: &ConnectorConfig,
    ) -> LifecycleResult<ConnectorInfo> {
        let _guard = self.locks.acquire(name).await;
        self.ensure_created_locked(name, config).await
    }

    /// `ensure_created`, then push `config` if the live connector drifted from it.
    pub async fn apply_config(
        &self,
        name: &str,
        config: &ConnectorConfig,
    ) -> LifecycleResult<ConnectorInfo> {
        let _guard = self.locks.acquire(name).await;
        let info = self.ensure_created_locked(name, config).await?;
        if same_config(&info.config, config) {
            return Ok(info);
        }
        info!("[lifecycle] {} config drifted, updating", name);
        Ok(self.api.update(name, config).await?)
    }

    /// Delete then create, regardless of current state.
    pub async fn recreate(
        &self,
        name: &str,
        config: &ConnectorConfig,
    ) -> LifecycleResult<ConnectorInfo> {
        let _guard = self.locks.acquire(name).await;
        self.api.delete(name).await?;
        self.wait_absent(name).await;
        self.create_once_more(name, config).await
    }

    /// Restart the connector and each of its failed tasks, then wait for RUNNING.
    ///
    /// Returns the status observed at the end; it may still be FAILED.
    pub async fn restart(&self, name: &str) -> LifecycleResult<ConnectorStatus> {
        let _guard = self.locks.acquire(name).await;
        self.api.restart(name).await?;
        if let StatusLookup::Present(status) = self.api.status(name).await? {
            for task in status.failed_tasks() {
                info!("[lifecycle] restarting failed task {}/{}", name, task.id);
                if let Err(err) = self.api.restart_task(name, task.id).await {
                    warn!("[lifecycle] restart task {}/{} failed: {}", name, task.id, err);
                }
            }
        }
        self.wait_recovered(name).await;
        match self.api.status(name).await? {
            StatusLookup::Present(status) => Ok(status),
            StatusLookup::Absent => Err(ConnectError::NotFound {
                name: name.to_string(),
            }
            .into()),
        }
    }

    pub async fn pause(&self, name: &str) -> LifecycleResult<()> {
        let _guard = self.locks.acquire(name).await;
        self.api.pause(name).await?;
        self.expect_state(name, ConnectorState::Paused).await
    }

    pub async fn resume(&self, name: &str) -> LifecycleResult<()> {
        let _guard = self.locks.acquire(name).await;
        self.api.resume(name).await?;
        self.expect_state(name, ConnectorState::Running).await
    }

    /// Idempotent delete; returns once the connector is gone or the wait expires.
    pub async fn remove(&self, name: &str) -> LifecycleResult<()> {
        let _guard = self.locks.acquire(name).await;
        self.api.delete(name).await?;
        self.wait_absent(name).await;
        Ok(())
    }

    async fn ensure_created_locked(
        &self,
        name: &str,
        config: &ConnectorConfig,
    ) -> LifecycleResult<ConnectorInfo> {
        match self.api.create(name, config).await {
            Ok(info) => return Ok(info),
            Err(ConnectError::Conflict { .. }) => {
                info!("[lifecycle] {} already exists, inspecting status", name)
            }
            Err(err) => return Err(err.into()),
        }

        match self.api.status(name).await {
            Ok(StatusLookup::Present(status)) => self.resolve_existing(name, config, status).await,
            Ok(StatusLookup::Absent) => {
                info!("[lifecycle] {} vanished after conflict, creating again", name);
                self.create_once_more(name, config).await
            }
            Err(err) => {
                warn!(
                    "[lifecycle] status of {} unavailable ({}), deleting before recreate",
                    name, err
                );
                if let Err(err) = self.api.delete(name).await {
                    debug!("[lifecycle] defensive delete of {} failed: {}", name, err);
                }
                self.create_once_more(name, config).await
            }
        }
    }

    async fn resolve_existing(
        &self,
        name: &str,
        config: &ConnectorConfig,
        mut status: ConnectorStatus,
    ) -> LifecycleResult<ConnectorInfo> {
        if status.state.is_transitional() {
            info!(
                "[lifecycle] {} is {}, giving it {:?} to settle",
                name,
                status.state,
                self.conf.settle_wait()
            );
            if self.wait_running(name, self.conf.settle_wait()).await {
                return self.reuse(name, config).await;
            }
            match self.api.status(name).await {
                Ok(StatusLookup::Present(latest)) => status = latest,
                Ok(StatusLookup::Absent) => return self.create_once_more(name, config).await,
                Err(err) => warn!("[lifecycle] status of {} unavailable: {}", name, err),
            }
        }

        if status.state == ConnectorState::Running {
            info!("[lifecycle] {} is RUNNING, reusing", name);
            return self.reuse(name, config).await;
        }

        info!("[lifecycle] {} is {}, restarting", name, status.state);
        match self.api.restart(name).await {
            Ok(()) => {}
            Err(ConnectError::NotFound { .. }) => return self.create_once_more(name, config).await,
            Err(err) => warn!("[lifecycle] restart of {} failed: {}", name, err),
        }
        if self.wait_recovered(name).await {
            info!("[lifecycle] {} recovered after restart", name);
            return self.reuse(name, config).await;
        }

        warn!(
            "[lifecycle] {} did not reach RUNNING within {:?}, recreating",
            name,
            self.conf.restart_wait()
        );
        self.api.delete(name).await?;
        self.wait_absent(name).await;
        self.create_once_more(name, config).await
    }

    async fn create_once_more(
        &self,
        name: &str,
        config: &ConnectorConfig,
    ) -> LifecycleResult<ConnectorInfo> {
        match self.api.create(name, config).await {
            Ok(info) => Ok(info),
            Err(ConnectError::Conflict { .. }) => Err(LifecycleError::Exhausted {
                name: name.to_string(),
                reason: "still conflicting after reuse, restart and recreate".into(),
                last_status: self.last_status(name).await,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn reuse(&self, name: &str, config: &ConnectorConfig) -> LifecycleResult<ConnectorInfo> {
        match self.api.info(name).await {
            Ok(info) => Ok(info),
            Err(err) => {
                warn!("[lifecycle] fetch info of {} failed: {}", name, err);
                Ok(ConnectorInfo {
                    name: name.to_string(),
                    config: config.clone(),
                    tasks: Vec::new(),
                    kind: None,
                })
            }
        }
    }

    async fn expect_state(&self, name: &str, target: ConnectorState) -> LifecycleResult<()> {
        let reached = self
            .api
            .wait_for_state(
                name,
                target,
                self.conf.restart_wait(),
                self.conf.poll_interval(),
            )
            .await;
        if reached {
            return Ok(());
        }
        Err(LifecycleError::Exhausted {
            name: name.to_string(),
            reason: format!("did not reach {target} within {:?}", self.conf.restart_wait()),
            last_status: self.last_status(name).await,
        })
    }

    async fn wait_running(&self, name: &str, max_wait: std::time::Duration) -> bool {
        self.api
            .wait_for_state(
                name,
                ConnectorState::Running,
                max_wait,
                self.conf.poll_interval(),
            )
            .await
    }

    /// Restarts are asynchronous: a FAILED reading right after the restart call
    /// does not end the wait, only RUNNING, absence or `restart_wait` do.
    async fn wait_recovered(&self, name: &str) -> bool {
        let deadline = Instant::now() + self.conf.restart_wait();
        loop {
            match self.api.status(name).await {
                Ok(StatusLookup::Present(status)) if status.state == ConnectorState::Running => {
                    return true;
                }
                Ok(StatusLookup::Present(status)) => {
                    debug!("[lifecycle] {} is {} after restart", name, status.state)
                }
                Ok(StatusLookup::Absent) => return false,
                Err(err) => debug!("[lifecycle] status of {} after restart: {}", name, err),
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.conf.poll_interval().min(deadline - now)).await;
        }
    }

    async fn wait_absent(&self, name: &str) {
        let deadline = Instant::now() + self.conf.delete_wait();
        loop {
            match self.api.status(name).await {
                Ok(StatusLookup::Absent) => return,
                Ok(StatusLookup::Present(status)) => {
                    debug!("[lifecycle] {} still {} after delete", name, status.state)
                }
                Err(err) => debug!("[lifecycle] status of {} during delete: {}", name, err),
            }
            if Instant::now() >= deadline {
                warn!("[lifecycle] {} still present {:?} after delete", name, self.conf.delete_wait());
                return;
            }
            tokio::time::sleep(self.conf.poll_interval()).await;
        }
    }

    async fn last_status(&self, name: &str) -> Option<ConnectorStatus> {
        self.api.status(name).await.ok().and_then(StatusLookup::into_status)
    }
}

/// The worker echoes `name` back into the config; ignore it when comparing.
fn same_config(live: &ConnectorConfig, wanted: &ConnectorConfig) -> bool {
    let strip = |cfg: &ConnectorConfig| {
        cfg.iter()
            .filter(|(k, _)| k.as_str() != "name")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<ConnectorConfig>()
    };
    strip(live) == strip(wanted)
}
