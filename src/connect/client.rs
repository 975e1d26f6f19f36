//! Retrying client for the connector-management REST API.
//!
//! Every call goes through [`ConnectorClient::execute`], which owns the retry loop:
//! transport errors and 429/5xx replies are retried with the configured
//! [`RetryPolicy`], every other reply is handed back for the caller to classify.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::config::ConnectConf;
use super::error::{ConnectError, ConnectResult, truncate_body};
use super::types::{
    ConnectorConfig, ConnectorInfo, ConnectorState, ConnectorStatus, PluginInfo, StatusBody,
    StatusLookup, ValidationReport,
};
use crate::retry::RetryPolicy;

const BODY_LIMIT: usize = 512;

/// Management API surface the lifecycle workflows are written against.
#[async_trait]
pub trait ConnectorApi: Send + Sync {
    async fn list(&self) -> BTreeSet<String>;
    async fn status(&self, name: &str) -> ConnectResult<StatusLookup>;
    async fn info(&self, name: &str) -> ConnectResult<ConnectorInfo>;
    async fn config(&self, name: &str) -> ConnectResult<ConnectorConfig>;
    async fn create(&self, name: &str, config: &ConnectorConfig) -> ConnectResult<ConnectorInfo>;
    async fn update(&self, name: &str, config: &ConnectorConfig) -> ConnectResult<ConnectorInfo>;
    async fn delete(&self, name: &str) -> ConnectResult<()>;
    async fn pause(&self, name: &str) -> ConnectResult<()>;
    async fn resume(&self, name: &str) -> ConnectResult<()>;
    async fn restart(&self, name: &str) -> ConnectResult<()>;
    async fn restart_task(&self, name: &str, task: u32) -> ConnectResult<()>;

    /// Poll until `target` is reported.
    ///
    /// Returns `false` as soon as the connector is absent, reports FAILED (unless
    /// FAILED is the target), or `max_wait` elapses.
    async fn wait_for_state(
        &self,
        name: &str,
        target: ConnectorState,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.status(name).await {
                Ok(StatusLookup::Present(status)) if status.state == target => return true,
                Ok(StatusLookup::Present(status)) if status.state == ConnectorState::Failed => {
                    warn!(
                        "[connect] {} reported FAILED while waiting for {}",
                        name, target
                    );
                    return false;
                }
                Ok(StatusLookup::Present(status)) => {
                    debug!("[connect] {} is {}, waiting for {}", name, status.state, target);
                }
                Ok(StatusLookup::Absent) => {
                    warn!("[connect] {} disappeared while waiting for {}", name, target);
                    return false;
                }
                Err(err) => warn!("[connect] status poll for {} failed: {}", name, err),
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

/// Raw reply once retries are settled.
struct Reply {
    status: StatusCode,
    body: String,
    attempts: u32,
}

#[derive(Clone)]
pub struct ConnectorClient {
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl ConnectorClient {
    pub fn new(conf: &ConnectConf) -> ConnectResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(conf.timeout())
            .build()
            .map_err(|e| ConnectError::RequestFailed {
                method: "INIT".into(),
                path: conf.url.clone(),
                status: None,
                attempts: 0,
                body: format!("build http client failed: {e}"),
            })?;
        Ok(Self::with_client(&conf.url, client, conf.retry.clone()))
    }

    pub fn with_client(base_url: &str, client: reqwest::Client, retry: RetryPolicy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            retry,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Installed plugins, `GET /connector-plugins`.
    pub async fn plugins(&self) -> ConnectResult<Vec<PluginInfo>> {
        let path = "/connector-plugins".to_string();
        let reply = self.execute(Method::GET, &path, None).await?;
        self.expect_json(&Method::GET, &path, None, reply)
    }

    /// Ask the worker to validate a config against a plugin without creating anything.
    pub async fn validate(
        &self,
        class: &str,
        config: &ConnectorConfig,
    ) -> ConnectResult<ValidationReport> {
        let plugin = class.rsplit('.').next().unwrap_or(class);
        let path = format!("/connector-plugins/{}/config/validate", encode(plugin));
        let mut body = config.clone();
        body.entry("connector.class".into())
            .or_insert_with(|| class.to_string());
        let reply = self
            .execute(Method::PUT, &path, Some(&json!(body)))
            .await?;
        self.expect_json(&Method::PUT, &path, None, reply)
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ConnectResult<Reply> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut req = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                req = req.json(body);
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if is_retryable(status) && self.retry.should_retry(attempt) {
                        let delay = self.retry.delay_for(attempt);
                        warn!(
                            "[connect] {} {} -> {}, retry {}/{} in {:?}",
                            method, path, status, attempt, self.retry.max_attempts, delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok(Reply {
                        status,
                        body: text,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    let transient = err.is_timeout() || err.is_connect() || err.is_request();
                    if transient && self.retry.should_retry(attempt) {
                        let delay = self.retry.delay_for(attempt);
                        warn!(
                            "[connect] {} {} transport error: {}, retry {}/{} in {:?}",
                            method, path, err, attempt, self.retry.max_attempts, delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(ConnectError::RequestFailed {
                        method: method.to_string(),
                        path: path.to_string(),
                        status: None,
                        attempts: attempt,
                        body: truncate_body(&err.to_string(), BODY_LIMIT),
                    });
                }
            }
        }
    }

    /// Map a reply onto the typed taxonomy: 2xx decoded, 404/409 classified.
    fn expect_json<T: DeserializeOwned>(
        &self,
        method: &Method,
        path: &str,
        name: Option<&str>,
        reply: Reply,
    ) -> ConnectResult<T> {
        self.expect_success(method, path, name, &reply)?;
        serde_json::from_str(&reply.body).map_err(|e| ConnectError::Decode {
            path: path.to_string(),
            reason: format!("{e}; body: {}", truncate_body(&reply.body, BODY_LIMIT)),
        })
    }

    fn expect_success(
        &self,
        method: &Method,
        path: &str,
        name: Option<&str>,
        reply: &Reply,
    ) -> ConnectResult<()> {
        if reply.status.is_success() {
            return Ok(());
        }
        match (reply.status, name) {
            (StatusCode::NOT_FOUND, Some(name)) => Err(ConnectError::NotFound {
                name: name.to_string(),
            }),
            (StatusCode::CONFLICT, Some(name)) => Err(ConnectError::Conflict {
                name: name.to_string(),
            }),
            _ => Err(ConnectError::RequestFailed {
                method: method.to_string(),
                path: path.to_string(),
                status: Some(reply.status.as_u16()),
                attempts: reply.attempts,
                body: truncate_body(&reply.body, BODY_LIMIT),
            }),
        }
    }

    async fn call_unit(&self, method: Method, path: String, name: &str) -> ConnectResult<()> {
        let reply = self.execute(method.clone(), &path, None).await?;
        self.expect_success(&method, &path, Some(name), &reply)
    }
}

#[async_trait]
impl ConnectorApi for ConnectorClient {
    async fn list(&self) -> BTreeSet<String> {
        let path = "/connectors";
        let reply = match self.execute(Method::GET, path, None).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!("[connect] list connectors failed: {}", err);
                return BTreeSet::new();
            }
        };
        if !reply.status.is_success() {
            warn!(
                "[connect] list connectors returned {}: {}",
                reply.status,
                truncate_body(&reply.body, BODY_LIMIT)
            );
            return BTreeSet::new();
        }
        match serde_json::from_str::<Value>(&reply.body) {
            Ok(value) => parse_connector_names(&value),
            Err(err) => {
                warn!("[connect] list connectors body is not json: {}", err);
                BTreeSet::new()
            }
        }
    }

    async fn status(&self, name: &str) -> ConnectResult<StatusLookup> {
        let path = format!("/connectors/{}/status", encode(name));
        let reply = self.execute(Method::GET, &path, None).await?;
        if reply.status == StatusCode::NOT_FOUND {
            return Ok(StatusLookup::Absent);
        }
        let body: StatusBody = self.expect_json(&Method::GET, &path, Some(name), reply)?;
        Ok(StatusLookup::Present(ConnectorStatus::from(body)))
    }

    async fn info(&self, name: &str) -> ConnectResult<ConnectorInfo> {
        let path = format!("/connectors/{}", encode(name));
        let reply = self.execute(Method::GET, &path, None).await?;
        self.expect_json(&Method::GET, &path, Some(name), reply)
    }

    async fn config(&self, name: &str) -> ConnectResult<ConnectorConfig> {
        let path = format!("/connectors/{}/config", encode(name));
        let reply = self.execute(Method::GET, &path, None).await?;
        self.expect_json(&Method::GET, &path, Some(name), reply)
    }

    async fn create(&self, name: &str, config: &ConnectorConfig) -> ConnectResult<ConnectorInfo> {
        let path = "/connectors".to_string();
        let body = json!({ "name": name, "config": config });
        let reply = self.execute(Method::POST, &path, Some(&body)).await?;
        let info = self.expect_json(&Method::POST, &path, Some(name), reply)?;
        info!("[connect] connector {} created", name);
        Ok(info)
    }

    async fn update(&self, name: &str, config: &ConnectorConfig) -> ConnectResult<ConnectorInfo> {
        let path = format!("/connectors/{}/config", encode(name));
        let reply = self
            .execute(Method::PUT, &path, Some(&json!(config)))
            .await?;
        self.expect_json(&Method::PUT, &path, Some(name), reply)
    }

    async fn delete(&self, name: &str) -> ConnectResult<()> {
        let path = format!("/connectors/{}", encode(name));
        let reply = self.execute(Method::DELETE, &path, None).await?;
        if reply.status.is_success() || reply.status == StatusCode::NOT_FOUND {
            info!("[connect] connector {} deleted ({})", name, reply.status);
            return Ok(());
        }
        if reply.status.is_server_error() {
            warn!(
                "[connect] delete {} returned {}, treating as done: {}",
                name,
                reply.status,
                truncate_body(&reply.body, BODY_LIMIT)
            );
            return Ok(());
        }
        self.expect_success(&Method::DELETE, &path, Some(name), &reply)
    }

    async fn pause(&self, name: &str) -> ConnectResult<()> {
        let path = format!("/connectors/{}/pause", encode(name));
        self.call_unit(Method::PUT, path, name).await
    }

    async fn resume(&self, name: &str) -> ConnectResult<()> {
        let path = format!("/connectors/{}/resume", encode(name));
        self.call_unit(Method::PUT, path, name).await
    }

    async fn restart(&self, name: &str) -> ConnectResult<()> {
        let path = format!("/connectors/{}/restart", encode(name));
        self.call_unit(Method::POST, path, name).await
    }

    async fn restart_task(&self, name: &str, task: u32) -> ConnectResult<()> {
        let path = format!("/connectors/{}/tasks/{}/restart", encode(name), task);
        self.call_unit(Method::POST, path, name).await
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Accepts `["a","b"]`, `{"connectors": [...]}` and the `?expand=` object form.
fn parse_connector_names(value: &Value) -> BTreeSet<String> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("connectors") {
            Some(Value::Array(items)) => items,
            _ => return map.keys().cloned().collect(),
        },
        _ => return BTreeSet::new(),
    };
    items
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect()
}
