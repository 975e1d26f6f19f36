use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Flat string map accepted by the management API.
pub type ConnectorConfig = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectorState {
    Running,
    Paused,
    Failed,
    Unassigned,
    Stopped,
    Restarting,
    #[serde(other)]
    Unknown,
}

impl ConnectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::Running => "RUNNING",
            ConnectorState::Paused => "PAUSED",
            ConnectorState::Failed => "FAILED",
            ConnectorState::Unassigned => "UNASSIGNED",
            ConnectorState::Stopped => "STOPPED",
            ConnectorState::Restarting => "RESTARTING",
            ConnectorState::Unknown => "UNKNOWN",
        }
    }

    /// States that may still settle into RUNNING without intervention.
    pub fn is_transitional(&self) -> bool {
        matches!(self, ConnectorState::Unassigned | ConnectorState::Restarting)
    }
}

impl Display for ConnectorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: u32,
    pub state: ConnectorState,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,
}

/// Decoded `GET /connectors/{name}/status` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorStatus {
    pub name: String,
    pub state: ConnectorState,
    pub worker_id: Option<String>,
    pub trace: Option<String>,
    pub tasks: Vec<TaskStatus>,
    pub kind: Option<ConnectorKind>,
}

impl ConnectorStatus {
    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskStatus> {
        self.tasks
            .iter()
            .filter(|t| t.state == ConnectorState::Failed)
    }

    /// Connector running with every task running too.
    pub fn is_healthy(&self) -> bool {
        self.state == ConnectorState::Running
            && self.tasks.iter().all(|t| t.state == ConnectorState::Running)
    }

    /// First failure trace, connector level before task level.
    pub fn first_trace(&self) -> Option<&str> {
        self.trace
            .as_deref()
            .or_else(|| self.tasks.iter().find_map(|t| t.trace.as_deref()))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusBody {
    name: String,
    connector: ConnectorStateBody,
    #[serde(default)]
    tasks: Vec<TaskStatus>,
    #[serde(rename = "type", default)]
    kind: Option<ConnectorKind>,
}

#[derive(Debug, Deserialize)]
struct ConnectorStateBody {
    state: ConnectorState,
    #[serde(default)]
    worker_id: Option<String>,
    #[serde(default)]
    trace: Option<String>,
}

impl From<StatusBody> for ConnectorStatus {
    fn from(body: StatusBody) -> Self {
        Self {
            name: body.name,
            state: body.connector.state,
            worker_id: body.connector.worker_id,
            trace: body.connector.trace,
            tasks: body.tasks,
            kind: body.kind,
        }
    }
}

/// Result of a status lookup; a missing connector is an answer, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusLookup {
    Absent,
    Present(ConnectorStatus),
}

impl StatusLookup {
    pub fn state(&self) -> Option<ConnectorState> {
        match self {
            StatusLookup::Absent => None,
            StatusLookup::Present(s) => Some(s.state),
        }
    }

    pub fn into_status(self) -> Option<ConnectorStatus> {
        match self {
            StatusLookup::Absent => None,
            StatusLookup::Present(s) => Some(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    Source,
    Sink,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskId {
    pub connector: String,
    pub task: u32,
}

/// Body of `POST /connectors` and `GET /connectors/{name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorInfo {
    pub name: String,
    #[serde(default)]
    pub config: ConnectorConfig,
    #[serde(default)]
    pub tasks: Vec<TaskId>,
    #[serde(rename = "type", default)]
    pub kind: Option<ConnectorKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    #[serde(rename = "class")]
    pub class_name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<ConnectorKind>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Body of `PUT /connector-plugins/{class}/config/validate`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationReport {
    pub name: String,
    pub error_count: u32,
    #[serde(default)]
    configs: Vec<ValidatedEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ValidatedEntry {
    value: ValidatedValue,
}

#[derive(Debug, Clone, Deserialize)]
struct ValidatedValue {
    name: String,
    #[serde(default)]
    errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.error_count == 0
    }

    /// `(key, messages)` for every key the worker rejected.
    pub fn errors(&self) -> BTreeMap<&str, &[String]> {
        self.configs
            .iter()
            .filter(|c| !c.value.errors.is_empty())
            .map(|c| (c.value.name.as_str(), c.value.errors.as_slice()))
            .collect()
    }
}
