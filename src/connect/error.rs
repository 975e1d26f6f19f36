use thiserror::Error;

use super::types::ConnectorStatus;

pub type ConnectResult<T> = Result<T, ConnectError>;

/// Terminal outcome of a management API call once retries are spent.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("connector '{name}' not found")]
    NotFound { name: String },

    #[error("connector '{name}' already exists")]
    Conflict { name: String },

    #[error("{method} {path} failed after {attempts} attempt(s): {}", describe(*status, body))]
    RequestFailed {
        method: String,
        path: String,
        status: Option<u16>,
        attempts: u32,
        body: String,
    },

    #[error("decode {path} response: {reason}")]
    Decode { path: String, reason: String },
}

fn describe(status: Option<u16>, body: &str) -> String {
    match status {
        Some(code) if body.is_empty() => format!("HTTP {code}"),
        Some(code) => format!("HTTP {code} - {body}"),
        None => body.to_string(),
    }
}

impl ConnectError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ConnectError::NotFound { .. } => Some(404),
            ConnectError::Conflict { .. } => Some(409),
            ConnectError::RequestFailed { status, .. } => *status,
            ConnectError::Decode { .. } => None,
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Every fallback (reuse, restart, recreate) was tried.
    #[error("connector '{name}': {reason}{}", trace_suffix(last_status.as_ref()))]
    Exhausted {
        name: String,
        reason: String,
        last_status: Option<ConnectorStatus>,
    },
}

fn trace_suffix(status: Option<&ConnectorStatus>) -> String {
    let Some(status) = status else {
        return String::new();
    };
    match status.first_trace() {
        Some(trace) => {
            let first_line = trace.lines().next().unwrap_or_default();
            format!(" (last state {}, trace: {})", status.state, first_line)
        }
        None => format!(" (last state {})", status.state),
    }
}

/// Cut a response body down for error messages without splitting a char.
pub(crate) fn truncate_body(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.trim().to_string();
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", body[..end].trim_end())
}
