use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl ChangeKind {
    /// Debezium `op` code; snapshot reads (`r`) count as inserts.
    pub fn from_op(op: &str) -> Option<Self> {
        match op {
            "c" | "r" => Some(ChangeKind::Insert),
            "u" => Some(ChangeKind::Update),
            "d" => Some(ChangeKind::Delete),
            "t" => Some(ChangeKind::Truncate),
            _ => None,
        }
    }
}

/// One decoded row change, handed to the store and then discarded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub pipeline_id: String,
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    pub timestamp: DateTime<Utc>,
    /// After-image for insert/update, before-image for delete, `Null` for truncate.
    pub payload: Value,
    /// Before-image of an update, when the source emits one.
    pub before: Option<Value>,
    /// Source-side marker: LSN, `file:pos`, or commit LSN.
    pub position: Option<String>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}
