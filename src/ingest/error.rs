use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("persist failed: {0}")]
    Persist(String),
}

/// Why a message produced no event.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope is not a json object")]
    NotObject,
    #[error("envelope has no op")]
    MissingOp,
    #[error("unknown op {0:?}")]
    UnknownOp(String),
    #[error("{0} image missing")]
    MissingImage(&'static str),
}
