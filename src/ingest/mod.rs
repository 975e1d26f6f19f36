//! Change-event ingestion: consume topics, decode envelopes, persist in batches.

mod batch;
pub mod config;
pub mod envelope;
mod error;
mod event;
mod ingestor;
#[cfg(feature = "kafka")]
pub mod kafka;
mod membership;
mod transport;

pub use config::IngestConf;
pub use error::{DecodeError, IngestError, IngestResult};
pub use event::{ChangeEvent, ChangeKind};
pub use ingestor::{EventIngestor, IngestStats, IngestorState, StartOutcome};
pub use transport::{ChangeStream, CommitPosition, EventStore, TransportConnector, TransportMessage};
