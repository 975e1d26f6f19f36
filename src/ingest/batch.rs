use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::event::ChangeEvent;
use super::transport::{CommitPosition, TransportMessage};

/// Events awaiting persistence plus the transport positions they cover.
///
/// Dropped messages (tombstones, undecodable, unmapped) still advance the
/// positions so they get committed with the next flush.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    events: Vec<ChangeEvent>,
    positions: BTreeMap<(String, i32), i64>,
    oldest: Option<Instant>,
}

impl Batch {
    pub(crate) fn track(&mut self, msg: &TransportMessage, event: Option<ChangeEvent>) {
        if self.oldest.is_none() {
            self.oldest = Some(Instant::now());
        }
        let slot = self
            .positions
            .entry((msg.topic.clone(), msg.partition))
            .or_insert(msg.offset);
        *slot = (*slot).max(msg.offset);
        if let Some(event) = event {
            self.events.push(event);
        }
    }

    /// Nothing buffered and nothing to commit.
    pub(crate) fn is_empty(&self) -> bool {
        self.oldest.is_none()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub(crate) fn is_due(&self, max_events: usize, max_age: Duration) -> bool {
        match self.oldest {
            None => false,
            Some(oldest) => self.events.len() >= max_events || oldest.elapsed() >= max_age,
        }
    }

    pub(crate) fn positions(&self) -> Vec<CommitPosition> {
        self.positions
            .iter()
            .map(|((topic, partition), offset)| CommitPosition {
                topic: topic.clone(),
                partition: *partition,
                offset: *offset,
            })
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
        self.positions.clear();
        self.oldest = None;
    }
}
