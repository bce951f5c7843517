//! Append-only history of spawn attempts.
//!
//! Each spawn appends one [`LifecycleRecord`]. Termination events fill the
//! remaining timestamps of the record they belong to, at most once each and
//! in whatever order they arrive. Only the newest records are retained.

use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;

use crate::config::MIN_HISTORY_LIMIT;

/// Stable identifier of a record, independent of its position in the ring
pub type RecordId = u64;

/// Timestamp slots of a lifecycle record, in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleField {
    Started,
    KillRequested,
    Exited,
    Closed,
}

impl LifecycleField {
    pub const ALL: [LifecycleField; 4] = [
        LifecycleField::Started,
        LifecycleField::KillRequested,
        LifecycleField::Exited,
        LifecycleField::Closed,
    ];
}

impl fmt::Display for LifecycleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleField::Started => "started",
            LifecycleField::KillRequested => "kill",
            LifecycleField::Exited => "exited",
            LifecycleField::Closed => "closed",
        })
    }
}

/// Events that complete a record after it was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    KillRequested,
    Exited,
    Closed,
}

impl LifecycleEvent {
    pub fn field(self) -> LifecycleField {
        match self {
            LifecycleEvent::KillRequested => LifecycleField::KillRequested,
            LifecycleEvent::Exited => LifecycleField::Exited,
            LifecycleEvent::Closed => LifecycleField::Closed,
        }
    }
}

/// One spawn attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleRecord {
    pub id: RecordId,
    pub process_id: String,
    pub started_at: Option<Instant>,
    pub kill_requested_at: Option<Instant>,
    pub exited_at: Option<Instant>,
    pub closed_at: Option<Instant>,
}

impl LifecycleRecord {
    pub fn get(&self, field: LifecycleField) -> Option<Instant> {
        match field {
            LifecycleField::Started => self.started_at,
            LifecycleField::KillRequested => self.kill_requested_at,
            LifecycleField::Exited => self.exited_at,
            LifecycleField::Closed => self.closed_at,
        }
    }

    pub fn is_set(&self, field: LifecycleField) -> bool {
        self.get(field).is_some()
    }

    /// Fields not yet set, in declaration order
    pub fn pending(&self) -> Vec<LifecycleField> {
        LifecycleField::ALL
            .into_iter()
            .filter(|f| !self.is_set(*f))
            .collect()
    }

    /// Termination events this instance has not delivered yet
    pub fn pending_termination(&self) -> Vec<LifecycleField> {
        [LifecycleField::Exited, LifecycleField::Closed]
            .into_iter()
            .filter(|f| !self.is_set(*f))
            .collect()
    }

    /// Seconds between start and the given field, if both are set
    pub fn elapsed_secs(&self, field: LifecycleField) -> Option<u64> {
        let started = self.started_at?;
        let at = self.get(field)?;
        Some(at.saturating_duration_since(started).as_secs())
    }

    fn slot(&mut self, event: LifecycleEvent) -> &mut Option<Instant> {
        match event {
            LifecycleEvent::KillRequested => &mut self.kill_requested_at,
            LifecycleEvent::Exited => &mut self.exited_at,
            LifecycleEvent::Closed => &mut self.closed_at,
        }
    }
}

/// Outcome of applying an event to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Applied,
    /// The field was already set; the first value is kept
    Duplicate,
    /// The record has been evicted from the ring
    UnknownRecord,
}

/// Bounded, append-only sequence of lifecycle records
#[derive(Debug, Clone)]
pub struct HistoryLedger {
    records: VecDeque<LifecycleRecord>,
    limit: usize,
    next_id: RecordId,
}

impl HistoryLedger {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(MIN_HISTORY_LIMIT);
        Self {
            records: VecDeque::with_capacity(limit),
            limit,
            next_id: 0,
        }
    }

    /// Append a record for a new spawn, evicting the oldest one if full
    pub fn start(&mut self, process_id: impl Into<String>, at: Instant) -> RecordId {
        let id = self.next_id;
        self.next_id += 1;
        self.records.push_back(LifecycleRecord {
            id,
            process_id: process_id.into(),
            started_at: Some(at),
            kill_requested_at: None,
            exited_at: None,
            closed_at: None,
        });
        self.trim();
        id
    }

    /// Set one field of a record, ignoring duplicates
    pub fn mark(&mut self, id: RecordId, event: LifecycleEvent, at: Instant) -> MarkOutcome {
        let Some(record) = self.records.iter_mut().rev().find(|r| r.id == id) else {
            return MarkOutcome::UnknownRecord;
        };
        let slot = record.slot(event);
        if slot.is_some() {
            return MarkOutcome::Duplicate;
        }
        *slot = Some(at);
        MarkOutcome::Applied
    }

    pub fn latest(&self) -> Option<&LifecycleRecord> {
        self.records.back()
    }

    /// The record before the latest one
    pub fn previous(&self) -> Option<&LifecycleRecord> {
        self.records.len().checked_sub(2).and_then(|i| self.records.get(i))
    }

    pub fn get(&self, id: RecordId) -> Option<&LifecycleRecord> {
        self.records.iter().rev().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LifecycleRecord> {
        self.records.iter()
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(MIN_HISTORY_LIMIT);
        self.trim();
    }

    fn trim(&mut self) {
        while self.records.len() > self.limit {
            self.records.pop_front();
        }
    }
}
