use std::fmt;

use crate::ledger::{HistoryLedger, LifecycleField, LifecycleRecord};

/// Lifecycle state derived from the two newest ledger records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    NotStarted,
    SpawnReady,
    /// The previous instance has not delivered these termination events yet
    SpawnAwaiting(Vec<LifecycleField>),
    /// Kill was requested; these fields are still outstanding
    KillPending(Vec<LifecycleField>),
    Killed,
    Closing,
    Closed,
    Spawned,
}

impl Status {
    /// Derive the status from the newest record and the one before it.
    ///
    /// Kill is checked before exit/close because a kill always ends up
    /// producing both.
    pub fn project(latest: Option<&LifecycleRecord>, previous: Option<&LifecycleRecord>) -> Status {
        let Some(current) = latest else {
            return Status::NotStarted;
        };

        if !current.is_set(LifecycleField::Started) {
            let pending = previous
                .map(LifecycleRecord::pending_termination)
                .unwrap_or_default();
            return if pending.is_empty() {
                Status::SpawnReady
            } else {
                Status::SpawnAwaiting(pending)
            };
        }

        let exited = current.is_set(LifecycleField::Exited);
        let closed = current.is_set(LifecycleField::Closed);

        if current.is_set(LifecycleField::KillRequested) {
            let pending = current.pending();
            if pending.is_empty() {
                Status::Killed
            } else {
                Status::KillPending(pending)
            }
        } else if exited && !closed {
            Status::Closing
        } else if exited && closed {
            Status::Closed
        } else {
            Status::Spawned
        }
    }

    pub fn of(ledger: &HistoryLedger) -> Status {
        Status::project(ledger.latest(), ledger.previous())
    }

    /// Label without the pending-field suffix
    pub fn label(&self) -> &'static str {
        match self {
            Status::NotStarted => "not started",
            Status::SpawnReady => "spawn ready",
            Status::SpawnAwaiting(_) => "spawn awaiting last",
            Status::KillPending(_) => "kill pending",
            Status::Killed => "killed",
            Status::Closing => "closing",
            Status::Closed => "closed",
            Status::Spawned => "spawned",
        }
    }

    pub fn pending(&self) -> &[LifecycleField] {
        match self {
            Status::SpawnAwaiting(fields) | Status::KillPending(fields) => fields,
            _ => &[],
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())?;
        let pending = self.pending();
        if !pending.is_empty() {
            f.write_str(": ")?;
            for (i, field) in pending.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{field}")?;
            }
        }
        Ok(())
    }
}
