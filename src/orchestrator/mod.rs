//! Application-level orchestration.
//!
//! This module owns the lifecycle of the long-running operations the CLI drives:
//! ingestion job polling, streaming analysis queries and filtered log browsing
//! with its background summary refresh. Presentation layers consume the events
//! these components emit and call into them for start/stop/cancel.

mod controller;
mod coordinator;
mod job_tracker;
mod query_stream;

pub(crate) use controller::{parse_command, run_watch, WatchCommand, WATCH_HELP};
pub(crate) use coordinator::QueryStateCoordinator;
pub(crate) use job_tracker::JobTracker;
pub(crate) use query_stream::StreamingQueryClient;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Generation counter shared by a component and the task it spawned.
///
/// Every `start` issues a fresh [`RunTicket`]; `stop`/`cancel` retire it. A task
/// may only publish state or events through its ticket, and publishing holds
/// the gate, so once `retire` returns the old task can no longer emit anything.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunGate {
    generation: Arc<Mutex<u64>>,
}

#[derive(Debug, Clone)]
pub(crate) struct RunTicket {
    generation: Arc<Mutex<u64>>,
    issued: u64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunGate {
    pub fn issue(&self) -> RunTicket {
        let mut current = lock(&self.generation);
        *current += 1;
        RunTicket {
            generation: self.generation.clone(),
            issued: *current,
        }
    }

    pub fn retire(&self) {
        *lock(&self.generation) += 1;
    }
}

impl RunTicket {
    pub fn is_current(&self) -> bool {
        *lock(&self.generation) == self.issued
    }

    /// Run `f` only if this ticket is still current, holding the gate while it runs.
    pub fn publish<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let current = lock(&self.generation);
        if *current != self.issued {
            return None;
        }
        let out = f();
        drop(current);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retired_ticket_cannot_publish() {
        let gate = RunGate::default();
        let first = gate.issue();
        assert_eq!(first.publish(|| 1), Some(1));

        let second = gate.issue();
        assert!(!first.is_current());
        assert_eq!(first.publish(|| 2), None);
        assert_eq!(second.publish(|| 3), Some(3));

        gate.retire();
        assert_eq!(second.publish(|| 4), None);
    }
}
