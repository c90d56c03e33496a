//! Admission control
//!
//! Each operation category has its own ceiling on concurrently running
//! operations. Callers beyond the ceiling wait in FIFO order: tokio's
//! semaphore hands permits out in the order they were requested.

use fleetstore_common::config::EngineConfig;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::trace;

/// Operation categories with independent limits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
    ReadRange,
    Replicate,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadRange => "read_range",
            Self::Replicate => "replicate",
        };
        f.write_str(s)
    }
}

/// Snapshot of one category
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionStats {
    pub limit: usize,
    pub in_flight: usize,
    /// Highest in-flight count observed since creation
    pub peak: usize,
}

struct Gate {
    limit: usize,
    semaphore: Semaphore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Gate {
    fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            semaphore: Semaphore::new(limit),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

/// Slot held for the duration of one operation
pub struct AdmissionPermit<'a> {
    gate: &'a Gate,
    _permit: SemaphorePermit<'a>,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Admission {
    read: Gate,
    write: Gate,
    read_range: Gate,
    replicate: Gate,
}

impl Admission {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            read: Gate::new(config.read_concurrency),
            write: Gate::new(config.write_concurrency),
            read_range: Gate::new(config.read_range_concurrency),
            replicate: Gate::new(config.replicate_concurrency),
        }
    }

    const fn gate(&self, kind: OpKind) -> &Gate {
        match kind {
            OpKind::Read => &self.read,
            OpKind::Write => &self.write,
            OpKind::ReadRange => &self.read_range,
            OpKind::Replicate => &self.replicate,
        }
    }

    /// Wait for a slot in `kind`
    pub async fn acquire(&self, kind: OpKind) -> AdmissionPermit<'_> {
        let gate = self.gate(kind);
        // the semaphore is never closed
        let permit = match gate.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("admission semaphore closed"),
        };
        let now = gate.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gate.peak.fetch_max(now, Ordering::SeqCst);
        trace!(%kind, in_flight = now, "admitted");
        AdmissionPermit { gate, _permit: permit }
    }

    #[must_use]
    pub fn stats(&self, kind: OpKind) -> AdmissionStats {
        let gate = self.gate(kind);
        AdmissionStats {
            limit: gate.limit,
            in_flight: gate.in_flight.load(Ordering::SeqCst),
            peak: gate.peak.load(Ordering::SeqCst),
        }
    }
}
