//! Worker pool arena.
//!
//! One table keyed by [`ConnectionId`]; each entry carries its membership as
//! a field ([`UnitState::Free`] or [`UnitState::Busy`] with its record), so a
//! unit can never be free and busy at once and never holds two records.
//! The pool is owned by the dispatcher actor and never shared.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::transport::UnitMessage;
use crate::events::ResizeJob;
use crate::messaging::QueueDelivery;

/// Identity of one unit connection; never reused across reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distinguishes successive assignments on the same unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AssignmentId(u64);

impl fmt::Display for AssignmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentPhase {
    AwaitingResult,
    /// The result arrived and is being stored; the upload resolves the message
    Uploading,
}

/// Binding of one job to one busy unit
#[derive(Debug)]
pub struct AssignmentRecord {
    pub assignment_id: AssignmentId,
    pub connection_id: ConnectionId,
    pub delivery: Arc<QueueDelivery>,
    pub job: ResizeJob,
    pub content_type: String,
    pub assigned_at: Instant,
    pub phase: AssignmentPhase,
    timeout: Option<JoinHandle<()>>,
}

impl AssignmentRecord {
    pub fn new(
        assignment_id: AssignmentId,
        connection_id: ConnectionId,
        delivery: Arc<QueueDelivery>,
        job: ResizeJob,
        content_type: String,
    ) -> Self {
        Self {
            assignment_id,
            connection_id,
            delivery,
            job,
            content_type,
            assigned_at: Instant::now(),
            phase: AssignmentPhase::AwaitingResult,
            timeout: None,
        }
    }

    pub fn arm_timeout(&mut self, handle: JoinHandle<()>) {
        self.cancel_timeout();
        self.timeout = Some(handle);
    }

    pub fn cancel_timeout(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
    }

    pub fn has_timeout(&self) -> bool {
        self.timeout.is_some()
    }
}

impl Drop for AssignmentRecord {
    fn drop(&mut self) {
        self.cancel_timeout();
    }
}

#[derive(Debug)]
pub enum UnitState {
    Free,
    Busy(Box<AssignmentRecord>),
}

#[derive(Debug)]
pub struct WorkerUnit {
    sender: mpsc::UnboundedSender<UnitMessage>,
    state: UnitState,
    connected_at: DateTime<Utc>,
    jobs_completed: u64,
}

impl WorkerUnit {
    fn new(sender: mpsc::UnboundedSender<UnitMessage>) -> Self {
        Self {
            sender,
            state: UnitState::Free,
            connected_at: Utc::now(),
            jobs_completed: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self.state, UnitState::Free)
    }

    pub fn state(&self) -> &UnitState {
        &self.state
    }

    pub fn into_record(self) -> Option<Box<AssignmentRecord>> {
        match self.state {
            UnitState::Free => None,
            UnitState::Busy(record) => Some(record),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSnapshot {
    pub connection_id: ConnectionId,
    pub busy: bool,
    pub assignment_id: Option<AssignmentId>,
    pub phase: Option<AssignmentPhase>,
    pub target_uri: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub jobs_completed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub units: Vec<UnitSnapshot>,
}

impl PoolSnapshot {
    pub fn free(&self) -> usize {
        self.units.iter().filter(|u| !u.busy).count()
    }

    pub fn busy(&self) -> usize {
        self.units.iter().filter(|u| u.busy).count()
    }

    pub fn unit(&self, connection_id: ConnectionId) -> Option<&UnitSnapshot> {
        self.units.iter().find(|u| u.connection_id == connection_id)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorkerPoolError {
    #[error("Unit already connected: {connection_id}")]
    DuplicateConnection { connection_id: ConnectionId },

    #[error("Unit not found: {connection_id}")]
    WorkerNotFound { connection_id: ConnectionId },

    #[error("Unit {connection_id} is busy with assignment {assignment_id}")]
    UnitBusy {
        connection_id: ConnectionId,
        assignment_id: AssignmentId,
    },
}

pub struct WorkerPool {
    units: HashMap<ConnectionId, WorkerUnit>,
    rng: fastrand::Rng,
    next_assignment: u64,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("units", &self.units.len())
            .field("free", &self.free_count())
            .field("next_assignment", &self.next_assignment)
            .finish()
    }
}

impl WorkerPool {
    /// `seed` makes free-unit selection reproducible
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            units: HashMap::new(),
            rng: seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed),
            next_assignment: 0,
        }
    }

    pub fn register(
        &mut self,
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<UnitMessage>,
    ) -> Result<(), WorkerPoolError> {
        if self.units.contains_key(&connection_id) {
            return Err(WorkerPoolError::DuplicateConnection { connection_id });
        }
        self.units.insert(connection_id, WorkerUnit::new(sender));
        Ok(())
    }

    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<WorkerUnit> {
        self.units.remove(&connection_id)
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.units.contains_key(&connection_id)
    }

    pub fn is_free(&self, connection_id: ConnectionId) -> bool {
        self.units
            .get(&connection_id)
            .is_some_and(WorkerUnit::is_free)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.units.values().filter(|u| u.is_free()).count()
    }

    pub fn busy_count(&self) -> usize {
        self.len() - self.free_count()
    }

    /// Uniform random pick among free units
    pub fn select_free(&mut self) -> Option<ConnectionId> {
        let mut free: Vec<ConnectionId> = self
            .units
            .iter()
            .filter(|(_, unit)| unit.is_free())
            .map(|(id, _)| *id)
            .collect();
        if free.is_empty() {
            return None;
        }
        // HashMap order is arbitrary; sort so a seeded rng is reproducible
        free.sort_unstable();
        Some(free[self.rng.usize(..free.len())])
    }

    pub fn next_assignment_id(&mut self) -> AssignmentId {
        self.next_assignment += 1;
        AssignmentId(self.next_assignment)
    }

    /// Move a free unit to busy with `record`
    pub fn assign(
        &mut self,
        connection_id: ConnectionId,
        record: AssignmentRecord,
    ) -> Result<&mut AssignmentRecord, WorkerPoolError> {
        let unit = self
            .units
            .get_mut(&connection_id)
            .ok_or(WorkerPoolError::WorkerNotFound { connection_id })?;

        if let UnitState::Busy(current) = &unit.state {
            return Err(WorkerPoolError::UnitBusy {
                connection_id,
                assignment_id: current.assignment_id,
            });
        }

        unit.state = UnitState::Busy(Box::new(record));
        match &mut unit.state {
            UnitState::Busy(record) => Ok(&mut **record),
            UnitState::Free => Err(WorkerPoolError::WorkerNotFound { connection_id }),
        }
    }

    pub fn record(&self, connection_id: ConnectionId) -> Option<&AssignmentRecord> {
        match &self.units.get(&connection_id)?.state {
            UnitState::Busy(record) => Some(&**record),
            UnitState::Free => None,
        }
    }

    pub fn record_mut(&mut self, connection_id: ConnectionId) -> Option<&mut AssignmentRecord> {
        match &mut self.units.get_mut(&connection_id)?.state {
            UnitState::Busy(record) => Some(&mut **record),
            UnitState::Free => None,
        }
    }

    /// Return a busy unit to free, handing back its record
    pub fn release(&mut self, connection_id: ConnectionId) -> Option<Box<AssignmentRecord>> {
        let unit = self.units.get_mut(&connection_id)?;
        match std::mem::replace(&mut unit.state, UnitState::Free) {
            UnitState::Busy(record) => Some(record),
            UnitState::Free => None,
        }
    }

    pub fn record_completion(&mut self, connection_id: ConnectionId) {
        if let Some(unit) = self.units.get_mut(&connection_id) {
            unit.jobs_completed += 1;
        }
    }

    pub fn sender(&self, connection_id: ConnectionId) -> Option<&mpsc::UnboundedSender<UnitMessage>> {
        self.units.get(&connection_id).map(|u| &u.sender)
    }

    /// Free every busy unit and hand back their records
    pub fn release_all(&mut self) -> Vec<Box<AssignmentRecord>> {
        let ids: Vec<ConnectionId> = self.units.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.release(id)).collect()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut units: Vec<UnitSnapshot> = self
            .units
            .iter()
            .map(|(id, unit)| {
                let record = match &unit.state {
                    UnitState::Busy(record) => Some(record),
                    UnitState::Free => None,
                };
                UnitSnapshot {
                    connection_id: *id,
                    busy: record.is_some(),
                    assignment_id: record.map(|r| r.assignment_id),
                    phase: record.map(|r| r.phase),
                    target_uri: record.map(|r| r.job.target_uri.clone()),
                    connected_at: unit.connected_at,
                    jobs_completed: unit.jobs_completed,
                }
            })
            .collect();
        units.sort_by_key(|u| u.connection_id);
        PoolSnapshot { units }
    }
}
