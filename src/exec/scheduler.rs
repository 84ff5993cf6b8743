//! Deferred launch queue.
//!
//! Launches are queued in submission order. On submission the scheduler
//! derives each launch's dependencies from its access plan, per region:
//!
//! - read after write: a read depends on the last writer
//! - write after read: a write depends on every reader since the last write
//! - write after write: a write depends on the last writer
//!
//! Draining in submission order satisfies every recorded dependency. Records
//! stay inspectable until the queue drains; then every recorded launch has
//! run, so [`Scheduler::retire`] forgets them along with the per-region
//! frontier.

use super::IndexLaunch;
use crate::access::Phase;
use crate::operator::OpId;
use crate::tensors::RegionId;
use std::collections::{HashMap, VecDeque};

/// Identifier of a submitted launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaunchId(pub u64);

/// What the scheduler knows about a submitted launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub id: LaunchId,
    pub op: OpId,
    pub phase: Phase,
    /// Earlier launches this one must follow, ascending.
    pub deps: Vec<LaunchId>,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    next: u64,
    queue: VecDeque<(LaunchId, IndexLaunch)>,
    last_writer: HashMap<RegionId, LaunchId>,
    readers: HashMap<RegionId, Vec<LaunchId>>,
    records: Vec<LaunchRecord>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a launch and records its dependencies.
    pub fn submit(&mut self, launch: IndexLaunch) -> LaunchId {
        let id = LaunchId(self.next);
        self.next += 1;

        let mut deps = Vec::new();
        for req in &launch.plan.requirements {
            if let Some(&w) = self.last_writer.get(&req.region) {
                deps.push(w);
            }
            if req.mode.writes() {
                if let Some(readers) = self.readers.get(&req.region) {
                    deps.extend(readers.iter().copied().filter(|&r| r != id));
                }
            }
        }
        deps.sort_unstable();
        deps.dedup();

        for req in &launch.plan.requirements {
            if req.mode.writes() {
                self.last_writer.insert(req.region, id);
                self.readers.remove(&req.region);
            } else {
                self.readers.entry(req.region).or_default().push(id);
            }
        }

        log::trace!(
            "submit {:?} {:?} of op {:?} deps={:?}",
            id,
            launch.plan.phase,
            launch.op.guid(),
            deps
        );
        self.records.push(LaunchRecord {
            id,
            op: launch.op.guid(),
            phase: launch.plan.phase,
            deps,
        });
        self.queue.push_back((id, launch));
        id
    }

    /// Next launch in submission order.
    pub fn pop(&mut self) -> Option<(LaunchId, IndexLaunch)> {
        self.queue.pop_front()
    }

    /// Drops every queued launch; used after a fatal failure.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Forgets completed launches once nothing is queued.
    pub fn retire(&mut self) {
        if !self.queue.is_empty() {
            return;
        }
        log::trace!("retire {} launch records", self.records.len());
        self.records.clear();
        self.last_writer.clear();
        self.readers.clear();
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn records(&self) -> &[LaunchRecord] {
        &self.records
    }

    pub fn record(&self, id: LaunchId) -> Option<&LaunchRecord> {
        let index = self.records.binary_search_by_key(&id, |r| r.id).ok()?;
        self.records.get(index)
    }
}
