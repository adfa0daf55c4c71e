//! Frame bookkeeping for one job.
//!
//! Every frame index of `[start, start + count)` is in exactly one place:
//! not yet handed out (at or past the fresh counter), waiting in the retry
//! queue, held by exactly one worker, or finished.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::bridge::protocol::FrameIndex;
use crate::transport::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("frame range starting at {start} with {count} frames exceeds u32")]
    RangeOverflow { start: FrameIndex, count: u32 },

    #[error("worker {0} is not registered")]
    UnknownWorker(ConnectionId),

    #[error("worker {worker} does not hold frame {frame}")]
    NotAssigned {
        worker: ConnectionId,
        frame: FrameIndex,
    },
}

#[derive(Debug)]
pub struct FrameSchedule {
    start_frame: FrameIndex,
    frame_count: u32,
    /// Offset of the next never-assigned frame.
    next_fresh: u32,
    retry: VecDeque<FrameIndex>,
    assignments: BTreeMap<ConnectionId, BTreeSet<FrameIndex>>,
    completed: u32,
    /// Retries are unbounded, so these two only saturate.
    failed: u64,
    requeued: u64,
}

impl FrameSchedule {
    pub fn new(start_frame: FrameIndex, frame_count: u32) -> Result<Self, ScheduleError> {
        if u64::from(start_frame) + u64::from(frame_count) > u64::from(u32::MAX) + 1 {
            return Err(ScheduleError::RangeOverflow {
                start: start_frame,
                count: frame_count,
            });
        }
        Ok(Self {
            start_frame,
            frame_count,
            next_fresh: 0,
            retry: VecDeque::new(),
            assignments: BTreeMap::new(),
            completed: 0,
            failed: 0,
            requeued: 0,
        })
    }

    /// Returns false if the worker was already known.
    pub fn add_worker(&mut self, worker: ConnectionId) -> bool {
        if self.assignments.contains_key(&worker) {
            return false;
        }
        self.assignments.insert(worker, BTreeSet::new());
        true
    }

    /// Forget a worker and put everything it held back in the retry queue.
    ///
    /// Returns the requeued frames in ascending order, or `None` for a
    /// worker that was never added.
    pub fn remove_worker(&mut self, worker: ConnectionId) -> Option<Vec<FrameIndex>> {
        let held = self.assignments.remove(&worker)?;
        let frames: Vec<FrameIndex> = held.into_iter().collect();
        self.retry.extend(frames.iter().copied());
        self.requeued = self.requeued.saturating_add(frames.len() as u64);
        Some(frames)
    }

    /// Hand the next frame to `worker`: retries first, then fresh frames.
    pub fn assign_next(&mut self, worker: ConnectionId) -> Option<FrameIndex> {
        let held = self.assignments.get_mut(&worker)?;
        let frame = match self.retry.pop_front() {
            Some(frame) => frame,
            None if self.next_fresh < self.frame_count => {
                let frame = self.start_frame + self.next_fresh;
                self.next_fresh += 1;
                frame
            }
            None => return None,
        };
        held.insert(frame);
        Some(frame)
    }

    pub fn complete(&mut self, worker: ConnectionId, frame: FrameIndex) -> Result<(), ScheduleError> {
        self.release(worker, frame)?;
        self.completed += 1;
        Ok(())
    }

    /// The worker gave up on `frame`; it goes back to the retry queue.
    pub fn fail(&mut self, worker: ConnectionId, frame: FrameIndex) -> Result<(), ScheduleError> {
        self.release(worker, frame)?;
        self.retry.push_back(frame);
        self.failed = self.failed.saturating_add(1);
        Ok(())
    }

    fn release(&mut self, worker: ConnectionId, frame: FrameIndex) -> Result<(), ScheduleError> {
        let held = self
            .assignments
            .get_mut(&worker)
            .ok_or(ScheduleError::UnknownWorker(worker))?;
        if held.remove(&frame) {
            Ok(())
        } else {
            Err(ScheduleError::NotAssigned { worker, frame })
        }
    }

    pub fn held(&self, worker: ConnectionId) -> usize {
        self.assignments.get(&worker).map_or(0, BTreeSet::len)
    }

    pub fn assigned_to(&self, worker: ConnectionId) -> Vec<FrameIndex> {
        self.assignments
            .get(&worker)
            .map(|held| held.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Known workers in ascending id order.
    pub fn workers(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.assignments.keys().copied()
    }

    /// Whether any frame is waiting to be handed out.
    pub fn has_unassigned(&self) -> bool {
        !self.retry.is_empty() || self.next_fresh < self.frame_count
    }

    pub fn is_complete(&self) -> bool {
        !self.has_unassigned() && self.assignments.values().all(BTreeSet::is_empty)
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn requeued(&self) -> u64 {
        self.requeued
    }
}
