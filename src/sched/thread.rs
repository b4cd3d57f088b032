//! Thread control block.

use std::collections::VecDeque;

use crate::fixedpoint::Fixed;
use crate::param::PRI_DEFAULT;

pub type Tid = u32;
pub type LockId = u32;

/// Thread name storage; the teacher caps this at `MAXPROCNAME` for its
/// fixed-size `[u8; N]` buffer. We are hosted, so a `String` is the
/// idiomatic equivalent, but we keep the same cap as a sanity bound.
pub const MAX_THREAD_NAME: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Ready,
    /// Blocked on a lock, semaphore, condition variable, or timer sleep.
    Blocked,
    Dying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Lock(LockId),
    Semaphore,
    Condvar,
    Sleep,
    ChildWait,
}

#[derive(Debug)]
pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub state: ThreadState,
    pub base_priority: u8,
    pub effective_priority: u8,
    pub blocked_on: Option<BlockReason>,
    /// Locks this thread currently owns, in acquisition order.
    pub holding_locks: Vec<LockId>,
    pub nice: i32,
    pub recent_cpu: Fixed,
    pub ticks_in_slice: u32,
    /// Only present for the main thread of a user process; kept generic
    /// here and attached by the process layer (spec.md: "per-process fields
    /// only if this thread is the main thread of a user process").
    pub is_user_process: bool,
}

impl Thread {
    pub fn new(tid: Tid, name: impl Into<String>, priority: u8) -> Self {
        let mut name = name.into();
        name.truncate(MAX_THREAD_NAME);
        Self {
            tid,
            name,
            state: ThreadState::Ready,
            base_priority: priority,
            effective_priority: priority,
            blocked_on: None,
            holding_locks: Vec::new(),
            nice: 0,
            recent_cpu: Fixed::ZERO,
            ticks_in_slice: 0,
            is_user_process: false,
        }
    }

    pub fn idle(tid: Tid) -> Self {
        Self::new(tid, "idle", PRI_DEFAULT)
    }
}

/// Ready queue shape from spec.md section 4.1: an array of FIFO lists
/// indexed by effective priority, `PRI_MIN..=PRI_MAX`.
#[derive(Debug)]
pub struct ReadyQueues {
    queues: Vec<VecDeque<Tid>>,
}

impl ReadyQueues {
    pub fn new(levels: usize) -> Self {
        Self {
            queues: (0..levels).map(|_| VecDeque::new()).collect(),
        }
    }

    pub fn push(&mut self, priority: u8, tid: Tid) {
        self.queues[priority as usize].push_back(tid);
    }

    /// Removes and returns the thread at the highest occupied priority
    /// level, FIFO within that level.
    pub fn pop_max(&mut self) -> Option<Tid> {
        for q in self.queues.iter_mut().rev() {
            if let Some(tid) = q.pop_front() {
                return Some(tid);
            }
        }
        None
    }

    pub fn peek_max_priority(&self) -> Option<u8> {
        self.queues
            .iter()
            .enumerate()
            .rev()
            .find(|(_, q)| !q.is_empty())
            .map(|(p, _)| p as u8)
    }

    pub fn remove(&mut self, priority: u8, tid: Tid) -> bool {
        let q = &mut self.queues[priority as usize];
        if let Some(pos) = q.iter().position(|&t| t == tid) {
            q.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}
