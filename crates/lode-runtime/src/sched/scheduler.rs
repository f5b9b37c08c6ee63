//! Cooperative job queue.
//!
//! Jobs run strictly in FIFO order on the owning thread. External event
//! sources (worker transports) are pumped when the queue drains, so their
//! deliveries are ordered after every job already queued.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::error::{RuntimeError, RuntimeResult};
use crate::value::Value;

use super::promise::Promise;

pub type Job = Box<dyn FnOnce()>;

/// Something outside the job queue that can produce work, e.g. a channel
/// carrying worker responses.
pub trait EventSource {
    /// True while the source still expects inbound events.
    fn has_pending(&self) -> bool;

    /// Deliver available events, scheduling their effects as jobs. With
    /// `block` set, wait until at least one event arrives or the source
    /// closes. Returns the number of events delivered.
    fn pump(&self, block: bool) -> RuntimeResult<usize>;
}

struct SchedulerInner {
    queue: RefCell<VecDeque<Job>>,
    sources: RefCell<Vec<Weak<dyn EventSource>>>,
    executed: Cell<u64>,
    next_id: Cell<u64>,
    max_jobs_per_run: Option<usize>,
}

#[derive(Clone)]
pub struct Scheduler(Rc<SchedulerInner>);

impl Scheduler {
    pub fn new(max_jobs_per_run: Option<usize>) -> Self {
        Scheduler(Rc::new(SchedulerInner {
            queue: RefCell::new(VecDeque::new()),
            sources: RefCell::new(Vec::new()),
            executed: Cell::new(0),
            next_id: Cell::new(1),
            max_jobs_per_run,
        }))
    }

    /// Queue `job` for the next tick.
    pub fn defer(&self, job: impl FnOnce() + 'static) {
        self.0.queue.borrow_mut().push_back(Box::new(job));
    }

    #[inline]
    pub fn pending_jobs(&self) -> usize {
        self.0.queue.borrow().len()
    }

    /// Total jobs executed since creation.
    pub fn executed(&self) -> u64 {
        self.0.executed.get()
    }

    pub(crate) fn next_id(&self) -> u64 {
        let id = self.0.next_id.get();
        self.0.next_id.set(id + 1);
        id
    }

    /// Run one queued job. Returns false if the queue was empty.
    pub fn run_once(&self) -> bool {
        // The borrow ends before the job runs; jobs may defer more jobs.
        let job = self.0.queue.borrow_mut().pop_front();
        match job {
            Some(job) => {
                let n = self.0.executed.get() + 1;
                self.0.executed.set(n);
                tracing::trace!(job = n, "run job");
                job();
                true
            }
            None => false,
        }
    }

    pub fn add_source(&self, source: Weak<dyn EventSource>) {
        self.0.sources.borrow_mut().push(source);
    }

    fn live_sources(&self) -> Vec<Rc<dyn EventSource>> {
        let mut sources = self.0.sources.borrow_mut();
        sources.retain(|s| s.strong_count() > 0);
        sources.iter().filter_map(|s| s.upgrade()).collect()
    }

    fn pump_sources(&self, block: bool) -> RuntimeResult<usize> {
        let mut delivered = 0;
        for source in self.live_sources() {
            if source.has_pending() {
                delivered += source.pump(block)?;
                if block && delivered > 0 {
                    break;
                }
            }
        }
        Ok(delivered)
    }

    /// Run jobs until the queue is empty and no source has anything ready.
    /// Never blocks. Returns the number of jobs executed.
    pub fn run_until_idle(&self) -> RuntimeResult<usize> {
        let mut ran = 0usize;
        loop {
            while self.run_once() {
                ran += 1;
                if let Some(max) = self.0.max_jobs_per_run {
                    if ran >= max && self.pending_jobs() > 0 {
                        return Err(RuntimeError::invalid_state(format!(
                            "job limit of {} reached with {} jobs queued",
                            max,
                            self.pending_jobs()
                        )));
                    }
                }
            }
            if self.pump_sources(false)? == 0 && self.pending_jobs() == 0 {
                return Ok(ran);
            }
        }
    }

    /// Drive the loop until `promise` settles and return its settlement.
    ///
    /// Blocks on event sources only when no job is runnable. Fails with
    /// `InvalidState` if nothing can make progress while the promise is still
    /// pending.
    pub fn block_on(&self, promise: &Promise) -> RuntimeResult<Value> {
        loop {
            if let Some(settled) = promise.settlement() {
                return settled;
            }
            if self.run_once() {
                continue;
            }
            if self.pump_sources(false)? > 0 {
                continue;
            }
            let waiting = self.live_sources().into_iter().any(|s| s.has_pending());
            if waiting && self.pump_sources(true)? > 0 {
                continue;
            }
            if self.pending_jobs() > 0 {
                continue;
            }
            if let Some(settled) = promise.settlement() {
                return settled;
            }
            return Err(RuntimeError::invalid_state(format!(
                "scheduler idle with promise #{} unsettled",
                promise.id()
            )));
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(None)
    }
}
