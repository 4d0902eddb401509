//! The cooperative loop that drives I/O completions and chunked tasks.
//!
//! Each process runs one single-threaded loop. Strategies (and the
//! disker thread in the IPC variant) post completion closures to the
//! loop through a cloned [`LoopHandle`]; the loop runs them in arrival
//! order. Long-running background work, like the startup rebuild, is
//! expressed as a [`CoopTask`] and driven one tick at a time between
//! completion batches, so no task monopolizes the loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

/// A completion ready to run on the loop.
pub(crate) type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Progress report from one task tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The task has more work; tick it again.
    More,
    /// The task is finished and can be dropped.
    Done,
}

/// A chunked unit of background work driven by the loop.
pub trait CoopTask {
    /// Perform one bounded chunk of work.
    fn tick(&mut self) -> Progress;
}

/// Cloneable handle for posting completions to a loop.
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<Completion>,
    in_flight: Arc<AtomicUsize>,
}

impl LoopHandle {
    /// Note an I/O submission whose completion will arrive later.
    pub(crate) fn submitted(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Post a completion for the loop to run.
    pub(crate) fn post(&self, completion: Completion) {
        // a send can only fail after the loop is gone, where the
        // completion has nobody left to inform
        let _ = self.tx.send(completion);
    }
}

/// The cooperative event loop.
pub struct CoopLoop {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    tasks: Vec<Box<dyn CoopTask>>,
    in_flight: Arc<AtomicUsize>,
}

impl CoopLoop {
    /// Create an idle loop.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            tasks: Vec::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A handle strategies use to post completions.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.tx.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Schedule a background task.
    pub fn schedule(&mut self, task: Box<dyn CoopTask>) {
        self.tasks.push(task);
    }

    /// Number of scheduled tasks still running.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Run every queued completion; returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(completion) = self.rx.try_recv() {
            completion();
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            ran += 1;
        }
        ran
    }

    /// Tick every task once, dropping the finished ones.
    fn tick_tasks(&mut self) {
        let mut i = 0;
        while i < self.tasks.len() {
            match self.tasks[i].tick() {
                Progress::More => i += 1,
                Progress::Done => {
                    self.tasks.remove(i);
                }
            }
        }
    }

    /// Drive completions and tasks until both are exhausted.
    ///
    /// Waits briefly for in-flight I/O handed to a disker thread, so a
    /// caller can submit work and then run the loop to completion.
    pub fn run_until_idle(&mut self) {
        loop {
            self.run_pending();
            self.tick_tasks();

            if !self.tasks.is_empty() {
                continue;
            }
            if self.in_flight.load(Ordering::Acquire) == 0 && self.rx.is_empty() {
                // nothing submitted, queued, or scheduled remains
                if self.run_pending() == 0 {
                    break;
                }
                continue;
            }
            // a disker still owes us a completion
            if let Ok(completion) = self.rx.recv_timeout(Duration::from_millis(10)) {
                completion();
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl Default for CoopLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Validity anchor for one-shot completion callbacks.
///
/// The submitter keeps the owner alive for as long as it wants its
/// callbacks delivered; completions carry a [`CbGuard`] and check it
/// before invoking the payload. A vanished owner drops the payload but
/// never the lock bookkeeping around it.
#[derive(Clone, Default)]
pub struct CbOwner(Arc<()>);

impl CbOwner {
    /// Create a live owner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a guard for a callback this owner vouches for.
    pub fn guard(&self) -> CbGuard {
        CbGuard(Arc::downgrade(&self.0))
    }
}

/// Weak reference checked at completion time.
#[derive(Clone)]
pub struct CbGuard(Weak<()>);

impl CbGuard {
    /// Whether the owning caller is still around.
    pub fn valid(&self) -> bool {
        self.0.strong_count() > 0
    }
}
