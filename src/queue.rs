//! The deferred-execution facility backing every settlement.
//!
//! Observers are never invoked inside `fulfill`/`reject`; they are boxed and
//! pushed here, and run when the host drains the queue. Thunks run in
//! submission order, and a thunk submitted during a drain runs within that
//! same drain, after everything submitted before it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Thunk = Box<dyn FnOnce() + Send>;

/// A FIFO queue of deferred thunks. Cloning yields another handle to the
/// same queue.
#[derive(Clone, Default)]
pub struct TaskQueue {
    jobs: Arc<Mutex<VecDeque<Thunk>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Enqueue a thunk to run on a later turn, after everything already
    /// queued.
    pub fn defer<F: FnOnce() + Send + 'static>(&self, thunk: F) {
        self.jobs.lock().unwrap().push_back(Box::new(thunk));
    }

    /// Pop and run the oldest thunk. Returns `false` if the queue was idle.
    /// The queue lock is not held while the thunk runs, so a thunk may
    /// defer more work.
    pub fn run_next(&self) -> bool {
        let job = self.jobs.lock().unwrap().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Drain until no work remains, including thunks enqueued mid-drain.
    /// Returns how many thunks ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    pub fn is_idle(&self) -> bool {
        self.jobs.lock().unwrap().is_empty()
    }

    /// Number of thunks waiting to run.
    pub fn backlog(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("backlog", &self.backlog())
            .finish()
    }
}
