//! Bounded ordered work queue for asynchronous writes
//!
//! Each connection owns one queue. Jobs run on worker threads spawned on
//! demand, never more than the concurrency limit at once; with the default
//! limit of 1 the queue degenerates to a single worker draining jobs in
//! submission order, which is what gives `write_async` its ordering
//! guarantee.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Work queue with a concurrency ceiling
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    limit: u32,
}

struct State {
    jobs: VecDeque<Job>,
    running: u32,
}

impl WorkQueue {
    /// Create a queue running at most `limit` jobs concurrently
    pub fn new(limit: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    jobs: VecDeque::new(),
                    running: 0,
                }),
                limit: limit.max(1),
            }),
        }
    }

    /// Enqueue a job; never blocks the caller
    ///
    /// If a worker slot is free the job starts immediately on a fresh
    /// worker thread, otherwise it waits in line.
    pub fn push(&self, job: Job) {
        let mut state = self.inner.state.lock();
        if state.running < self.inner.limit {
            state.running += 1;
            drop(state);
            let inner = Arc::clone(&self.inner);
            std::thread::spawn(move || Inner::run(inner, job));
        } else {
            state.jobs.push_back(job);
        }
    }

    /// Jobs waiting for a worker slot
    pub fn pending(&self) -> usize {
        self.inner.state.lock().jobs.len()
    }
}

impl Inner {
    /// Worker body: run the first job, then drain until the queue is empty
    fn run(inner: Arc<Inner>, first: Job) {
        let mut job = first;
        loop {
            job();
            let mut state = inner.state.lock();
            match state.jobs.pop_front() {
                Some(next) => job = next,
                None => {
                    state.running -= 1;
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkQueue")
            .field("limit", &self.inner.limit)
            .field("running", &state.running)
            .field("pending", &state.jobs.len())
            .finish()
    }
}
