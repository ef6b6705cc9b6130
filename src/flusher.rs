//! The flush-request queue and the worker pool draining it.

use std::collections::VecDeque;
use std::io;
use std::process;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, error};

use crate::block::BlockId;
use crate::tree::Engine;

/// Ids of buffers that crossed their flush threshold, waiting for a worker.
///
/// Tracks how many flushes are currently running in addition to the pending
/// ids, so [`wait_idle`](Self::wait_idle) can tell "queue momentarily
/// empty" apart from "every requested flush has completed".
pub struct FlushQueue {
    state: Mutex<State>,
    ready: Condvar,
    idle: Condvar,
}

struct State {
    pending: VecDeque<BlockId>,
    in_flight: usize,
    shutdown: bool,
}

impl FlushQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: VecDeque::new(),
                in_flight: 0,
                shutdown: false,
            }),
            ready: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    /// Requests a flush of `block`.
    pub fn enqueue(&self, block: BlockId) {
        let mut state = self.state.lock().unwrap();
        state.pending.push_back(block);
        drop(state);

        self.ready.notify_one();
    }

    /// Blocks until every requested flush has been picked up *and*
    /// finished.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while !(state.pending.is_empty() && state.in_flight == 0) {
            state = self.idle.wait(state).unwrap();
        }
    }

    /// Worker side: waits for the next id, or `None` once shutdown is set
    /// and the queue has drained.
    fn next(&self) -> Option<BlockId> {
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some(block) = state.pending.pop_front() {
                state.in_flight += 1;
                return Some(block);
            }
            if state.shutdown {
                return None;
            }
            state = self.ready.wait(state).unwrap();
        }
    }

    /// Worker side: marks the flush taken by [`next`](Self::next) finished.
    fn done(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        let idle = state.pending.is_empty() && state.in_flight == 0;
        drop(state);

        if idle {
            self.idle.notify_all();
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        drop(state);

        self.ready.notify_all();
    }
}

/// Worker threads flushing buffers off the request queue.
///
/// Workers run until dropped; the drop sets the sticky shutdown flag, wakes
/// everyone and joins. Pending requests are still drained before a worker
/// exits.
pub struct FlusherPool {
    engine: Arc<Engine>,
    workers: Vec<JoinHandle<()>>,
}

impl FlusherPool {
    pub fn spawn(engine: &Arc<Engine>, count: usize) -> io::Result<Self> {
        let workers = (0..count.max(1))
            .map(|id| {
                let engine = Arc::clone(engine);
                std::thread::Builder::new()
                    .name(format!("chute-flusher-{}", id))
                    .spawn(move || worker(&engine, id))
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            engine: Arc::clone(engine),
            workers,
        })
    }

    /// Number of worker threads in the pool.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for FlusherPool {
    fn drop(&mut self) {
        self.engine.flush_queue().shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker(engine: &Engine, id: usize) {
    debug!("flusher {} started", id);

    while let Some(block) = engine.flush_queue().next() {
        let result = engine.flush_block(block);
        engine.flush_queue().done();

        if let Err(err) = result {
            // No caller to propagate to; an invariant is broken and
            // continuing would corrupt batches.
            error!("flusher {}: flush of buffer {} failed: {}", id, block, err);
            process::abort();
        }
    }

    debug!("flusher {} exiting", id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_idle_returns_immediately_when_empty() {
        let queue = FlushQueue::new();
        queue.wait_idle();
    }

    #[test]
    fn next_drains_pending_before_shutdown() {
        let queue = FlushQueue::new();
        queue.enqueue(3);
        queue.enqueue(5);
        queue.shutdown();

        assert_eq!(queue.next(), Some(3));
        queue.done();
        assert_eq!(queue.next(), Some(5));
        queue.done();
        assert_eq!(queue.next(), None);
    }

    #[test]
    fn wait_idle_covers_in_flight_work() {
        let queue = FlushQueue::new();
        queue.enqueue(1);

        crossbeam_utils::thread::scope(|s| {
            s.spawn(|_| {
                let block = queue.next().unwrap();
                assert_eq!(block, 1);
                std::thread::sleep(std::time::Duration::from_millis(50));
                queue.done();
            });

            // Give the worker time to take the id off the queue, then wait:
            // the id is gone but the flush is still in flight.
            std::thread::sleep(std::time::Duration::from_millis(10));
            queue.wait_idle();

            let state = queue.state.lock().unwrap();
            assert_eq!(state.in_flight, 0);
        })
        .unwrap();
    }
}
