//! Priority Thread Pool for Block Decoding
//!
//! A fixed set of worker threads draining a priority-ordered task queue.
//! Lower priority values run first; within one priority tasks run FIFO.
//! Submitting returns a one-shot handle that delivers the task's result,
//! including its failure, only when the handle is consumed. Workers never
//! abort on a failed task.
//!
//! Each worker can optionally be pinned to a logical core via a
//! `{thread index -> core id}` map, which helps cache locality when the
//! pool size matches the machine.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, TryRecvError};

use crate::error::{PargzError, PargzResult};

/// Maps a worker's thread index to the logical core it should be pinned to.
pub type ThreadPinning = HashMap<usize, u32>;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    running: bool,
    /// Priority -> FIFO bucket. BTreeMap iteration order gives us
    /// "lowest priority value first".
    tasks: BTreeMap<i32, VecDeque<Job>>,
}

struct Shared {
    state: Mutex<PoolState>,
    ping_workers: Condvar,
}

/// Handle to a submitted task's eventual result.
///
/// The result (or the task's error) is delivered exactly once. If the pool
/// is stopped while the task is still queued, the task is dropped and the
/// handle yields [`PargzError::BrokenTask`] on consumption.
pub struct TaskHandle<T> {
    receiver: Receiver<PargzResult<T>>,
}

impl<T> TaskHandle<T> {
    /// Whether a result is already waiting, without consuming it.
    pub fn is_ready(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Non-blocking take. `None` while the task is still pending.
    pub fn try_take(&self) -> Option<PargzResult<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Disconnected) => Some(Err(PargzError::BrokenTask)),
            Err(TryRecvError::Empty) => None,
        }
    }

    /// Wait up to `timeout` for the result. `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<PargzResult<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Some(Err(PargzError::BrokenTask))
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
        }
    }

    /// Block until the result is available.
    pub fn wait(self) -> PargzResult<T> {
        match self.receiver.recv() {
            Ok(result) => result,
            Err(_) => Err(PargzError::BrokenTask),
        }
    }
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(n_threads: usize) -> Self {
        Self::with_pinning(n_threads, ThreadPinning::new())
    }

    pub fn with_pinning(n_threads: usize, pinning: ThreadPinning) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                running: true,
                tasks: BTreeMap::new(),
            }),
            ping_workers: Condvar::new(),
        });

        let threads = (0..n_threads)
            .map(|thread_index| {
                let shared = Arc::clone(&shared);
                let core_id = pinning.get(&thread_index).copied();
                thread::spawn(move || worker_main(&shared, core_id))
            })
            .collect();

        ThreadPool { shared, threads }
    }

    /// Submit a task. Lower `priority` values are processed first.
    pub fn submit<F, T>(&self, task: F, priority: i32) -> TaskHandle<T>
    where
        F: FnOnce() -> PargzResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = bounded(1);
        let job: Job = Box::new(move || {
            // The receiver may already be gone when nobody cares about the
            // result anymore; that is fine.
            let _ = sender.send(task());
        });

        {
            let mut state = self.shared.state.lock().unwrap();
            state.tasks.entry(priority).or_default().push_back(job);
        }
        self.shared.ping_workers.notify_one();

        TaskHandle { receiver }
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Queue depth, either total or for one priority bucket.
    pub fn unprocessed_tasks_count(&self, priority: Option<i32>) -> usize {
        let state = self.shared.state.lock().unwrap();
        match priority {
            Some(p) => state.tasks.get(&p).map_or(0, VecDeque::len),
            None => state.tasks.values().map(VecDeque::len).sum(),
        }
    }

    /// Stop the pool: still-queued tasks are dropped (their handles yield
    /// `BrokenTask`), in-flight tasks run to completion, workers are joined.
    /// Idempotent.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = false;
            state.tasks.clear();
        }
        self.shared.ping_workers.notify_all();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main(shared: &Shared, core_id: Option<u32>) {
    if let Some(core_id) = core_id {
        pin_to_core(core_id);
    }

    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if !state.running {
                    return;
                }
                if let Some(job) = pop_next_task(&mut state) {
                    break job;
                }
                state = shared.ping_workers.wait(state).unwrap();
            }
        };
        job();
    }
}

/// Pop the first task from the lowest-priority non-empty bucket.
fn pop_next_task(state: &mut PoolState) -> Option<Job> {
    let (&priority, bucket) = state.tasks.iter_mut().find(|(_, b)| !b.is_empty())?;
    let job = bucket.pop_front();
    if bucket.is_empty() {
        state.tasks.remove(&priority);
    }
    job
}

#[cfg(target_os = "linux")]
fn pin_to_core(core_id: u32) {
    if let Some(core_ids) = core_affinity::get_core_ids() {
        if let Some(id) = core_ids.into_iter().find(|c| c.id == core_id as usize) {
            let _ = core_affinity::set_for_current(id);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core_id: u32) {
    // Pinning is best effort and only wired up on Linux.
}
