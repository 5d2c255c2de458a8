//! Work-stealing static thread pool.
//!
//! A fixed set of workers, each owning a mutex/condvar FIFO. Submission
//! picks a starting slot from a round-robin counter and probes `2 × size`
//! queues with `try_lock`, falling back to a blocking push; workers steal
//! from their peers with `try_lock` before blocking on their own queue.
//! Per-worker queues are cache-padded so the round-robin counter and
//! neighbouring queue heads do not false-share.
//!
//! ```text
//!  submit ──► [q0] [q1] [q2] [q3]   try_lock probes, round robin
//!               ▲    ▲    ▲    ▲
//!              w0   w1   w2   w3    each steals from the right, wrapping
//! ```
//!
//! Shutdown contract: [`finish`](StaticThreadPool::finish) wakes every
//! worker; each drains its own queue and exits. The destructor calls
//! `finish` and joins. Work submitted after `finish` completes immediately
//! with `set_stopped` on the submitting thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, TryLockError};
use std::thread::JoinHandle;

use crossbeam_utils::CachePadded;
use tracing::{debug, trace};

use crate::exec::env::Environment;
use crate::exec::{AnyScheduler, Operation, Receiver, Scheduler, Sender, Signal, Work};

struct WorkerState {
    items: VecDeque<Work>,
    finishing: bool,
}

/// Outcome of a push attempt; rejected and contended pushes hand the work
/// item back to the caller.
enum Push {
    Done,
    Rejected(Work),
    Contended(Work),
}

struct WorkerQueue {
    queue: Mutex<WorkerState>,
    cv: Condvar,
}

impl WorkerQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(WorkerState { items: VecDeque::new(), finishing: false }),
            cv: Condvar::new(),
        }
    }

    fn try_enqueue(&self, work: Work) -> Push {
        let state = match self.queue.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Push::Contended(work),
        };
        Self::push_locked(state, work, &self.cv)
    }

    fn enqueue(&self, work: Work) -> Push {
        let state = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        Self::push_locked(state, work, &self.cv)
    }

    fn push_locked(
        mut state: std::sync::MutexGuard<'_, WorkerState>,
        work: Work,
        cv: &Condvar,
    ) -> Push {
        if state.finishing {
            return Push::Rejected(work);
        }
        state.items.push_back(work);
        drop(state);
        cv.notify_one();
        Push::Done
    }

    /// Non-blocking pop used by stealers.
    fn try_dequeue(&self) -> Option<Work> {
        let mut state = match self.queue.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        state.items.pop_front()
    }

    /// Blocking pop on the worker's own queue; `None` signals exit.
    fn dequeue(&self) -> Option<Work> {
        let mut state = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(work) = state.items.pop_front() {
                return Some(work);
            }
            if state.finishing {
                return None;
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self) {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).finishing = true;
        self.cv.notify_all();
    }
}

struct PoolShared {
    workers: Box<[CachePadded<WorkerQueue>]>,
    index: CachePadded<AtomicUsize>,
}

impl PoolShared {
    const SPIN_ROUNDS: usize = 2;

    fn size(&self) -> usize {
        self.workers.len()
    }

    fn enqueue(&self, work: Work) {
        let size = self.size();
        let index = self.index.fetch_add(1, Ordering::Relaxed);
        let mut work = work;
        for k in index..index + Self::SPIN_ROUNDS * size {
            match self.workers[k % size].try_enqueue(work) {
                Push::Done => return,
                Push::Rejected(rejected) => {
                    // Pool is finishing.
                    rejected(Signal::Shutdown);
                    return;
                }
                Push::Contended(returned) => work = returned,
            }
        }
        match self.workers[index % size].enqueue(work) {
            Push::Done => {}
            Push::Rejected(rejected) => rejected(Signal::Shutdown),
            Push::Contended(_) => unreachable!("blocking push cannot contend"),
        }
    }

    fn work(&self, me: usize) {
        trace!(worker = me, "pool worker starting");
        loop {
            let task = self.steal(me).or_else(|| self.workers[me].dequeue());
            match task {
                Some(work) => work(Signal::Deliver),
                None => break,
            }
        }
        trace!(worker = me, "pool worker exiting");
    }

    /// One try-lock probe over every queue, own queue first.
    fn steal(&self, me: usize) -> Option<Work> {
        let size = self.size();
        (me..me + size).find_map(|k| self.workers[k % size].try_dequeue())
    }
}

/// Fixed-size worker pool; the size is set at construction and never
/// changes.
pub struct StaticThreadPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
}

impl StaticThreadPool {
    /// Spawns `size` workers.
    ///
    /// # Panics
    ///
    /// Panics when `size` is zero or a worker thread cannot be spawned.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "a thread pool needs at least one worker");
        let workers: Box<[_]> = (0..size).map(|_| CachePadded::new(WorkerQueue::new())).collect();
        let shared = Arc::new(PoolShared { workers, index: CachePadded::new(AtomicUsize::new(0)) });
        let handles = (0..size)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("telaio-pool-{i}"))
                    .spawn(move || shared.work(i))
                    .expect("failed to spawn pool worker")
            })
            .collect();
        debug!(size, "thread pool started");
        Self { shared, handles }
    }

    /// A scheduler submitting to this pool.
    pub fn scheduler(&self) -> PoolScheduler {
        PoolScheduler { shared: self.shared.clone() }
    }

    /// Stops the workers once their queues drain.
    ///
    /// Idempotent; also invoked by the destructor.
    pub fn finish(&self) {
        for worker in &self.shared.workers {
            worker.finish();
        }
    }
}

impl Drop for StaticThreadPool {
    fn drop(&mut self) {
        self.finish();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!("thread pool joined");
    }
}

/// Scheduler handle of a [`StaticThreadPool`].
#[derive(Clone)]
pub struct PoolScheduler {
    shared: Arc<PoolShared>,
}

impl Scheduler for PoolScheduler {
    type ScheduleSender = PoolSchedule;

    fn schedule(&self) -> PoolSchedule {
        PoolSchedule { shared: self.shared.clone() }
    }
}

/// Sender completing on one of the pool's workers.
pub struct PoolSchedule {
    shared: Arc<PoolShared>,
}

impl Sender for PoolSchedule {
    type Value = ();

    type Operation<R>
        = PoolScheduleOp<R>
    where
        R: Receiver<Value = ()>;

    fn connect<R>(self, receiver: R) -> PoolScheduleOp<R>
    where
        R: Receiver<Value = ()>,
    {
        PoolScheduleOp { shared: self.shared, receiver }
    }

    fn completion_scheduler(&self) -> Option<AnyScheduler> {
        Some(AnyScheduler::new(PoolScheduler { shared: self.shared.clone() }))
    }
}

pub struct PoolScheduleOp<R> {
    shared: Arc<PoolShared>,
    receiver: R,
}

impl<R> Operation for PoolScheduleOp<R>
where
    R: Receiver<Value = ()>,
{
    fn start(self) {
        let token = self.receiver.env().stop_token();
        let receiver = self.receiver;
        self.shared.enqueue(Box::new(move |signal| match signal {
            Signal::Deliver if !token.stop_requested() => receiver.set_value(()),
            _ => receiver.set_stopped(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::exec::sync_wait;
    use crate::senders::{SenderExt, when_all};

    /// Scheduled work runs on a pool worker, not the submitting thread.
    #[test]
    fn test_runs_on_worker() {
        let pool = StaticThreadPool::new(2);
        let sched = pool.scheduler();
        let here = std::thread::current().id();
        let there = sync_wait(sched.schedule().map(|()| std::thread::current().id()))
            .unwrap()
            .unwrap();
        assert_ne!(here, there);
    }

    /// Every submitted task runs exactly once, across many submissions.
    #[test]
    fn test_all_tasks_run() {
        let pool = StaticThreadPool::new(4);
        let sched = pool.scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut waits = Vec::new();
        for _ in 0..256 {
            let hits = hits.clone();
            let sched = sched.clone();
            waits.push(std::thread::spawn(move || {
                sync_wait(sched.schedule().map(move |()| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
            }));
        }
        for w in waits {
            w.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 256);
    }

    /// With enough submissions, more than one worker participates.
    #[test]
    fn test_work_spreads() {
        let pool = StaticThreadPool::new(4);
        let sched = pool.scheduler();
        let seen = Arc::new(Mutex::new(HashSet::new()));
        for _ in 0..64 {
            let seen = seen.clone();
            sync_wait(sched.schedule().map(move |()| {
                seen.lock().unwrap().insert(std::thread::current().id());
            }))
            .unwrap();
        }
        assert!(seen.lock().unwrap().len() > 1);
    }

    /// Submissions after `finish` complete stopped instead of hanging.
    #[test]
    fn test_schedule_after_finish_is_stopped() {
        let pool = StaticThreadPool::new(2);
        let sched = pool.scheduler();
        pool.finish();
        let out = sync_wait(sched.schedule()).unwrap();
        assert_eq!(out, None);
    }

    /// The pool drives independent children of a join concurrently.
    #[test]
    fn test_when_all_on_pool() {
        let pool = StaticThreadPool::new(num_cpus::get().max(2));
        let sched = pool.scheduler();
        let snd = when_all((
            sched.schedule().map(|()| 1u64),
            sched.schedule().map(|()| 2u64),
            sched.schedule().map(|()| 3u64),
        ));
        let (a, b, c) = sync_wait(snd).unwrap().unwrap();
        assert_eq!(a + b + c, 6);
    }
}
