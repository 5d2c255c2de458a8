//! Single-threaded run loop.
//!
//! A [`RunLoop`] is a FIFO of scheduled work drained by whichever thread
//! calls [`RunLoop::run`]. The loop's [`scheduler`](RunLoop::scheduler)
//! produces senders that complete with `()` on the running thread, or with
//! `set_stopped` when the receiver's stop token is already requested at the
//! moment the item is dequeued.
//!
//! Shutdown contract: call [`finish`](RunLoop::finish), after which `run`
//! drains the remaining items and returns. Work scheduled after `finish`
//! completes immediately with `set_stopped` on the scheduling thread.
//! Dropping a loop that still holds work and never entered the finishing
//! state is a contract violation and panics.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tracing::trace;

use crate::exec::env::Environment;
use crate::exec::{AnyScheduler, Operation, Receiver, Scheduler, Sender, Signal, Work};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Idle,
    Running,
    Finishing,
}

struct Queue {
    items: VecDeque<Work>,
    phase: Phase,
}

struct State {
    queue: Mutex<Queue>,
    cv: Condvar,
}

impl State {
    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `work`, or returns it when the loop is finishing.
    fn enqueue(&self, work: Work) -> Result<(), Work> {
        {
            let mut queue = self.lock();
            if queue.phase == Phase::Finishing {
                return Err(work);
            }
            queue.items.push_back(work);
        }
        self.cv.notify_one();
        Ok(())
    }

    fn dequeue(&self) -> Option<Work> {
        let mut queue = self.lock();
        loop {
            if let Some(work) = queue.items.pop_front() {
                return Some(work);
            }
            if queue.phase == Phase::Finishing {
                return None;
            }
            queue = self.cv.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// A single-threaded execution context.
pub struct RunLoop {
    state: Arc<State>,
}

impl RunLoop {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                queue: Mutex::new(Queue { items: VecDeque::new(), phase: Phase::Idle }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Drains scheduled work on the calling thread until [`finish`] has
    /// been called and the queue is exhausted.
    ///
    /// [`finish`]: RunLoop::finish
    pub fn run(&self) {
        {
            // A finish that won the race to the lock stays in force.
            let mut queue = self.state.lock();
            if queue.phase == Phase::Idle {
                queue.phase = Phase::Running;
            }
        }
        trace!("run loop entering");
        while let Some(work) = self.state.dequeue() {
            work(Signal::Deliver);
        }
        trace!("run loop exhausted");
    }

    /// Tells `run` to return once the queue is drained.
    pub fn finish(&self) {
        self.state.lock().phase = Phase::Finishing;
        self.cv_notify_all();
    }

    fn cv_notify_all(&self) {
        self.state.cv.notify_all();
    }

    /// A scheduler submitting to this loop.
    pub fn scheduler(&self) -> LoopScheduler {
        LoopScheduler { state: self.state.clone() }
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        let queue = self.state.lock();
        if !queue.items.is_empty() && queue.phase != Phase::Finishing {
            drop(queue);
            panic!("run loop dropped with pending work; call finish() and drain with run()");
        }
        // Anything left after `finish` is released as a shutdown.
        drop(queue);
        let leftovers: Vec<Work> = {
            let mut queue = self.state.lock();
            queue.items.drain(..).collect()
        };
        for work in leftovers {
            work(Signal::Shutdown);
        }
    }
}

/// Scheduler handle of a [`RunLoop`].
#[derive(Clone)]
pub struct LoopScheduler {
    state: Arc<State>,
}

impl Scheduler for LoopScheduler {
    type ScheduleSender = LoopSchedule;

    fn schedule(&self) -> LoopSchedule {
        LoopSchedule { state: self.state.clone() }
    }
}

/// Sender completing on the loop's running thread.
pub struct LoopSchedule {
    state: Arc<State>,
}

impl Sender for LoopSchedule {
    type Value = ();

    type Operation<R>
        = LoopScheduleOp<R>
    where
        R: Receiver<Value = ()>;

    fn connect<R>(self, receiver: R) -> LoopScheduleOp<R>
    where
        R: Receiver<Value = ()>,
    {
        LoopScheduleOp { state: self.state, receiver }
    }

    fn completion_scheduler(&self) -> Option<AnyScheduler> {
        Some(AnyScheduler::new(LoopScheduler { state: self.state.clone() }))
    }
}

pub struct LoopScheduleOp<R> {
    state: Arc<State>,
    receiver: R,
}

impl<R> Operation for LoopScheduleOp<R>
where
    R: Receiver<Value = ()>,
{
    fn start(self) {
        let token = self.receiver.env().stop_token();
        let receiver = self.receiver;
        let work: Work = Box::new(move |signal| match signal {
            Signal::Deliver if !token.stop_requested() => receiver.set_value(()),
            _ => receiver.set_stopped(),
        });
        if let Err(work) = self.state.enqueue(work) {
            // Loop is finishing: the context will never pick us up.
            work(Signal::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::exec::sync_wait;
    use crate::senders::SenderExt;
    use crate::stop::StopSource;

    /// Scheduled work runs on the thread that called `run`.
    #[test]
    fn test_runs_on_loop_thread() {
        let lp = RunLoop::new();
        let sched = lp.scheduler();
        thread::scope(|s| {
            let driver = s.spawn(|| {
                lp.run();
                thread::current().id()
            });
            let out = sync_wait(sched.schedule().map(|()| thread::current().id())).unwrap();
            lp.finish();
            let loop_thread = driver.join().unwrap();
            assert_eq!(out, Some(loop_thread));
        });
    }

    /// `finish` lets `run` return after draining queued work.
    #[test]
    fn test_finish_drains() {
        let lp = RunLoop::new();
        let sched = lp.scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        thread::scope(|s| {
            let driver = s.spawn(|| lp.run());
            for _ in 0..8 {
                let hits = Arc::clone(&hits);
                sync_wait(sched.schedule().map(move |()| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
            }
            lp.finish();
            driver.join().unwrap();
        });
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }

    /// An already-requested token turns the delivery into a stop.
    #[test]
    fn test_stop_observed_at_dequeue() {
        let src = StopSource::new();
        src.request_stop();
        let lp = RunLoop::new();
        let sched = lp.scheduler();
        let out = thread::scope(|s| {
            s.spawn(|| lp.run());
            let out = sync_wait(sched.schedule().with_stop_token(src.token())).unwrap();
            lp.finish();
            out
        });
        assert_eq!(out, None);
    }

    /// Work scheduled after `finish` completes stopped instead of hanging.
    #[test]
    fn test_schedule_after_finish_is_stopped() {
        let lp = RunLoop::new();
        let sched = lp.scheduler();
        thread::scope(|s| {
            let driver = s.spawn(|| lp.run());
            lp.finish();
            driver.join().unwrap();
        });
        let out = sync_wait(sched.schedule()).unwrap();
        assert_eq!(out, None);
    }
}
