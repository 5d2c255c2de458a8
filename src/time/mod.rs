//! Timer loop: deadline-ordered execution context.
//!
//! A [`TimerLoop`] stores pending deadlines in a red-black tree keyed by
//! `(deadline, insertion order)` and sleeps until the cached minimum is
//! due. Its scheduler is a [`Scheduler`] whose plain `schedule` completes
//! as soon as the loop thread gets to it, plus the timed variants
//! [`TimerScheduler::schedule_after`] and [`TimerScheduler::schedule_at`].
//!
//! Cancellation re-keys the entry to *now* and marks it cancelled, so the
//! loop thread resurfaces promptly and delivers `set_stopped` instead of
//! letting the original deadline play out. This is what makes
//! timeout-by-race patterns settle quickly: the losing long timer is
//! re-keyed the moment the race cancels it.
//!
//! Shutdown contract: [`finish`](TimerLoop::finish) makes
//! [`run`](TimerLoop::run) return without waiting for pending deadlines;
//! dropping the loop completes whatever is still queued with
//! `set_stopped`.

mod tree;

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::exec::env::Environment;
use crate::exec::{AnyScheduler, Operation, Receiver, Scheduler, Sender};
use crate::stop::StopCallback;
use tree::RbTree;

/// Completion routine of a queued timer; the flag is `true` when the entry
/// was cancelled or the context is shutting down.
type Fire = Box<dyn FnOnce(bool) + Send>;

struct Entry {
    id: u64,
    cancelled: bool,
    fire: Option<Fire>,
    stop_cb: Option<StopCallback>,
}

struct Tree {
    tree: RbTree<(Instant, u64), Entry>,
    next_id: u64,
    finishing: bool,
}

struct TimerState {
    tree: Mutex<Tree>,
    cv: Condvar,
}

impl TimerState {
    fn lock(&self) -> std::sync::MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a deadline, returning a handle for cancellation; when the
    /// loop is finishing the routine is handed back instead.
    fn enqueue(&self, deadline: Instant, fire: Fire) -> Result<(usize, u64), Fire> {
        let (slot, id, is_min) = {
            let mut tree = self.lock();
            if tree.finishing {
                return Err(fire);
            }
            let id = tree.next_id;
            tree.next_id += 1;
            let entry = Entry { id, cancelled: false, fire: Some(fire), stop_cb: None };
            let slot = tree.tree.insert((deadline, id), entry);
            (slot, id, tree.tree.min_slot() == Some(slot))
        };
        if is_min {
            self.cv.notify_one();
        }
        trace!(id, "timer queued");
        Ok((slot, id))
    }

    /// Stores the cancellation registration in a still-queued entry, or
    /// hands it back when the entry already fired.
    fn attach_stop_cb(&self, slot: usize, id: u64, cb: StopCallback) -> Option<StopCallback> {
        let mut tree = self.lock();
        match tree.tree.get_mut(slot) {
            Some((_, entry)) if entry.id == id => {
                entry.stop_cb = Some(cb);
                None
            }
            _ => Some(cb),
        }
    }

    /// Re-keys a queued entry to fire immediately as cancelled.
    fn cancel(&self, slot: usize, id: u64) {
        {
            let mut tree = self.lock();
            let valid = matches!(tree.tree.get(slot), Some((_, entry)) if entry.id == id);
            if !valid {
                return;
            }
            let (_, mut entry) = tree.tree.remove(slot);
            entry.cancelled = true;
            let reinsert_id = tree.next_id;
            tree.next_id += 1;
            tree.tree.insert((Instant::now(), reinsert_id), entry);
            trace!(id, "timer cancelled");
        }
        self.cv.notify_one();
    }

    /// Blocks until the earliest deadline is due, returning its entry;
    /// `None` means the loop is finishing.
    fn dequeue(&self) -> Option<Entry> {
        let mut tree = self.lock();
        loop {
            if tree.finishing {
                return None;
            }
            let Some(min) = tree.tree.min_slot() else {
                tree = self.cv.wait(tree).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let (deadline, _) = *tree.tree.get(min).expect("minimum slot is occupied").0;
            let now = Instant::now();
            if deadline <= now {
                let (_, entry) = tree.tree.remove(min);
                return Some(entry);
            }
            // Sleep until the cached minimum; a new minimum or a finish
            // request wakes us early.
            let (guard, _) = self
                .cv
                .wait_timeout(tree, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            tree = guard;
        }
    }
}

/// A deadline-driven execution context.
pub struct TimerLoop {
    state: Arc<TimerState>,
}

impl TimerLoop {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TimerState {
                tree: Mutex::new(Tree { tree: RbTree::new(), next_id: 0, finishing: false }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Delivers due timers on the calling thread until [`finish`] is
    /// called.
    ///
    /// [`finish`]: TimerLoop::finish
    pub fn run(&self) {
        while let Some(mut entry) = self.state.dequeue() {
            // Deregistration happens outside the tree lock; it may have to
            // wait out a cancellation callback that is mid-flight.
            drop(entry.stop_cb.take());
            if let Some(fire) = entry.fire.take() {
                fire(entry.cancelled);
            }
        }
        trace!("timer loop exiting");
    }

    /// Makes `run` return promptly; pending deadlines stay queued until
    /// the loop is dropped, which completes them with `set_stopped`.
    pub fn finish(&self) {
        self.state.lock().finishing = true;
        self.state.cv.notify_all();
    }

    /// A scheduler submitting deadlines to this loop.
    pub fn scheduler(&self) -> TimerScheduler {
        TimerScheduler { state: self.state.clone() }
    }
}

impl Default for TimerLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerLoop {
    fn drop(&mut self) {
        self.finish();
        let mut leftovers = Vec::new();
        {
            let mut tree = self.state.lock();
            while let Some((_, entry)) = tree.tree.pop_min() {
                leftovers.push(entry);
            }
        }
        for mut entry in leftovers {
            drop(entry.stop_cb.take());
            if let Some(fire) = entry.fire.take() {
                fire(true);
            }
        }
    }
}

/// Scheduler handle of a [`TimerLoop`].
#[derive(Clone)]
pub struct TimerScheduler {
    state: Arc<TimerState>,
}

impl TimerScheduler {
    /// A sender completing on the loop thread once `delay` has elapsed
    /// (measured from `start`).
    pub fn schedule_after(&self, delay: Duration) -> TimerSchedule {
        TimerSchedule { state: self.state.clone(), when: When::After(delay) }
    }

    /// A sender completing on the loop thread at `deadline`; a deadline in
    /// the past fires as soon as the loop thread gets to it.
    pub fn schedule_at(&self, deadline: Instant) -> TimerSchedule {
        TimerSchedule { state: self.state.clone(), when: When::At(deadline) }
    }
}

impl Scheduler for TimerScheduler {
    type ScheduleSender = TimerSchedule;

    fn schedule(&self) -> TimerSchedule {
        TimerSchedule { state: self.state.clone(), when: When::Immediate }
    }
}

#[derive(Clone, Copy)]
enum When {
    Immediate,
    After(Duration),
    At(Instant),
}

impl When {
    fn resolve(self, now: Instant) -> Instant {
        match self {
            When::Immediate => now,
            When::After(delay) => now + delay,
            When::At(deadline) => deadline,
        }
    }
}

/// Sender completing on the timer thread at its deadline, or earlier with
/// `set_stopped` when cancelled.
pub struct TimerSchedule {
    state: Arc<TimerState>,
    when: When,
}

impl Sender for TimerSchedule {
    type Value = ();

    type Operation<R>
        = TimerScheduleOp<R>
    where
        R: Receiver<Value = ()>;

    fn connect<R>(self, receiver: R) -> TimerScheduleOp<R>
    where
        R: Receiver<Value = ()>,
    {
        TimerScheduleOp { state: self.state, when: self.when, receiver }
    }

    fn completion_scheduler(&self) -> Option<AnyScheduler> {
        Some(AnyScheduler::new(TimerScheduler { state: self.state.clone() }))
    }
}

pub struct TimerScheduleOp<R> {
    state: Arc<TimerState>,
    when: When,
    receiver: R,
}

impl<R> Operation for TimerScheduleOp<R>
where
    R: Receiver<Value = ()>,
{
    fn start(self) {
        let deadline = self.when.resolve(Instant::now());
        let token = self.receiver.env().stop_token();
        let receiver = self.receiver;
        let fire: Fire = {
            let token = token.clone();
            Box::new(move |cancelled| {
                if cancelled || token.stop_requested() {
                    receiver.set_stopped();
                } else {
                    receiver.set_value(());
                }
            })
        };

        let (slot, id) = match self.state.enqueue(deadline, fire) {
            Ok(handle) => handle,
            Err(fire) => {
                // Loop is finishing; release the receiver as stopped.
                fire(true);
                return;
            }
        };

        // Registering after the insert keeps the inline-execution case
        // simple: a token that is already requested cancels the entry we
        // just queued.
        let cb = StopCallback::new(&token, {
            let state = Arc::downgrade(&self.state);
            move || {
                if let Some(state) = state.upgrade() {
                    state.cancel(slot, id);
                }
            }
        });
        if let Some(cb) = self.state.attach_stop_cb(slot, id, cb) {
            // Entry already fired; the registration just deregisters.
            drop(cb);
        }
    }
}
