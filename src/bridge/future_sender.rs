//! Running a future as a sender on an inline poll loop.
//!
//! The operation state is a reference-counted task polled on whichever
//! thread wakes it, with no executor in between. Exclusive access to the
//! future is arbitrated by a small atomic state machine instead of a lock,
//! because a future may wake itself synchronously from inside `poll`:
//!
//! ```text
//!          wake             poll → Pending
//!   IDLE ───────► RUNNING ────────────────► IDLE
//!                 │  ▲ │
//!          wake   │  │ │ poll → Ready / panic / stop
//!                 ▼  │ ▼
//!              REPOLL│DONE
//! ```
//!
//! A wake during `RUNNING` parks a `REPOLL` request that the polling
//! thread consumes before going idle, so no wakeup is lost and no thread
//! ever blocks on another's poll.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::task::{self, ArcWake};

use crate::error::TaskPanic;
use crate::exec::env::Environment;
use crate::exec::{Operation, Outcome, Receiver, Sender};
use crate::stop::{StopCallback, StopToken};

/// Runs `future` as a sender completing with the future's output.
///
/// The future starts executing when the operation is started and makes
/// progress on the threads that wake it. A stop request interrupts it at
/// the next suspension point: the registered callback wakes the loop,
/// which observes the token and completes with `set_stopped`, dropping the
/// future. Panics while polling are caught and delivered as errors.
pub fn from_future<F>(future: F) -> FromFuture<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    FromFuture { future }
}

/// Like [`from_future`], for futures returning `Result`: `Ok` completes
/// with the value, `Err` completes on the error channel.
pub fn try_from_future<F, T, E>(future: F) -> TryFromFuture<F>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    TryFromFuture { future }
}

pub struct FromFuture<F> {
    future: F,
}

impl<F> Sender for FromFuture<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    type Value = F::Output;

    type Operation<R>
        = FutureOp<F, R, fn(F::Output) -> Outcome<F::Output>>
    where
        R: Receiver<Value = F::Output>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = F::Output>,
    {
        FutureOp::new(self.future, receiver, Outcome::Value)
    }
}

pub struct TryFromFuture<F> {
    future: F,
}

impl<F, T, E> Sender for TryFromFuture<F>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Value = T;

    type Operation<R>
        = FutureOp<F, R, fn(Result<T, E>) -> Outcome<T>>
    where
        R: Receiver<Value = T>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = T>,
    {
        FutureOp::new(self.future, receiver, result_to_outcome)
    }
}

pub(crate) fn result_to_outcome<T, E>(result: Result<T, E>) -> Outcome<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match result {
        Ok(value) => Outcome::Value(value),
        Err(error) => Outcome::Error(Box::new(error)),
    }
}

pub struct FutureOp<F, R, M> {
    future: F,
    receiver: R,
    map: M,
}

impl<F, R, M> FutureOp<F, R, M> {
    pub(crate) fn new(future: F, receiver: R, map: M) -> Self {
        Self { future, receiver, map }
    }
}

impl<F, R, M> Operation for FutureOp<F, R, M>
where
    F: Future + Send + 'static,
    R: Receiver,
    R::Value: Send + 'static,
    M: FnOnce(F::Output) -> Outcome<R::Value> + Send + 'static,
{
    fn start(self) {
        let token = self.receiver.env().stop_token();
        let task = Arc::new(InlineTask {
            state: AtomicU8::new(IDLE),
            token: token.clone(),
            stop_cb: Mutex::new(None),
            cell: UnsafeCell::new(Cell {
                future: Some(self.future),
                receiver: Some(self.receiver),
                map: Some(self.map),
            }),
        });
        // First poll happens before the callback is registered: a request
        // landing in between is still observed, because the callback runs
        // inline at registration and re-enters the loop.
        InlineTask::resume(&task);
        let cb = StopCallback::new(&token, {
            let task = task.clone();
            move || InlineTask::resume(&task)
        });
        let slot = task.stop_cb.lock().unwrap_or_else(PoisonError::into_inner);
        if task.state.load(Ordering::Acquire) == DONE {
            // Finished while we registered; keeping the registration would
            // tie the task into a cycle with its own callback.
            drop(slot);
            drop(cb);
        } else {
            let mut slot = slot;
            *slot = Some(cb);
        }
    }
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const REPOLL: u8 = 2;
const DONE: u8 = 3;

struct Cell<F, R, M> {
    future: Option<F>,
    receiver: Option<R>,
    map: Option<M>,
}

struct InlineTask<F, R, M> {
    state: AtomicU8,
    token: StopToken,
    /// Kept outside `cell` so registration can race task completion
    /// without touching the exclusively-owned part.
    stop_cb: Mutex<Option<StopCallback>>,
    cell: UnsafeCell<Cell<F, R, M>>,
}

// The cell is only touched by the thread holding the RUNNING state.
unsafe impl<F: Send, R: Send, M: Send> Send for InlineTask<F, R, M> {}
unsafe impl<F: Send, R: Send, M: Send> Sync for InlineTask<F, R, M> {}

impl<F, R, M> InlineTask<F, R, M>
where
    F: Future + Send + 'static,
    R: Receiver,
    R::Value: Send + 'static,
    M: FnOnce(F::Output) -> Outcome<R::Value> + Send + 'static,
{
    /// Requests a poll: takes the loop if it is idle, or parks a repoll
    /// request for the thread that currently holds it.
    fn resume(this: &Arc<Self>) {
        loop {
            match this.state.load(Ordering::Acquire) {
                IDLE => {
                    if this
                        .state
                        .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        Self::run(this);
                        return;
                    }
                }
                RUNNING => {
                    if this
                        .state
                        .compare_exchange(RUNNING, REPOLL, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return, // REPOLL already parked, or DONE
            }
        }
    }

    /// The poll loop; the caller owns the RUNNING state.
    fn run(this: &Arc<Self>) {
        loop {
            if this.token.stop_requested() {
                Self::complete(this, Outcome::Stopped);
                return;
            }
            let waker = task::waker_ref(this);
            let mut cx = Context::from_waker(&waker);
            // Exclusive: only the RUNNING holder touches the cell, and the
            // future never moves out of the Arc until dropped in place.
            let polled = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
                let cell = &mut *this.cell.get();
                let future = cell.future.as_mut().expect("task polled after completion");
                Pin::new_unchecked(future).poll(&mut cx)
            }));
            match polled {
                Err(payload) => {
                    Self::complete(this, Outcome::Error(TaskPanic::from_payload(payload)));
                    return;
                }
                Ok(Poll::Ready(output)) => {
                    let map = unsafe { (*this.cell.get()).map.take() }
                        .expect("task completed twice");
                    Self::complete(this, map(output));
                    return;
                }
                Ok(Poll::Pending) => {
                    match this.state.compare_exchange(
                        RUNNING,
                        IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(_) => {
                            // A repoll was parked while we were polling.
                            this.state.store(RUNNING, Ordering::Release);
                        }
                    }
                }
            }
        }
    }

    fn complete(this: &Arc<Self>, outcome: Outcome<R::Value>) {
        let receiver = unsafe {
            let cell = &mut *this.cell.get();
            // Dropped in place; the future stays pinned until the end.
            cell.future = None;
            cell.receiver.take().expect("task completed twice")
        };
        this.state.store(DONE, Ordering::Release);
        // Deregister before delivering: blocks out a cancellation callback
        // still holding its token registration (the same-thread case, a
        // callback completing its own task, is resolved by the stop
        // protocol's removed-during-execution handling).
        let cb = this.stop_cb.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(cb);
        outcome.send_to(receiver);
    }
}

impl<F, R, M> ArcWake for InlineTask<F, R, M>
where
    F: Future + Send + 'static,
    R: Receiver,
    R::Value: Send + 'static,
    M: FnOnce(F::Output) -> Outcome<R::Value> + Send + 'static,
{
    fn wake_by_ref(arc_self: &Arc<Self>) {
        Self::resume(arc_self);
    }
}
