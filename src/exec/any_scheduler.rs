//! Type-erased scheduler.
//!
//! Erases a concrete [`Scheduler`] behind an `Arc`, so heterogeneous
//! contexts (run loop, thread pool, timer loop) can be stored in one field
//! or threaded through an environment query. Scheduling through the erased
//! layer costs one allocation per submitted item.

use std::fmt;
use std::sync::Arc;

use crate::error::BoxError;
use crate::exec::env::Empty;
use crate::exec::{Operation, Receiver, Scheduler, Sender, Signal, Work};

/// A cloneable handle to some execution context.
#[derive(Clone)]
pub struct AnyScheduler {
    inner: Arc<dyn ErasedScheduler>,
}

impl AnyScheduler {
    pub fn new<S: Scheduler>(scheduler: S) -> Self {
        Self { inner: Arc::new(Erased(scheduler)) }
    }

    /// Two handles are the same scheduler when they erase the same
    /// underlying object.
    pub fn same_context(&self, other: &AnyScheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for AnyScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AnyScheduler")
    }
}

impl Scheduler for AnyScheduler {
    type ScheduleSender = AnySchedule;

    fn schedule(&self) -> AnySchedule {
        AnySchedule { inner: self.inner.clone() }
    }
}

/// Sender completing on the erased context.
pub struct AnySchedule {
    inner: Arc<dyn ErasedScheduler>,
}

impl Sender for AnySchedule {
    type Value = ();

    type Operation<R>
        = AnyScheduleOp<R>
    where
        R: Receiver<Value = ()>;

    fn connect<R>(self, receiver: R) -> AnyScheduleOp<R>
    where
        R: Receiver<Value = ()>,
    {
        AnyScheduleOp { inner: self.inner, receiver }
    }

    fn completion_scheduler(&self) -> Option<AnyScheduler> {
        Some(AnyScheduler { inner: self.inner.clone() })
    }
}

pub struct AnyScheduleOp<R> {
    inner: Arc<dyn ErasedScheduler>,
    receiver: R,
}

impl<R> Operation for AnyScheduleOp<R>
where
    R: Receiver<Value = ()>,
{
    fn start(self) {
        use crate::exec::env::Environment;
        let token = self.receiver.env().stop_token();
        let receiver = self.receiver;
        self.inner.schedule_work(Box::new(move |signal| match signal {
            Signal::Deliver if !token.stop_requested() => receiver.set_value(()),
            _ => receiver.set_stopped(),
        }));
    }
}

trait ErasedScheduler: Send + Sync {
    fn schedule_work(&self, work: Work);
}

struct Erased<S>(S);

impl<S: Scheduler> ErasedScheduler for Erased<S> {
    fn schedule_work(&self, work: Work) {
        self.0.schedule().connect(WorkReceiver { work, env: Empty }).start();
    }
}

/// Adapts a queued work item to the receiver protocol of the concrete
/// context. Scheduler senders never deliver errors in this crate, but the
/// contract is honoured by treating one as a shutdown.
struct WorkReceiver {
    work: Work,
    env: Empty,
}

impl Receiver for WorkReceiver {
    type Value = ();
    type Env = Empty;

    fn env(&self) -> &Empty {
        &self.env
    }

    fn set_value(self, (): ()) {
        (self.work)(Signal::Deliver);
    }

    fn set_error(self, _error: BoxError) {
        (self.work)(Signal::Shutdown);
    }

    fn set_stopped(self) {
        (self.work)(Signal::Shutdown);
    }
}
