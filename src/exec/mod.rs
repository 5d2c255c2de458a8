//! The sender/receiver execution protocol.
//!
//! A [`Sender`] *describes* an asynchronous operation. Connecting it to a
//! [`Receiver`] materializes an [`Operation`]; starting the operation
//! launches it. The operation eventually delivers exactly one completion
//! signal to the receiver:
//!
//! ```text
//!   Sender ──connect(receiver)──► Operation ──start()──► ...
//!                                                         │
//!                    ┌────────────────────────────────────┤
//!                    ▼                 ▼                  ▼
//!            set_value(value)   set_error(error)    set_stopped()
//! ```
//!
//! Receivers carry an [`Environment`](env::Environment): a queryable record
//! of attributes (stop token, current scheduler) that flows *down* the
//! pipeline from consumer to producer, which is how cancellation reaches
//! leaf operations.
//!
//! Operations are consumed by [`Operation::start`]: everything that must
//! outlive the call moves into context queues, waiter nodes or shared
//! records. The completion contract is unaffected: after `start`, exactly
//! one of the three signals is delivered exactly once, on some thread at
//! some time.

pub mod env;

mod any_scheduler;
mod sync_wait;

pub use any_scheduler::AnyScheduler;
pub use sync_wait::sync_wait;

use crate::error::BoxError;
use env::Environment;

/// A description of an asynchronous operation.
///
/// `Value` is the payload of the value completion (a tuple when the
/// operation logically produces several values). Errors are type-erased
/// [`BoxError`]s; the stopped channel carries no payload.
pub trait Sender: Send + Sized {
    type Value: Send + 'static;

    type Operation<R>: Operation
    where
        R: Receiver<Value = Self::Value>;

    /// Materializes an operation bound to `receiver`.
    ///
    /// Must not start any work.
    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = Self::Value>;

    /// The scheduler this sender completes on, when it advertises one.
    fn completion_scheduler(&self) -> Option<AnyScheduler> {
        None
    }
}

/// Completion-signal bundle with an environment.
pub trait Receiver: Send + Sized + 'static {
    type Value;
    type Env: Environment;

    fn env(&self) -> &Self::Env;

    fn set_value(self, value: Self::Value);
    fn set_error(self, error: BoxError);
    fn set_stopped(self);
}

/// A materialized sender/receiver pairing.
pub trait Operation {
    /// Launches the operation, consuming the state.
    ///
    /// The receiver hears back exactly once, possibly before `start`
    /// returns (inline completion) or later from another thread.
    fn start(self);
}

/// Factory for senders that complete on a particular execution context.
pub trait Scheduler: Clone + Send + Sync + 'static {
    type ScheduleSender: Sender<Value = ()>;

    /// A sender that completes with `()` on this scheduler's context, or
    /// with `set_stopped` when the receiver's stop token is already
    /// requested at delivery time.
    fn schedule(&self) -> Self::ScheduleSender;
}

/// The result of a completed operation: the three completion signals
/// collapsed back into one value. Used by consumers that need to store or
/// forward a completion as data (`sync_wait`, the future bridge, the
/// scope's eager futures).
#[derive(Debug)]
pub enum Outcome<T> {
    Value(T),
    Error(BoxError),
    Stopped,
}

impl<T> Outcome<T> {
    /// Delivers this outcome to `receiver` on the matching channel.
    pub(crate) fn send_to<R>(self, receiver: R)
    where
        R: Receiver<Value = T>,
    {
        match self {
            Outcome::Value(value) => receiver.set_value(value),
            Outcome::Error(error) => receiver.set_error(error),
            Outcome::Stopped => receiver.set_stopped(),
        }
    }
}

/// How a queued work item is being released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Normal delivery on the context's thread.
    Deliver,
    /// The context is shutting down; complete with `set_stopped`.
    Shutdown,
}

/// A unit of work queued on an execution context.
pub(crate) type Work = Box<dyn FnOnce(Signal) + Send>;
