//! Lazy coroutine-style tasks.

use crate::exec::env::Environment;
use crate::exec::{Outcome, Receiver, Sender};
use crate::stop::StopToken;

use super::future_sender::FutureOp;

/// Context handed to a task body when the task is connected.
///
/// Carries the stop token inherited from the awaiting receiver's
/// environment, so a body can poll for cancellation at its own pace in
/// addition to the prompt stop delivered at suspension points.
#[derive(Clone, Debug)]
pub struct TaskContext {
    token: StopToken,
}

impl TaskContext {
    pub fn stop_token(&self) -> StopToken {
        self.token.clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.token.stop_requested()
    }
}

/// A lazy task: `f` receives the context and returns the future to run.
///
/// Nothing executes at construction or connection; the future is built at
/// connect time (when the parent's environment is known) and starts
/// polling when the operation starts.
pub fn task<F, Fut>(f: F) -> Task<F>
where
    F: FnOnce(TaskContext) -> Fut + Send,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    Task { f }
}

/// Like [`task`], for bodies returning `Result`; `Err` completes on the
/// error channel.
pub fn try_task<F, Fut, T, E>(f: F) -> TryTask<F>
where
    F: FnOnce(TaskContext) -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    TryTask { f }
}

pub struct Task<F> {
    f: F,
}

impl<F, Fut> Sender for Task<F>
where
    F: FnOnce(TaskContext) -> Fut + Send,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    type Value = Fut::Output;

    type Operation<R>
        = FutureOp<Fut, R, fn(Fut::Output) -> Outcome<Fut::Output>>
    where
        R: Receiver<Value = Fut::Output>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = Fut::Output>,
    {
        let ctx = TaskContext { token: receiver.env().stop_token() };
        let future = (self.f)(ctx);
        FutureOp::new(future, receiver, Outcome::Value)
    }
}

pub struct TryTask<F> {
    f: F,
}

impl<F, Fut, T, E> Sender for TryTask<F>
where
    F: FnOnce(TaskContext) -> Fut + Send,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Value = T;

    type Operation<R>
        = FutureOp<Fut, R, fn(Result<T, E>) -> Outcome<T>>
    where
        R: Receiver<Value = T>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = T>,
    {
        let ctx = TaskContext { token: receiver.env().stop_token() };
        let future = (self.f)(ctx);
        FutureOp::new(future, receiver, super::future_sender::result_to_outcome)
    }
}
