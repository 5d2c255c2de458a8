//! Awaiting a sender from any executor.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use crate::error::{BoxError, WaitError};
use crate::exec::env::{Empty, WithStopToken};
use crate::exec::{Operation, Outcome, Receiver, Sender};
use crate::stop::StopToken;

/// A future resolving to the sender's completion.
///
/// The sender is connected and started on first poll; until then the
/// pipeline does nothing, matching the laziness of the underlying
/// protocol. The one-shot receiver stores the outcome in a shared slot and
/// wakes the awaiting task.
///
/// # Cancellation
///
/// Dropping the future after the first poll does *not* cancel the
/// in-flight operation; it merely discards the outcome on arrival. To
/// cancel, pass a token with [`with_stop_token`](Self::with_stop_token)
/// and request stop on its source.
#[must_use = "futures do nothing unless polled"]
pub struct SenderFuture<S: Sender> {
    inner: Inner<S>,
}

enum Inner<S: Sender> {
    Idle { sender: S, token: StopToken },
    Started(Arc<Slot<S::Value>>),
    Finished,
}

/// Safe: the future owns its state by value; nothing borrows across polls.
impl<S: Sender> Unpin for SenderFuture<S> {}

impl<S: Sender> SenderFuture<S> {
    pub(crate) fn new(sender: S) -> Self {
        Self { inner: Inner::Idle { sender, token: StopToken::never() } }
    }

    /// Installs `token` as the stop token the pipeline observes.
    ///
    /// Has no effect once the future has been polled.
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        if let Inner::Idle { token: slot, .. } = &mut self.inner {
            *slot = token;
        }
        self
    }
}

impl<S: Sender> Future for SenderFuture<S> {
    type Output = Result<S::Value, WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.inner, Inner::Finished) {
            Inner::Idle { sender, token } => {
                let slot = Arc::new(Slot {
                    state: Mutex::new(SlotState { outcome: None, waker: Some(cx.waker().clone()) }),
                });
                let receiver = SlotReceiver {
                    slot: slot.clone(),
                    env: WithStopToken::new(Empty, token),
                };
                sender.connect(receiver).start();
                // The operation may have completed inline on this thread.
                Self::check(slot, &mut this.inner, cx)
            }
            Inner::Started(slot) => Self::check(slot, &mut this.inner, cx),
            Inner::Finished => panic!("SenderFuture polled after completion"),
        }
    }
}

impl<S: Sender> SenderFuture<S> {
    fn check(
        slot: Arc<Slot<S::Value>>,
        inner: &mut Inner<S>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<S::Value, WaitError>> {
        let outcome = {
            let mut state = slot.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.outcome.take() {
                Some(outcome) => Some(outcome),
                None => {
                    state.waker = Some(cx.waker().clone());
                    None
                }
            }
        };
        match outcome {
            Some(Outcome::Value(value)) => Poll::Ready(Ok(value)),
            Some(Outcome::Error(error)) => Poll::Ready(Err(WaitError::Failed(error))),
            Some(Outcome::Stopped) => Poll::Ready(Err(WaitError::Stopped)),
            None => {
                *inner = Inner::Started(slot);
                Poll::Pending
            }
        }
    }
}

struct SlotState<T> {
    outcome: Option<Outcome<T>>,
    waker: Option<Waker>,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
}

impl<T> Slot<T> {
    fn fulfill(&self, outcome: Outcome<T>) {
        let waker = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            debug_assert!(state.outcome.is_none(), "operation completed twice");
            state.outcome = Some(outcome);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct SlotReceiver<T> {
    slot: Arc<Slot<T>>,
    env: WithStopToken<Empty>,
}

impl<T: Send + 'static> Receiver for SlotReceiver<T> {
    type Value = T;
    type Env = WithStopToken<Empty>;

    fn env(&self) -> &Self::Env {
        &self.env
    }

    fn set_value(self, value: T) {
        self.slot.fulfill(Outcome::Value(value));
    }

    fn set_error(self, error: BoxError) {
        self.slot.fulfill(Outcome::Error(error));
    }

    fn set_stopped(self) {
        self.slot.fulfill(Outcome::Stopped);
    }
}
