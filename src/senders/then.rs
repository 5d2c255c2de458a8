//! Sender-returning continuation on the value channel.

use std::marker::PhantomData;

use crate::error::BoxError;
use crate::exec::{Operation, Receiver, Sender};

/// Runs `f(value)` to obtain a second sender and forwards its completion.
///
/// The continuation sender is connected and started on whatever thread the
/// first sender completed on; errors and stops from either stage pass
/// straight through to the final receiver.
pub struct Then<S, F> {
    sender: S,
    f: F,
}

impl<S, F> Then<S, F> {
    pub(crate) fn new(sender: S, f: F) -> Self {
        Self { sender, f }
    }
}

impl<S, F, S2> Sender for Then<S, F>
where
    S: Sender,
    F: FnOnce(S::Value) -> S2 + Send + 'static,
    S2: Sender + 'static,
{
    type Value = S2::Value;

    type Operation<R>
        = S::Operation<ThenReceiver<R, F, S::Value, S2>>
    where
        R: Receiver<Value = S2::Value>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = S2::Value>,
    {
        self.sender.connect(ThenReceiver { receiver, f: self.f, _stage: PhantomData })
    }
}

pub struct ThenReceiver<R, F, V, S2> {
    receiver: R,
    f: F,
    _stage: PhantomData<fn(V) -> S2>,
}

impl<R, F, V, S2> Receiver for ThenReceiver<R, F, V, S2>
where
    R: Receiver,
    F: FnOnce(V) -> S2 + Send + 'static,
    V: Send + 'static,
    S2: Sender<Value = R::Value> + 'static,
{
    type Value = V;
    type Env = R::Env;

    fn env(&self) -> &R::Env {
        self.receiver.env()
    }

    fn set_value(self, value: V) {
        let continuation = (self.f)(value);
        continuation.connect(self.receiver).start();
    }

    fn set_error(self, error: BoxError) {
        self.receiver.set_error(error);
    }

    fn set_stopped(self) {
        self.receiver.set_stopped();
    }
}
