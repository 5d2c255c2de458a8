//! Collapses the stopped channel into the value channel.

use std::marker::PhantomData;

use crate::error::BoxError;
use crate::exec::{Receiver, Sender};

/// Completes with `Some(v)` for a value and `None` for a stop signal, so a
/// cancelled operation looks like an absent result to the consumer instead
/// of a cancellation of the consumer itself.
pub struct StoppedAsOptional<S> {
    sender: S,
}

impl<S> StoppedAsOptional<S> {
    pub(crate) fn new(sender: S) -> Self {
        Self { sender }
    }
}

impl<S: Sender> Sender for StoppedAsOptional<S> {
    type Value = Option<S::Value>;

    type Operation<R>
        = S::Operation<OptionalReceiver<R, S::Value>>
    where
        R: Receiver<Value = Option<S::Value>>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = Option<S::Value>>,
    {
        self.sender.connect(OptionalReceiver { receiver, _value: PhantomData })
    }
}

pub struct OptionalReceiver<R, V> {
    receiver: R,
    _value: PhantomData<fn(V)>,
}

impl<R, V> Receiver for OptionalReceiver<R, V>
where
    R: Receiver<Value = Option<V>>,
    V: Send + 'static,
{
    type Value = V;
    type Env = R::Env;

    fn env(&self) -> &R::Env {
        self.receiver.env()
    }

    fn set_value(self, value: V) {
        self.receiver.set_value(Some(value));
    }

    fn set_error(self, error: BoxError) {
        self.receiver.set_error(error);
    }

    fn set_stopped(self) {
        self.receiver.set_value(None);
    }
}
