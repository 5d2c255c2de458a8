//! Single-channel transforms: value, error and stopped interceptors.

use std::marker::PhantomData;

use crate::error::BoxError;
use crate::exec::{Receiver, Sender};

/// Transforms the value completion; errors and stops pass through.
pub struct Map<S, F> {
    sender: S,
    f: F,
}

impl<S, F> Map<S, F> {
    pub(crate) fn new(sender: S, f: F) -> Self {
        Self { sender, f }
    }
}

impl<S, F, T> Sender for Map<S, F>
where
    S: Sender,
    F: FnOnce(S::Value) -> T + Send + 'static,
    T: Send + 'static,
{
    type Value = T;

    type Operation<R>
        = S::Operation<MapReceiver<R, F, S::Value>>
    where
        R: Receiver<Value = T>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = T>,
    {
        self.sender.connect(MapReceiver { receiver, f: self.f, _value: PhantomData })
    }
}

pub struct MapReceiver<R, F, V> {
    receiver: R,
    f: F,
    _value: PhantomData<fn(V)>,
}

impl<R, F, V> Receiver for MapReceiver<R, F, V>
where
    R: Receiver,
    F: FnOnce(V) -> R::Value + Send + 'static,
    V: Send + 'static,
{
    type Value = V;
    type Env = R::Env;

    fn env(&self) -> &R::Env {
        self.receiver.env()
    }

    fn set_value(self, value: V) {
        let mapped = (self.f)(value);
        self.receiver.set_value(mapped);
    }

    fn set_error(self, error: BoxError) {
        self.receiver.set_error(error);
    }

    fn set_stopped(self) {
        self.receiver.set_stopped();
    }
}

/// Recovers from the error channel by mapping the error to a value.
pub struct Recover<S, F> {
    sender: S,
    f: F,
}

impl<S, F> Recover<S, F> {
    pub(crate) fn new(sender: S, f: F) -> Self {
        Self { sender, f }
    }
}

impl<S, F> Sender for Recover<S, F>
where
    S: Sender,
    F: FnOnce(BoxError) -> S::Value + Send + 'static,
{
    type Value = S::Value;

    type Operation<R>
        = S::Operation<RecoverReceiver<R, F>>
    where
        R: Receiver<Value = S::Value>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = S::Value>,
    {
        self.sender.connect(RecoverReceiver { receiver, f: self.f })
    }
}

pub struct RecoverReceiver<R, F> {
    receiver: R,
    f: F,
}

impl<R, F> Receiver for RecoverReceiver<R, F>
where
    R: Receiver,
    F: FnOnce(BoxError) -> R::Value + Send + 'static,
{
    type Value = R::Value;
    type Env = R::Env;

    fn env(&self) -> &R::Env {
        self.receiver.env()
    }

    fn set_value(self, value: R::Value) {
        self.receiver.set_value(value);
    }

    fn set_error(self, error: BoxError) {
        let recovered = (self.f)(error);
        self.receiver.set_value(recovered);
    }

    fn set_stopped(self) {
        self.receiver.set_stopped();
    }
}

/// Recovers from the stopped channel by producing a value.
pub struct RecoverStopped<S, F> {
    sender: S,
    f: F,
}

impl<S, F> RecoverStopped<S, F> {
    pub(crate) fn new(sender: S, f: F) -> Self {
        Self { sender, f }
    }
}

impl<S, F> Sender for RecoverStopped<S, F>
where
    S: Sender,
    F: FnOnce() -> S::Value + Send + 'static,
{
    type Value = S::Value;

    type Operation<R>
        = S::Operation<RecoverStoppedReceiver<R, F>>
    where
        R: Receiver<Value = S::Value>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = S::Value>,
    {
        self.sender.connect(RecoverStoppedReceiver { receiver, f: self.f })
    }
}

pub struct RecoverStoppedReceiver<R, F> {
    receiver: R,
    f: F,
}

impl<R, F> Receiver for RecoverStoppedReceiver<R, F>
where
    R: Receiver,
    F: FnOnce() -> R::Value + Send + 'static,
{
    type Value = R::Value;
    type Env = R::Env;

    fn env(&self) -> &R::Env {
        self.receiver.env()
    }

    fn set_value(self, value: R::Value) {
        self.receiver.set_value(value);
    }

    fn set_error(self, error: BoxError) {
        self.receiver.set_error(error);
    }

    fn set_stopped(self) {
        let value = (self.f)();
        self.receiver.set_value(value);
    }
}
