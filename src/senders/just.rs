//! Leaf senders completing immediately on the starting thread.

use std::marker::PhantomData;

use crate::error::BoxError;
use crate::exec::{Operation, Receiver, Sender};

/// A sender that completes with `value` as soon as it is started.
pub fn just<V: Send + 'static>(value: V) -> Just<V> {
    Just { value }
}

/// A sender that completes on the error channel as soon as it is started.
///
/// The value type parameter only shapes the pipeline; no value is ever
/// produced.
pub fn just_error<V: Send + 'static>(error: BoxError) -> JustError<V> {
    JustError { error, _value: PhantomData }
}

/// A sender that completes with the stop signal as soon as it is started.
pub fn just_stopped<V: Send + 'static>() -> JustStopped<V> {
    JustStopped { _value: PhantomData }
}

/// A sender that invokes `f` on start and completes with its result.
///
/// The call happens inline on the starting thread; combine with
/// [`start_on`](crate::senders::start_on) to run it elsewhere.
pub fn just_from<F, T>(f: F) -> JustFrom<F>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    JustFrom { f }
}

pub struct JustFrom<F> {
    f: F,
}

impl<F, T> Sender for JustFrom<F>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    type Value = T;

    type Operation<R>
        = JustFromOp<F, R>
    where
        R: Receiver<Value = T>;

    fn connect<R>(self, receiver: R) -> JustFromOp<F, R>
    where
        R: Receiver<Value = T>,
    {
        JustFromOp { f: self.f, receiver }
    }
}

pub struct JustFromOp<F, R> {
    f: F,
    receiver: R,
}

impl<F, R> Operation for JustFromOp<F, R>
where
    R: Receiver,
    F: FnOnce() -> R::Value + Send + 'static,
{
    fn start(self) {
        let value = (self.f)();
        self.receiver.set_value(value);
    }
}

pub struct Just<V> {
    value: V,
}

impl<V: Send + 'static> Sender for Just<V> {
    type Value = V;

    type Operation<R>
        = JustOp<R>
    where
        R: Receiver<Value = V>;

    fn connect<R>(self, receiver: R) -> JustOp<R>
    where
        R: Receiver<Value = V>,
    {
        JustOp { value: self.value, receiver }
    }
}

pub struct JustOp<R: Receiver> {
    value: R::Value,
    receiver: R,
}

impl<R: Receiver> Operation for JustOp<R> {
    fn start(self) {
        self.receiver.set_value(self.value);
    }
}

pub struct JustError<V> {
    error: BoxError,
    _value: PhantomData<fn() -> V>,
}

impl<V: Send + 'static> Sender for JustError<V> {
    type Value = V;

    type Operation<R>
        = JustErrorOp<R>
    where
        R: Receiver<Value = V>;

    fn connect<R>(self, receiver: R) -> JustErrorOp<R>
    where
        R: Receiver<Value = V>,
    {
        JustErrorOp { error: self.error, receiver }
    }
}

pub struct JustErrorOp<R> {
    error: BoxError,
    receiver: R,
}

impl<R: Receiver> Operation for JustErrorOp<R> {
    fn start(self) {
        self.receiver.set_error(self.error);
    }
}

pub struct JustStopped<V> {
    _value: PhantomData<fn() -> V>,
}

impl<V: Send + 'static> Sender for JustStopped<V> {
    type Value = V;

    type Operation<R>
        = JustStoppedOp<R>
    where
        R: Receiver<Value = V>;

    fn connect<R>(self, receiver: R) -> JustStoppedOp<R>
    where
        R: Receiver<Value = V>,
    {
        JustStoppedOp { receiver }
    }
}

pub struct JustStoppedOp<R> {
    receiver: R,
}

impl<R: Receiver> Operation for JustStoppedOp<R> {
    fn start(self) {
        self.receiver.set_stopped();
    }
}
