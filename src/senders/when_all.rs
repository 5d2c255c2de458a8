//! Concurrent join of several senders.

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::BoxError;
use crate::exec::env::{Environment, WithStopToken};
use crate::exec::{Operation, Receiver, Sender};
use crate::senders::Map;
use crate::stop::{StopCallback, StopSource};

/// Starts every sender of the tuple and completes when all have settled.
///
/// - All children complete with values: completes with the tuple of values.
/// - Any child completes with an error: the first observed error is
///   forwarded, the remaining children are cancelled through an inner stop
///   source, and their completions are discarded.
/// - Any child stops (and no error was observed): completes stopped.
///
/// A stop request from the parent environment is chained into the inner
/// stop source, so cancelling the join cancels every child at once. The
/// final completion runs on whichever thread settled last.
pub fn when_all<T: WhenAllTuple>(senders: T) -> T::Sender {
    senders.combine()
}

/// Tuples of senders that can be joined; implemented for arities 2 to 6.
pub trait WhenAllTuple {
    type Sender: Sender;

    fn combine(self) -> Self::Sender;
}

/// The binary join every larger arity is built from.
pub struct WhenAll2<A, B> {
    a: A,
    b: B,
}

impl<A, B> Sender for WhenAll2<A, B>
where
    A: Sender,
    B: Sender,
{
    type Value = (A::Value, B::Value);

    type Operation<R>
        = WhenAllOp<A, B, R>
    where
        R: Receiver<Value = (A::Value, B::Value)>;

    fn connect<R>(self, receiver: R) -> WhenAllOp<A, B, R>
    where
        R: Receiver<Value = (A::Value, B::Value)>,
    {
        WhenAllOp { a: self.a, b: self.b, receiver }
    }
}

pub struct WhenAllOp<A, B, R> {
    a: A,
    b: B,
    receiver: R,
}

impl<A, B, R> Operation for WhenAllOp<A, B, R>
where
    A: Sender,
    B: Sender,
    R: Receiver<Value = (A::Value, B::Value)>,
{
    fn start(self) {
        let parent_env = self.receiver.env().clone();
        let parent_token = parent_env.stop_token();
        let shared = Arc::new(Shared {
            remaining: AtomicUsize::new(2),
            stop: StopSource::new(),
            inner: Mutex::new(SharedInner {
                a: None,
                b: None,
                failure: None,
                receiver: Some(self.receiver),
                parent_cb: None,
            }),
        });
        let child_token = shared.stop.token();

        // Chain the parent's cancellation into the children's.
        let parent_cb = StopCallback::new(&parent_token, {
            let shared = shared.clone();
            move || {
                shared.stop.request_stop();
            }
        });
        shared.lock().parent_cb = Some(parent_cb);

        let env = WithStopToken::new(parent_env, child_token);
        self.a
            .connect(ChildA { shared: shared.clone(), env: env.clone() })
            .start();
        self.b.connect(ChildB { shared, env }).start();
    }
}

enum Failure {
    Error(BoxError),
    Stopped,
}

struct SharedInner<VA, VB, R> {
    a: Option<VA>,
    b: Option<VB>,
    failure: Option<Failure>,
    receiver: Option<R>,
    parent_cb: Option<StopCallback>,
}

struct Shared<VA, VB, R> {
    remaining: AtomicUsize,
    stop: StopSource,
    inner: Mutex<SharedInner<VA, VB, R>>,
}

impl<VA, VB, R> Shared<VA, VB, R>
where
    R: Receiver<Value = (VA, VB)>,
{
    fn lock(&self) -> std::sync::MutexGuard<'_, SharedInner<VA, VB, R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the first failure and cancels the peers.
    fn record_failure(&self, failure: Failure) {
        let is_first = {
            let mut inner = self.lock();
            if inner.failure.is_none() {
                inner.failure = Some(failure);
                true
            } else {
                false
            }
        };
        if is_first {
            self.stop.request_stop();
        }
    }

    /// Settles one child; the last arrival delivers.
    fn complete_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let (receiver, parent_cb, a, b, failure) = {
            let mut inner = self.lock();
            (
                inner.receiver.take(),
                inner.parent_cb.take(),
                inner.a.take(),
                inner.b.take(),
                inner.failure.take(),
            )
        };
        // Deregister before delivering so the chain callback cannot fire
        // into a dismantled join.
        drop(parent_cb);
        let receiver = receiver.expect("join delivered twice");
        match failure {
            Some(Failure::Error(error)) => receiver.set_error(error),
            Some(Failure::Stopped) => receiver.set_stopped(),
            None => match (a, b) {
                (Some(a), Some(b)) => receiver.set_value((a, b)),
                _ => unreachable!("child settled without storing a value"),
            },
        }
    }
}

macro_rules! when_all_child {
    ($name:ident, $slot:ident, $value:ident) => {
        struct $name<VA, VB, R: Receiver> {
            shared: Arc<Shared<VA, VB, R>>,
            env: WithStopToken<R::Env>,
        }

        impl<VA, VB, R> Receiver for $name<VA, VB, R>
        where
            VA: Send + 'static,
            VB: Send + 'static,
            R: Receiver<Value = (VA, VB)>,
        {
            type Value = $value;
            type Env = WithStopToken<R::Env>;

            fn env(&self) -> &Self::Env {
                &self.env
            }

            fn set_value(self, value: $value) {
                self.shared.lock().$slot = Some(value);
                self.shared.complete_one();
            }

            fn set_error(self, error: BoxError) {
                self.shared.record_failure(Failure::Error(error));
                self.shared.complete_one();
            }

            fn set_stopped(self) {
                self.shared.record_failure(Failure::Stopped);
                self.shared.complete_one();
            }
        }
    };
}

when_all_child!(ChildA, a, VA);
when_all_child!(ChildB, b, VB);

impl<S1, S2> WhenAllTuple for (S1, S2)
where
    S1: Sender,
    S2: Sender,
{
    type Sender = WhenAll2<S1, S2>;

    fn combine(self) -> Self::Sender {
        WhenAll2 { a: self.0, b: self.1 }
    }
}

impl<S1, S2, S3> WhenAllTuple for (S1, S2, S3)
where
    S1: Sender,
    S2: Sender,
    S3: Sender,
{
    type Sender = Map<
        WhenAll2<WhenAll2<S1, S2>, S3>,
        fn(((S1::Value, S2::Value), S3::Value)) -> (S1::Value, S2::Value, S3::Value),
    >;

    fn combine(self) -> Self::Sender {
        let (s1, s2, s3) = self;
        let nested = WhenAll2 { a: WhenAll2 { a: s1, b: s2 }, b: s3 };
        let flatten: fn(((S1::Value, S2::Value), S3::Value)) -> _ = |((v1, v2), v3)| (v1, v2, v3);
        Map::new(nested, flatten)
    }
}

impl<S1, S2, S3, S4> WhenAllTuple for (S1, S2, S3, S4)
where
    S1: Sender,
    S2: Sender,
    S3: Sender,
    S4: Sender,
{
    type Sender = Map<
        WhenAll2<WhenAll2<WhenAll2<S1, S2>, S3>, S4>,
        fn(
            (((S1::Value, S2::Value), S3::Value), S4::Value),
        ) -> (S1::Value, S2::Value, S3::Value, S4::Value),
    >;

    fn combine(self) -> Self::Sender {
        let (s1, s2, s3, s4) = self;
        let nested = WhenAll2 {
            a: WhenAll2 { a: WhenAll2 { a: s1, b: s2 }, b: s3 },
            b: s4,
        };
        let flatten: fn((((S1::Value, S2::Value), S3::Value), S4::Value)) -> _ =
            |(((v1, v2), v3), v4)| (v1, v2, v3, v4);
        Map::new(nested, flatten)
    }
}

impl<S1, S2, S3, S4, S5> WhenAllTuple for (S1, S2, S3, S4, S5)
where
    S1: Sender,
    S2: Sender,
    S3: Sender,
    S4: Sender,
    S5: Sender,
{
    type Sender = Map<
        WhenAll2<WhenAll2<WhenAll2<WhenAll2<S1, S2>, S3>, S4>, S5>,
        fn(
            ((((S1::Value, S2::Value), S3::Value), S4::Value), S5::Value),
        ) -> (S1::Value, S2::Value, S3::Value, S4::Value, S5::Value),
    >;

    fn combine(self) -> Self::Sender {
        let (s1, s2, s3, s4, s5) = self;
        let nested = WhenAll2 {
            a: WhenAll2 {
                a: WhenAll2 { a: WhenAll2 { a: s1, b: s2 }, b: s3 },
                b: s4,
            },
            b: s5,
        };
        let flatten: fn(((((S1::Value, S2::Value), S3::Value), S4::Value), S5::Value)) -> _ =
            |((((v1, v2), v3), v4), v5)| (v1, v2, v3, v4, v5);
        Map::new(nested, flatten)
    }
}

impl<S1, S2, S3, S4, S5, S6> WhenAllTuple for (S1, S2, S3, S4, S5, S6)
where
    S1: Sender,
    S2: Sender,
    S3: Sender,
    S4: Sender,
    S5: Sender,
    S6: Sender,
{
    type Sender = Map<
        WhenAll2<WhenAll2<WhenAll2<WhenAll2<WhenAll2<S1, S2>, S3>, S4>, S5>, S6>,
        fn(
            (((((S1::Value, S2::Value), S3::Value), S4::Value), S5::Value), S6::Value),
        )
            -> (S1::Value, S2::Value, S3::Value, S4::Value, S5::Value, S6::Value),
    >;

    fn combine(self) -> Self::Sender {
        let (s1, s2, s3, s4, s5, s6) = self;
        let nested = WhenAll2 {
            a: WhenAll2 {
                a: WhenAll2 {
                    a: WhenAll2 { a: WhenAll2 { a: s1, b: s2 }, b: s3 },
                    b: s4,
                },
                b: s5,
            },
            b: s6,
        };
        let flatten: fn((((((S1::Value, S2::Value), S3::Value), S4::Value), S5::Value), S6::Value)) -> _ =
            |(((((v1, v2), v3), v4), v5), v6)| (v1, v2, v3, v4, v5, v6);
        Map::new(nested, flatten)
    }
}
