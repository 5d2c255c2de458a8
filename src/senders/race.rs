//! First-completion-wins combinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::BoxError;
use crate::exec::env::{Environment, WithStopToken};
use crate::exec::{Operation, Outcome, Receiver, Sender};
use crate::stop::{StopCallback, StopSource};

/// Starts every sender of the tuple; the first completion (value, error or
/// stop alike) is forwarded and the losers are cancelled through an inner
/// stop source, their completions discarded.
///
/// The race is structured: delivery happens once every child has settled,
/// so no child outlives the race. Losers that honour their stop token
/// settle promptly; ones that ignore it delay delivery but cannot change
/// the outcome.
pub fn race<T: RaceTuple>(senders: T) -> T::Sender {
    senders.combine()
}

/// Tuples of same-valued senders that can race; implemented for arities
/// 2 to 6.
pub trait RaceTuple {
    type Sender: Sender;

    fn combine(self) -> Self::Sender;
}

/// The binary race every larger arity is built from.
pub struct Race2<A, B> {
    a: A,
    b: B,
}

impl<A, B> Sender for Race2<A, B>
where
    A: Sender,
    B: Sender<Value = A::Value>,
{
    type Value = A::Value;

    type Operation<R>
        = RaceOp<A, B, R>
    where
        R: Receiver<Value = A::Value>;

    fn connect<R>(self, receiver: R) -> RaceOp<A, B, R>
    where
        R: Receiver<Value = A::Value>,
    {
        RaceOp { a: self.a, b: self.b, receiver }
    }
}

pub struct RaceOp<A, B, R> {
    a: A,
    b: B,
    receiver: R,
}

impl<A, B, R> Operation for RaceOp<A, B, R>
where
    A: Sender,
    B: Sender<Value = A::Value>,
    R: Receiver<Value = A::Value>,
{
    fn start(self) {
        let parent_env = self.receiver.env().clone();
        let parent_token = parent_env.stop_token();
        let shared = Arc::new(Shared {
            remaining: AtomicUsize::new(2),
            stop: StopSource::new(),
            inner: Mutex::new(SharedInner {
                winner: None,
                receiver: Some(self.receiver),
                parent_cb: None,
            }),
        });
        let child_token = shared.stop.token();

        let parent_cb = StopCallback::new(&parent_token, {
            let shared = shared.clone();
            move || {
                shared.stop.request_stop();
            }
        });
        shared.lock().parent_cb = Some(parent_cb);

        let env = WithStopToken::new(parent_env, child_token);
        self.a
            .connect(Contestant { shared: shared.clone(), env: env.clone() })
            .start();
        self.b.connect(Contestant { shared, env }).start();
    }
}

struct SharedInner<V, R> {
    winner: Option<Outcome<V>>,
    receiver: Option<R>,
    parent_cb: Option<StopCallback>,
}

struct Shared<V, R> {
    remaining: AtomicUsize,
    stop: StopSource,
    inner: Mutex<SharedInner<V, R>>,
}

impl<V, R> Shared<V, R>
where
    R: Receiver<Value = V>,
{
    fn lock(&self) -> std::sync::MutexGuard<'_, SharedInner<V, R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: Outcome<V>) {
        let is_first = {
            let mut inner = self.lock();
            if inner.winner.is_none() {
                inner.winner = Some(outcome);
                true
            } else {
                false
            }
        };
        if is_first {
            self.stop.request_stop();
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let (receiver, parent_cb, winner) = {
            let mut inner = self.lock();
            (inner.receiver.take(), inner.parent_cb.take(), inner.winner.take())
        };
        drop(parent_cb);
        let receiver = receiver.expect("race delivered twice");
        winner.expect("race settled without a winner").send_to(receiver);
    }
}

struct Contestant<V, R: Receiver> {
    shared: Arc<Shared<V, R>>,
    env: WithStopToken<R::Env>,
}

impl<V, R> Receiver for Contestant<V, R>
where
    V: Send + 'static,
    R: Receiver<Value = V>,
{
    type Value = V;
    type Env = WithStopToken<R::Env>;

    fn env(&self) -> &Self::Env {
        &self.env
    }

    fn set_value(self, value: V) {
        self.shared.settle(Outcome::Value(value));
    }

    fn set_error(self, error: BoxError) {
        self.shared.settle(Outcome::Error(error));
    }

    fn set_stopped(self) {
        self.shared.settle(Outcome::Stopped);
    }
}

impl<S1, S2> RaceTuple for (S1, S2)
where
    S1: Sender,
    S2: Sender<Value = S1::Value>,
{
    type Sender = Race2<S1, S2>;

    fn combine(self) -> Self::Sender {
        Race2 { a: self.0, b: self.1 }
    }
}

impl<S1, S2, S3> RaceTuple for (S1, S2, S3)
where
    S1: Sender,
    S2: Sender<Value = S1::Value>,
    S3: Sender<Value = S1::Value>,
{
    type Sender = Race2<Race2<S1, S2>, S3>;

    fn combine(self) -> Self::Sender {
        let (s1, s2, s3) = self;
        Race2 { a: Race2 { a: s1, b: s2 }, b: s3 }
    }
}

impl<S1, S2, S3, S4> RaceTuple for (S1, S2, S3, S4)
where
    S1: Sender,
    S2: Sender<Value = S1::Value>,
    S3: Sender<Value = S1::Value>,
    S4: Sender<Value = S1::Value>,
{
    type Sender = Race2<Race2<Race2<S1, S2>, S3>, S4>;

    fn combine(self) -> Self::Sender {
        let (s1, s2, s3, s4) = self;
        Race2 { a: Race2 { a: Race2 { a: s1, b: s2 }, b: s3 }, b: s4 }
    }
}

impl<S1, S2, S3, S4, S5> RaceTuple for (S1, S2, S3, S4, S5)
where
    S1: Sender,
    S2: Sender<Value = S1::Value>,
    S3: Sender<Value = S1::Value>,
    S4: Sender<Value = S1::Value>,
    S5: Sender<Value = S1::Value>,
{
    type Sender = Race2<Race2<Race2<Race2<S1, S2>, S3>, S4>, S5>;

    fn combine(self) -> Self::Sender {
        let (s1, s2, s3, s4, s5) = self;
        Race2 {
            a: Race2 { a: Race2 { a: Race2 { a: s1, b: s2 }, b: s3 }, b: s4 },
            b: s5,
        }
    }
}

impl<S1, S2, S3, S4, S5, S6> RaceTuple for (S1, S2, S3, S4, S5, S6)
where
    S1: Sender,
    S2: Sender<Value = S1::Value>,
    S3: Sender<Value = S1::Value>,
    S4: Sender<Value = S1::Value>,
    S5: Sender<Value = S1::Value>,
    S6: Sender<Value = S1::Value>,
{
    type Sender = Race2<Race2<Race2<Race2<Race2<S1, S2>, S3>, S4>, S5>, S6>;

    fn combine(self) -> Self::Sender {
        let (s1, s2, s3, s4, s5, s6) = self;
        Race2 {
            a: Race2 {
                a: Race2 { a: Race2 { a: Race2 { a: s1, b: s2 }, b: s3 }, b: s4 },
                b: s5,
            },
            b: s6,
        }
    }
}
