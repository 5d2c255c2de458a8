//! Structured-concurrency scope.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tracing::{error, trace};

use crate::error::BoxError;
use crate::exec::env::{Empty, WithStopToken};
use crate::exec::{Operation, Outcome, Receiver, Sender};
use crate::stop::{StopSource, StopToken};

use super::event::ManualResetEvent;

struct ScopeInner {
    /// Outstanding spawned operations.
    count: AtomicUsize,
    /// Set exactly while `count` is zero.
    done: ManualResetEvent,
    stop: StopSource,
}

impl ScopeInner {
    fn add_work(&self) {
        self.done.reset();
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn finish_work(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.set();
        }
    }
}

/// Tracks spawned work and joins it at teardown.
///
/// Every [`spawn`](Scope::spawn) and [`spawn_future`](Scope::spawn_future)
/// increments an outstanding counter that the spawned operation's
/// completion decrements; [`deplete_async`](Scope::deplete_async) completes
/// when the counter reaches zero. Spawned operations see the scope's stop
/// token in their environment, so [`request_stop`](Scope::request_stop)
/// cancels all of them at once.
///
/// # Teardown contract
///
/// Await `deplete_async` (e.g. via
/// [`sync_wait`](crate::exec::sync_wait)) before dropping the scope;
/// dropping with outstanding work panics.
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                count: AtomicUsize::new(0),
                done: ManualResetEvent::new(true),
                stop: StopSource::new(),
            }),
        }
    }

    /// Starts `sender` eagerly, discarding its value.
    ///
    /// Spawned work must handle its own errors: an error completion here
    /// is a programming error and aborts the process.
    pub fn spawn<S>(&self, sender: S)
    where
        S: Sender + 'static,
    {
        self.inner.add_work();
        trace!("scope spawn");
        let env = WithStopToken::new(Empty, self.inner.stop.token());
        sender
            .connect(SpawnReceiver { scope: self.inner.clone(), env, _value: PhantomData })
            .start();
    }

    /// Spawns a plain closure as eager work.
    pub fn spawn_call<F, T>(&self, f: F)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(crate::senders::just_from(f));
    }

    /// Starts `sender` eagerly and returns a sender for its result.
    ///
    /// Unlike [`spawn`](Scope::spawn), errors are preserved and delivered
    /// to whoever connects the returned sender. The result is delivered at
    /// most once; dropping the returned sender discards it.
    pub fn spawn_future<S>(&self, sender: S) -> SpawnFuture<S::Value>
    where
        S: Sender + 'static,
    {
        self.inner.add_work();
        trace!("scope spawn_future");
        let state = Arc::new(FutureState { slot: StdMutex::new(Handoff::Empty) });
        let env = WithStopToken::new(Empty, self.inner.stop.token());
        sender
            .connect(FutureProducer { scope: self.inner.clone(), state: state.clone(), env })
            .start();
        SpawnFuture { state }
    }

    /// A sender completing once every spawned operation has finished.
    ///
    /// Completes inline when the scope is already idle.
    pub fn deplete_async(&self) -> DepleteAsync {
        DepleteAsync { inner: self.inner.clone() }
    }

    /// Cancels all outstanding spawned operations.
    pub fn request_stop(&self) -> bool {
        trace!("scope stop requested");
        self.inner.stop.request_stop()
    }

    /// The scope's stop token, as seen by spawned operations.
    pub fn token(&self) -> StopToken {
        self.inner.stop.token()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let outstanding = self.inner.count.load(Ordering::Acquire);
        assert!(
            outstanding == 0,
            "scope dropped with {outstanding} outstanding operations; await deplete_async() first"
        );
    }
}

struct SpawnReceiver<V> {
    scope: Arc<ScopeInner>,
    env: WithStopToken<Empty>,
    _value: PhantomData<fn(V)>,
}

impl<V: Send + 'static> Receiver for SpawnReceiver<V> {
    type Value = V;
    type Env = WithStopToken<Empty>;

    fn env(&self) -> &Self::Env {
        &self.env
    }

    fn set_value(self, _value: V) {
        self.scope.finish_work();
    }

    fn set_error(self, err: BoxError) {
        error!(error = %err, "spawned operation failed; aborting");
        std::process::abort();
    }

    fn set_stopped(self) {
        self.scope.finish_work();
    }
}

/// Producer/consumer handoff of an eager result.
///
/// Two parties race to the slot: the spawned operation completing, and the
/// consumer connecting the returned sender. Whoever arrives second
/// performs the delivery.
enum Handoff<V> {
    /// Neither the result nor a consumer has arrived.
    Empty,
    /// The result arrived first.
    Done(Outcome<V>),
    /// The consumer arrived first and parked its delivery.
    Waiting(Box<dyn FnOnce(Outcome<V>) + Send>),
}

struct FutureState<V> {
    slot: StdMutex<Handoff<V>>,
}

struct FutureProducer<V> {
    scope: Arc<ScopeInner>,
    state: Arc<FutureState<V>>,
    env: WithStopToken<Empty>,
}

impl<V: Send + 'static> FutureProducer<V> {
    fn fulfill(self, outcome: Outcome<V>) {
        let deliver = {
            let mut slot = self.state.slot.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *slot, Handoff::Empty) {
                Handoff::Empty => {
                    *slot = Handoff::Done(outcome);
                    None
                }
                Handoff::Waiting(deliver) => Some((deliver, outcome)),
                Handoff::Done(_) => unreachable!("eager result produced twice"),
            }
        };
        if let Some((deliver, outcome)) = deliver {
            deliver(outcome);
        }
        // Scope bookkeeping runs after the value is parked, so a consumer
        // woken by deplete_async cannot miss it.
        self.scope.finish_work();
    }
}

impl<V: Send + 'static> Receiver for FutureProducer<V> {
    type Value = V;
    type Env = WithStopToken<Empty>;

    fn env(&self) -> &Self::Env {
        &self.env
    }

    fn set_value(self, value: V) {
        self.fulfill(Outcome::Value(value));
    }

    fn set_error(self, error: BoxError) {
        self.fulfill(Outcome::Error(error));
    }

    fn set_stopped(self) {
        self.fulfill(Outcome::Stopped);
    }
}

/// Sender returned by [`Scope::spawn_future`].
pub struct SpawnFuture<V> {
    state: Arc<FutureState<V>>,
}

impl<V: Send + 'static> Sender for SpawnFuture<V> {
    type Value = V;

    type Operation<R>
        = SpawnFutureOp<V, R>
    where
        R: Receiver<Value = V>;

    fn connect<R>(self, receiver: R) -> SpawnFutureOp<V, R>
    where
        R: Receiver<Value = V>,
    {
        SpawnFutureOp { state: self.state, receiver }
    }
}

pub struct SpawnFutureOp<V, R> {
    state: Arc<FutureState<V>>,
    receiver: R,
}

impl<V, R> Operation for SpawnFutureOp<V, R>
where
    V: Send + 'static,
    R: Receiver<Value = V>,
{
    fn start(self) {
        let receiver = self.receiver;
        let ready = {
            let mut slot = self.state.slot.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *slot, Handoff::Empty) {
                Handoff::Empty => {
                    *slot = Handoff::Waiting(Box::new(move |outcome| outcome.send_to(receiver)));
                    None
                }
                Handoff::Done(outcome) => Some((outcome, receiver)),
                Handoff::Waiting(_) => unreachable!("eager result connected twice"),
            }
        };
        if let Some((outcome, receiver)) = ready {
            outcome.send_to(receiver);
        }
    }
}

/// Sender returned by [`Scope::deplete_async`].
pub struct DepleteAsync {
    inner: Arc<ScopeInner>,
}

impl Sender for DepleteAsync {
    type Value = ();

    type Operation<R>
        = DepleteAsyncOp<R>
    where
        R: Receiver<Value = ()>;

    fn connect<R>(self, receiver: R) -> DepleteAsyncOp<R>
    where
        R: Receiver<Value = ()>,
    {
        DepleteAsyncOp { inner: self.inner, receiver }
    }
}

pub struct DepleteAsyncOp<R> {
    inner: Arc<ScopeInner>,
    receiver: R,
}

impl<R> Operation for DepleteAsyncOp<R>
where
    R: Receiver<Value = ()>,
{
    fn start(self) {
        let inner = self.inner;
        let receiver = self.receiver;
        // The waiter holds the scope alive until the event releases it.
        let keepalive = inner.clone();
        inner
            .done
            .wait_async()
            .connect(DepleteReceiver { keepalive, receiver })
            .start();
    }
}

struct DepleteReceiver<R> {
    keepalive: Arc<ScopeInner>,
    receiver: R,
}

impl<R> Receiver for DepleteReceiver<R>
where
    R: Receiver<Value = ()>,
{
    type Value = ();
    type Env = R::Env;

    fn env(&self) -> &R::Env {
        self.receiver.env()
    }

    fn set_value(self, (): ()) {
        drop(self.keepalive);
        self.receiver.set_value(());
    }

    fn set_error(self, error: BoxError) {
        self.receiver.set_error(error);
    }

    fn set_stopped(self) {
        self.receiver.set_stopped();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::exec::{Scheduler, sync_wait};
    use crate::senders::{SenderExt, just, just_error};
    use crate::thread_pool::StaticThreadPool;

    /// Spawned work runs and deplete completes once all of it settles.
    #[test]
    fn test_spawn_and_deplete() {
        let pool = StaticThreadPool::new(2);
        let sched = pool.scheduler();
        let scope = Scope::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let hits = hits.clone();
            scope.spawn(sched.schedule().map(move |()| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        sync_wait(scope.deplete_async()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 16);
    }

    /// `spawn_call` runs plain closures as scope work.
    #[test]
    fn test_spawn_call() {
        let scope = Scope::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let hits = hits.clone();
            scope.spawn_call(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        sync_wait(scope.deplete_async()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    /// Depleting an idle scope completes inline.
    #[test]
    fn test_deplete_idle() {
        let scope = Scope::new();
        assert_eq!(sync_wait(scope.deplete_async()).unwrap(), Some(()));
    }

    /// `request_stop` cancels in-flight spawned timers promptly.
    #[test]
    fn test_stop_cancels_children() {
        let lp = Arc::new(crate::time::TimerLoop::new());
        let sched = lp.scheduler();
        let driver = std::thread::spawn({
            let lp = lp.clone();
            move || lp.run()
        });
        let scope = Scope::new();
        let started = std::time::Instant::now();
        for _ in 0..4 {
            scope.spawn(sched.schedule_after(Duration::from_secs(3600)));
        }
        scope.request_stop();
        sync_wait(scope.deplete_async()).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        lp.finish();
        driver.join().unwrap();
    }

    /// An eager result produced before the consumer attaches is kept.
    #[test]
    fn test_spawn_future_value_first() {
        let scope = Scope::new();
        let fut = scope.spawn_future(just(17));
        sync_wait(scope.deplete_async()).unwrap();
        assert_eq!(sync_wait(fut).unwrap(), Some(17));
    }

    /// A consumer attached before production is delivered to on
    /// completion.
    #[test]
    fn test_spawn_future_consumer_first() {
        let pool = StaticThreadPool::new(2);
        let sched = pool.scheduler();
        let scope = Scope::new();
        let fut = scope.spawn_future(sched.schedule().map(|()| 23));
        assert_eq!(sync_wait(fut).unwrap(), Some(23));
        sync_wait(scope.deplete_async()).unwrap();
    }

    /// `spawn_future` preserves errors instead of aborting.
    #[test]
    fn test_spawn_future_keeps_errors() {
        let scope = Scope::new();
        let fut = scope.spawn_future(just_error::<i32>("kept".into()));
        sync_wait(scope.deplete_async()).unwrap();
        let err = sync_wait(fut).unwrap_err();
        assert_eq!(err.to_string(), "kept");
    }

    /// Dropping a scope with outstanding work is a contract violation.
    #[test]
    #[should_panic(expected = "outstanding operations")]
    fn test_drop_with_outstanding_panics() {
        let lp = Arc::new(crate::time::TimerLoop::new());
        let sched = lp.scheduler();
        let driver = std::thread::spawn({
            let lp = lp.clone();
            move || lp.run()
        });
        let scope = Scope::new();
        scope.spawn(sched.schedule_after(Duration::from_secs(3600)));
        lp.finish();
        driver.join().unwrap();
        drop(scope);
    }
}
