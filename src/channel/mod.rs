//! Asynchronous multi-producer multi-consumer channel.
//!
//! A [`Channel`] matches senders and receivers directly when possible,
//! buffers according to its capacity and [`OverflowPolicy`] otherwise, and
//! suspends operations that can make no progress:
//!
//! ```text
//! send ──► queued receiver? ── deliver directly, complete both
//!            │ no
//!            ▼
//!          buffer has room (or a drop policy)? ── push, complete send
//!            │ no (Suspend)
//!            ▼
//!          park the send until a receive frees a slot
//! ```
//!
//! Receives mirror this: pop from the buffer (promoting a parked send into
//! the freed slot), else take a parked send's value directly, else park.
//! Parked operations observe their stop token and complete with
//! `set_stopped` promptly when cancelled; [`Channel::cancel`] flushes both
//! parked sides at once. Completions are never invoked under the channel
//! lock.

mod buffer;

pub use buffer::OverflowPolicy;
use buffer::Buffer;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::trace;

use crate::exec::env::Environment;
use crate::exec::{Operation, Receiver, Sender};
use crate::stop::StopCallback;

/// Completion of a parked send; `true` means stopped.
type SendDone = Box<dyn FnOnce(bool) + Send>;
/// Completion of a parked receive; `None` means stopped.
type RecvDone<T> = Box<dyn FnOnce(Option<T>) + Send>;

struct ParkedSend<T> {
    id: u64,
    value: T,
    done: SendDone,
    stop_cb: Option<StopCallback>,
}

struct ParkedRecv<T> {
    id: u64,
    done: RecvDone<T>,
    stop_cb: Option<StopCallback>,
}

struct ChannelState<T> {
    buffer: Buffer<T>,
    parked_sends: VecDeque<ParkedSend<T>>,
    parked_recvs: VecDeque<ParkedRecv<T>>,
    next_id: u64,
}

struct ChannelInner<T> {
    state: Mutex<ChannelState<T>>,
}

impl<T> ChannelInner<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for ChannelInner<T> {
    fn drop(&mut self) {
        // Parked operations hold no strong reference to the channel, so
        // they can outlive the last handle; release them as stopped.
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for mut parked in state.parked_sends.drain(..) {
            drop(parked.stop_cb.take());
            (parked.done)(true);
        }
        for mut parked in state.parked_recvs.drain(..) {
            drop(parked.stop_cb.take());
            (parked.done)(None);
        }
    }
}

/// Cloneable handle to an async channel.
///
/// All clones refer to the same channel; dropping the last handle cancels
/// whatever is still parked.
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> Channel<T> {
    /// A channel buffering up to `capacity` values, with `policy` deciding
    /// what happens to sends into a full buffer.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero and `policy` is not
    /// [`OverflowPolicy::Suspend`]: with no buffer there is nothing to
    /// drop.
    pub fn bounded(capacity: usize, policy: OverflowPolicy) -> Self {
        Self::with_buffer(Buffer::bounded(capacity, policy))
    }

    /// A zero-capacity channel: every send rendezvouses with a receive.
    pub fn rendezvous() -> Self {
        Self::with_buffer(Buffer::bounded(0, OverflowPolicy::Suspend))
    }

    /// A channel whose buffer grows without bound; sends never suspend.
    pub fn unbounded() -> Self {
        Self::with_buffer(Buffer::unbounded())
    }

    fn with_buffer(buffer: Buffer<T>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState {
                    buffer,
                    parked_sends: VecDeque::new(),
                    parked_recvs: VecDeque::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// A sender completing once `value` is delivered, buffered or dropped
    /// by policy; completes with `set_stopped` if cancelled while parked.
    pub fn send_async(&self, value: T) -> SendAsync<T> {
        SendAsync { inner: self.inner.clone(), value }
    }

    /// A sender completing with the next value; completes with
    /// `set_stopped` if cancelled while parked.
    pub fn receive_async(&self) -> ReceiveAsync<T> {
        ReceiveAsync { inner: self.inner.clone() }
    }

    /// Flushes both parked sides with `set_stopped`. Buffered values stay
    /// readable; the channel remains usable afterwards.
    pub fn cancel(&self) {
        cancel_all(&self.inner);
    }
}

fn cancel_all<T>(inner: &Arc<ChannelInner<T>>) {
    let (sends, recvs) = {
        let mut state = inner.lock();
        (
            state.parked_sends.drain(..).collect::<Vec<_>>(),
            state.parked_recvs.drain(..).collect::<Vec<_>>(),
        )
    };
    trace!(sends = sends.len(), recvs = recvs.len(), "channel cancelled");
    for mut parked in sends {
        drop(parked.stop_cb.take());
        (parked.done)(true);
    }
    for mut parked in recvs {
        drop(parked.stop_cb.take());
        (parked.done)(None);
    }
}

/// Removes a parked send by id, completing it as stopped.
fn cancel_send<T>(inner: &Arc<ChannelInner<T>>, id: u64) {
    let parked = {
        let mut state = inner.lock();
        let pos = state.parked_sends.iter().position(|p| p.id == id);
        pos.and_then(|i| state.parked_sends.remove(i))
    };
    if let Some(mut parked) = parked {
        drop(parked.stop_cb.take());
        (parked.done)(true);
    }
}

/// Removes a parked receive by id, completing it as stopped.
fn cancel_recv<T>(inner: &Arc<ChannelInner<T>>, id: u64) {
    let parked = {
        let mut state = inner.lock();
        let pos = state.parked_recvs.iter().position(|p| p.id == id);
        pos.and_then(|i| state.parked_recvs.remove(i))
    };
    if let Some(mut parked) = parked {
        drop(parked.stop_cb.take());
        (parked.done)(None);
    }
}

/// Sender returned by [`Channel::send_async`].
pub struct SendAsync<T> {
    inner: Arc<ChannelInner<T>>,
    value: T,
}

impl<T: Send + 'static> Sender for SendAsync<T> {
    type Value = ();

    type Operation<R>
        = SendAsyncOp<T, R>
    where
        R: Receiver<Value = ()>;

    fn connect<R>(self, receiver: R) -> SendAsyncOp<T, R>
    where
        R: Receiver<Value = ()>,
    {
        SendAsyncOp { inner: self.inner, value: self.value, receiver }
    }
}

pub struct SendAsyncOp<T, R> {
    inner: Arc<ChannelInner<T>>,
    value: T,
    receiver: R,
}

impl<T, R> Operation for SendAsyncOp<T, R>
where
    T: Send + 'static,
    R: Receiver<Value = ()>,
{
    fn start(self) {
        let token = self.receiver.env().stop_token();
        let receiver = self.receiver;
        let inner = self.inner;
        let value = self.value;

        enum Action<T, R> {
            Delivered { recv: ParkedRecv<T>, value: T, receiver: R },
            Absorbed { receiver: R },
            Parked(u64),
        }

        let action = {
            let mut state = inner.lock();
            if let Some(recv) = state.parked_recvs.pop_front() {
                Action::Delivered { recv, value, receiver }
            } else {
                match state.buffer.try_push(value) {
                    Ok(()) => Action::Absorbed { receiver },
                    Err(value) => {
                        // Suspend policy with a full buffer, or a
                        // rendezvous channel with no receive in sight.
                        let id = state.next_id;
                        state.next_id += 1;
                        let done: SendDone = Box::new(move |stopped| {
                            if stopped {
                                receiver.set_stopped();
                            } else {
                                receiver.set_value(());
                            }
                        });
                        state
                            .parked_sends
                            .push_back(ParkedSend { id, value, done, stop_cb: None });
                        Action::Parked(id)
                    }
                }
            }
        };

        match action {
            Action::Delivered { mut recv, value, receiver } => {
                drop(recv.stop_cb.take());
                (recv.done)(Some(value));
                receiver.set_value(());
            }
            Action::Absorbed { receiver } => receiver.set_value(()),
            Action::Parked(id) => attach_send_cb(&inner, id, &token),
        }
    }
}

fn attach_send_cb<T: Send + 'static>(
    inner: &Arc<ChannelInner<T>>,
    id: u64,
    token: &crate::stop::StopToken,
) {
    let cb = StopCallback::new(token, {
        let weak = Arc::downgrade(inner);
        move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                cancel_send(&inner, id);
            }
        }
    });
    let mut state = inner.lock();
    match state.parked_sends.iter_mut().find(|p| p.id == id) {
        Some(parked) => parked.stop_cb = Some(cb),
        None => {
            // Already completed or cancelled; just deregister.
            drop(state);
            drop(cb);
        }
    }
}

/// Sender returned by [`Channel::receive_async`].
pub struct ReceiveAsync<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T: Send + 'static> Sender for ReceiveAsync<T> {
    type Value = T;

    type Operation<R>
        = ReceiveAsyncOp<T, R>
    where
        R: Receiver<Value = T>;

    fn connect<R>(self, receiver: R) -> ReceiveAsyncOp<T, R>
    where
        R: Receiver<Value = T>,
    {
        ReceiveAsyncOp { inner: self.inner, receiver }
    }
}

pub struct ReceiveAsyncOp<T, R> {
    inner: Arc<ChannelInner<T>>,
    receiver: R,
}

impl<T, R> Operation for ReceiveAsyncOp<T, R>
where
    T: Send + 'static,
    R: Receiver<Value = T>,
{
    fn start(self) {
        let token = self.receiver.env().stop_token();
        let receiver = self.receiver;
        let inner = self.inner;

        enum Action<T, R> {
            Popped { value: T, promoted: Option<(SendDone, Option<StopCallback>)>, receiver: R },
            Direct { send: ParkedSend<T>, receiver: R },
            Parked(u64),
        }

        let action = {
            let mut state = inner.lock();
            if let Some(value) = state.buffer.try_pop() {
                // A slot freed up: promote the longest-parked send into it.
                let promoted = state.parked_sends.pop_front().map(|parked| {
                    let ParkedSend { value, done, stop_cb, .. } = parked;
                    if state.buffer.try_push(value).is_err() {
                        unreachable!("freed buffer slot cannot be full");
                    }
                    (done, stop_cb)
                });
                Action::Popped { value, promoted, receiver }
            } else if let Some(send) = state.parked_sends.pop_front() {
                // No buffered value (rendezvous): take the parked send's
                // value directly.
                Action::Direct { send, receiver }
            } else {
                let id = state.next_id;
                state.next_id += 1;
                let done: RecvDone<T> = Box::new(move |value| match value {
                    Some(value) => receiver.set_value(value),
                    None => receiver.set_stopped(),
                });
                state.parked_recvs.push_back(ParkedRecv { id, done, stop_cb: None });
                Action::Parked(id)
            }
        };

        match action {
            Action::Popped { value, promoted, receiver } => {
                if let Some((done, stop_cb)) = promoted {
                    drop(stop_cb);
                    done(false);
                }
                receiver.set_value(value);
            }
            Action::Direct { send, receiver } => {
                let ParkedSend { value, done, stop_cb, .. } = send;
                drop(stop_cb);
                done(false);
                receiver.set_value(value);
            }
            Action::Parked(id) => attach_recv_cb(&inner, id, &token),
        }
    }
}

fn attach_recv_cb<T: Send + 'static>(
    inner: &Arc<ChannelInner<T>>,
    id: u64,
    token: &crate::stop::StopToken,
) {
    let cb = StopCallback::new(token, {
        let weak = Arc::downgrade(inner);
        move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                cancel_recv(&inner, id);
            }
        }
    });
    let mut state = inner.lock();
    match state.parked_recvs.iter_mut().find(|p| p.id == id) {
        Some(parked) => parked.stop_cb = Some(cb),
        None => {
            drop(state);
            drop(cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::exec::sync_wait;
    use crate::senders::{SenderExt, when_all};
    use crate::stop::StopSource;

    /// Sends into a free buffer complete immediately; receives drain FIFO.
    #[test]
    fn test_buffered_fifo() {
        let chan = Channel::bounded(4, OverflowPolicy::Suspend);
        for v in 1..=4 {
            assert_eq!(sync_wait(chan.send_async(v)).unwrap(), Some(()));
        }
        for v in 1..=4 {
            assert_eq!(sync_wait(chan.receive_async()).unwrap(), Some(v));
        }
    }

    /// Drop-oldest: three sends into capacity two all succeed and the
    /// receiver sees the newest two.
    #[test]
    fn test_drop_oldest_policy() {
        let chan = Channel::bounded(2, OverflowPolicy::DropOldest);
        for v in 1..=3 {
            assert_eq!(sync_wait(chan.send_async(v)).unwrap(), Some(()));
        }
        assert_eq!(sync_wait(chan.receive_async()).unwrap(), Some(2));
        assert_eq!(sync_wait(chan.receive_async()).unwrap(), Some(3));
    }

    /// Drop-latest: the incoming value is the one sacrificed.
    #[test]
    fn test_drop_latest_policy() {
        let chan = Channel::bounded(2, OverflowPolicy::DropLatest);
        for v in 1..=3 {
            assert_eq!(sync_wait(chan.send_async(v)).unwrap(), Some(()));
        }
        assert_eq!(sync_wait(chan.receive_async()).unwrap(), Some(1));
        assert_eq!(sync_wait(chan.receive_async()).unwrap(), Some(2));
    }

    /// A parked receive is completed directly by a later send.
    #[test]
    fn test_receiver_first_handoff() {
        let chan = Channel::rendezvous();
        let waiter = thread::spawn({
            let chan = chan.clone();
            move || sync_wait(chan.receive_async()).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sync_wait(chan.send_async(9)).unwrap(), Some(()));
        assert_eq!(waiter.join().unwrap(), Some(9));
    }

    /// A parked rendezvous send is completed by a later receive.
    #[test]
    fn test_sender_first_handoff() {
        let chan = Channel::rendezvous();
        let parked = thread::spawn({
            let chan = chan.clone();
            move || sync_wait(chan.send_async(5)).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sync_wait(chan.receive_async()).unwrap(), Some(5));
        assert_eq!(parked.join().unwrap(), Some(()));
    }

    /// Suspended sends are granted slots in arrival order as receives
    /// free them.
    #[test]
    fn test_suspended_sends_fifo() {
        let chan = Channel::bounded(1, OverflowPolicy::Suspend);
        assert_eq!(sync_wait(chan.send_async(0)).unwrap(), Some(()));
        let mut parked = Vec::new();
        for v in 1..=3 {
            let chan = chan.clone();
            parked.push(thread::spawn(move || sync_wait(chan.send_async(v)).unwrap()));
            // Serialize arrivals so the FIFO order is deterministic.
            thread::sleep(Duration::from_millis(20));
        }
        for v in 0..=3 {
            assert_eq!(sync_wait(chan.receive_async()).unwrap(), Some(v));
        }
        for p in parked {
            assert_eq!(p.join().unwrap(), Some(()));
        }
    }

    /// `cancel` flushes parked operations on both sides with the stop
    /// signal. Two channels keep the parked send and receive from simply
    /// matching each other.
    #[test]
    fn test_cancel_flushes() {
        let stops = Arc::new(AtomicUsize::new(0));

        let full = Channel::bounded(1, OverflowPolicy::Suspend);
        sync_wait(full.send_async(0)).unwrap();
        // Buffer full: this send parks on this very thread.
        full.send_async(1).connect(StopCounter::new(&stops)).start();

        let empty = Channel::<i32>::rendezvous();
        empty.receive_async().connect(StopCounter::new(&stops)).start();

        assert_eq!(stops.load(Ordering::SeqCst), 0);
        full.cancel();
        empty.cancel();
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        // The buffered value survives a cancel.
        assert_eq!(sync_wait(full.receive_async()).unwrap(), Some(0));
    }

    /// Counts stopped completions; panics on anything else.
    struct StopCounter<V> {
        stops: Arc<AtomicUsize>,
        env: crate::exec::env::Empty,
        _value: std::marker::PhantomData<fn(V)>,
    }

    impl<V> StopCounter<V> {
        fn new(stops: &Arc<AtomicUsize>) -> Self {
            Self {
                stops: stops.clone(),
                env: crate::exec::env::Empty,
                _value: std::marker::PhantomData,
            }
        }
    }

    impl<V: Send + 'static> Receiver for StopCounter<V> {
        type Value = V;
        type Env = crate::exec::env::Empty;

        fn env(&self) -> &Self::Env {
            &self.env
        }

        fn set_value(self, _value: V) {
            panic!("expected a stopped completion");
        }

        fn set_error(self, _error: crate::error::BoxError) {
            panic!("expected a stopped completion");
        }

        fn set_stopped(self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A stop token cancels one parked operation without disturbing the
    /// rest of the channel.
    #[test]
    fn test_token_cancels_parked_receive() {
        let chan = Channel::<i32>::rendezvous();
        let src = StopSource::new();
        let cancelled = thread::spawn({
            let chan = chan.clone();
            let token = src.token();
            move || sync_wait(chan.receive_async().with_stop_token(token)).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        src.request_stop();
        assert_eq!(cancelled.join().unwrap(), None);
        // The channel still works.
        let other = thread::spawn({
            let chan = chan.clone();
            move || sync_wait(chan.receive_async()).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        sync_wait(chan.send_async(3)).unwrap();
        assert_eq!(other.join().unwrap(), Some(3));
    }

    /// Values sent equal values received across concurrent producers.
    #[test]
    fn test_no_loss_many_producers() {
        let chan = Channel::unbounded();
        let sum = AtomicUsize::new(0);
        thread::scope(|s| {
            for p in 0..4 {
                let chan = chan.clone();
                s.spawn(move || {
                    for v in 0..32 {
                        sync_wait(chan.send_async(p * 100 + v)).unwrap();
                    }
                });
            }
            for _ in 0..128 {
                let v = sync_wait(chan.receive_async()).unwrap().unwrap();
                sum.fetch_add(v, Ordering::Relaxed);
            }
        });
        let expected: usize = (0..4).flat_map(|p| (0..32).map(move |v| p * 100 + v)).sum();
        assert_eq!(sum.load(Ordering::Relaxed), expected);
    }

    /// Sends and receives compose with pipeline algorithms.
    #[test]
    fn test_composes_with_when_all() {
        let chan = Channel::bounded(2, OverflowPolicy::Suspend);
        let out = sync_wait(when_all((
            chan.send_async(1).map(|()| "sent"),
            chan.receive_async(),
        )))
        .unwrap()
        .unwrap();
        assert_eq!(out, ("sent", 1));
    }
}
