//! Asynchronous manual-reset event.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::exec::{Operation, Receiver, Sender};

/// Untagged states of the waiter word; any other value is the head of the
/// waiter stack.
const EMPTY: usize = 0;
const SET: usize = 1;

struct WaitNode {
    next: *mut WaitNode,
    complete: Box<dyn FnOnce() + Send>,
}

/// A latch that stays signalled until explicitly reset.
///
/// One word of state encodes everything:
///
/// ```text
/// EMPTY (0)  ──wait──►  node ─► node ─► …   (LIFO stack of waiters)
///    │                        │
///   set                      set: swap in SET, reverse, release FIFO
///    ▼                        ▼
///  SET (1)  ── wait completes inline on the waiting thread
/// ```
///
/// ## Synchronization
///
/// | Operation | Memory ordering | Purpose |
/// |-----------|-----------------|---------|
/// | waiter push CAS | `Release` | Publish the node to the setter |
/// | `set` swap | `AcqRel` | Acquire the stack, publish the signal |
/// | inline-complete load | `Acquire` | See writes preceding `set` |
/// | `reset` CAS | `AcqRel` | Order against `set`/`wait` cycles |
///
/// Completions released by [`set`](Self::set) happen-after everything the
/// setting thread did before calling it.
///
/// Waits are not individually cancellable; dropping the event abandons any
/// still-queued waiters (their receivers are dropped without completing),
/// so the event must be kept alive until outstanding waits finish.
pub struct ManualResetEvent {
    word: AtomicUsize,
}

// Raw waiter pointers are owned by the stack and freed exactly once.
unsafe impl Send for ManualResetEvent {}
unsafe impl Sync for ManualResetEvent {}

impl ManualResetEvent {
    pub fn new(initially_set: bool) -> Self {
        Self { word: AtomicUsize::new(if initially_set { SET } else { EMPTY }) }
    }

    pub fn is_set(&self) -> bool {
        self.word.load(Ordering::Acquire) == SET
    }

    /// Signals the event and releases every queued waiter in FIFO order on
    /// the calling thread. Idempotent while set.
    pub fn set(&self) {
        let prev = self.word.swap(SET, Ordering::AcqRel);
        if prev == SET || prev == EMPTY {
            return;
        }
        // We own the whole stack now; reverse it so waiters complete in
        // the order they arrived.
        let mut head = prev as *mut WaitNode;
        let mut reversed: *mut WaitNode = ptr::null_mut();
        unsafe {
            while !head.is_null() {
                let next = (*head).next;
                (*head).next = reversed;
                reversed = head;
                head = next;
            }
            while !reversed.is_null() {
                // The node may be freed by the completion's fallout; read
                // the link first.
                let node = Box::from_raw(reversed);
                reversed = node.next;
                (node.complete)();
            }
        }
    }

    /// Unsignals the event; a no-op unless currently set.
    pub fn reset(&self) {
        let _ = self
            .word
            .compare_exchange(SET, EMPTY, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// A sender completing once the event is set.
    ///
    /// Completes inline on the starting thread when the event is already
    /// set, otherwise on the thread that eventually calls
    /// [`set`](Self::set).
    pub fn wait_async(&self) -> WaitAsync<'_> {
        WaitAsync { event: self }
    }
}

impl Drop for ManualResetEvent {
    fn drop(&mut self) {
        let word = *self.word.get_mut();
        if word == SET || word == EMPTY {
            return;
        }
        // Abandoned waiters: free the nodes, dropping their receivers.
        let mut head = word as *mut WaitNode;
        unsafe {
            while !head.is_null() {
                let node = Box::from_raw(head);
                head = node.next;
            }
        }
    }
}

/// Sender returned by [`ManualResetEvent::wait_async`].
pub struct WaitAsync<'a> {
    event: &'a ManualResetEvent,
}

impl<'a> Sender for WaitAsync<'a> {
    type Value = ();

    type Operation<R>
        = WaitAsyncOp<'a, R>
    where
        R: Receiver<Value = ()>;

    fn connect<R>(self, receiver: R) -> WaitAsyncOp<'a, R>
    where
        R: Receiver<Value = ()>,
    {
        WaitAsyncOp { event: self.event, receiver }
    }
}

pub struct WaitAsyncOp<'a, R> {
    event: &'a ManualResetEvent,
    receiver: R,
}

impl<R> Operation for WaitAsyncOp<'_, R>
where
    R: Receiver<Value = ()>,
{
    fn start(self) {
        let word = &self.event.word;
        let receiver = self.receiver;
        let mut node = Box::new(WaitNode {
            next: ptr::null_mut(),
            complete: Box::new(move || receiver.set_value(())),
        });
        let mut cur = word.load(Ordering::Acquire);
        loop {
            if cur == SET {
                // Already signalled: complete synchronously.
                (node.complete)();
                return;
            }
            node.next = cur as *mut WaitNode;
            let raw = Box::into_raw(node);
            match word.compare_exchange_weak(cur, raw as usize, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => {
                    node = unsafe { Box::from_raw(raw) };
                    cur = observed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::exec::sync_wait;
    use crate::senders::SenderExt;

    /// Waiting on a set event completes inline.
    #[test]
    fn test_wait_on_set_event() {
        let ev = ManualResetEvent::new(true);
        assert_eq!(sync_wait(ev.wait_async()).unwrap(), Some(()));
    }

    /// `set` releases a waiter queued on another thread, and the waiter
    /// observes writes made before `set` (release/acquire handoff).
    #[test]
    fn test_cross_thread_handoff() {
        let ev = Arc::new(ManualResetEvent::new(false));
        let payload = Arc::new(AtomicUsize::new(0));
        let waiter = thread::spawn({
            let ev = ev.clone();
            let payload = payload.clone();
            move || {
                let seen = sync_wait(ev.wait_async().map(move |()| payload.load(Ordering::Relaxed)))
                    .unwrap()
                    .unwrap();
                assert_eq!(seen, 7);
            }
        });
        thread::sleep(Duration::from_millis(20));
        payload.store(7, Ordering::Relaxed);
        ev.set();
        waiter.join().unwrap();
    }

    /// All queued waiters are released by one `set`, in FIFO order.
    #[test]
    fn test_fifo_release() {
        let ev = ManualResetEvent::new(false);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            ev.wait_async()
                .map(move |()| order.lock().unwrap().push(i))
                .connect(crate::sync::tests_support::NullReceiver::default())
                .start();
        }
        ev.set();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    /// `reset` makes subsequent waits block until the next `set`.
    #[test]
    fn test_reset_cycle() {
        let ev = Arc::new(ManualResetEvent::new(true));
        ev.reset();
        assert!(!ev.is_set());
        let waiter = thread::spawn({
            let ev = ev.clone();
            move || sync_wait(ev.wait_async()).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        ev.set();
        assert_eq!(waiter.join().unwrap(), Some(()));
    }
}
