//! Asynchronous mutual exclusion with fair handoff.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use crate::exec::{Operation, Receiver, Sender};

/// Untagged state of the acquisition word; any other value is the head of
/// the LIFO waiter stack. `LOCKED_IDLE` (null) means locked with no
/// pending waiter.
const UNLOCKED: usize = 1;
const LOCKED_IDLE: usize = 0;

struct WaitNode {
    next: *mut WaitNode,
    complete: Box<dyn FnOnce() + Send>,
}

/// An async mutex: acquisition is lock-free, release hands the lock to the
/// longest-waiting acquirer.
///
/// State machine of the acquisition word:
///
/// ```text
///   UNLOCKED ──try/lock CAS──► LOCKED_IDLE ──contended lock──► stack head
///       ▲                          │                              │
///       └────────── unlock ────────┘         unlock: take stack,  │
///                (no waiters)                reverse into pending ◄┘
/// ```
///
/// The pending FIFO is drained only by the unlocking thread, one handoff
/// per unlock: the lock is passed directly to the next waiter and is never
/// observed unlocked while waiters exist, which makes the queue
/// starvation-free. Waiter pushes use `Release`, acquisitions `Acquire`.
///
/// There is no guard type: a completed [`lock_async`](Self::lock_async)
/// (or successful [`try_lock`](Self::try_lock)) must be balanced by
/// exactly one [`unlock`](Self::unlock).
pub struct Mutex {
    waiting: AtomicUsize,
    /// FIFO of waiters already drained from `waiting`, touched only while
    /// holding the lock; the std mutex serializes misuse instead of
    /// letting it corrupt the list.
    pending: StdMutex<*mut WaitNode>,
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub fn new() -> Self {
        Self {
            waiting: AtomicUsize::new(UNLOCKED),
            pending: StdMutex::new(ptr::null_mut()),
        }
    }

    /// Attempts a synchronous acquisition.
    pub fn try_lock(&self) -> bool {
        self.waiting
            .compare_exchange(UNLOCKED, LOCKED_IDLE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// A sender completing with the mutex held.
    ///
    /// Completes inline when the mutex is free, otherwise on the thread of
    /// the unlock that hands the mutex over. Waits are not individually
    /// cancellable.
    pub fn lock_async(&self) -> LockAsync<'_> {
        LockAsync { mutex: self }
    }

    /// Releases the mutex, handing it to the longest-waiting acquirer if
    /// any.
    ///
    /// # Panics
    ///
    /// Panics when the mutex is not held.
    pub fn unlock(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_null() {
            let mut cur = self.waiting.load(Ordering::Relaxed);
            loop {
                match cur {
                    UNLOCKED => panic!("unlock of an unlocked async mutex"),
                    LOCKED_IDLE => {
                        // No waiters: publish the unlocked state.
                        match self.waiting.compare_exchange_weak(
                            LOCKED_IDLE,
                            UNLOCKED,
                            Ordering::Release,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => return,
                            Err(observed) => cur = observed,
                        }
                    }
                    head => {
                        // Claim the whole waiter stack.
                        match self.waiting.compare_exchange_weak(
                            head,
                            LOCKED_IDLE,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => {
                                // Reverse LIFO arrivals into FIFO handoff
                                // order.
                                let mut node = head as *mut WaitNode;
                                let mut fifo: *mut WaitNode = ptr::null_mut();
                                unsafe {
                                    while !node.is_null() {
                                        let next = (*node).next;
                                        (*node).next = fifo;
                                        fifo = node;
                                        node = next;
                                    }
                                }
                                *pending = fifo;
                                break;
                            }
                            Err(observed) => cur = observed,
                        }
                    }
                }
            }
        }
        // Hand off to the head of the FIFO; the lock stays held throughout.
        let node = *pending;
        unsafe {
            *pending = (*node).next;
            drop(pending);
            let node = Box::from_raw(node);
            (node.complete)();
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        // Abandoned waiters: free the nodes, dropping their receivers.
        let word = *self.waiting.get_mut();
        if word != UNLOCKED && word != LOCKED_IDLE {
            let mut head = word as *mut WaitNode;
            unsafe {
                while !head.is_null() {
                    let node = Box::from_raw(head);
                    head = node.next;
                }
            }
        }
        let mut pending = *self.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            while !pending.is_null() {
                let node = Box::from_raw(pending);
                pending = node.next;
            }
        }
    }
}

/// Sender returned by [`Mutex::lock_async`].
pub struct LockAsync<'a> {
    mutex: &'a Mutex,
}

impl<'a> Sender for LockAsync<'a> {
    type Value = ();

    type Operation<R>
        = LockAsyncOp<'a, R>
    where
        R: Receiver<Value = ()>;

    fn connect<R>(self, receiver: R) -> LockAsyncOp<'a, R>
    where
        R: Receiver<Value = ()>,
    {
        LockAsyncOp { mutex: self.mutex, receiver }
    }
}

pub struct LockAsyncOp<'a, R> {
    mutex: &'a Mutex,
    receiver: R,
}

impl<R> Operation for LockAsyncOp<'_, R>
where
    R: Receiver<Value = ()>,
{
    fn start(self) {
        let word = &self.mutex.waiting;
        let receiver = self.receiver;
        let mut node = Box::new(WaitNode {
            next: ptr::null_mut(),
            complete: Box::new(move || receiver.set_value(())),
        });
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            if cur == UNLOCKED {
                match word.compare_exchange_weak(
                    UNLOCKED,
                    LOCKED_IDLE,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Acquired synchronously.
                        (node.complete)();
                        return;
                    }
                    Err(observed) => cur = observed,
                }
            } else {
                node.next = cur as *mut WaitNode;
                let raw = Box::into_raw(node);
                match word.compare_exchange_weak(
                    cur,
                    raw as usize,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(observed) => {
                        node = unsafe { Box::from_raw(raw) };
                        cur = observed;
                    }
                }
            }
        }
    }
}
