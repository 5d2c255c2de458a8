//! Asynchronous readers/writer lock with fair handoff.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::Backoff;

use crate::exec::{Operation, Receiver, Sender};

/// Sentinel for "held uniquely" in the holder count.
const UNIQUE_LOCKED: isize = -1;

struct WaitNode {
    next: *mut WaitNode,
    shared: bool,
    complete: Box<dyn FnOnce() + Send>,
}

struct State {
    /// `0` unheld, `-1` held uniquely, positive = number of shared
    /// holders.
    holders: isize,
    /// LIFO of newly arrived waiters.
    waiting: *mut WaitNode,
    /// FIFO drained from `waiting`, consumed by handoffs.
    pending: *mut WaitNode,
}

/// A readers/writer async mutex.
///
/// Any number of shared holders may coexist; a unique holder excludes
/// everyone. Handoff is FIFO over arrival order: releasing the lock
/// resumes either the next unique waiter alone, or the next contiguous run
/// of shared waiters together. A shared acquisition fails fast whenever
/// *any* waiter is queued, so a waiting writer is never bypassed by
/// readers that arrived after it.
///
/// The state sits behind a spinlock; waiter completions always run after
/// the spinlock is released. Like [`Mutex`](super::Mutex) there are no
/// guards: balance each acquisition with the matching
/// [`unlock`](Self::unlock) / [`unlock_shared`](Self::unlock_shared).
pub struct SharedMutex {
    locked: AtomicBool,
    state: UnsafeCell<State>,
}

// All state behind the spinlock; waiter nodes are owned by the lists.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    pub fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            state: UnsafeCell::new(State {
                holders: 0,
                waiting: ptr::null_mut(),
                pending: ptr::null_mut(),
            }),
        }
    }

    /// Runs `f` under the spinlock.
    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let backoff = Backoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            backoff.snooze();
        }
        let result = f(unsafe { &mut *self.state.get() });
        self.locked.store(false, Ordering::Release);
        result
    }

    /// Attempts a synchronous unique acquisition.
    pub fn try_lock(&self) -> bool {
        self.with_state(|state| {
            if state.holders == 0 {
                state.holders = UNIQUE_LOCKED;
                true
            } else {
                false
            }
        })
    }

    /// Attempts a synchronous shared acquisition; refuses whenever any
    /// waiter is queued, even a shared one, to preserve FIFO fairness.
    pub fn try_lock_shared(&self) -> bool {
        self.with_state(|state| {
            if state.holders != UNIQUE_LOCKED
                && state.waiting.is_null()
                && state.pending.is_null()
            {
                state.holders += 1;
                true
            } else {
                false
            }
        })
    }

    /// A sender completing with the mutex held uniquely.
    pub fn lock_async(&self) -> LockAsync<'_> {
        LockAsync { mutex: self, shared: false }
    }

    /// A sender completing with the mutex held shared.
    pub fn lock_shared_async(&self) -> LockAsync<'_> {
        LockAsync { mutex: self, shared: true }
    }

    /// Releases a unique hold.
    ///
    /// # Panics
    ///
    /// Panics when the mutex is not held uniquely.
    pub fn unlock(&self) {
        let resume = self.with_state(|state| {
            assert!(
                state.holders == UNIQUE_LOCKED,
                "unique unlock of a shared mutex that is not held uniquely"
            );
            state.holders = 0;
            Self::take_resumption(state)
        });
        Self::resume_chain(resume);
    }

    /// Releases a shared hold; the last shared holder performs handoff.
    ///
    /// # Panics
    ///
    /// Panics when the mutex is not held shared.
    pub fn unlock_shared(&self) {
        let resume = self.with_state(|state| {
            assert!(
                state.holders > 0,
                "shared unlock of a shared mutex that is not held shared"
            );
            state.holders -= 1;
            if state.holders == 0 {
                Self::take_resumption(state)
            } else {
                ptr::null_mut()
            }
        });
        Self::resume_chain(resume);
    }

    /// Selects the waiters to resume and updates the holder count; called
    /// under the spinlock with the mutex unheld. Returns a chain detached
    /// from the lists.
    fn take_resumption(state: &mut State) -> *mut WaitNode {
        unsafe {
            if state.pending.is_null() {
                // Refill the FIFO from the LIFO arrivals.
                let mut node = state.waiting;
                state.waiting = ptr::null_mut();
                let mut fifo: *mut WaitNode = ptr::null_mut();
                while !node.is_null() {
                    let next = (*node).next;
                    (*node).next = fifo;
                    fifo = node;
                    node = next;
                }
                state.pending = fifo;
            }
            if state.pending.is_null() {
                return ptr::null_mut();
            }
            if !(*state.pending).shared {
                // Exclusive handoff to a single writer.
                state.holders = UNIQUE_LOCKED;
                let head = state.pending;
                state.pending = (*head).next;
                (*head).next = ptr::null_mut();
                return head;
            }
            // Shared handoff: a contiguous prefix of readers.
            let head = state.pending;
            let mut last = head;
            loop {
                state.holders += 1;
                let next = (*last).next;
                if next.is_null() || !(*next).shared {
                    state.pending = next;
                    (*last).next = ptr::null_mut();
                    break;
                }
                last = next;
            }
            head
        }
    }

    /// Completes a detached chain of waiters, outside the spinlock.
    fn resume_chain(mut node: *mut WaitNode) {
        unsafe {
            while !node.is_null() {
                let owned = Box::from_raw(node);
                node = owned.next;
                (owned.complete)();
            }
        }
    }
}

impl Default for SharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SharedMutex {
    fn drop(&mut self) {
        // Abandoned waiters: free the nodes, dropping their receivers.
        let state = self.state.get_mut();
        for list in [state.waiting, state.pending] {
            let mut node = list;
            unsafe {
                while !node.is_null() {
                    let owned = Box::from_raw(node);
                    node = owned.next;
                }
            }
        }
    }
}

/// Sender returned by [`SharedMutex::lock_async`] and
/// [`SharedMutex::lock_shared_async`].
pub struct LockAsync<'a> {
    mutex: &'a SharedMutex,
    shared: bool,
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
        LockAsyncOp { mutex: self.mutex, shared: self.shared, receiver }
    }
}

pub struct LockAsyncOp<'a, R> {
    mutex: &'a SharedMutex,
    shared: bool,
    receiver: R,
}

impl<R> Operation for LockAsyncOp<'_, R>
where
    R: Receiver<Value = ()>,
{
    fn start(self) {
        let shared = self.shared;
        let receiver = self.receiver;
        let node = Box::new(WaitNode {
            next: ptr::null_mut(),
            shared,
            complete: Box::new(move || receiver.set_value(())),
        });
        let acquired = self.mutex.with_state(move |state| {
            let can_acquire = if shared {
                state.holders != UNIQUE_LOCKED
                    && state.waiting.is_null()
                    && state.pending.is_null()
            } else {
                state.holders == 0
            };
            if can_acquire {
                if shared {
                    state.holders += 1;
                } else {
                    state.holders = UNIQUE_LOCKED;
                }
                Some(node)
            } else {
                let raw = Box::into_raw(node);
                unsafe { (*raw).next = state.waiting };
                state.waiting = raw;
                None
            }
        });
        // Synchronous acquisition: complete outside the spinlock.
        if let Some(node) = acquired {
            (node.complete)();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

    use super::*;
    use crate::exec::sync_wait;
    use crate::senders::SenderExt;

    /// Unique and shared synchronous acquisition rules.
    #[test]
    fn test_try_lock_rules() {
        let mtx = SharedMutex::new();
        assert!(mtx.try_lock_shared());
        assert!(mtx.try_lock_shared());
        assert!(!mtx.try_lock());
        mtx.unlock_shared();
        mtx.unlock_shared();
        assert!(mtx.try_lock());
        assert!(!mtx.try_lock_shared());
        assert!(!mtx.try_lock());
        mtx.unlock();
    }

    /// Misuse is a detected contract violation.
    #[test]
    #[should_panic(expected = "not held uniquely")]
    fn test_bad_unique_unlock_panics() {
        let mtx = SharedMutex::new();
        mtx.unlock();
    }

    /// A queued writer blocks later shared acquisitions (no reader
    /// bypass).
    #[test]
    fn test_writer_is_not_bypassed() {
        let mtx = Arc::new(SharedMutex::new());
        assert!(mtx.try_lock_shared());
        // A writer queues behind the reader.
        let granted = Arc::new(AtomicUsize::new(0));
        {
            let granted = granted.clone();
            let mtx2 = mtx.clone();
            mtx.lock_async()
                .map(move |()| {
                    granted.fetch_add(1, Ordering::SeqCst);
                    mtx2.unlock();
                })
                .connect(crate::sync::tests_support::NullReceiver::default())
                .start();
        }
        // A reader arriving after the writer must not jump the queue.
        assert!(!mtx.try_lock_shared());
        assert_eq!(granted.load(Ordering::SeqCst), 0);
        // Releasing the original reader hands off to the writer.
        mtx.unlock_shared();
        assert_eq!(granted.load(Ordering::SeqCst), 1);
        assert!(mtx.try_lock_shared());
        mtx.unlock_shared();
    }

    /// A contiguous run of readers is resumed together after a writer.
    #[test]
    fn test_shared_batch_handoff() {
        let mtx = Arc::new(SharedMutex::new());
        assert!(mtx.try_lock());
        let concurrent = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let concurrent = concurrent.clone();
            mtx.lock_shared_async()
                .map(move |()| {
                    concurrent.fetch_add(1, Ordering::SeqCst);
                    // Holds are released later, below.
                })
                .connect(crate::sync::tests_support::NullReceiver::default())
                .start();
        }
        assert_eq!(concurrent.load(Ordering::SeqCst), 0);
        mtx.unlock();
        // All three readers were granted by the single handoff.
        assert_eq!(concurrent.load(Ordering::SeqCst), 3);
        mtx.unlock_shared();
        mtx.unlock_shared();
        mtx.unlock_shared();
    }

    /// Never a unique holder concurrent with any other holder.
    #[test]
    fn test_exclusion_invariant() {
        let mtx = Arc::new(SharedMutex::new());
        // Positive while readers hold, a large negative while a writer
        // holds; any overlap shows up as an impossible count.
        let holders = Arc::new(AtomicIsize::new(0));

        let mut waits = Vec::new();
        for i in 0..64 {
            let mtx = mtx.clone();
            let holders = holders.clone();
            waits.push(std::thread::spawn(move || {
                let unlocker = mtx.clone();
                if i % 4 == 0 {
                    sync_wait(mtx.lock_async().map(move |()| {
                        assert_eq!(holders.fetch_sub(1000, Ordering::SeqCst), 0);
                        assert_eq!(holders.fetch_add(1000, Ordering::SeqCst), -1000);
                        unlocker.unlock();
                    }))
                    .unwrap();
                } else {
                    sync_wait(mtx.lock_shared_async().map(move |()| {
                        assert!(holders.fetch_add(1, Ordering::SeqCst) >= 0);
                        assert!(holders.fetch_sub(1, Ordering::SeqCst) >= 1);
                        unlocker.unlock_shared();
                    }))
                    .unwrap();
                }
            }));
        }
        for w in waits {
            w.join().unwrap();
        }
        assert_eq!(holders.load(Ordering::SeqCst), 0);
    }
}
