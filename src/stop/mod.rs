//! Cooperative cancellation: stop sources, tokens and callbacks.
//!
//! A [`StopSource`] owns a one-way "stop requested" flag and a list of
//! registered callbacks. [`StopToken`]s are cheap observing handles;
//! [`StopCallback`]s register a closure that runs exactly once when stop is
//! requested, and deregister on drop.
//!
//! ## State word layout
//!
//! The source packs everything that must change together into a single
//! `AtomicUsize`:
//!
//! ```text
//! ┌───────────────────────────────┬───────────┬────────┐
//! │ head of callback list (ptr)   │ REQUESTED │ LOCKED │
//! └───────────────────────────────┴───────────┴────────┘
//!   bits 2..                         bit 1       bit 0
//! ```
//!
//! Callback nodes are heap allocations with pointer alignment, so the two
//! low bits of the head pointer are always free. Taking the lock spins with
//! [`Backoff`] under contention; the critical sections are a handful of
//! pointer updates.
//!
//! ## Synchronization
//!
//! | Operation | Memory ordering | Purpose |
//! |-----------|-----------------|---------|
//! | lock CAS | `Acquire` | See list mutations of the previous holder |
//! | unlock store | `Release` | Publish list mutations to the next holder |
//! | `REQUESTED` read | `Acquire` | Pair with the requesting thread's flip |
//! | node `state` store | `Release` | Publish "started"/"completed" to a dropping thread |
//! | node `state` read | `Acquire` | Observe the callback's progress |
//!
//! ## Callback execution protocol
//!
//! `request_stop` detaches one callback at a time, marks it started,
//! releases the lock and only then invokes it, so user code never runs under
//! the internal lock. Dropping a [`StopCallback`] whose closure is currently
//! executing either marks it as removed (when the drop happens on the
//! requesting thread, i.e. from inside the closure itself) or blocks until
//! the closure finishes. Registered-after-request callbacks run inline in
//! the registering thread.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use crossbeam_utils::Backoff;

const LOCKED: usize = 0b01;
const REQUESTED: usize = 0b10;
const HEAD_MASK: usize = !(LOCKED | REQUESTED);

// Per-callback execution progress.
const NOT_STARTED: u8 = 0;
const STARTED: u8 = 1;
const COMPLETED: u8 = 2;

type Callback = Box<dyn FnOnce() + Send>;

struct CallbackNode {
    prev: *mut CallbackNode,
    next: *mut CallbackNode,
    callback: Option<Callback>,
    state: AtomicU8,
    /// While `state == STARTED`, points at a `bool` on the requesting
    /// thread's stack; a same-thread drop flips it to tell the requester
    /// not to touch this node again.
    removed_ptr: *mut bool,
}

struct StopState {
    word: AtomicUsize,
    /// Guarded by the lock bit of `word`.
    requesting_thread: UnsafeCell<Option<ThreadId>>,
}

// The raw pointers inside `word` only ever reference heap nodes whose
// ownership is coordinated by the protocol above.
unsafe impl Send for StopState {}
unsafe impl Sync for StopState {}

impl StopState {
    fn new() -> Self {
        Self {
            word: AtomicUsize::new(0),
            requesting_thread: UnsafeCell::new(None),
        }
    }

    fn stop_requested(&self) -> bool {
        self.word.load(Ordering::Acquire) & REQUESTED != 0
    }

    /// Spins until the lock bit is acquired, returning the current head.
    fn lock_and_load(&self) -> *mut CallbackNode {
        let backoff = Backoff::new();
        loop {
            let cur = self.word.load(Ordering::Relaxed);
            if cur & LOCKED == 0 {
                if self
                    .word
                    .compare_exchange_weak(cur, cur | LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return (cur & HEAD_MASK) as *mut CallbackNode;
                }
            } else {
                backoff.snooze();
            }
        }
    }

    /// Publishes a new head and releases the lock, preserving `REQUESTED`.
    ///
    /// Only the lock holder may call this, so the non-atomic read-modify
    /// of the flag bits cannot race.
    fn store_and_unlock(&self, head: *mut CallbackNode) {
        let requested = self.word.load(Ordering::Relaxed) & REQUESTED;
        self.word.store(head as usize | requested, Ordering::Release);
    }

    /// Takes the lock unless stop was already requested.
    fn lock_if_not_requested(&self) -> Option<*mut CallbackNode> {
        if self.stop_requested() {
            return None;
        }
        let head = self.lock_and_load();
        // Re-check: the flag may have flipped while we were spinning.
        if self.word.load(Ordering::Relaxed) & REQUESTED != 0 {
            self.store_and_unlock(head);
            return None;
        }
        Some(head)
    }

    fn request_stop(&self) -> bool {
        let Some(head) = self.lock_if_not_requested() else {
            return false;
        };
        unsafe { *self.requesting_thread.get() = Some(thread::current().id()) };
        self.word.fetch_or(REQUESTED, Ordering::Release);

        let mut current = head;
        while !current.is_null() {
            unsafe {
                // Detach the head callback.
                let new_head = (*current).next;
                if !new_head.is_null() {
                    (*new_head).prev = ptr::null_mut();
                }
                let callback = (*current).callback.take();
                let mut removed = false;
                (*current).removed_ptr = &mut removed;
                (*current).state.store(STARTED, Ordering::Release);
                self.store_and_unlock(new_head);

                // Lock released; run the callback.
                if let Some(callback) = callback {
                    callback();
                }
                // If the owning `StopCallback` was dropped from inside the
                // closure, it has flipped our stack flag and already freed
                // the node: hands off.
                if !removed {
                    (*current).state.store(COMPLETED, Ordering::Release);
                }
            }
            current = self.lock_and_load();
        }
        self.store_and_unlock(ptr::null_mut());
        true
    }

    /// Registers `node` unless stop was already requested.
    ///
    /// Returns `false` when the caller must run the callback inline.
    unsafe fn try_attach(&self, node: *mut CallbackNode) -> bool {
        let Some(head) = self.lock_if_not_requested() else {
            return false;
        };
        unsafe {
            (*node).next = head;
            if !head.is_null() {
                (*head).prev = node;
            }
        }
        self.store_and_unlock(node);
        true
    }

    /// Deregisters `node`; the caller frees it afterwards.
    unsafe fn detach(&self, node: *mut CallbackNode) {
        let head = self.lock_and_load();
        unsafe {
            let observed = (*node).state.load(Ordering::Acquire);
            if observed == NOT_STARTED {
                // Still linked; unlink and unlock.
                let prev = (*node).prev;
                let next = (*node).next;
                if !next.is_null() {
                    (*next).prev = prev;
                }
                if !prev.is_null() {
                    (*prev).next = next;
                    self.store_and_unlock(head);
                } else {
                    // Node is the current head.
                    self.store_and_unlock(next);
                }
                return;
            }
            // Execution has started; the list no longer references the node.
            let requesting = *self.requesting_thread.get();
            self.store_and_unlock(head);
            if observed == STARTED && requesting == Some(thread::current().id()) {
                // The closure itself is dropping its registration: flag the
                // requester's stack slot. Only valid mid-execution; once
                // `COMPLETED` is published that slot is gone.
                *(*node).removed_ptr = true;
            } else {
                // Block until the requesting thread finishes the closure
                // (no-op if it already has).
                let backoff = Backoff::new();
                while (*node).state.load(Ordering::Acquire) != COMPLETED {
                    backoff.snooze();
                }
            }
        }
    }
}

/// Owner of a cancellation flag that can be requested exactly once.
pub struct StopSource {
    state: Arc<StopState>,
}

impl StopSource {
    pub fn new() -> Self {
        Self { state: Arc::new(StopState::new()) }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> StopToken {
        StopToken { state: Some(self.state.clone()) }
    }

    /// Requests stop, running every registered callback on this thread.
    ///
    /// Returns `true` iff this call performed the transition; all later
    /// calls return `false` without touching the callbacks.
    pub fn request_stop(&self) -> bool {
        self.state.request_stop()
    }

    pub fn stop_requested(&self) -> bool {
        self.state.stop_requested()
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StopSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSource")
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

/// Cheap observing handle to a [`StopSource`], or the never-stopping token.
#[derive(Clone)]
pub struct StopToken {
    state: Option<Arc<StopState>>,
}

impl StopToken {
    /// A token that can never report a stop request.
    ///
    /// Registering a callback on it is a no-op; the callback is dropped
    /// without ever running.
    pub fn never() -> Self {
        Self { state: None }
    }

    pub fn stop_requested(&self) -> bool {
        self.state.as_deref().is_some_and(StopState::stop_requested)
    }

    /// `false` for [`StopToken::never`], `true` when associated with a source.
    pub fn stop_possible(&self) -> bool {
        self.state.is_some()
    }
}

impl PartialEq for StopToken {
    fn eq(&self, other: &Self) -> bool {
        match (&self.state, &other.state) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for StopToken {}

impl fmt::Debug for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopToken")
            .field("stop_possible", &self.stop_possible())
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

/// Registration of a closure to run on stop request.
///
/// The closure runs exactly once if stop is requested while the
/// registration is alive; registering on an already-requested token runs it
/// inline before `new` returns. Dropping the registration guarantees the
/// closure is not running (and never will run) once `drop` returns, except
/// when the drop happens from inside the closure itself.
pub struct StopCallback {
    registration: Option<(Arc<StopState>, NonNull<CallbackNode>)>,
}

// The node pointer is only dereferenced through the source's protocol.
unsafe impl Send for StopCallback {}

impl StopCallback {
    pub fn new<F>(token: &StopToken, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(state) = &token.state else {
            // Never-stop token: nothing to observe.
            return Self { registration: None };
        };
        let node = Box::into_raw(Box::new(CallbackNode {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            callback: Some(Box::new(callback)),
            state: AtomicU8::new(NOT_STARTED),
            removed_ptr: ptr::null_mut(),
        }));
        unsafe {
            if state.try_attach(node) {
                Self { registration: Some((state.clone(), NonNull::new_unchecked(node))) }
            } else {
                // Stop already requested: run inline, keep nothing.
                let mut node = Box::from_raw(node);
                if let Some(callback) = node.callback.take() {
                    callback();
                }
                Self { registration: None }
            }
        }
    }
}

impl Drop for StopCallback {
    fn drop(&mut self) {
        if let Some((state, node)) = self.registration.take() {
            unsafe {
                state.detach(node.as_ptr());
                drop(Box::from_raw(node.as_ptr()));
            }
        }
    }
}

impl fmt::Debug for StopCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopCallback")
            .field("registered", &self.registration.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// A registered callback runs exactly once when stop is requested.
    #[test]
    fn test_callback_runs_once() {
        let src = StopSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb = {
            let hits = hits.clone();
            StopCallback::new(&src.token(), move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert!(src.request_stop());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(cb);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    /// The transition happens exactly once.
    #[test]
    fn test_request_stop_is_one_shot() {
        let src = StopSource::new();
        assert!(!src.stop_requested());
        assert!(src.request_stop());
        assert!(!src.request_stop());
        assert!(src.stop_requested());
        assert!(src.token().stop_requested());
    }

    /// Registering after the request runs the callback inline.
    #[test]
    fn test_late_registration_runs_inline() {
        let src = StopSource::new();
        src.request_stop();
        let hits = Arc::new(AtomicUsize::new(0));
        let _cb = {
            let hits = hits.clone();
            StopCallback::new(&src.token(), move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    /// A deregistered callback never runs.
    #[test]
    fn test_dropped_callback_does_not_run() {
        let src = StopSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb = {
            let hits = hits.clone();
            StopCallback::new(&src.token(), move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        drop(cb);
        src.request_stop();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    /// The never token observes nothing and swallows registrations.
    #[test]
    fn test_never_token() {
        let token = StopToken::never();
        assert!(!token.stop_possible());
        assert!(!token.stop_requested());
        let hits = Arc::new(AtomicUsize::new(0));
        let _cb = {
            let hits = hits.clone();
            StopCallback::new(&token, move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    /// Callbacks run in some order, each exactly once, with several
    /// registrations outstanding.
    #[test]
    fn test_many_callbacks() {
        let src = StopSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cbs: Vec<_> = (0..32)
            .map(|_| {
                let hits = hits.clone();
                StopCallback::new(&src.token(), move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        src.request_stop();
        assert_eq!(hits.load(Ordering::SeqCst), 32);
        drop(cbs);
    }

    /// A callback may drop another registration from inside its closure.
    #[test]
    fn test_callback_drops_sibling() {
        let src = StopSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<StopCallback>>> = Arc::new(Mutex::new(None));

        let sibling = {
            let hits = hits.clone();
            StopCallback::new(&src.token(), move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        *slot.lock().unwrap() = Some(sibling);

        let _killer = {
            let slot = slot.clone();
            StopCallback::new(&src.token(), move || {
                // Deregisters the sibling before it had a chance to run
                // (LIFO registration order: this callback runs first).
                *slot.lock().unwrap() = None;
            })
        };
        src.request_stop();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    /// A registration dropped from inside its own closure is handled
    /// without blocking or double-free.
    #[test]
    fn test_callback_drops_itself() {
        let src = StopSource::new();
        let slot: Arc<Mutex<Option<StopCallback>>> = Arc::new(Mutex::new(None));
        let cb = {
            let slot = slot.clone();
            StopCallback::new(&src.token(), move || {
                *slot.lock().unwrap() = None;
            })
        };
        *slot.lock().unwrap() = Some(cb);
        src.request_stop();
        assert!(slot.lock().unwrap().is_none());
    }

    /// Dropping a callback concurrently with its execution blocks until the
    /// closure has finished, so the drop cannot outrun the closure.
    #[test]
    fn test_drop_waits_for_running_callback() {
        let src = StopSource::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let cb = {
            let finished = finished.clone();
            StopCallback::new(&src.token(), move || {
                std::thread::sleep(Duration::from_millis(50));
                finished.store(1, Ordering::SeqCst);
            })
        };

        let requester = std::thread::spawn(move || {
            src.request_stop();
        });
        // Let the requester enter the callback.
        std::thread::sleep(Duration::from_millis(10));
        drop(cb);
        // After drop returns the closure must have completed.
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        requester.join().unwrap();
    }

    /// Hammer registrations and deregistrations against a concurrent stop
    /// request; every callback either runs once or not at all.
    #[test]
    fn test_concurrent_register_and_request() {
        for _ in 0..16 {
            let src = Arc::new(StopSource::new());
            let hits = Arc::new(AtomicUsize::new(0));
            let mut threads = Vec::new();
            for _ in 0..4 {
                let src = src.clone();
                let hits = hits.clone();
                threads.push(std::thread::spawn(move || {
                    for _ in 0..64 {
                        let hits = hits.clone();
                        let cb = StopCallback::new(&src.token(), move || {
                            hits.fetch_add(1, Ordering::SeqCst);
                        });
                        drop(cb);
                    }
                }));
            }
            let requester = {
                let src = src.clone();
                std::thread::spawn(move || {
                    src.request_stop();
                })
            };
            for t in threads {
                t.join().unwrap();
            }
            requester.join().unwrap();
            // No assertion on the exact count: only that nothing crashed
            // and the flag latched.
            assert!(src.stop_requested());
        }
    }
}
