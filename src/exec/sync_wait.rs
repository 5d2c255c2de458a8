//! Blocking sender consumer.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::error::BoxError;
use crate::exec::env::Empty;
use crate::exec::{Operation, Outcome, Receiver, Sender};

/// Runs `sender` to completion, blocking the calling thread.
///
/// Returns `Ok(Some(value))` on a value completion, `Ok(None)` on a stopped
/// completion, `Err` on an error completion.
///
/// The operation may complete on any thread; the slot handoff is a plain
/// mutex/condvar pair, so this is safe to call from threads that are not
/// driving any execution context (and deadlocks, as expected, when called
/// from the only thread that would complete it).
pub fn sync_wait<S: Sender>(sender: S) -> Result<Option<S::Value>, BoxError> {
    let shared = Arc::new(SyncWaitShared { slot: Mutex::new(None), cv: Condvar::new() });
    sender
        .connect(SyncWaitReceiver { shared: shared.clone(), env: Empty })
        .start();

    let mut slot = shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
    while slot.is_none() {
        slot = shared.cv.wait(slot).unwrap_or_else(PoisonError::into_inner);
    }
    match slot.take().expect("slot checked non-empty") {
        Outcome::Value(value) => Ok(Some(value)),
        Outcome::Error(error) => Err(error),
        Outcome::Stopped => Ok(None),
    }
}

struct SyncWaitShared<T> {
    slot: Mutex<Option<Outcome<T>>>,
    cv: Condvar,
}

struct SyncWaitReceiver<T> {
    shared: Arc<SyncWaitShared<T>>,
    env: Empty,
}

impl<T> SyncWaitReceiver<T> {
    fn fulfill(self, outcome: Outcome<T>) {
        let mut slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(slot.is_none(), "operation completed twice");
        *slot = Some(outcome);
        drop(slot);
        self.shared.cv.notify_one();
    }
}

impl<T: Send + 'static> Receiver for SyncWaitReceiver<T> {
    type Value = T;
    type Env = Empty;

    fn env(&self) -> &Empty {
        &self.env
    }

    fn set_value(self, value: T) {
        self.fulfill(Outcome::Value(value));
    }

    fn set_error(self, error: BoxError) {
        self.fulfill(Outcome::Error(error));
    }

    fn set_stopped(self) {
        self.fulfill(Outcome::Stopped);
    }
}
