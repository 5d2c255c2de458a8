//! Asynchronous synchronization primitives.
//!
//! - [`ManualResetEvent`]: lock-free latch with a LIFO waiter stack,
//!   released FIFO.
//! - [`Mutex`]: async mutual exclusion with lock-free acquisition and fair
//!   FIFO handoff.
//! - [`SharedMutex`]: readers/writer lock with FIFO handoff; a writer is
//!   never bypassed by readers that arrived after it.
//! - [`Scope`]: structured-concurrency scope tracking spawned work, with
//!   group cancellation and asynchronous teardown.
//!
//! All waits are senders: they suspend the awaiting operation until the
//! resource is available and complete it on the thread that released the
//! resource. None of these primitives invoke completions while holding an
//! internal lock.

mod event;
mod mutex;
mod scope;
mod shared_mutex;

pub use event::ManualResetEvent;
pub use mutex::Mutex;
pub use scope::Scope;
pub use shared_mutex::SharedMutex;

#[cfg(test)]
pub(crate) mod tests_support {
    use crate::error::BoxError;
    use crate::exec::Receiver;
    use crate::exec::env::Empty;

    /// Discards every completion; lets tests start fire-and-forget ops.
    #[derive(Default)]
    pub(crate) struct NullReceiver {
        env: Empty,
    }

    impl Receiver for NullReceiver {
        type Value = ();
        type Env = Empty;

        fn env(&self) -> &Empty {
            &self.env
        }

        fn set_value(self, (): ()) {}
        fn set_error(self, _error: BoxError) {}
        fn set_stopped(self) {}
    }
}
