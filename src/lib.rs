//! # telaio
//!
//! Structured concurrency for Rust, built on a sender/receiver execution
//! protocol: asynchronous operations are *described* as [`Sender`]s,
//! *materialized* by connecting them to a [`Receiver`], and *launched* by
//! starting the resulting operation. Exactly one of three completion
//! signals comes back: a value, a type-erased error, or a stop.
//!
//! ```text
//!            describe            materialize            launch
//!   Sender ───────────► connect(receiver) ───► Operation ───► start()
//!      │                                                        │
//!      │  map / then / when_all / race / on / …                 ▼
//!      └── senders compose into pipelines          set_value | set_error | set_stopped
//! ```
//!
//! ## What's in the box
//!
//! | Layer | Module | Contents |
//! |-------|--------|----------|
//! | cancellation | [`stop`] | stop source/token/callback |
//! | protocol | [`exec`] | core traits, environments, `sync_wait`, type-erased scheduler |
//! | algorithms | [`senders`] | `just`, `map`, `then`, `when_all`, `race`, scheduler hops |
//! | contexts | [`run_loop`], [`thread_pool`], [`time`] | single-thread loop, work-stealing pool, timer loop |
//! | coroutine bridge | [`bridge`] | await senders, run futures as senders, lazy tasks |
//! | primitives | [`sync`], [`channel`] | event, async mutexes, scope, mpmc channel |
//!
//! ## Example
//!
//! ```
//! use telaio::exec::sync_wait;
//! use telaio::senders::{SenderExt, on, when_all};
//! use telaio::thread_pool::StaticThreadPool;
//!
//! let pool = StaticThreadPool::new(4);
//! let work = when_all((
//!     on(pool.scheduler(), telaio::senders::just(40).map(|x| x + 1)),
//!     on(pool.scheduler(), telaio::senders::just(1)),
//! ));
//! let (a, b) = sync_wait(work).unwrap().unwrap();
//! assert_eq!(a + b, 42);
//! ```
//!
//! ## Cancellation
//!
//! Cancellation is cooperative and flows *down* a pipeline through the
//! receiver environment's stop token ([`stop::StopToken`]). Contexts check
//! the token when they deliver; parked waits register callbacks that
//! complete them with `set_stopped` promptly; in-flight computations
//! observe requests at their own pace. Cancellation is not an error: it is
//! the third completion channel.

pub mod bridge;
pub mod channel;
pub mod error;
pub mod exec;
pub mod run_loop;
pub mod senders;
pub mod stop;
pub mod sync;
pub mod thread_pool;
pub mod time;

pub use error::{BoxError, TaskPanic, WaitError};
pub use exec::{AnyScheduler, Operation, Outcome, Receiver, Scheduler, Sender, sync_wait};
pub use senders::{SenderExt, just, on, race, start_on, when_all};
pub use stop::{StopCallback, StopSource, StopToken};
