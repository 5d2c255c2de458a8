//! Sender factories and adaptors.
//!
//! Factories create leaf senders ([`just`], [`just_error`],
//! [`just_stopped`]); adaptors wrap an upstream sender and transform its
//! completions. Adaptors are available as combinator methods through
//! [`SenderExt`], which is implemented for every sender:
//!
//! ```
//! use telaio::exec::sync_wait;
//! use telaio::senders::{SenderExt, just};
//!
//! let out = sync_wait(just(41).map(|x| x + 1)).unwrap();
//! assert_eq!(out, Some(42));
//! ```
//!
//! Errors short-circuit: value adaptors ([`SenderExt::map`],
//! [`SenderExt::then`]) forward errors and stops untouched, while
//! [`SenderExt::recover`] and [`SenderExt::recover_stopped`] intercept
//! their respective channels and rejoin the value path.

mod just;
mod map;
mod race;
mod stopped_as_optional;
mod then;
mod transfer;
mod when_all;
mod with_token;

pub use just::{Just, JustError, JustFrom, JustStopped, just, just_error, just_from, just_stopped};
pub use map::{Map, Recover, RecoverStopped};
pub use race::{Race2, RaceTuple, race};
pub use stopped_as_optional::StoppedAsOptional;
pub use then::Then;
pub use transfer::{ContinueOn, On, StartOn, on, start_on};
pub use when_all::{WhenAll2, WhenAllTuple, when_all};
pub use with_token::WithToken;

use crate::error::BoxError;
use crate::exec::{Scheduler, Sender};
use crate::stop::StopToken;

/// Combinator methods available on every sender.
pub trait SenderExt: Sender {
    /// Transforms the value completion with `f`.
    fn map<F, T>(self, f: F) -> Map<Self, F>
    where
        F: FnOnce(Self::Value) -> T + Send + 'static,
        T: Send + 'static,
    {
        Map::new(self, f)
    }

    /// Chains a sender-returning continuation on the value completion.
    fn then<F, S2>(self, f: F) -> Then<Self, F>
    where
        F: FnOnce(Self::Value) -> S2 + Send + 'static,
        S2: Sender,
    {
        Then::new(self, f)
    }

    /// Turns an error completion back into a value.
    fn recover<F>(self, f: F) -> Recover<Self, F>
    where
        F: FnOnce(BoxError) -> Self::Value + Send + 'static,
    {
        Recover::new(self, f)
    }

    /// Turns a stopped completion back into a value.
    fn recover_stopped<F>(self, f: F) -> RecoverStopped<Self, F>
    where
        F: FnOnce() -> Self::Value + Send + 'static,
    {
        RecoverStopped::new(self, f)
    }

    /// Maps value completions to `Some(v)` and stopped completions to
    /// `None`, so cancellation surfaces as an absent value instead of a
    /// stop signal.
    fn stopped_as_optional(self) -> StoppedAsOptional<Self> {
        StoppedAsOptional::new(self)
    }

    /// Re-delivers every completion on `scheduler`'s context.
    fn continue_on<Sch: Scheduler>(self, scheduler: Sch) -> ContinueOn<Self, Sch> {
        ContinueOn::new(self, scheduler)
    }

    /// Overrides the stop token seen by this sender and everything
    /// upstream of it.
    fn with_stop_token(self, token: StopToken) -> WithToken<Self> {
        WithToken::new(self, token)
    }

    /// Makes this sender awaitable.
    fn into_future(self) -> crate::bridge::SenderFuture<Self> {
        crate::bridge::SenderFuture::new(self)
    }
}

impl<S: Sender> SenderExt for S {}
