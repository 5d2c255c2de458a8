//! Receiver environments: typed attribute lookup.
//!
//! An environment is a compile-time record of queries. The root environment
//! ([`Empty`]) answers every query with its default; wrapper environments
//! override one query and forward the rest to the wrapped environment, so
//! attributes installed high up a pipeline remain visible to leaf
//! operations unless an adaptor deliberately shadows them.

use crate::exec::AnyScheduler;
use crate::stop::StopToken;

/// A queryable bag of receiver attributes.
///
/// The defaulted methods are the forwarding behaviour: an implementation
/// overrides the queries it answers and leaves the rest alone.
pub trait Environment: Clone + Send + Sync + 'static {
    /// The stop token in effect for the operation.
    fn stop_token(&self) -> StopToken {
        StopToken::never()
    }

    /// The scheduler the operation is nominally running on.
    fn scheduler(&self) -> Option<AnyScheduler> {
        None
    }
}

/// The root environment: every query answers its default.
#[derive(Clone, Copy, Debug, Default)]
pub struct Empty;

impl Environment for Empty {}

/// Overrides the stop-token query, forwarding everything else.
#[derive(Clone)]
pub struct WithStopToken<E> {
    token: StopToken,
    base: E,
}

impl<E: Environment> WithStopToken<E> {
    pub fn new(base: E, token: StopToken) -> Self {
        Self { token, base }
    }
}

impl<E: Environment> Environment for WithStopToken<E> {
    fn stop_token(&self) -> StopToken {
        self.token.clone()
    }

    fn scheduler(&self) -> Option<AnyScheduler> {
        self.base.scheduler()
    }
}

/// Overrides the scheduler query, forwarding everything else.
#[derive(Clone)]
pub struct WithScheduler<E> {
    scheduler: AnyScheduler,
    base: E,
}

impl<E: Environment> WithScheduler<E> {
    pub fn new(base: E, scheduler: AnyScheduler) -> Self {
        Self { scheduler, base }
    }
}

impl<E: Environment> Environment for WithScheduler<E> {
    fn stop_token(&self) -> StopToken {
        self.base.stop_token()
    }

    fn scheduler(&self) -> Option<AnyScheduler> {
        Some(self.scheduler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::StopSource;

    /// The root environment defaults every query.
    #[test]
    fn test_empty_defaults() {
        let env = Empty;
        assert!(!env.stop_token().stop_possible());
        assert!(env.scheduler().is_none());
    }

    /// An override answers its own query and forwards the others.
    #[test]
    fn test_with_stop_token_forwards() {
        let src = StopSource::new();
        let env = WithStopToken::new(Empty, src.token());
        assert!(env.stop_token().stop_possible());
        assert!(env.scheduler().is_none());
        src.request_stop();
        assert!(env.stop_token().stop_requested());
    }

    /// Later overrides shadow earlier ones for the same query.
    #[test]
    fn test_shadowing() {
        let first = StopSource::new();
        let second = StopSource::new();
        let env = WithStopToken::new(WithStopToken::new(Empty, first.token()), second.token());
        second.request_stop();
        assert!(env.stop_token().stop_requested());
        assert_eq!(env.stop_token(), second.token());
    }
}
