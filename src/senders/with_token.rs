//! Environment override: inject a stop token into the upstream chain.

use crate::error::BoxError;
use crate::exec::env::WithStopToken;
use crate::exec::{Receiver, Sender};
use crate::stop::StopToken;

/// Runs the wrapped sender with `token` as the stop token in its
/// environment; every other query forwards to the downstream receiver.
///
/// This is the building block for external cancellation of a pipeline that
/// is consumed by a token-less consumer such as
/// [`sync_wait`](crate::exec::sync_wait).
pub struct WithToken<S> {
    sender: S,
    token: StopToken,
}

impl<S> WithToken<S> {
    pub(crate) fn new(sender: S, token: StopToken) -> Self {
        Self { sender, token }
    }
}

impl<S: Sender> Sender for WithToken<S> {
    type Value = S::Value;

    type Operation<R>
        = S::Operation<TokenReceiver<R>>
    where
        R: Receiver<Value = S::Value>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = S::Value>,
    {
        let env = WithStopToken::new(receiver.env().clone(), self.token);
        self.sender.connect(TokenReceiver { receiver, env })
    }
}

pub struct TokenReceiver<R: Receiver> {
    receiver: R,
    env: WithStopToken<R::Env>,
}

impl<R: Receiver> Receiver for TokenReceiver<R> {
    type Value = R::Value;
    type Env = WithStopToken<R::Env>;

    fn env(&self) -> &Self::Env {
        &self.env
    }

    fn set_value(self, value: R::Value) {
        self.receiver.set_value(value);
    }

    fn set_error(self, error: BoxError) {
        self.receiver.set_error(error);
    }

    fn set_stopped(self) {
        self.receiver.set_stopped();
    }
}
