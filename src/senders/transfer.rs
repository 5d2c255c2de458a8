//! Scheduler hops: start elsewhere, continue elsewhere, or both.

use crate::error::BoxError;
use crate::exec::env::WithScheduler;
use crate::exec::{AnyScheduler, Operation, Outcome, Receiver, Scheduler, Sender};

/// Starts `sender` on `scheduler`'s context.
///
/// The result completes wherever `sender` completes; only the *start* hops.
pub fn start_on<Sch: Scheduler, S: Sender>(scheduler: Sch, sender: S) -> StartOn<Sch, S> {
    StartOn { scheduler, sender }
}

/// Starts `sender` on `scheduler` and re-delivers its completion there too,
/// so both the work and the continuation observe `scheduler` as the current
/// context.
pub fn on<Sch: Scheduler, S: Sender>(scheduler: Sch, sender: S) -> On<Sch, S> {
    On { scheduler, sender }
}

pub struct StartOn<Sch, S> {
    scheduler: Sch,
    sender: S,
}

impl<Sch, S> Sender for StartOn<Sch, S>
where
    Sch: Scheduler,
    S: Sender + 'static,
{
    type Value = S::Value;

    type Operation<R>
        = <Sch::ScheduleSender as Sender>::Operation<StartOnReceiver<S, R>>
    where
        R: Receiver<Value = S::Value>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = S::Value>,
    {
        self.scheduler
            .schedule()
            .connect(StartOnReceiver { sender: self.sender, receiver })
    }
}

/// Receiver for the scheduling hop: once the context picks us up, connect
/// and start the payload sender right there.
pub struct StartOnReceiver<S, R> {
    sender: S,
    receiver: R,
}

impl<S, R> Receiver for StartOnReceiver<S, R>
where
    S: Sender + 'static,
    R: Receiver<Value = S::Value>,
{
    type Value = ();
    type Env = R::Env;

    fn env(&self) -> &R::Env {
        self.receiver.env()
    }

    fn set_value(self, (): ()) {
        self.sender.connect(self.receiver).start();
    }

    fn set_error(self, error: BoxError) {
        self.receiver.set_error(error);
    }

    fn set_stopped(self) {
        self.receiver.set_stopped();
    }
}

/// Re-delivers every completion of the wrapped sender on `scheduler`.
pub struct ContinueOn<S, Sch> {
    sender: S,
    scheduler: Sch,
}

impl<S, Sch> ContinueOn<S, Sch> {
    pub(crate) fn new(sender: S, scheduler: Sch) -> Self {
        Self { sender, scheduler }
    }
}

impl<S, Sch> Sender for ContinueOn<S, Sch>
where
    S: Sender,
    Sch: Scheduler,
{
    type Value = S::Value;

    type Operation<R>
        = S::Operation<ContinueOnReceiver<R, Sch>>
    where
        R: Receiver<Value = S::Value>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = S::Value>,
    {
        self.sender
            .connect(ContinueOnReceiver { receiver, scheduler: self.scheduler })
    }

    fn completion_scheduler(&self) -> Option<AnyScheduler> {
        Some(AnyScheduler::new(self.scheduler.clone()))
    }
}

pub struct ContinueOnReceiver<R, Sch> {
    receiver: R,
    scheduler: Sch,
}

impl<R, Sch> ContinueOnReceiver<R, Sch>
where
    R: Receiver,
    R::Value: Send + 'static,
    Sch: Scheduler,
{
    fn hop(self, outcome: Outcome<R::Value>) {
        let receiver = self.receiver;
        self.scheduler
            .schedule()
            .connect(DeliverReceiver { outcome, receiver })
            .start();
    }
}

impl<R, Sch> Receiver for ContinueOnReceiver<R, Sch>
where
    R: Receiver,
    R::Value: Send + 'static,
    Sch: Scheduler,
{
    type Value = R::Value;
    type Env = R::Env;

    fn env(&self) -> &R::Env {
        self.receiver.env()
    }

    fn set_value(self, value: R::Value) {
        self.hop(Outcome::Value(value));
    }

    fn set_error(self, error: BoxError) {
        self.hop(Outcome::Error(error));
    }

    fn set_stopped(self) {
        self.hop(Outcome::Stopped);
    }
}

/// Delivers a stored outcome once the target context resumes us.
///
/// A stop observed by the hop itself (token requested while in the queue,
/// or context shutdown) demotes the stored outcome to `set_stopped`; a
/// scheduling error supersedes a stored value.
pub struct DeliverReceiver<R: Receiver> {
    outcome: Outcome<R::Value>,
    receiver: R,
}

impl<R> Receiver for DeliverReceiver<R>
where
    R: Receiver,
    R::Value: Send + 'static,
{
    type Value = ();
    type Env = R::Env;

    fn env(&self) -> &R::Env {
        self.receiver.env()
    }

    fn set_value(self, (): ()) {
        self.outcome.send_to(self.receiver);
    }

    fn set_error(self, error: BoxError) {
        self.receiver.set_error(error);
    }

    fn set_stopped(self) {
        self.receiver.set_stopped();
    }
}

/// `start_on` + `continue_on`, with the environment advertising `scheduler`
/// as the current scheduler to the wrapped sender.
pub struct On<Sch, S> {
    scheduler: Sch,
    sender: S,
}

impl<Sch, S> Sender for On<Sch, S>
where
    Sch: Scheduler,
    S: Sender + 'static,
{
    type Value = S::Value;

    type Operation<R>
        = <StartOn<Sch, ContinueOn<S, Sch>> as Sender>::Operation<SchedulerEnvReceiver<R>>
    where
        R: Receiver<Value = S::Value>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = S::Value>,
    {
        let erased = AnyScheduler::new(self.scheduler.clone());
        let env = WithScheduler::new(receiver.env().clone(), erased);
        start_on(
            self.scheduler.clone(),
            ContinueOn::new(self.sender, self.scheduler),
        )
        .connect(SchedulerEnvReceiver { receiver, env })
    }

    fn completion_scheduler(&self) -> Option<AnyScheduler> {
        Some(AnyScheduler::new(self.scheduler.clone()))
    }
}

pub struct SchedulerEnvReceiver<R: Receiver> {
    receiver: R,
    env: WithScheduler<R::Env>,
}

impl<R: Receiver> Receiver for SchedulerEnvReceiver<R> {
    type Value = R::Value;
    type Env = WithScheduler<R::Env>;

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
