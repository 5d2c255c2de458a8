//! Bridging between senders and futures.
//!
//! The bridge is bidirectional:
//!
//! - [`SenderFuture`] (via
//!   [`SenderExt::into_future`](crate::senders::SenderExt::into_future))
//!   makes any sender awaitable from any executor. The sender is connected
//!   and started on first poll; its completion stores an outcome and wakes
//!   the task.
//! - [`from_future`] / [`try_from_future`] run a future as a sender on an
//!   inline reference-counted poll loop: the future is polled on whichever
//!   thread wakes it, panics are captured into the error channel, and a
//!   stop request wakes the loop so `set_stopped` is delivered promptly
//!   without waiting for the future's own progress.
//! - [`task`] / [`try_task`] are the lazy variants: a closure receives a
//!   [`TaskContext`] carrying the stop token inherited from the awaiting
//!   receiver's environment, and returns the future to run. Nothing
//!   happens until the task is connected and started.

mod future_sender;
mod sender_future;
mod task;

pub use future_sender::{FromFuture, FutureOp, TryFromFuture, from_future, try_from_future};
pub use sender_future::SenderFuture;
pub use task::{Task, TaskContext, TryTask, task, try_task};

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::WaitError;
    use crate::exec::sync_wait;
    use crate::senders::{SenderExt, just};
    use crate::stop::StopSource;

    /// A sender can be awaited from a foreign executor.
    #[tokio::test]
    async fn test_await_sender() {
        let out = just(5).map(|x| x * 2).into_future().await.unwrap();
        assert_eq!(out, 10);
    }

    /// Stopped completions surface as `WaitError::Stopped` when awaited.
    #[tokio::test]
    async fn test_await_stopped() {
        let err = crate::senders::just_stopped::<i32>().into_future().await.unwrap_err();
        assert!(matches!(err, WaitError::Stopped));
    }

    /// A future can run as a sender and complete a blocking consumer.
    #[test]
    fn test_future_as_sender() {
        let out = sync_wait(from_future(async { 1 + 2 })).unwrap();
        assert_eq!(out, Some(3));
    }

    /// `try_from_future` maps `Err` into the error channel.
    #[test]
    fn test_try_future_error() {
        let out = sync_wait(try_from_future(async { Err::<i32, _>(std::io::Error::other("nope")) }));
        assert_eq!(out.unwrap_err().to_string(), "nope");
        let ok = sync_wait(try_from_future(async { Ok::<_, std::io::Error>(4) })).unwrap();
        assert_eq!(ok, Some(4));
    }

    /// A panic inside a bridged future becomes an error completion, not an
    /// abort of the completing thread.
    #[test]
    fn test_panic_becomes_error() {
        async fn boom() -> i32 {
            panic!("kaboom")
        }
        let err = sync_wait(from_future(boom())).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    /// The task context observes the stop token injected downstream.
    #[test]
    fn test_task_sees_token() {
        let src = StopSource::new();
        src.request_stop();
        let snd = task(|ctx: TaskContext| async move { ctx.stop_requested() })
            .with_stop_token(src.token());
        // The inline loop observes the requested token before polling and
        // completes stopped rather than running the body.
        assert_eq!(sync_wait(snd).unwrap(), None);
    }

    /// Without a stop request the task body runs to completion.
    #[test]
    fn test_task_runs() {
        let snd = task(|ctx: TaskContext| async move { ctx.stop_requested() });
        assert_eq!(sync_wait(snd).unwrap(), Some(false));
    }

    /// A sender future passed a token reports stopped once requested,
    /// even while suspended on a pending operation.
    #[tokio::test]
    async fn test_await_with_token() {
        let src = StopSource::new();
        let lp = std::sync::Arc::new(crate::time::TimerLoop::new());
        let sched = lp.scheduler();
        let driver = std::thread::spawn({
            let lp = lp.clone();
            move || lp.run()
        });
        let fut = sched
            .schedule_after(Duration::from_secs(3600))
            .into_future()
            .with_stop_token(src.token());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            src.request_stop();
        });
        let err = fut.await.unwrap_err();
        assert!(matches!(err, WaitError::Stopped));
        lp.finish();
        driver.join().unwrap();
    }
}
