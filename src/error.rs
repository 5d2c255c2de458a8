use std::any::Any;

use thiserror::Error;

/// Type-erased error travelling down the error channel of a pipeline.
///
/// Senders advertise a single typed value completion; errors are uniformly
/// type-erased, mirroring how runtime errors cross task boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned when awaiting a sender through the future bridge.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The operation completed with a stop signal instead of a value.
    #[error("operation completed with a stop signal")]
    Stopped,
    /// The operation completed on the error channel.
    #[error("operation failed: {0}")]
    Failed(BoxError),
}

/// A panic captured while polling a bridged future.
///
/// The panic payload is flattened to its message (when it is a string) so it
/// can travel the error channel like any other error.
#[derive(Debug, Error)]
#[error("task panicked: {message}")]
pub struct TaskPanic {
    message: String,
}

impl TaskPanic {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> BoxError {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("non-string panic payload")
        };
        Box::new(TaskPanic { message })
    }

    /// The panic message, if one could be recovered.
    pub fn message(&self) -> &str {
        &self.message
    }
}
