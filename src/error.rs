//! Error types for autofocus procedures.
//!
//! Every procedure in this crate terminates with either a value or one of the
//! four [`AutofocusError`] kinds. The hardware capability layer speaks
//! `anyhow::Result`; those errors are folded into
//! [`AutofocusError::HardwareFailure`] through `From`, so driver calls can be
//! propagated with `?` inside a procedure.
//!
//! ## Error Kinds
//!
//! - **`Timeout`**: a blocking hardware call (image acquisition, light warm-up,
//!   a sub-search) exceeded its allotted time. Soft during illumination
//!   warm-up, fatal during the focus search.
//! - **`Cancelled`**: a cancellation request was observed and cleanup has
//!   completed. Callers should treat it as an intentional abort.
//! - **`InvalidConfiguration`**: the request cannot be run as given (empty
//!   search range, no detector, no selector for several detectors, a component
//!   missing for an alignment mode...).
//! - **`HardwareFailure`**: a move or acquisition failed for any other reason.
//!
//! The enum is `Clone` because a task's terminal result is cached and may be
//! read several times.

use thiserror::Error;

/// Convenience alias for results of autofocus procedures.
pub type AfResult<T> = std::result::Result<T, AutofocusError>;

/// Terminal error of an autofocus task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AutofocusError {
    /// A blocking call did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The task observed a cancellation request and finished its cleanup.
    #[error("Procedure cancelled")]
    Cancelled,

    /// The request is not runnable with the given parameters or components.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An underlying hardware call failed.
    #[error("Hardware failure: {0}")]
    HardwareFailure(String),
}

impl AutofocusError {
    /// Whether this is the cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AutofocusError::Cancelled)
    }

    /// Whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AutofocusError::Timeout(_))
    }
}

impl From<anyhow::Error> for AutofocusError {
    fn from(err: anyhow::Error) -> Self {
        AutofocusError::HardwareFailure(format!("{err:#}"))
    }
}
