//! Recoverable error conditions.
//!
//! Most misuse of this crate is treated as an unrecoverable invariant
//! violation (wrong-thread access, out-of-order lifecycle transitions) and
//! terminates the process after logging a diagnostic. The errors in this
//! module are the exceptions: conditions a caller can meaningfully check for
//! and handle. Timeouts are not errors at all; the timed wait functions
//! return a plain `bool`.

use thiserror::Error;

/// Errors returned by the recoverable portions of the api.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForgeError {
    /// The value of an [`AsyncResult`](crate::async_result::AsyncResult) was
    /// requested before the associated operation completed.
    #[error("async result has not completed yet")]
    ResultNotReady,

    /// The value of an [`AsyncResult`](crate::async_result::AsyncResult) was
    /// already taken by an earlier call.
    #[error("async result value was already taken")]
    ResultAlreadyTaken,
}
