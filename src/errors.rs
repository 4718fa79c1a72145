//! The `errors` module defines the crate's error type.

use std::error;
use std::fmt;

use super::Result;

/// `Error` enumerates everything that can go fatally wrong while running the
/// ordered parallel pipeline over a stream of VBI lines.
///
/// Numerical degeneracies that the `Line Decoder` recovers from locally (an
/// alignment that didn't converge, a mask that filtered a byte position down
/// to nothing) are not represented here — they are reported as data via
/// `Diagnostics`, not as errors. See `decoder::Diagnostics`.
#[derive(Debug)]
pub enum Error {
    /// A worker thread did not signal readiness within the startup deadline.
    WorkerStartTimeout,
    /// A worker thread stopped while the pipeline was still waiting on
    /// results from it.
    ChildStopped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::WorkerStartTimeout => {
                write!(f, "timed out waiting for a decoder worker thread to start")
            }
            Error::ChildStopped => write!(f, "a decoder worker thread stopped unexpectedly"),
        }
    }
}

impl error::Error for Error {}

/// Shorthand for `Err(Error::WorkerStartTimeout)`, generic over the `Ok` type.
pub fn worker_start_timeout<T>() -> Result<T> {
    Err(Error::WorkerStartTimeout)
}

/// Shorthand for `Err(Error::ChildStopped)`, generic over the `Ok` type.
pub fn child_stopped<T>() -> Result<T> {
    Err(Error::ChildStopped)
}
