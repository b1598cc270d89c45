//! Helpers for non-blocking IO.

use std::io;

/// Non-blocking IO wrapper.
///
/// Turns `WouldBlock` into `Ok(None)` and leaves every other error alone.
pub trait NonBlockingResult {
    /// Type of the converted result: `io::Result<Option<T>>`
    type Result;
    /// Perform the non-block conversion.
    fn no_block(self) -> Self::Result;
}

impl<T> NonBlockingResult for io::Result<T> {
    type Result = io::Result<Option<T>>;
    fn no_block(self) -> Self::Result {
        match self {
            Ok(x) => Ok(Some(x)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Run `op` again for as long as it is interrupted by a signal.
pub fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}
