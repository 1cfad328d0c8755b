//! Cooperative cancellation.

use asupersync::Cx;
use rtsum_error::{Result, RtError};
use std::sync::atomic::{AtomicBool, Ordering};

/// Cancellation signal polled at checkpoints.
///
/// The check never blocks on this; it only asks, between extent records and
/// between compared blocks, whether it should stop.
pub trait Terminate {
    fn should_terminate(&self) -> bool;
}

/// A signal that never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverTerminate;

impl Terminate for NeverTerminate {
    fn should_terminate(&self) -> bool {
        false
    }
}

/// A capability context terminates once its checkpoint fails, either
/// because cancellation was requested or its budget ran out.
impl Terminate for Cx {
    fn should_terminate(&self) -> bool {
        self.checkpoint().is_err()
    }
}

impl Terminate for AtomicBool {
    fn should_terminate(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

#[inline]
pub(crate) fn checkpoint(terminate: &dyn Terminate) -> Result<()> {
    if terminate.should_terminate() {
        return Err(RtError::Cancelled);
    }
    Ok(())
}
