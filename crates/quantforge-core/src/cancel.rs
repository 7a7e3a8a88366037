//! Cancellation token shared between the CLI signal handler and running work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::QuantError;

/// A cancellation token for cooperative cancellation of a quantization run.
///
/// Clones share state: cancelling any clone cancels all of them. The process
/// tracker checks the token between output records and kills the running
/// engine process once it is set.
///
/// ```
/// use quantforge::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let handler_side = token.clone();
/// handler_side.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(QuantError::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), QuantError> {
        if self.is_cancelled() {
            Err(QuantError::Cancelled)
        } else {
            Ok(())
        }
    }
}
