use std::sync::{Arc, Mutex};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::foundation::error::MontageError;

struct Inner {
    cancel: CancellationToken,
    stop: CancellationToken,
    failure: Mutex<Option<MontageError>>,
}

/// Cancellation and failure state shared by every task of one composition.
///
/// `stop` asks producers to wind down and finalize normally; `cancel` aborts everything. Only the
/// first reported failure is kept.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancel: CancellationToken::new(),
                stop: CancellationToken::new(),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Records `err` (unless a failure is already recorded) and cancels the composition.
    pub fn fail(&self, err: MontageError) {
        if let Ok(mut slot) = self.inner.failure.lock() {
            if slot.is_none() {
                tracing::error!(error = %err, "composition failed");
                *slot = Some(err);
            } else {
                tracing::debug!(error = %err, "additional failure after the first");
            }
        }
        self.cancel();
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancel.cancelled()
    }

    pub fn request_stop(&self) {
        self.inner.stop.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    pub fn has_failed(&self) -> bool {
        self.inner.failure.lock().is_ok_and(|f| f.is_some())
    }

    pub fn take_failure(&self) -> Option<MontageError> {
        self.inner.failure.lock().ok().and_then(|mut f| f.take())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/stream/supervisor.rs"]
mod tests;
