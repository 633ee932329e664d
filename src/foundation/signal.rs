use tokio::sync::watch;

/// One-shot broadcast signal. Fires at most once; every waiter (including late ones) observes it.
#[derive(Clone, Debug)]
pub struct OnceSignal {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Default for OnceSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl OnceSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Returns `true` if this call fired the signal.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/signal.rs"]
mod tests;
