use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct Entry {
    id: u64,
    period: Duration,
    due: Instant,
    notify: Arc<Notify>,
}

struct Shared {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    token: CancellationToken,
}

impl Shared {
    fn remove(&self, id: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|e| e.id != id);
        }
    }
}

/// Composition-scoped timer. One task drives every subscription at a multiple of the base
/// resolution; notifications coalesce when a subscriber falls behind.
pub struct TickScheduler {
    shared: Arc<Shared>,
    base: Duration,
}

impl TickScheduler {
    /// Spawns the timer task on the current runtime.
    pub fn start(base: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        let shared = Arc::new(Shared {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            token: CancellationToken::new(),
        });
        tokio::spawn(run(Arc::clone(&shared), base));
        Self { shared, base }
    }

    /// `period` is rounded up to the base resolution.
    pub fn subscribe(&self, period: Duration) -> Subscription {
        let period = period.max(self.base);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = Arc::new(Notify::new());
        if let Ok(mut entries) = self.shared.entries.lock() {
            entries.push(Entry {
                id,
                period,
                due: Instant::now() + period,
                notify: Arc::clone(&notify),
            });
        }
        Subscription {
            id,
            notify,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.entries.lock().map_or(0, |e| e.len())
    }

    /// Stops the timer. Pending and future `Subscription::tick` calls return `false`.
    pub fn shutdown(&self) {
        self.shared.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run(shared: Arc<Shared>, base: Duration) {
    let mut interval = tokio::time::interval(base);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shared.token.cancelled() => break,
            now = interval.tick() => {
                let Ok(mut entries) = shared.entries.lock() else {
                    break;
                };
                for entry in entries.iter_mut() {
                    if now >= entry.due {
                        entry.notify.notify_one();
                        entry.due = now + entry.period;
                    }
                }
            }
        }
    }
    tracing::trace!("tick scheduler stopped");
}

/// Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    notify: Arc<Notify>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Waits for the next period. Returns `false` once the scheduler shut down.
    pub async fn tick(&self) -> bool {
        if self.shared.token.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => false,
            _ = self.notify.notified() => true,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.remove(self.id);
    }
}

#[cfg(test)]
#[path = "../../tests/unit/stream/scheduler.rs"]
mod tests;
