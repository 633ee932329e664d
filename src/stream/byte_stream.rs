use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::foundation::error::{MontageError, MontageResult};
use crate::foundation::signal::OnceSignal;
use crate::mp4::Mp4Muxer;
use crate::stream::scheduler::Subscription;
use crate::stream::supervisor::Supervisor;

/// Bounded so that a slow consumer throttles flushing.
pub(crate) const OUTPUT_CHANNEL_CAPACITY: usize = 16;

/// Pull-controlled fragmented MP4 output of a composition.
///
/// Every chunk holds whole top-level boxes. The stream ends normally after the last fragment, or
/// with the composition's error as its final item.
pub struct ByteStream {
    rx: mpsc::Receiver<MontageResult<Bytes>>,
    supervisor: Supervisor,
}

impl ByteStream {
    pub(crate) fn new(rx: mpsc::Receiver<MontageResult<Bytes>>, supervisor: Supervisor) -> Self {
        Self { rx, supervisor }
    }

    pub async fn next_chunk(&mut self) -> Option<MontageResult<Bytes>> {
        self.rx.recv().await
    }

    /// Collects the whole stream, failing with the composition's error if there is one.
    pub async fn read_to_end(mut self) -> MontageResult<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    /// Finalizes early: production halts, encoders flush and the stream closes normally.
    pub fn stop(&self) {
        self.supervisor.request_stop();
    }

    /// Aborts the composition and releases its clips.
    pub fn cancel(&self) {
        self.supervisor.cancel();
    }
}

impl Stream for ByteStream {
    type Item = MontageResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        self.supervisor.cancel();
    }
}

/// Moves completed boxes from the muxer into the output channel on every subscription tick.
pub(crate) fn spawn_flusher(
    muxer: Arc<Mutex<Mp4Muxer>>,
    subscription: Subscription,
    tx: mpsc::Sender<MontageResult<Bytes>>,
    supervisor: Supervisor,
    mux_finished: OnceSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let take = || -> MontageResult<Option<Bytes>> {
            let mut muxer = muxer
                .lock()
                .map_err(|_| MontageError::sequence("muxer lock poisoned"))?;
            Ok(muxer.take_flushable())
        };

        let mut emitted = 0u64;
        loop {
            let finishing = tokio::select! {
                _ = supervisor.cancelled() => break,
                _ = mux_finished.wait() => true,
                alive = subscription.tick() => {
                    if !alive {
                        break;
                    }
                    false
                }
            };

            let chunk = match take() {
                Ok(chunk) => chunk,
                Err(e) => {
                    supervisor.fail(e);
                    break;
                }
            };
            if let Some(chunk) = chunk {
                emitted += chunk.len() as u64;
                tokio::select! {
                    _ = supervisor.cancelled() => break,
                    sent = tx.send(Ok(chunk)) => {
                        if sent.is_err() {
                            tracing::debug!("output consumer went away");
                            supervisor.cancel();
                            break;
                        }
                    }
                }
            }
            if finishing {
                tracing::debug!(bytes = emitted, "output stream complete");
                return;
            }
        }

        // Cancelled or failed: emit complete boxes without waiting, then the error.
        if let Ok(Some(chunk)) = take() {
            let _ = tx.try_send(Ok(chunk));
        }
        if let Some(err) = supervisor.take_failure() {
            let _ = tx.send(Err(err)).await;
        }
    })
}

#[cfg(test)]
#[path = "../../tests/unit/stream/byte_stream.rs"]
mod tests;
