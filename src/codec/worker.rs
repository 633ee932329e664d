use std::{
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
};

use anyhow::Context as _;

use crate::codec::diagnostics;
use crate::foundation::error::{CodecState, MontageError, MontageResult};

pub(crate) enum WorkerMsg<I> {
    Input(I),
    Flush,
}

/// A named OS thread that processes codec inputs in submission order.
///
/// `pending` counts inputs submitted but not yet processed; it is the codec's queue depth.
pub(crate) struct CodecWorker<I> {
    tx: Option<mpsc::Sender<WorkerMsg<I>>>,
    pending: Arc<AtomicUsize>,
    abort: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl<I: Send + 'static> CodecWorker<I> {
    /// `handle` receives each message with the queue depth at that moment. Returning
    /// `ControlFlow::Break` stops the thread; remaining inputs are discarded.
    pub(crate) fn spawn<F>(name: &str, mut handle: F) -> MontageResult<Self>
    where
        F: FnMut(WorkerMsg<I>, usize) -> ControlFlow<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<WorkerMsg<I>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let abort = Arc::new(AtomicBool::new(false));

        let thread_pending = Arc::clone(&pending);
        let thread_abort = Arc::clone(&abort);
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let mut stopped = false;
                while let Ok(msg) = rx.recv() {
                    let is_input = matches!(msg, WorkerMsg::Input(_));
                    if !stopped && !thread_abort.load(Ordering::Relaxed) {
                        let depth = thread_pending.load(Ordering::Relaxed);
                        stopped = handle(msg, depth).is_break();
                    }
                    if is_input {
                        thread_pending.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            })
            .with_context(|| format!("spawn codec worker thread '{name}'"))?;

        Ok(Self {
            tx: Some(tx),
            pending,
            abort,
            thread: Some(thread),
        })
    }

    /// Returns `false` once the worker is gone.
    pub(crate) fn submit(&self, msg: WorkerMsg<I>) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let is_input = matches!(msg, WorkerMsg::Input(_));
        if is_input {
            self.pending.fetch_add(1, Ordering::Relaxed);
        }
        if tx.send(msg).is_err() {
            if is_input {
                self.pending.fetch_sub(1, Ordering::Relaxed);
            }
            return false;
        }
        true
    }
}

impl<I> CodecWorker<I> {
    pub(crate) fn queue_size(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Discards queued inputs and joins the thread after its current item.
    pub(crate) fn close(&mut self) {
        self.abort.store(true, Ordering::Relaxed);
        self.tx = None;
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl<I> Drop for CodecWorker<I> {
    fn drop(&mut self) {
        self.close();
    }
}

/// State machine shared by every software codec: `Unconfigured -> Configured -> Closed`.
pub(crate) struct CodecCore<I> {
    codec: &'static str,
    state: CodecState,
    worker: Option<CodecWorker<I>>,
}

impl<I: Send + 'static> CodecCore<I> {
    pub(crate) fn new(codec: &'static str) -> Self {
        Self {
            codec,
            state: CodecState::Unconfigured,
            worker: None,
        }
    }

    pub(crate) fn state(&self) -> CodecState {
        self.state
    }

    pub(crate) fn queue_size(&self) -> usize {
        self.worker.as_ref().map_or(0, CodecWorker::queue_size)
    }

    pub(crate) fn error(&self, msg: impl Into<String>, timestamp: Option<i64>) -> MontageError {
        MontageError::codec(
            msg,
            diagnostics(self.codec, self.state, self.queue_size(), timestamp),
        )
    }

    /// Installs the worker for a successful `configure`. Reconfiguring replaces the worker.
    pub(crate) fn start<F>(&mut self, role: &str, handle: F) -> MontageResult<()>
    where
        F: FnMut(WorkerMsg<I>, usize) -> ControlFlow<()> + Send + 'static,
    {
        if self.state == CodecState::Closed {
            return Err(self.error("configure called on a closed codec", None));
        }
        if let Some(mut old) = self.worker.take() {
            old.close();
        }
        let name = format!("{}-{role}", self.codec);
        self.worker = Some(CodecWorker::spawn(&name, handle)?);
        self.state = CodecState::Configured;
        Ok(())
    }

    pub(crate) fn submit(&mut self, input: I, timestamp: i64) -> MontageResult<()> {
        let worker = self.configured_worker(Some(timestamp))?;
        if !worker.submit(WorkerMsg::Input(input)) {
            return Err(self.error("codec worker thread has stopped", Some(timestamp)));
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> MontageResult<()> {
        let worker = self.configured_worker(None)?;
        if !worker.submit(WorkerMsg::Flush) {
            return Err(self.error("codec worker thread has stopped", None));
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        if let Some(mut w) = self.worker.take() {
            w.close();
        }
        self.state = CodecState::Closed;
    }

    fn configured_worker(&self, timestamp: Option<i64>) -> MontageResult<&CodecWorker<I>> {
        match (self.state, &self.worker) {
            (CodecState::Configured, Some(w)) => Ok(w),
            (CodecState::Closed, _) => Err(self.error("codec is closed", timestamp)),
            _ => Err(self.error("codec is not configured", timestamp)),
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/codec/worker.rs"]
mod tests;
