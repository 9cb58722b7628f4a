//! Serialized writer queue
//!
//! All mutations flow through one bounded FIFO drained by a single writer
//! thread, which owns the file handle outright. Callers enqueue a command
//! and block on its completion; ordering on the queue is the total write
//! order, so WAL appends need no global mutex and the read path is never
//! blocked by writers.
//!
//! Cancellation: a command cancelled before the writer dequeues it is
//! skipped entirely; once the writer has started it, the command runs to
//! completion and cancellation only stops the caller from waiting.

use entitydb_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

struct Envelope<C, R> {
    cmd: C,
    cancelled: Arc<AtomicBool>,
    reply: SyncSender<R>,
}

/// Cancels a submitted command if the writer has not started it yet
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded FIFO plus its single writer thread
pub struct WriterQueue<C, R> {
    sender: Option<SyncSender<Envelope<C, R>>>,
    thread: Option<JoinHandle<()>>,
}

impl<C: Send + 'static, R: Send + 'static> WriterQueue<C, R> {
    /// Spawn the writer thread
    ///
    /// `worker` owns all mutable write-side state (file handle, WAL
    /// cursor) by capture; it runs every command in queue order.
    pub fn spawn(depth: usize, mut worker: impl FnMut(C) -> R + Send + 'static) -> Self {
        let (sender, receiver): (SyncSender<Envelope<C, R>>, Receiver<Envelope<C, R>>) =
            mpsc::sync_channel(depth);

        let thread = thread::Builder::new()
            .name("entitydb-writer".to_owned())
            .spawn(move || {
                while let Ok(envelope) = receiver.recv() {
                    if envelope.cancelled.load(Ordering::SeqCst) {
                        debug!(target: "entitydb::storage", "skipped cancelled write op");
                        continue;
                    }
                    let result = worker(envelope.cmd);
                    // A caller that stopped waiting just loses the reply;
                    // the op itself is already applied.
                    let _ = envelope.reply.send(result);
                }
            })
            .expect("spawn writer thread");

        WriterQueue {
            sender: Some(sender),
            thread: Some(thread),
        }
    }

    /// Enqueue a command and wait for its completion
    pub fn submit(&self, cmd: C) -> Result<R> {
        let (_token, receiver) = self.submit_cancellable(cmd)?;
        receiver
            .recv()
            .map_err(|_| Error::invariant("writer thread exited with ops in flight"))
    }

    /// Enqueue a command, returning a cancel token and the completion
    /// channel
    pub fn submit_cancellable(&self, cmd: C) -> Result<(CancelToken, Receiver<R>)> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::invariant("writer queue is shut down"))?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let (reply, receiver) = mpsc::sync_channel(1);
        sender
            .send(Envelope {
                cmd,
                cancelled: Arc::clone(&cancelled),
                reply,
            })
            .map_err(|_| Error::invariant("writer thread is gone"))?;
        Ok((CancelToken(cancelled), receiver))
    }

    /// Stop accepting commands, drain the queue, and join the thread
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<C, R> Drop for WriterQueue<C, R> {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
