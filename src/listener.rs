//! Consumer loop turning frames from a [`FrameReader`] into callbacks.
//!
//! A [`MessageListener`] is either stopped or running exactly one consumer
//! thread. The thread keeps the reader open, waits for frames with a
//! bounded timeout and hands each one to the message callback. Read
//! failures other than a timeout are reported and followed by a fixed,
//! interruptible back-off, so a broken transport degrades to a slow retry
//! loop instead of taking the owner down.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::reporting::{
    DEFAULT_ERROR_WINDOW, ErrorSink, LogErrorSink, RateLimitedErrorSink, WorkerError,
};
use crate::transport::FrameReader;

/// Bound on each read so stop requests are noticed promptly.
pub const DEFAULT_LISTENER_READ_TIMEOUT: Duration = Duration::from_millis(1000);
/// Pause after a failed read before trying again.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(1000);

/// Invoked with the reader and the payload of every received frame.
pub type MessageCallback = Arc<dyn Fn(&dyn FrameReader, Vec<u8>) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerOptions {
    pub read_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_LISTENER_READ_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener '{0}' has been closed")]
    Closed(String),
    #[error("failed to spawn listener thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Running {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// State shared with the consumer thread.
#[derive(Clone)]
struct LoopContext {
    name: String,
    reader: Arc<dyn FrameReader>,
    on_message: MessageCallback,
    exceptions: Arc<dyn ErrorSink>,
    options: ListenerOptions,
}

impl LoopContext {
    fn origin(&self) -> String {
        format!("MessageListener '{}'", self.name)
    }

    fn report(&self, err: &WorkerError) {
        self.exceptions.report(err);
    }
}

/// Generic frame consumer bound to one reader.
pub struct MessageListener {
    ctx: LoopContext,
    running: Mutex<Option<Running>>,
    disposed: AtomicBool,
}

impl MessageListener {
    pub fn new<F>(reader: Arc<dyn FrameReader>, on_message: F) -> Self
    where
        F: Fn(&dyn FrameReader, Vec<u8>) + Send + Sync + 'static,
    {
        Self {
            ctx: LoopContext {
                name: reader.name().to_owned(),
                reader,
                on_message: Arc::new(on_message),
                exceptions: Arc::new(LogErrorSink),
                options: ListenerOptions::default(),
            },
            running: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_options(mut self, options: ListenerOptions) -> Self {
        self.ctx.options = options;
        self
    }

    /// Route read failures, callback panics, and the reader's own worker
    /// errors to `handler` instead of the log.
    pub fn with_exception_handler(mut self, handler: Arc<dyn ErrorSink>) -> Self {
        self.ctx.exceptions = handler;
        self
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn reader(&self) -> &Arc<dyn FrameReader> {
        &self.ctx.reader
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the consumer thread. No-op if already running.
    pub fn start(&self) -> Result<(), ListenerError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ListenerError::Closed(self.ctx.name.clone()));
        }
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let exceptions = Arc::clone(&self.ctx.exceptions);
        let forward = move |err: &WorkerError| exceptions.report(err);
        self.ctx.reader.errors().attach(Arc::new(RateLimitedErrorSink::new(
            forward,
            DEFAULT_ERROR_WINDOW,
        )));

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ctx = self.ctx.clone();
        let handle = thread::Builder::new()
            .name(format!("femtowire-listener-{}", self.ctx.name))
            .spawn(move || consume(&ctx, &stop_rx))?;
        *running = Some(Running { stop_tx, handle });
        debug!("MessageListener '{}' started", self.ctx.name);
        Ok(())
    }

    /// Signal the consumer thread and wait for it to exit.
    ///
    /// Returns once the current read or back-off has been interrupted, so
    /// the delay is bounded by the read timeout.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.stop_tx.send(());
        if running.handle.join().is_err() {
            warn!("MessageListener '{}': consumer thread panicked", self.ctx.name);
        }
        debug!("MessageListener '{}' stopped", self.ctx.name);
    }

    /// Stop the loop and close the reader. Only the first call has effect.
    pub fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ctx.reader.errors().detach();
        self.stop();
        self.ctx.reader.close();
    }
}

impl Drop for MessageListener {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MessageListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageListener")
            .field("name", &self.ctx.name)
            .field("options", &self.ctx.options)
            .field("running", &self.is_running())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Body of the consumer thread.
fn consume(ctx: &LoopContext, stop_rx: &Receiver<()>) {
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        if let Err(err) = poll_once(ctx) {
            ctx.report(&err);
            if back_off(ctx.options.retry_backoff, stop_rx) {
                break;
            }
        }
    }
}

/// One iteration: make sure the reader is open, then wait for a frame.
fn poll_once(ctx: &LoopContext) -> Result<(), WorkerError> {
    let reader = ctx.reader.as_ref();
    if !reader.is_open() {
        reader
            .open()
            .map_err(|err| WorkerError::transport(ctx.origin(), err))?;
    }
    let frame = match reader.read_timeout(ctx.options.read_timeout) {
        Ok(frame) => frame,
        Err(err) if err.is_timeout() => return Ok(()),
        Err(err) => return Err(WorkerError::transport(ctx.origin(), err)),
    };
    // Callback panics are reported without the retry pause.
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (ctx.on_message)(reader, frame))) {
        ctx.report(&WorkerError::panic(ctx.origin(), payload.as_ref()));
    }
    Ok(())
}

/// Sleep for `pause` unless a stop arrives first. Returns true on stop.
fn back_off(pause: Duration, stop_rx: &Receiver<()>) -> bool {
    match stop_rx.recv_timeout(pause) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}
