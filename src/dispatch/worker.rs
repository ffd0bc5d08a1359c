//! Long-lived run-mode dispatch thread.
//!
//! Producers never spawn threads. They flag work on the manager, which
//! wakes this thread through a one-slot channel; repeated wakes while a
//! run is pending coalesce into one.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{debug, warn};

use crate::reporting::{ErrorSink, WorkerError};

use super::manager::MessageManager;

/// Handle to the dispatch thread and its wake/shutdown channels.
pub(crate) struct WorkerParts {
    pub(crate) shutdown_tx: Sender<()>,
    pub(crate) handle: JoinHandle<()>,
}

/// Create the one-slot wake channel shared by the manager and the worker.
pub(crate) fn wake_channel() -> (Sender<()>, Receiver<()>) {
    bounded(1)
}

/// Spawn the dispatch thread.
pub(crate) fn spawn_worker(
    manager: Arc<MessageManager>,
    wake_rx: Receiver<()>,
    errors: Arc<dyn ErrorSink>,
) -> std::io::Result<WorkerParts> {
    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    let handle = thread::Builder::new()
        .name("femtowire-dispatch".into())
        .spawn(move || worker_thread_loop(&manager, &wake_rx, &shutdown_rx, errors.as_ref()))?;
    Ok(WorkerParts {
        shutdown_tx,
        handle,
    })
}

/// Main loop of the dispatch thread.
///
/// Each wake runs passes until the queue stays empty. A shutdown signal
/// ends the loop; the owner flushes whatever is left afterwards.
pub(crate) fn worker_thread_loop(
    manager: &MessageManager,
    wake_rx: &Receiver<()>,
    shutdown_rx: &Receiver<()>,
    errors: &dyn ErrorSink,
) {
    loop {
        select! {
            recv(wake_rx) -> msg => match msg {
                Ok(()) => run_guarded(manager, errors),
                Err(_) => break,
            },
            recv(shutdown_rx) -> _ => break,
        }
    }
    debug!("MessageManager worker exiting");
}

fn run_guarded(manager: &MessageManager, errors: &dyn ErrorSink) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| manager.run_until_drained())) {
        errors.report(&WorkerError::panic("dispatch worker", payload.as_ref()));
        // A stale in-progress flag would stop producers from waking us.
        manager.finish();
        if !manager.is_stopped() {
            warn!("MessageManager worker: rescheduling after panic");
            manager.process();
        }
    }
}
