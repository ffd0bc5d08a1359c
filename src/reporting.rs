//! Out-of-band reporting for failures inside background workers.
//!
//! Transport workers, listener loops, and the dispatch worker never propagate
//! unexpected failures to their callers. They hand a [`WorkerError`] to an
//! [`ErrorSink`] instead. [`RateLimitedErrorSink`] wraps any sink and
//! suppresses repeats of the same error signature within a window, so a
//! persistently failing collector produces one report per window rather
//! than a log storm. [`ErrorSlot`] is the subscription point an owner
//! attaches its own sink to and detaches it from before teardown.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::destination::SinkError;
use crate::transport::TransportError;

/// Default window during which a repeated error signature is suppressed.
pub const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(20 * 60);

/// Upper bound on remembered signatures before stale entries are pruned.
const MAX_TRACKED_SIGNATURES: usize = 1024;

/// Returns the current time in milliseconds.
pub type TimeProvider = Box<dyn Fn() -> u64 + Send + Sync>;

/// A failure raised inside a background worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{origin}: {source}")]
    Transport {
        origin: String,
        #[source]
        source: TransportError,
    },
    #[error("destination '{destination}' failed: {source}")]
    Dispatch {
        destination: String,
        #[source]
        source: SinkError,
    },
    #[error("{origin}: callback failed: {message}")]
    Callback { origin: String, message: String },
    #[error("{origin}: worker panicked: {message}")]
    Panic { origin: String, message: String },
}

impl WorkerError {
    pub fn transport(origin: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            origin: origin.into(),
            source,
        }
    }

    /// Build a [`WorkerError::Panic`] from a `catch_unwind` payload.
    pub fn panic(origin: impl Into<String>, payload: &(dyn Any + Send)) -> Self {
        Self::Panic {
            origin: origin.into(),
            message: panic_message(payload),
        }
    }

    /// Key used to recognise repeats of the same failure.
    pub fn signature(&self) -> String {
        self.to_string()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Receiver of worker failures.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &WorkerError);
}

impl<F> ErrorSink for F
where
    F: Fn(&WorkerError) + Send + Sync,
{
    fn report(&self, error: &WorkerError) {
        self(error)
    }
}

/// Fallback sink writing failures to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, error: &WorkerError) {
        error!("femtowire worker error: {error}");
    }
}

struct SignatureState {
    last_reported: u64,
    suppressed: u64,
}

/// Decorator that forwards each distinct error signature at most once per
/// window.
pub struct RateLimitedErrorSink<S> {
    inner: S,
    window_ms: AtomicU64,
    seen: Mutex<HashMap<String, SignatureState>>,
    time_provider: TimeProvider,
}

impl<S: ErrorSink> RateLimitedErrorSink<S> {
    pub fn new(inner: S, window: Duration) -> Self {
        Self::with_time_provider(inner, window, Box::new(system_time_provider))
    }

    pub fn with_time_provider(inner: S, window: Duration, time_provider: TimeProvider) -> Self {
        Self {
            inner,
            window_ms: AtomicU64::new(millis(window)),
            seen: Mutex::new(HashMap::new()),
            time_provider,
        }
    }

    /// Change the suppression window for subsequent reports.
    pub fn set_window(&self, window: Duration) {
        self.window_ms.store(millis(window), Ordering::Relaxed);
    }

    fn should_forward(&self, signature: String) -> Option<u64> {
        let now = (self.time_provider)();
        let window = self.window_ms.load(Ordering::Relaxed);
        let mut seen = self.seen.lock();
        if let Some(state) = seen.get_mut(&signature) {
            if now.saturating_sub(state.last_reported) < window {
                state.suppressed += 1;
                return None;
            }
            let suppressed = std::mem::take(&mut state.suppressed);
            state.last_reported = now;
            return Some(suppressed);
        }
        if seen.len() >= MAX_TRACKED_SIGNATURES {
            seen.retain(|_, state| now.saturating_sub(state.last_reported) < window);
        }
        if seen.len() >= MAX_TRACKED_SIGNATURES {
            let oldest = seen
                .iter()
                .min_by_key(|(_, state)| state.last_reported)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                seen.remove(&oldest);
            }
        }
        seen.insert(
            signature,
            SignatureState {
                last_reported: now,
                suppressed: 0,
            },
        );
        Some(0)
    }
}

impl<S: ErrorSink> ErrorSink for RateLimitedErrorSink<S> {
    fn report(&self, error: &WorkerError) {
        let Some(suppressed) = self.should_forward(error.signature()) else {
            return;
        };
        if suppressed > 0 {
            warn!("femtowire: suppressed {suppressed} repeats of: {error}");
        }
        self.inner.report(error);
    }
}

fn millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

/// Subscription point for a worker's error channel.
///
/// Falls back to [`LogErrorSink`] while nothing is attached.
#[derive(Default)]
pub struct ErrorSlot {
    sink: RwLock<Option<Arc<dyn ErrorSink>>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sink: Arc<dyn ErrorSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Detach the current subscriber, returning it.
    pub fn detach(&self) -> Option<Arc<dyn ErrorSink>> {
        self.sink.write().take()
    }

    pub fn is_attached(&self) -> bool {
        self.sink.read().is_some()
    }
}

impl ErrorSink for ErrorSlot {
    fn report(&self, error: &WorkerError) {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => sink.report(error),
            None => LogErrorSink.report(error),
        }
    }
}

/// Milliseconds since the UNIX epoch, or 0 if the clock is before it.
pub fn system_time_provider() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Clock that only moves when told to.
#[cfg(any(test, feature = "test-util"))]
#[derive(Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

#[cfg(any(test, feature = "test-util"))]
impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(millis(by), Ordering::SeqCst);
    }

    pub fn provider(&self) -> TimeProvider {
        let inner = Arc::clone(&self.0);
        Box::new(move || inner.load(Ordering::SeqCst))
    }
}
