//! Inbound half of the framed transport.
//!
//! A [`TcpReader`] listens on the configured port. An accept thread hands
//! each connection to its own worker thread, which reassembles frames and
//! pushes them into one shared bounded FIFO. Callers pull frames with
//! [`FrameReader::read`] or [`FrameReader::read_timeout`]. Frames from
//! different connections are served in arrival order only.

use std::{
    io::Read,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryRecvError, bounded};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::reporting::{ErrorSink, ErrorSlot, WorkerError};

use super::{
    ConnectionSettings, FrameReader, ReaderOptions, TransportError,
    error::{is_disconnect, is_transient},
    frame::FrameAssembler,
};

/// Pause between polls of the non-blocking listener socket.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// State shared by the accept thread and every connection worker.
#[derive(Clone)]
struct ConnectionContext {
    name: String,
    options: ReaderOptions,
    shutdown: Arc<AtomicBool>,
    frames: Sender<Vec<u8>>,
    errors: Arc<ErrorSlot>,
}

impl ConnectionContext {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn report(&self, what: &str, err: TransportError) {
        self.errors.report(&WorkerError::transport(
            format!("TcpReader '{}' {what}", self.name),
            err,
        ));
    }

    /// Block until the FIFO has room, giving up only on shutdown.
    fn enqueue(&self, mut frame: Vec<u8>) -> bool {
        loop {
            match self.frames.send_timeout(frame, self.options.read_poll) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(pending)) => {
                    if self.stopping() {
                        return false;
                    }
                    frame = pending;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

struct Listening {
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Listens for inbound connections and queues the frames they carry.
pub struct TcpReader {
    settings: ConnectionSettings,
    options: ReaderOptions,
    frames_tx: Sender<Vec<u8>>,
    frames_rx: Receiver<Vec<u8>>,
    errors: Arc<ErrorSlot>,
    state: Mutex<Option<Listening>>,
}

impl TcpReader {
    /// Snapshot `settings` with default reader options.
    pub fn new(settings: &ConnectionSettings) -> Result<Self, TransportError> {
        Self::with_options(settings, ReaderOptions::default())
    }

    pub fn with_options(
        settings: &ConnectionSettings,
        options: ReaderOptions,
    ) -> Result<Self, TransportError> {
        options.validate()?;
        let (frames_tx, frames_rx) = bounded(options.capacity);
        Ok(Self {
            settings: settings.clone(),
            options,
            frames_tx,
            frames_rx,
            errors: Arc::new(ErrorSlot::new()),
            state: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Address actually bound, available while open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|l| l.local_addr)
    }

    /// Number of frames waiting to be read.
    pub fn pending(&self) -> usize {
        self.frames_rx.len()
    }

    fn bind_host(&self) -> &str {
        match self.settings.host().trim() {
            "" => "0.0.0.0",
            host => host,
        }
    }

    fn context(&self, shutdown: Arc<AtomicBool>) -> ConnectionContext {
        ConnectionContext {
            name: self.settings.name().to_owned(),
            options: self.options.clone(),
            shutdown,
            frames: self.frames_tx.clone(),
            errors: Arc::clone(&self.errors),
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    while !ctx.stopping() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("TcpReader '{}' accepted {peer}", ctx.name);
                let worker_ctx = ctx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("femtowire-conn-{peer}"))
                    .spawn(move || {
                        let result =
                            catch_unwind(AssertUnwindSafe(|| serve_connection(stream, peer, &worker_ctx)));
                        if let Err(payload) = result {
                            debug!("TcpReader '{}': worker for {peer} panicked", worker_ctx.name);
                            worker_ctx.errors.report(&WorkerError::panic(
                                format!("TcpReader '{}' connection", worker_ctx.name),
                                payload.as_ref(),
                            ));
                        }
                    });
                match spawned {
                    Ok(handle) => {
                        let mut live = connections.lock();
                        live.retain(|h| !h.is_finished());
                        live.push(handle);
                    }
                    Err(err) => ctx.report("connection spawn", err.into()),
                }
            }
            Err(err) if is_transient(&err) => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(err) => {
                ctx.report("accept", err.into());
                thread::sleep(ctx.options.transient_backoff);
            }
        }
    }
    debug!("TcpReader '{}' stopped listening", ctx.name);
}

fn serve_connection(mut stream: TcpStream, peer: SocketAddr, ctx: &ConnectionContext) {
    if let Err(err) = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(Some(ctx.options.read_poll)))
    {
        ctx.report("socket setup", err.into());
        return;
    }
    pump_frames(&mut stream, peer, ctx);
    let _ = stream.shutdown(Shutdown::Both);
}

/// Reassemble frames from `source` until it ends, fails, or the reader stops.
fn pump_frames<R: Read>(source: &mut R, peer: SocketAddr, ctx: &ConnectionContext) {
    let mut assembler = FrameAssembler::new(ctx.options.max_frame_size);
    while !ctx.stopping() {
        match source.read(assembler.read_buf()) {
            Ok(0) => {
                if !assembler.is_idle() {
                    warn!(
                        "TcpReader '{}': {peer} disconnected mid-frame; partial frame discarded",
                        ctx.name
                    );
                }
                debug!("TcpReader '{}': {peer} closed the connection", ctx.name);
                break;
            }
            Ok(n) => match assembler.advance(n) {
                Ok(Some(frame)) => {
                    if !ctx.enqueue(frame) {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!("TcpReader '{}': rejecting frame from {peer}", ctx.name);
                    ctx.report("connection", err);
                    break;
                }
            },
            Err(err) if is_transient(&err) => thread::sleep(ctx.options.transient_backoff),
            Err(err) if is_disconnect(&err) => {
                debug!("TcpReader '{}': {peer} dropped: {err}", ctx.name);
                break;
            }
            Err(err) => {
                debug!("TcpReader '{}': read from {peer} failed", ctx.name);
                ctx.report("connection", err.into());
                break;
            }
        }
    }
}

impl FrameReader for TcpReader {
    fn name(&self) -> &str {
        self.settings.name()
    }

    fn open(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind((self.bind_host(), self.settings.port()))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let ctx = self.context(Arc::clone(&shutdown));
        let accept_connections = Arc::clone(&connections);
        let accept = thread::Builder::new()
            .name(format!("femtowire-accept-{}", self.settings.name()))
            .spawn(move || accept_loop(listener, ctx, accept_connections))?;
        debug!(
            "TcpReader '{}' listening on {local_addr}",
            self.settings.name()
        );
        *state = Some(Listening {
            shutdown,
            local_addr,
            accept,
            connections,
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    fn read(&self) -> Result<Vec<u8>, TransportError> {
        // Wake up periodically so a concurrent close is noticed.
        loop {
            match self.read_timeout(self.options.read_poll) {
                Err(TransportError::Timeout(_)) => continue,
                other => return other,
            }
        }
    }

    fn read_timeout(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self.frames_rx.try_recv() {
            Ok(frame) => return Ok(frame),
            Err(TryRecvError::Empty) if self.is_open() => {}
            Err(_) => return Err(TransportError::NotConnected),
        }
        self.frames_rx
            .recv_timeout(timeout)
            .map_err(|_| TransportError::Timeout(timeout))
    }

    fn close(&self) {
        let Some(listening) = self.state.lock().take() else {
            return;
        };
        listening.shutdown.store(true, Ordering::Release);
        if listening.accept.join().is_err() {
            warn!("TcpReader '{}': accept thread panicked", self.settings.name());
        }
        let workers = std::mem::take(&mut *listening.connections.lock());
        for worker in workers {
            let _ = worker.join();
        }
        debug!("TcpReader '{}' closed", self.settings.name());
    }

    fn errors(&self) -> &Arc<ErrorSlot> {
        &self.errors
    }
}

impl Drop for TcpReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpReader")
            .field("settings", &self.settings)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::encode_frame;
    use rstest::{fixture, rstest};
    use std::io::{self, Cursor};

    /// Yields `data`, then fails every further read with `kind`.
    struct FailAfter {
        data: Cursor<Vec<u8>>,
        kind: io::ErrorKind,
    }

    impl FailAfter {
        fn new(data: Vec<u8>, kind: io::ErrorKind) -> Self {
            Self {
                data: Cursor::new(data),
                kind,
            }
        }
    }

    impl Read for FailAfter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(io::Error::from(self.kind)),
                n => Ok(n),
            }
        }
    }

    struct Harness {
        ctx: ConnectionContext,
        frames: Receiver<Vec<u8>>,
        reported: Arc<Mutex<Vec<String>>>,
    }

    #[fixture]
    fn harness() -> Harness {
        let (tx, rx) = bounded(16);
        let errors = Arc::new(ErrorSlot::new());
        let reported: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink_reported = Arc::clone(&reported);
        errors.attach(Arc::new(move |err: &WorkerError| {
            sink_reported.lock().push(err.to_string());
        }));
        Harness {
            ctx: ConnectionContext {
                name: "inbound".into(),
                options: ReaderOptions::default(),
                shutdown: Arc::new(AtomicBool::new(false)),
                frames: tx,
                errors,
            },
            frames: rx,
            reported,
        }
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn framed(payload: &[u8]) -> Vec<u8> {
        encode_frame(payload).expect("frame fits")
    }

    #[rstest]
    #[case(io::ErrorKind::ConnectionReset)]
    #[case(io::ErrorKind::ConnectionAborted)]
    fn reset_ends_the_connection_quietly(harness: Harness, #[case] kind: io::ErrorKind) {
        let mut bytes = framed(b"kept");
        bytes.extend_from_slice(&[9, 0, 0, 0, b'x']);
        pump_frames(&mut FailAfter::new(bytes, kind), peer(40000), &harness.ctx);

        assert_eq!(harness.frames.try_recv().expect("complete frame"), b"kept");
        assert!(harness.frames.try_recv().is_err(), "partial frame discarded");
        assert!(harness.reported.lock().is_empty());
    }

    #[rstest]
    fn unexpected_failures_share_one_signature_across_peers(harness: Harness) {
        for port in [40001, 40002] {
            let mut source = FailAfter::new(Vec::new(), io::ErrorKind::InvalidData);
            pump_frames(&mut source, peer(port), &harness.ctx);
        }
        let reported = harness.reported.lock();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0], reported[1]);
        assert!(reported[0].starts_with("TcpReader 'inbound' connection: "));
        assert!(!reported[0].contains("4000"), "peer leaked into {}", reported[0]);
    }

    #[rstest]
    fn stopping_reader_skips_reads(harness: Harness) {
        harness.ctx.shutdown.store(true, Ordering::Release);
        let mut source = FailAfter::new(framed(b"late"), io::ErrorKind::ConnectionReset);
        pump_frames(&mut source, peer(40003), &harness.ctx);
        assert!(harness.frames.try_recv().is_err());
    }
}
