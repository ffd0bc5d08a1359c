//! Loopback fixtures shared by the end-to-end tests: a reader bound to an
//! ephemeral port, writers pointed at it, and a listener collecting the
//! decoded packages it receives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use femtowire::{
    BoundPackage, ConnectionSettings, FrameReader, ListenerOptions, MessageListener, TcpReader,
    TcpWriter, decode_package,
};
use parking_lot::Mutex;

/// Packages decoded by a [`collecting_listener`].
pub type Received = Arc<Mutex<Vec<BoundPackage>>>;

/// Return an open reader on `127.0.0.1` with an OS-assigned port.
pub fn loopback_reader() -> Arc<TcpReader> {
    let reader = TcpReader::new(&ConnectionSettings::new("inbound", "127.0.0.1", 0))
        .expect("reader settings are valid");
    reader.open().expect("bind ephemeral port");
    Arc::new(reader)
}

pub fn local_addr(reader: &TcpReader) -> SocketAddr {
    reader.local_addr().expect("open reader has an address")
}

/// A writer targeting `addr`, not yet connected.
pub fn writer_for(name: &str, addr: SocketAddr) -> TcpWriter {
    TcpWriter::new(&ConnectionSettings::new(name, addr.ip().to_string(), addr.port()))
        .expect("writer settings are valid")
}

/// Start a listener on `reader` that decodes every frame into `Received`.
pub fn collecting_listener(reader: Arc<TcpReader>) -> (Received, MessageListener) {
    let received: Received = Arc::default();
    let sink = Arc::clone(&received);
    let listener = MessageListener::new(reader as Arc<dyn FrameReader>, move |_, frame| {
        let package = decode_package(&frame).expect("frame holds an encoded package");
        sink.lock().push(package);
    })
    .with_options(ListenerOptions {
        read_timeout: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(20),
    });
    listener.start().expect("start listener");
    (received, listener)
}

/// Poll `done` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}
