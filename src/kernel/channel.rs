//! Output channel.
//!
//! One Unix stream socket per kernel, in the shared container directory.
//! A worker connects, sends its request token on the first line, and from
//! then on everything it writes is output of that process. The stream has
//! no framing and no acknowledgements.

use super::KernelError;
use super::process::{Pid, RequestId};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Longest handshake line accepted, token plus newline.
const HANDSHAKE_LIMIT: u64 = 64;

const READ_CHUNK: usize = 16 * 1024;

static CHANNEL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Receives what arrives on the channel.
pub trait ChannelSink: Send + Sync + 'static {
    /// A worker presented `token`; returns the pid its output belongs to, or
    /// `None` to drop the connection.
    fn connected(&self, token: RequestId) -> Option<Pid>;

    fn output(&self, pid: Pid, bytes: Vec<u8>);

    fn closed(&self, pid: Pid);
}

#[derive(Debug)]
pub struct OutputChannel {
    path: PathBuf,
    closing: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl OutputChannel {
    /// Bind a fresh socket in `dir` and start accepting connections.
    pub fn bind(dir: &Path, sink: Arc<dyn ChannelSink>) -> Result<Self, KernelError> {
        let failed = |err: std::io::Error| KernelError::SocketCreationFailed(format!("{}: {err}", dir.display()));
        std::fs::create_dir_all(dir).map_err(failed)?;
        let path = dir.join(format!(
            "kernel-{}-{}.sock",
            crate::host_pid(),
            CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(failed(err)),
        }
        let listener = UnixListener::bind(&path).map_err(failed)?;
        let closing = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let closing = closing.clone();
            std::thread::Builder::new()
                .name("lodge-channel".into())
                .spawn(move || accept_loop(listener, closing, sink))
                .map_err(failed)?
        };
        debug!("output channel listening on {}", path.display());
        Ok(Self {
            path,
            closing,
            acceptor: Some(acceptor),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and remove the socket. Established streams run until
    /// their worker closes them.
    pub fn close(&mut self) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };
        self.closing.store(true, Ordering::Release);
        // Wake the acceptor out of accept().
        let _ = UnixStream::connect(&self.path);
        let _ = acceptor.join();
        let _ = std::fs::remove_file(&self.path);
        debug!("output channel {} closed", self.path.display());
    }
}

impl Drop for OutputChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(listener: UnixListener, closing: Arc<AtomicBool>, sink: Arc<dyn ChannelSink>) {
    for stream in listener.incoming() {
        if closing.load(Ordering::Acquire) {
            break;
        }
        match stream {
            Ok(stream) => {
                let sink = sink.clone();
                let spawned = std::thread::Builder::new()
                    .name("lodge-stream".into())
                    .spawn(move || serve(stream, sink.as_ref()));
                if let Err(err) = spawned {
                    warn!("dropping output connection: {err}");
                }
            }
            Err(err) => warn!("accept failed: {err}"),
        }
    }
}

fn serve(stream: UnixStream, sink: &dyn ChannelSink) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    if let Err(err) = (&mut reader).take(HANDSHAKE_LIMIT).read_line(&mut line) {
        debug!("handshake read failed: {err}");
        return;
    }
    let Ok(token) = line.trim_end().parse::<RequestId>() else {
        debug!("dropping connection with malformed handshake {line:?}");
        return;
    };
    let Some(pid) = sink.connected(token) else {
        debug!("dropping connection for unknown request {token}");
        return;
    };
    trace!("stream for {pid} open");

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => sink.output(pid, buf[..n].to_vec()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("stream for {pid} failed: {err}");
                break;
            }
        }
    }
    trace!("stream for {pid} closed");
    sink.closed(pid);
}
