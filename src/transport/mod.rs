//! Framed TCP transport shared by the control and streaming channels.
//!
//! Reads are blocking and retry transparently across socket read timeouts until the
//! requested byte count arrives, the peer goes away, or [`TcpTransport::close`] is
//! called from another thread. Writes are queued to a per-connection writer thread
//! so callers never block on the socket; write failures are reported through the
//! callback given at connect time.

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::SockRef;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{Result, VcsError};

/// Callback invoked from the writer thread when a queued write fails.
pub type WriteErrorHandler = Arc<dyn Fn(&io::Error) + Send + Sync>;

/// Socket options applied on connect.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    /// Bound on each blocking read. Expiry is retried, not surfaced.
    pub read_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_millis(2000), read_timeout: Duration::from_millis(2000) }
    }
}

/// Why a read did not complete.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The transport was closed locally.
    #[error("transport closed")]
    Closed,
    /// The peer closed the connection or the socket failed.
    #[error("socket read failed: {0}")]
    Io(#[from] io::Error),
}

impl ReadError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ReadError::Closed)
    }
}

impl From<ReadError> for VcsError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Closed => VcsError::SocketRead { source: io::Error::from(io::ErrorKind::NotConnected) },
            ReadError::Io(source) => VcsError::SocketRead { source },
        }
    }
}

enum WriteJob {
    Send(Vec<u8>),
    SendAndAck(Vec<u8>, mpsc::Sender<io::Result<()>>),
}

/// One TCP connection with blocking framed reads and queued writes.
pub struct TcpTransport {
    peer: SocketAddr,
    reader: Mutex<BufReader<TcpStream>>,
    socket: TcpStream,
    writer: Mutex<Option<mpsc::Sender<WriteJob>>>,
    closed: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Connects with no-delay, abortive close and a bounded read timeout.
    pub fn connect(
        host: &str,
        port: u16,
        options: TransportOptions,
        on_write_error: WriteErrorHandler,
    ) -> Result<Arc<Self>> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| VcsError::connection_failed_with_source(format!("cannot resolve {}:{}", host, port), Box::new(e)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, options.connect_timeout) {
                Ok(stream) => return Self::from_stream(stream, options, on_write_error),
                Err(e) => {
                    debug!(%addr, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = format!("cannot connect to {}:{}", host, port);
        Err(match last_error {
            Some(e) => VcsError::connection_failed_with_source(reason, Box::new(e)),
            None => VcsError::connection_failed(reason),
        })
    }

    fn from_stream(stream: TcpStream, options: TransportOptions, on_write_error: WriteErrorHandler) -> Result<Arc<Self>> {
        let configure = |stream: &TcpStream| -> io::Result<SocketAddr> {
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(options.read_timeout))?;
            SockRef::from(stream).set_linger(Some(Duration::ZERO))?;
            stream.peer_addr()
        };
        let peer = configure(&stream)
            .map_err(|e| VcsError::connection_failed_with_source("socket configuration failed", Box::new(e)))?;

        let clone = |stream: &TcpStream| {
            stream
                .try_clone()
                .map_err(|e| VcsError::connection_failed_with_source("socket clone failed", Box::new(e)))
        };
        let read_half = clone(&stream)?;
        let write_half = clone(&stream)?;

        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let writer_closed = Arc::clone(&closed);
        thread::Builder::new()
            .name(format!("vcs-writer-{}", peer))
            .spawn(move || writer_loop(write_half, rx, writer_closed, on_write_error))
            .map_err(|e| VcsError::connection_failed_with_source("cannot spawn writer thread", Box::new(e)))?;

        debug!(%peer, "Transport connected");
        Ok(Arc::new(Self {
            peer,
            reader: Mutex::new(BufReader::new(read_half)),
            socket: stream,
            writer: Mutex::new(Some(tx)),
            closed,
        }))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fills `buf` completely, retrying across read timeouts.
    pub fn read_exact_into(&self, buf: &mut [u8]) -> std::result::Result<(), ReadError> {
        let mut reader = self.reader.lock();
        let mut filled = 0;
        while filled < buf.len() {
            if self.is_closed() {
                return Err(ReadError::Closed);
            }
            match reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    if self.is_closed() {
                        return Err(ReadError::Closed);
                    }
                    return Err(ReadError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
                }
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    trace!(peer = %self.peer, filled, wanted = buf.len(), "Read timeout, retrying");
                }
                Err(e) => {
                    if self.is_closed() {
                        return Err(ReadError::Closed);
                    }
                    return Err(ReadError::Io(e));
                }
            }
        }
        Ok(())
    }

    pub fn read_u8(&self) -> std::result::Result<u8, ReadError> {
        let mut buf = [0u8; 1];
        self.read_exact_into(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_i32_be(&self) -> std::result::Result<i32, ReadError> {
        let mut buf = [0u8; 4];
        self.read_exact_into(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    pub fn read_i32_le(&self) -> std::result::Result<i32, ReadError> {
        let mut buf = [0u8; 4];
        self.read_exact_into(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_u16_le(&self) -> std::result::Result<u16, ReadError> {
        let mut buf = [0u8; 2];
        self.read_exact_into(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_bytes(&self, len: usize) -> std::result::Result<Vec<u8>, ReadError> {
        let mut buf = vec![0u8; len];
        self.read_exact_into(&mut buf)?;
        Ok(buf)
    }

    /// Reads `len` bytes as text. Invalid UTF-8 is replaced, not rejected.
    pub fn read_string(&self, len: usize) -> std::result::Result<String, ReadError> {
        let buf = self.read_bytes(len)?;
        Ok(String::from_utf8(buf).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
    }

    /// Queues `bytes` for the writer thread. Returns `false` once closed.
    pub fn write_async(&self, bytes: Vec<u8>) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.writer.lock().as_ref() {
            Some(tx) => tx.send(WriteJob::Send(bytes)).is_ok(),
            None => false,
        }
    }

    /// Queues `bytes` and waits up to `timeout` for them to be flushed.
    pub fn write_and_wait(&self, bytes: Vec<u8>, timeout: Duration) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        let queued = match self.writer.lock().as_ref() {
            Some(tx) if !self.is_closed() => tx.send(WriteJob::SendAndAck(bytes, ack_tx)).is_ok(),
            _ => false,
        };
        if !queued {
            return Err(VcsError::SocketSend { source: io::Error::from(io::ErrorKind::NotConnected) });
        }
        match ack_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(VcsError::SocketSend { source }),
            Err(_) => Err(VcsError::Timeout { operation: "socket write".to_string(), duration: timeout }),
        }
    }

    /// Closes the connection. Idempotent and callable from any thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.writer.lock().take();
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            trace!(peer = %self.peer, error = %e, "Shutdown after peer close");
        }
        debug!(peer = %self.peer, "Transport closed");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport").field("peer", &self.peer).field("closed", &self.is_closed()).finish()
    }
}

fn writer_loop(
    mut stream: TcpStream,
    jobs: mpsc::Receiver<WriteJob>,
    closed: Arc<AtomicBool>,
    on_write_error: WriteErrorHandler,
) {
    let mut write = |bytes: &[u8]| -> io::Result<()> {
        stream.write_all(bytes)?;
        stream.flush()
    };

    for job in jobs {
        let (bytes, ack) = match job {
            WriteJob::Send(bytes) => (bytes, None),
            WriteJob::SendAndAck(bytes, ack) => (bytes, Some(ack)),
        };
        let result = write(&bytes);
        let failed = result.as_ref().err().map(|e| io::Error::new(e.kind(), e.to_string()));
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
        if let Some(error) = failed {
            if !closed.load(Ordering::Acquire) {
                warn!(error = %error, "Socket write failed");
                on_write_error(&error);
            }
            break;
        }
        trace!(len = bytes.len(), "Wrote frame");
    }
}
