//! The transport binding the stream layer consumes: one TCP connection
//! with a reader task feeding the connection pipe, a writer task
//! serializing outgoing buffers, and close events fanned out to listeners.

use crate::buffer::{IoBuffer, PipeSender};
use crate::config::TimeoutSetting;
use crate::error::ProxyError;
use crate::metrics::Counter;
use crate::util::Cancellable;
use bytes::BytesMut;
use captains_log::LogFilter;
use crossfire::{mpsc, MAsyncRx, MTx};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const DEFAULT_CONN_BUF_SIZE: usize = 8 * 1024;

static CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    ConnectTimeout,
    ConnectFailed,
    LocalClose,
    RemoteClose,
    OnReadErrClose,
}

impl ConnectionEvent {
    #[inline]
    pub fn is_close(&self) -> bool {
        matches!(self, Self::LocalClose | Self::RemoteClose | Self::OnReadErrClose)
    }

    #[inline]
    pub fn connect_failure(&self) -> bool {
        matches!(self, Self::ConnectTimeout | Self::ConnectFailed)
    }
}

/// Whether a local close flushes queued writes first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CloseType {
    FlushWrite,
    NoFlush,
}

pub trait ConnectionEventListener: Send + Sync + 'static {
    fn on_event(&self, event: ConnectionEvent);
}

/// Byte totals attached at creation; cluster-wide counters in practice.
pub struct ConnectionStats {
    pub read_total: Arc<Counter>,
    pub write_total: Arc<Counter>,
}

/// A shared handle on one transport connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    id: u64,
    addr: String,
    logger: Arc<LogFilter>,
    buf_size: AtomicUsize,
    listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
    dispatch: Mutex<Option<PipeSender>>,
    pending_stream: Mutex<Option<TcpStream>>,
    write_tx: Mutex<Option<MTx<IoBuffer>>>,
    stats: Mutex<Option<Arc<ConnectionStats>>>,
    // (read, write) socket deadlines
    timeouts: Mutex<(Duration, Duration)>,
    closed: AtomicBool,
    // set for NoFlush close, the writer drops queued buffers
    noflush: AtomicBool,
    close_tx: Mutex<Option<MTx<()>>>,
    close_rx: MAsyncRx<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "conn#{} to {}", self.inner.id, self.inner.addr)
    }
}

impl Connection {
    /// A client connection that is not yet connected; call [Connection::connect].
    pub fn new(addr: &str) -> Self {
        Self::build(addr, None)
    }

    /// Wrap an accepted stream; call [Connection::start] once the read
    /// dispatch is attached.
    pub fn from_accepted(stream: TcpStream) -> Self {
        let addr = match stream.peer_addr() {
            Ok(a) => a.to_string(),
            Err(_) => "unknown".to_string(),
        };
        Self::build(&addr, Some(stream))
    }

    fn build(addr: &str, stream: Option<TcpStream>) -> Self {
        let (close_tx, close_rx) = crossfire::mpmc::unbounded_async::<()>();
        let timeout = TimeoutSetting::default();
        Self {
            inner: Arc::new(ConnInner {
                id: CONN_ID.fetch_add(1, Ordering::Relaxed),
                addr: addr.to_string(),
                logger: Arc::new(LogFilter::new()),
                buf_size: AtomicUsize::new(DEFAULT_CONN_BUF_SIZE),
                listeners: Mutex::new(Vec::new()),
                dispatch: Mutex::new(None),
                pending_stream: Mutex::new(stream),
                write_tx: Mutex::new(None),
                stats: Mutex::new(None),
                timeouts: Mutex::new((timeout.read_timeout, timeout.write_timeout)),
                closed: AtomicBool::new(false),
                noflush: AtomicBool::new(false),
                close_tx: Mutex::new(Some(close_tx)),
                close_rx,
            }),
        }
    }

    #[inline]
    pub fn logger(&self) -> Arc<LogFilter> {
        self.inner.logger.clone()
    }

    #[inline]
    pub fn remote_addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn add_event_listener(&self, l: Arc<dyn ConnectionEventListener>) {
        self.inner.listeners.lock().unwrap().push(l);
    }

    pub fn set_read_dispatch(&self, pipe: PipeSender) {
        self.inner.dispatch.lock().unwrap().replace(pipe);
    }

    pub fn set_stats(&self, stats: ConnectionStats) {
        self.inner.stats.lock().unwrap().replace(Arc::new(stats));
    }

    /// Read chunk size; 0 keeps the default. Takes effect on [Connection::start].
    pub fn set_buf_size(&self, size: usize) {
        if size > 0 {
            self.inner.buf_size.store(size, Ordering::Relaxed);
        }
    }

    /// Socket read/write deadlines. Takes effect on [Connection::start].
    pub fn set_timeouts(&self, timeout: &TimeoutSetting) {
        *self.inner.timeouts.lock().unwrap() = (timeout.read_timeout, timeout.write_timeout);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Dial the peer with a deadline. Fires `Connected` on success,
    /// `ConnectTimeout` / `ConnectFailed` (and then the close event) on
    /// failure, to listeners registered before the call.
    pub async fn connect(&self, timeout: Duration) -> Result<(), ProxyError> {
        if self.is_closed() {
            return Err(ProxyError::ConnClosed);
        }
        match tokio::time::timeout(timeout, TcpStream::connect(&self.inner.addr)).await {
            Ok(Ok(stream)) => {
                self.inner.pending_stream.lock().unwrap().replace(stream);
                self.start();
                self.inner.fire_event(ConnectionEvent::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                logger_warn!(self.inner.logger, "{:?} connect failed: {}", self, e);
                self.inner.fire_event(ConnectionEvent::ConnectFailed);
                self.inner.on_close(ConnectionEvent::LocalClose);
                Err(e.into())
            }
            Err(_) => {
                logger_warn!(self.inner.logger, "{:?} connect timeout", self);
                self.inner.fire_event(ConnectionEvent::ConnectTimeout);
                self.inner.on_close(ConnectionEvent::LocalClose);
                Err(ProxyError::Io(std::io::ErrorKind::TimedOut.into()))
            }
        }
    }

    /// Spawn the reader and writer tasks over the held stream.
    pub fn start(&self) {
        let stream = match self.inner.pending_stream.lock().unwrap().take() {
            Some(s) => s,
            None => return,
        };
        let (mut read_half, mut write_half) = stream.into_split();

        let (write_tx, write_rx) = mpsc::unbounded_async::<IoBuffer>();
        self.inner.write_tx.lock().unwrap().replace(write_tx);
        let stats = self.inner.stats.lock().unwrap().clone();
        let (read_timeout, write_timeout) = *self.inner.timeouts.lock().unwrap();

        let inner = self.inner.clone();
        let _stats = stats.clone();
        tokio::spawn(async move {
            while let Ok(buf) = write_rx.recv().await {
                if inner.noflush.load(Ordering::Acquire) {
                    continue;
                }
                match tokio::time::timeout(write_timeout, write_half.write_all(buf.bytes())).await
                {
                    Ok(Ok(())) => {
                        if let Some(stats) = _stats.as_ref() {
                            stats.write_total.inc(buf.len() as i64);
                        }
                    }
                    Ok(Err(e)) => {
                        logger_debug!(inner.logger, "conn#{} write err: {}", inner.id, e);
                        break;
                    }
                    Err(_) => {
                        logger_warn!(inner.logger, "conn#{} write timeout", inner.id);
                        break;
                    }
                }
            }
            let _ = write_half.shutdown().await;
        });

        let inner = self.inner.clone();
        let close_rx = self.inner.close_rx.clone();
        tokio::spawn(async move {
            let mut pipe = inner.dispatch.lock().unwrap().take();
            let buf_size = inner.buf_size.load(Ordering::Relaxed);
            let mut event = None;
            loop {
                let mut chunk = BytesMut::with_capacity(buf_size);
                let read = tokio::time::timeout(read_timeout, read_half.read_buf(&mut chunk));
                match Cancellable::new(read, close_rx.recv()).await {
                    Err(_) => break, // locally closed
                    // idle past the read deadline; loop to re-check close
                    Ok(Err(_)) => continue,
                    Ok(Ok(Ok(0))) => {
                        event = Some(ConnectionEvent::RemoteClose);
                        break;
                    }
                    Ok(Ok(Ok(n))) => {
                        if let Some(stats) = stats.as_ref() {
                            stats.read_total.inc(n as i64);
                        }
                        if let Some(pipe) = pipe.as_mut() {
                            if pipe.dispatch(IoBuffer::from(chunk)).await.is_err() {
                                // the parser went away, nothing consumes reads
                                event = Some(ConnectionEvent::LocalClose);
                                break;
                            }
                        }
                    }
                    Ok(Ok(Err(e))) => {
                        logger_debug!(inner.logger, "conn#{} read err: {}", inner.id, e);
                        event = Some(ConnectionEvent::OnReadErrClose);
                        break;
                    }
                }
            }
            // dropping `pipe` here closes the parser's read side
            drop(pipe);
            if let Some(event) = event {
                inner.on_close(event);
            }
        });
    }

    /// Queue one buffer for the peer. The writer task serializes all
    /// writes, so interleaved frames from multiple tasks cannot corrupt
    /// framing.
    pub fn write(&self, buf: IoBuffer) -> Result<(), ProxyError> {
        let tx = self.inner.write_tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx.send(buf).map_err(|_| ProxyError::ConnClosed),
            None => Err(ProxyError::ConnClosed),
        }
    }

    pub fn close(&self, how: CloseType, event: ConnectionEvent) {
        if how == CloseType::NoFlush {
            self.inner.noflush.store(true, Ordering::Release);
        }
        self.inner.on_close(event);
    }
}

impl ConnInner {
    fn fire_event(&self, event: ConnectionEvent) {
        let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
        for l in listeners {
            l.on_event(event);
        }
    }

    fn on_close(&self, event: ConnectionEvent) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // stops the reader, which closes the pipe and ends the parser
        let _ = self.close_tx.lock().unwrap().take();
        // the writer drains queued buffers (unless noflush) and shuts down
        let _ = self.write_tx.lock().unwrap().take();
        let _ = self.dispatch.lock().unwrap().take();
        self.fire_event(event);
        // drop listeners so a client wrapper does not keep the cycle alive
        self.listeners.lock().unwrap().clear();
    }
}
