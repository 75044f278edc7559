//! Stream connections for the binary RPC framing. Unlike HTTP/1, requests
//! are correlated by the 32-bit request id, so many streams can be in
//! flight on one connection.

use crate::buffer::{conn_pipe, IoBuffer, PipeReader};
use crate::error::{ProxyError, StreamResetReason};
use crate::net::{CloseType, Connection, ConnectionEvent};
use crate::protocol::rpc::{self, DecodeError, RpcFrame};
use crate::protocol::{self, HeaderMap, ProtocolId, HEADER_RPC_REQUEST_ID};
use crate::stream::{
    ClientStreamConnection, ServerStreamCallbacks, ServerStreamConnection, StreamCore,
    StreamReceiver, StreamSender,
};
use captains_log::LogFilter;
use crossfire::{mpsc, MTx};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub struct RpcStreamFactory;

impl crate::stream::StreamConnFactory for RpcStreamFactory {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::MeshRpc
    }

    fn protocol_match(&self, prefix: &[u8]) -> crate::protocol::MatchResult {
        rpc::protocol_match(prefix)
    }

    fn create_client_stream(&self, conn: Connection) -> Arc<dyn ClientStreamConnection> {
        RpcClientStreamConnection::new(conn)
    }

    fn create_server_stream(
        &self, conn: Connection, callbacks: Arc<dyn ServerStreamCallbacks>,
    ) -> Arc<dyn ServerStreamConnection> {
        RpcServerStreamConnection::new(conn, callbacks)
    }
}

// ===== client side =====

pub struct RpcClientStreamConnection {
    inner: Arc<RpcClientInner>,
}

struct RpcClientInner {
    conn: Connection,
    streams: Mutex<FxHashMap<u32, Arc<RpcClientStream>>>,
    next_request_id: AtomicU32,
    streams_created: AtomicU64,
    logger: Arc<LogFilter>,
}

impl RpcClientStreamConnection {
    pub fn new(conn: Connection) -> Arc<Self> {
        let (pipe_tx, pipe_rx) = conn_pipe();
        conn.set_read_dispatch(pipe_tx);
        let inner = Arc::new(RpcClientInner {
            logger: conn.logger(),
            conn,
            streams: Mutex::new(FxHashMap::default()),
            next_request_id: AtomicU32::new(1),
            streams_created: AtomicU64::new(0),
        });
        let _inner = inner.clone();
        tokio::spawn(async move {
            let mut reader = pipe_rx;
            loop {
                match AssertUnwindSafe(_inner.serve(&mut reader)).catch_unwind().await {
                    Ok(_) => return,
                    Err(_) => {
                        logger_error!(_inner.logger, "rpc client serve task panic, restarting");
                    }
                }
            }
        });
        Arc::new(Self { inner })
    }

    /// The concrete stream type, exposing the request id the keep-alive
    /// controller records before sending a probe.
    pub fn new_rpc_stream(
        &self, receiver: Option<Arc<dyn StreamReceiver>>,
    ) -> Arc<RpcClientStream> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let s = Arc::new(RpcClientStream {
            core: StreamCore::new(protocol::generate_stream_id(), receiver),
            conn: Arc::downgrade(&self.inner),
            request_id,
            req: Mutex::new(Some(RpcRequestState::default())),
        });
        self.inner.streams_created.fetch_add(1, Ordering::Relaxed);
        self.inner.streams.lock().unwrap().insert(request_id, s.clone());
        s
    }
}

impl RpcClientInner {
    async fn serve(&self, reader: &mut PipeReader) {
        loop {
            match rpc::decode_frame(reader).await {
                Err(DecodeError::Closed) => {
                    self.drain_streams(StreamResetReason::StreamConnectionTermination);
                    return;
                }
                Err(DecodeError::Invalid(e)) => {
                    logger_error!(self.logger, "{:?} rpc client decode error: {}", self.conn, e);
                    self.drain_streams(StreamResetReason::StreamRemoteReset);
                    self.conn.close(CloseType::NoFlush, ConnectionEvent::LocalClose);
                    return;
                }
                Ok(frame) => {
                    if frame.is_request() {
                        logger_warn!(self.logger, "{:?} unexpected request frame", self.conn);
                        continue;
                    }
                    let s = self.streams.lock().unwrap().remove(&frame.request_id);
                    match s {
                        Some(s) => s.on_response(frame),
                        None => {
                            // response for an id we no longer track
                            logger_trace!(
                                self.logger,
                                "{:?} drop response request_id={}",
                                self.conn,
                                frame.request_id
                            );
                        }
                    }
                }
            }
        }
    }

    fn drain_streams(&self, reason: StreamResetReason) {
        let streams: Vec<_> = self.streams.lock().unwrap().drain().map(|(_, s)| s).collect();
        for s in streams {
            s.core.reset(reason);
        }
    }
}

impl ClientStreamConnection for RpcClientStreamConnection {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::MeshRpc
    }

    fn new_stream(&self, receiver: Option<Arc<dyn StreamReceiver>>) -> Arc<dyn StreamSender> {
        self.new_rpc_stream(receiver)
    }

    fn streams_created(&self) -> u64 {
        self.inner.streams_created.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.inner.conn.close(CloseType::NoFlush, ConnectionEvent::LocalClose);
    }

    fn is_closed(&self) -> bool {
        self.inner.conn.is_closed()
    }
}

#[derive(Default)]
struct RpcRequestState {
    headers: HeaderMap,
    content: Vec<u8>,
}

pub struct RpcClientStream {
    core: StreamCore,
    conn: Weak<RpcClientInner>,
    request_id: u32,
    req: Mutex<Option<RpcRequestState>>,
}

impl RpcClientStream {
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    fn on_response(&self, frame: RpcFrame) {
        if !self.core.mark_terminated() {
            return;
        }
        let mut headers = frame.headers;
        headers.set(HEADER_RPC_REQUEST_ID, &frame.request_id.to_string());
        if let Some(receiver) = self.core.receiver() {
            let has_data = !frame.content.is_empty();
            receiver.on_receive_headers(headers, !has_data);
            if has_data {
                receiver.on_receive_data(frame.content, true);
            }
        }
    }

    fn end_stream(&self) -> Result<(), ProxyError> {
        let state = self.req.lock().unwrap().take().ok_or(ProxyError::ConnClosed)?;
        let inner = self.conn.upgrade().ok_or(ProxyError::ConnClosed)?;
        let wire = rpc::encode_request(self.request_id, &state.headers, &state.content)?;
        inner.conn.write(wire)
    }
}

impl StreamSender for RpcClientStream {
    fn append_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), ProxyError> {
        {
            let mut guard = self.req.lock().unwrap();
            let state = guard.as_mut().ok_or(ProxyError::ConnClosed)?;
            state.headers = headers;
        }
        if end_stream {
            self.end_stream()?;
        }
        Ok(())
    }

    fn append_data(&self, data: IoBuffer, end_stream: bool) -> Result<(), ProxyError> {
        {
            let mut guard = self.req.lock().unwrap();
            let state = guard.as_mut().ok_or(ProxyError::ConnClosed)?;
            state.content.extend_from_slice(data.bytes());
        }
        if end_stream {
            self.end_stream()?;
        }
        Ok(())
    }

    fn append_trailers(&self, _trailers: HeaderMap) -> Result<(), ProxyError> {
        self.end_stream()
    }

    fn stream(&self) -> &StreamCore {
        &self.core
    }
}

// ===== server side =====

pub struct RpcServerStreamConnection {
    inner: Arc<RpcServerInner>,
}

struct RpcServerInner {
    conn: Connection,
    callbacks: Arc<dyn ServerStreamCallbacks>,
    logger: Arc<LogFilter>,
}

impl RpcServerStreamConnection {
    pub fn new(conn: Connection, callbacks: Arc<dyn ServerStreamCallbacks>) -> Arc<Self> {
        let (pipe_tx, pipe_rx) = conn_pipe();
        conn.set_read_dispatch(pipe_tx);
        let inner =
            Arc::new(RpcServerInner { logger: conn.logger(), conn: conn.clone(), callbacks });
        let _inner = inner.clone();
        tokio::spawn(async move {
            let mut reader = pipe_rx;
            loop {
                match AssertUnwindSafe(RpcServerInner::serve(&_inner, &mut reader))
                    .catch_unwind()
                    .await
                {
                    Ok(_) => return,
                    Err(_) => {
                        logger_error!(_inner.logger, "rpc server serve task panic, restarting");
                    }
                }
            }
        });
        conn.start();
        Arc::new(Self { inner })
    }
}

impl RpcServerInner {
    async fn serve(this: &Arc<Self>, reader: &mut PipeReader) {
        loop {
            let frame = match rpc::decode_frame(reader).await {
                Err(DecodeError::Closed) => return,
                Err(DecodeError::Invalid(e)) => {
                    logger_error!(this.logger, "{:?} rpc server decode error: {}", this.conn, e);
                    this.conn.close(CloseType::NoFlush, ConnectionEvent::LocalClose);
                    return;
                }
                Ok(frame) => frame,
            };
            if !frame.is_request() {
                continue;
            }
            if frame.is_heartbeat() {
                // heartbeats are answered inline, never dispatched upstream
                if this.conn.write(rpc::encode_heartbeat_ack(frame.request_id)).is_err() {
                    return;
                }
                continue;
            }

            let (done_tx, done_rx) = mpsc::unbounded_async::<bool>();
            let stream = Arc::new(RpcServerStream {
                core: StreamCore::new(protocol::generate_stream_id(), None),
                conn: Arc::downgrade(this),
                request_id: frame.request_id,
                resp: Mutex::new(Some(RpcRequestState::default())),
                done_tx,
            });
            let receiver = this.callbacks.new_stream_detect(stream.clone());
            stream.core.set_receiver(receiver);

            let mut headers = frame.headers;
            headers.set(HEADER_RPC_REQUEST_ID, &frame.request_id.to_string());
            if let Some(receiver) = stream.core.receiver() {
                let has_data = !frame.content.is_empty();
                receiver.on_receive_headers(headers, !has_data);
                if has_data {
                    receiver.on_receive_data(frame.content, true);
                }
            }

            // wait for the driver to finish producing the response
            if done_rx.recv().await.is_err() {
                logger_warn!(this.logger, "{:?} rpc server stream abandoned", this.conn);
                return;
            }
        }
    }
}

impl ServerStreamConnection for RpcServerStreamConnection {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::MeshRpc
    }
}

pub struct RpcServerStream {
    core: StreamCore,
    conn: Weak<RpcServerInner>,
    request_id: u32,
    resp: Mutex<Option<RpcRequestState>>,
    done_tx: MTx<bool>,
}

impl RpcServerStream {
    fn end_stream(&self) -> Result<(), ProxyError> {
        let state = self.resp.lock().unwrap().take().ok_or(ProxyError::ConnClosed)?;
        let inner = self.conn.upgrade().ok_or(ProxyError::ConnClosed)?;
        let wire = rpc::encode_response(self.request_id, &state.headers, &state.content)?;
        let r = inner.conn.write(wire);
        self.core.mark_terminated();
        let _ = self.done_tx.send(true);
        r
    }
}

impl StreamSender for RpcServerStream {
    fn append_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), ProxyError> {
        {
            let mut guard = self.resp.lock().unwrap();
            let state = guard.as_mut().ok_or(ProxyError::ConnClosed)?;
            state.headers = headers;
        }
        if end_stream {
            self.end_stream()?;
        }
        Ok(())
    }

    fn append_data(&self, data: IoBuffer, end_stream: bool) -> Result<(), ProxyError> {
        {
            let mut guard = self.resp.lock().unwrap();
            let state = guard.as_mut().ok_or(ProxyError::ConnClosed)?;
            state.content.extend_from_slice(data.bytes());
        }
        if end_stream {
            self.end_stream()?;
        }
        Ok(())
    }

    fn append_trailers(&self, _trailers: HeaderMap) -> Result<(), ProxyError> {
        self.end_stream()
    }

    fn stream(&self) -> &StreamCore {
        &self.core
    }
}
