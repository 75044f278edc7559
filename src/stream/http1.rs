//! HTTP/1 stream connections. One request/response at a time on the wire;
//! multiplexing across streams happens at the pool layer by using many
//! connections.

use crate::buffer::{conn_pipe, IoBuffer, PipeReader};
use crate::error::{ProxyError, StreamResetReason};
use crate::net::{CloseType, Connection, ConnectionEvent};
use crate::protocol::http1::{
    self, HttpResponse, HK_CONNECTION, HV_CLOSE, HV_KEEP_ALIVE,
};
use crate::protocol::{
    self, HeaderMap, ProtocolId, HEADER_HOST, HEADER_METHOD, HEADER_PATH, HEADER_QUERY_STRING,
    HEADER_STATUS,
};
use crate::stream::{
    ClientStreamConnection, ServerStreamCallbacks, ServerStreamConnection, StreamCore,
    StreamReceiver, StreamSender,
};
use bytes::BytesMut;
use captains_log::LogFilter;
use crossfire::{mpsc, MTx};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub struct Http1StreamFactory;

impl crate::stream::StreamConnFactory for Http1StreamFactory {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Http1
    }

    fn protocol_match(&self, prefix: &[u8]) -> crate::protocol::MatchResult {
        http1::protocol_match(prefix)
    }

    fn create_client_stream(&self, conn: Connection) -> Arc<dyn ClientStreamConnection> {
        Http1ClientStreamConnection::new(conn)
    }

    fn create_server_stream(
        &self, conn: Connection, callbacks: Arc<dyn ServerStreamCallbacks>,
    ) -> Arc<dyn ServerStreamConnection> {
        Http1ServerStreamConnection::new(conn, callbacks)
    }
}

// ===== client side =====

pub struct Http1ClientStreamConnection {
    inner: Arc<H1ClientInner>,
}

struct H1ClientInner {
    conn: Connection,
    current: Mutex<Option<Arc<Http1ClientStream>>>,
    streams_created: AtomicU64,
    logger: Arc<LogFilter>,
}

impl Http1ClientStreamConnection {
    pub fn new(conn: Connection) -> Arc<Self> {
        let (pipe_tx, pipe_rx) = conn_pipe();
        conn.set_read_dispatch(pipe_tx);
        let inner = Arc::new(H1ClientInner {
            logger: conn.logger(),
            conn,
            current: Mutex::new(None),
            streams_created: AtomicU64::new(0),
        });
        let _inner = inner.clone();
        tokio::spawn(async move {
            let mut reader = pipe_rx;
            loop {
                match AssertUnwindSafe(_inner.serve(&mut reader)).catch_unwind().await {
                    Ok(_) => return,
                    Err(_) => {
                        logger_error!(_inner.logger, "http client serve task panic, restarting");
                    }
                }
            }
        });
        Arc::new(Self { inner })
    }
}

impl H1ClientInner {
    async fn serve(&self, reader: &mut PipeReader) {
        let mut acc = BytesMut::new();
        loop {
            // 1. blocking read of a full response
            let mut resp = http1::acquire_response();
            if let Err(e) = http1::read_response(reader, &mut acc, &mut resp).await {
                if let Some(s) = self.current.lock().unwrap().take() {
                    logger_error!(self.logger, "{:?} http client codec error: {:?}", self.conn, e);
                    s.core.reset(StreamResetReason::StreamRemoteReset);
                }
                return;
            }

            // 2. response processing
            let s = match self.current.lock().unwrap().take() {
                Some(s) => s,
                None => {
                    logger_warn!(self.logger, "{:?} response without a stream", self.conn);
                    self.conn.close(CloseType::NoFlush, ConnectionEvent::LocalClose);
                    return;
                }
            };
            let reset_conn = resp.connection_close;
            s.on_response(resp);

            if reset_conn {
                self.conn.close(CloseType::NoFlush, ConnectionEvent::LocalClose);
                return;
            }
        }
    }
}

impl ClientStreamConnection for Http1ClientStreamConnection {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Http1
    }

    fn new_stream(&self, receiver: Option<Arc<dyn StreamReceiver>>) -> Arc<dyn StreamSender> {
        let s = Arc::new(Http1ClientStream {
            core: StreamCore::new(protocol::generate_stream_id(), receiver),
            conn: Arc::downgrade(&self.inner),
            request: Mutex::new(Some(http1::acquire_request())),
            pending_response: Mutex::new(None),
        });
        self.inner.streams_created.fetch_add(1, Ordering::Relaxed);
        self.inner.current.lock().unwrap().replace(s.clone());
        s
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

pub struct Http1ClientStream {
    core: StreamCore,
    conn: Weak<H1ClientInner>,
    request: Mutex<Option<Box<http1::HttpRequest>>>,
    pending_response: Mutex<Option<Box<HttpResponse>>>,
}

impl Http1ClientStream {
    fn on_response(&self, resp: Box<HttpResponse>) {
        if self.core.read_disabled() {
            self.pending_response.lock().unwrap().replace(resp);
            return;
        }
        self.handle_response(resp);
    }

    fn handle_response(&self, mut resp: Box<HttpResponse>) {
        if !self.core.mark_terminated() {
            http1::release_response(resp);
            return;
        }
        // copy out of the holder so recycling cannot alias driver-held data
        let mut headers = std::mem::take(&mut resp.headers);
        let status = resp.status.to_string();
        headers.set(HEADER_STATUS, &status);
        let body = std::mem::take(&mut resp.body);
        http1::release_response(resp);

        if let Some(receiver) = self.core.receiver() {
            let has_data = !body.is_empty();
            receiver.on_receive_headers(headers, !has_data);
            if has_data {
                receiver.on_receive_data(IoBuffer::from(body), true);
            }
        }
    }

    fn end_stream(&self) -> Result<(), ProxyError> {
        let req = self.request.lock().unwrap().take().ok_or(ProxyError::ConnClosed)?;
        let inner = self.conn.upgrade().ok_or(ProxyError::ConnClosed)?;
        let wire = http1::encode_request(&req);
        let r = inner.conn.write(wire);
        http1::release_request(req);
        r
    }
}

impl StreamSender for Http1ClientStream {
    fn append_headers(&self, mut headers: HeaderMap, end_stream: bool) -> Result<(), ProxyError> {
        {
            let mut guard = self.request.lock().unwrap();
            let req = guard.as_mut().ok_or(ProxyError::ConnClosed)?;
            // explicit method wins; a headers-only request defaults to GET
            req.method = match headers.take(HEADER_METHOD) {
                Some(m) => m,
                None => (if end_stream { "GET" } else { "POST" }).to_string(),
            };
            req.path = headers.take(HEADER_PATH).unwrap_or_default();
            req.query = headers.take(HEADER_QUERY_STRING).unwrap_or_default();
            req.host = match headers.take(HEADER_HOST) {
                Some(h) => h,
                None => match self.conn.upgrade() {
                    Some(inner) => inner.conn.remote_addr().to_string(),
                    None => return Err(ProxyError::ConnClosed),
                },
            };
            headers.strip_internal();
            req.headers = headers;
        }
        if end_stream {
            self.end_stream()?;
        }
        Ok(())
    }

    fn append_data(&self, data: IoBuffer, end_stream: bool) -> Result<(), ProxyError> {
        {
            let mut guard = self.request.lock().unwrap();
            let req = guard.as_mut().ok_or(ProxyError::ConnClosed)?;
            req.body.extend_from_slice(data.bytes());
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

    fn read_disable(&self, disable: bool) {
        if self.core.read_disable(disable) <= 0 {
            if let Some(resp) = self.pending_response.lock().unwrap().take() {
                self.handle_response(resp);
            }
        }
    }
}

// ===== server side =====

pub struct Http1ServerStreamConnection {
    inner: Arc<H1ServerInner>,
}

struct H1ServerInner {
    conn: Connection,
    callbacks: Arc<dyn ServerStreamCallbacks>,
    logger: Arc<LogFilter>,
}

impl Http1ServerStreamConnection {
    pub fn new(conn: Connection, callbacks: Arc<dyn ServerStreamCallbacks>) -> Arc<Self> {
        let (pipe_tx, pipe_rx) = conn_pipe();
        conn.set_read_dispatch(pipe_tx);
        let inner =
            Arc::new(H1ServerInner { logger: conn.logger(), conn: conn.clone(), callbacks });
        let _inner = inner.clone();
        tokio::spawn(async move {
            let mut reader = pipe_rx;
            loop {
                match AssertUnwindSafe(H1ServerInner::serve(&_inner, &mut reader)).catch_unwind().await
                {
                    Ok(_) => return,
                    Err(_) => {
                        logger_error!(_inner.logger, "http server serve task panic, restarting");
                    }
                }
            }
        });
        conn.start();
        Arc::new(Self { inner })
    }
}

impl H1ServerInner {
    async fn serve(this: &Arc<Self>, reader: &mut PipeReader) {
        let mut acc = BytesMut::new();
        loop {
            // 1. blocking read of a full request
            let mut req = http1::acquire_request();
            if http1::read_request(reader, &mut acc, &mut req).await.is_err() {
                // no stream can be in flight here, requests are serial
                return;
            }

            // 2. request processing
            let id = protocol::generate_stream_id();
            let (done_tx, done_rx) = mpsc::unbounded_async::<bool>();
            let stream = Arc::new(Http1ServerStream {
                core: StreamCore::new(id, None),
                conn: Arc::downgrade(this),
                response: Mutex::new(Some(http1::acquire_response())),
                pending_request: Mutex::new(None),
                done_tx,
                request_close: req.connection_close,
                request_is11: req.version_11,
            });
            let receiver = this.callbacks.new_stream_detect(stream.clone());
            stream.core.set_receiver(receiver);

            // set request-line info as internal routing metadata
            let mut headers = std::mem::take(&mut req.headers);
            headers.set(HEADER_HOST, &req.host);
            headers.set(HEADER_METHOD, &req.method);
            headers.set(HEADER_PATH, &req.path);
            if !req.query.is_empty() {
                headers.set(HEADER_QUERY_STRING, &req.query);
            }
            let body = std::mem::take(&mut req.body);
            http1::release_request(req);

            stream.on_request(headers, body);

            // wait for the driver to finish producing the response
            if done_rx.recv().await.is_err() {
                logger_warn!(this.logger, "{:?} server stream abandoned", this.conn);
                return;
            }
        }
    }
}

impl ServerStreamConnection for Http1ServerStreamConnection {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Http1
    }
}

pub struct Http1ServerStream {
    core: StreamCore,
    conn: Weak<H1ServerInner>,
    response: Mutex<Option<Box<HttpResponse>>>,
    pending_request: Mutex<Option<(HeaderMap, Vec<u8>)>>,
    done_tx: MTx<bool>,
    request_close: bool,
    request_is11: bool,
}

impl Http1ServerStream {
    fn on_request(&self, headers: HeaderMap, body: Vec<u8>) {
        if self.core.read_disabled() {
            self.pending_request.lock().unwrap().replace((headers, body));
            return;
        }
        self.handle_request(headers, body);
    }

    fn handle_request(&self, headers: HeaderMap, body: Vec<u8>) {
        if let Some(receiver) = self.core.receiver() {
            let has_data = !body.is_empty();
            receiver.on_receive_headers(headers, !has_data);
            if has_data {
                receiver.on_receive_data(IoBuffer::from(body), true);
            }
        }
    }

    fn end_stream(&self) -> Result<(), ProxyError> {
        let mut resp = self.response.lock().unwrap().take().ok_or(ProxyError::ConnClosed)?;
        let inner = self.conn.upgrade().ok_or(ProxyError::ConnClosed)?;

        let mut reset_conn = false;
        if self.request_close {
            resp.headers.set(HK_CONNECTION, HV_CLOSE);
            reset_conn = true;
        } else if !self.request_is11 {
            // keep-alive must be explicit below HTTP/1.1; 1.1 has it by default
            resp.headers.set(HK_CONNECTION, HV_KEEP_ALIVE);
        }

        let wire = http1::encode_response(&resp);
        let r = inner.conn.write(wire);
        self.core.mark_terminated();
        let _ = self.done_tx.send(true);
        if reset_conn {
            inner.conn.close(CloseType::FlushWrite, ConnectionEvent::LocalClose);
        }
        http1::release_response(resp);
        r
    }
}

impl StreamSender for Http1ServerStream {
    fn append_headers(&self, mut headers: HeaderMap, end_stream: bool) -> Result<(), ProxyError> {
        {
            let mut guard = self.response.lock().unwrap();
            let resp = guard.as_mut().ok_or(ProxyError::ConnClosed)?;
            resp.status = match headers.take(HEADER_STATUS) {
                Some(s) => s.parse::<u16>().map_err(|_| ProxyError::Encode("bad status header"))?,
                None => 200,
            };
            headers.strip_internal();
            resp.headers = headers;
        }
        if end_stream {
            self.end_stream()?;
        }
        Ok(())
    }

    fn append_data(&self, data: IoBuffer, end_stream: bool) -> Result<(), ProxyError> {
        {
            let mut guard = self.response.lock().unwrap();
            let resp = guard.as_mut().ok_or(ProxyError::ConnClosed)?;
            resp.body.extend_from_slice(data.bytes());
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

    fn read_disable(&self, disable: bool) {
        if self.core.read_disable(disable) <= 0 {
            if let Some((headers, body)) = self.pending_request.lock().unwrap().take() {
                self.handle_request(headers, body);
            }
        }
    }
}
