//! The per-host upstream connection pool: hands out free codec clients on
//! demand, enforces the cluster's max-connections ceiling, and reacts to
//! connection and stream events.

use crate::cluster::Host;
use crate::config::ProxyConfig;
use crate::error::{PoolFailureReason, StreamResetReason};
use crate::net::{Connection, ConnectionEvent, ConnectionEventListener, ConnectionStats};
use crate::protocol::{HeaderMap, ProtocolId};
use crate::stream::{
    self, ClientStreamConnection, StreamEventListener, StreamReceiver, StreamSender,
};
use crate::buffer::IoBuffer;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Notified by [ConnPool::new_stream].
pub trait PoolEventListener: Send + Sync + 'static {
    fn on_ready(&self, sender: Arc<dyn StreamSender>, host: Arc<Host>);

    fn on_failure(&self, reason: PoolFailureReason, host: Arc<Host>);
}

/// Stream lifecycle notifications forwarded from a codec client to its
/// owner.
pub trait CodecClientCallbacks: Send + Sync + 'static {
    fn on_stream_destroy(&self);

    fn on_stream_reset(&self, reason: StreamResetReason);
}

/// A protocol-agnostic wrapper around one upstream client stream
/// connection, counting in-flight streams and reporting their lifecycle.
#[derive(Clone)]
pub struct CodecClient {
    inner: Arc<CodecClientInner>,
}

struct CodecClientInner {
    protocol: ProtocolId,
    conn: Connection,
    stream_conn: Arc<dyn ClientStreamConnection>,
    active_requests: Mutex<FxHashMap<u64, ()>>,
    callbacks: Mutex<Option<Weak<dyn CodecClientCallbacks>>>,
}

impl CodecClient {
    /// Bind a codec for `protocol` onto `conn`. The codec spawns its parser
    /// task immediately; it blocks on the pipe until the connection starts.
    pub fn new(protocol: ProtocolId, conn: Connection) -> Self {
        let stream_conn = stream::new_client_stream_connection(protocol, conn.clone())
            .expect("protocol registered");
        let inner = Arc::new(CodecClientInner {
            protocol,
            conn: conn.clone(),
            stream_conn,
            active_requests: Mutex::new(FxHashMap::default()),
            callbacks: Mutex::new(None),
        });
        conn.add_event_listener(inner.clone());
        Self { inner }
    }

    pub fn set_callbacks(&self, cb: Weak<dyn CodecClientCallbacks>) {
        self.inner.callbacks.lock().unwrap().replace(cb);
    }

    #[inline]
    pub fn protocol(&self) -> ProtocolId {
        self.inner.protocol
    }

    #[inline]
    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    #[inline]
    pub fn stream_conn(&self) -> &Arc<dyn ClientStreamConnection> {
        &self.inner.stream_conn
    }

    pub fn new_stream(&self, receiver: Option<Arc<dyn StreamReceiver>>) -> Arc<dyn StreamSender> {
        let request = Arc::new(ActiveRequest {
            client: Arc::downgrade(&self.inner),
            stream_id: AtomicU64::new(0),
            receiver,
        });
        let sender = self.inner.stream_conn.new_stream(Some(request.clone()));
        let stream_id = sender.stream().id();
        request.stream_id.store(stream_id, Ordering::Release);
        self.inner.active_requests.lock().unwrap().insert(stream_id, ());
        sender.stream().add_event_listener(request);
        sender
    }

    pub fn active_request_count(&self) -> usize {
        self.inner.active_requests.lock().unwrap().len()
    }

    pub fn close(&self) {
        self.inner.stream_conn.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stream_conn.is_closed()
    }
}

impl CodecClientInner {
    fn on_stream_complete(&self, stream_id: u64) {
        if self.active_requests.lock().unwrap().remove(&stream_id).is_some() {
            if let Some(cb) = self.upgrade_callbacks() {
                cb.on_stream_destroy();
            }
        }
    }

    fn on_stream_reset(&self, stream_id: u64, reason: StreamResetReason) {
        if self.active_requests.lock().unwrap().remove(&stream_id).is_some() {
            if let Some(cb) = self.upgrade_callbacks() {
                cb.on_stream_reset(reason);
                cb.on_stream_destroy();
            }
        }
    }

    fn upgrade_callbacks(&self) -> Option<Arc<dyn CodecClientCallbacks>> {
        self.callbacks.lock().unwrap().as_ref().and_then(|w| w.upgrade())
    }
}

impl ConnectionEventListener for CodecClientInner {
    fn on_event(&self, event: ConnectionEvent) {
        if !event.is_close() {
            return;
        }
        // every stream still in flight on this connection surfaces the
        // same connection-scoped reason
        let drained: Vec<u64> = self.active_requests.lock().unwrap().drain().map(|(k, _)| k).collect();
        if drained.is_empty() {
            return;
        }
        if let Some(cb) = self.upgrade_callbacks() {
            for _ in drained {
                cb.on_stream_reset(StreamResetReason::StreamConnectionTermination);
                cb.on_stream_destroy();
            }
        }
    }
}

/// Wraps the driver's receiver to observe the terminal event of one
/// stream.
struct ActiveRequest {
    client: Weak<CodecClientInner>,
    stream_id: AtomicU64,
    receiver: Option<Arc<dyn StreamReceiver>>,
}

impl ActiveRequest {
    fn complete(&self) {
        if let Some(client) = self.client.upgrade() {
            client.on_stream_complete(self.stream_id.load(Ordering::Acquire));
        }
    }
}

impl StreamReceiver for ActiveRequest {
    fn on_receive_headers(&self, headers: HeaderMap, end_stream: bool) {
        if let Some(r) = self.receiver.as_ref() {
            r.on_receive_headers(headers, end_stream);
        }
        if end_stream {
            self.complete();
        }
    }

    fn on_receive_data(&self, data: IoBuffer, end_stream: bool) {
        if let Some(r) = self.receiver.as_ref() {
            r.on_receive_data(data, end_stream);
        }
        if end_stream {
            self.complete();
        }
    }

    fn on_receive_trailers(&self, trailers: HeaderMap) {
        if let Some(r) = self.receiver.as_ref() {
            r.on_receive_trailers(trailers);
        }
        self.complete();
    }
}

impl StreamEventListener for ActiveRequest {
    fn on_reset_stream(&self, reason: StreamResetReason) {
        if let Some(client) = self.client.upgrade() {
            client.on_stream_reset(self.stream_id.load(Ordering::Acquire), reason);
        }
    }
}

/// One upstream stream-connection with pool bookkeeping. States:
/// connecting, available (in the free list), in-use, closed.
pub struct ActiveClient {
    weak_self: Weak<ActiveClient>,
    pool: Weak<PoolInner>,
    codec: CodecClient,
    host: Arc<Host>,
    total_stream: AtomicU64,
    /// a connection-scoped reset arrived while a stream was in flight;
    /// statistics attribution only
    close_with_active_req: AtomicBool,
    closed: AtomicBool,
}

impl ActiveClient {
    async fn connect(
        pool: &Arc<PoolInner>,
    ) -> Result<Arc<ActiveClient>, PoolFailureReason> {
        let host = pool.host.clone();
        let conn = Connection::new(&host.address);
        conn.set_buf_size(pool.config.stream_buf_size);
        conn.set_timeouts(&pool.config.timeout);
        conn.set_stats(ConnectionStats {
            read_total: host.cluster.stats.upstream_bytes_read_total.clone(),
            write_total: host.cluster.stats.upstream_bytes_write_total.clone(),
        });
        let codec = CodecClient::new(pool.protocol, conn.clone());
        let client = Arc::new_cyclic(|weak_self| ActiveClient {
            weak_self: weak_self.clone(),
            pool: Arc::downgrade(pool),
            codec: codec.clone(),
            host: host.clone(),
            total_stream: AtomicU64::new(0),
            close_with_active_req: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let client_dyn: Arc<dyn CodecClientCallbacks> = client.clone();
        let cb: Weak<dyn CodecClientCallbacks> = Arc::downgrade(&client_dyn);
        codec.set_callbacks(cb);
        conn.add_event_listener(client.clone());

        host.stats.upstream_connection_total.inc(1);
        host.stats.upstream_connection_active.inc(1);
        host.cluster.stats.upstream_connection_total.inc(1);
        host.cluster.stats.upstream_connection_active.inc(1);

        if conn.connect(pool.config.timeout.connect_timeout).await.is_err() {
            return Err(PoolFailureReason::ConnectionFailure);
        }
        Ok(client)
    }

    #[inline]
    pub fn codec(&self) -> &CodecClient {
        &self.codec
    }

    /// Streams ever handed out on this client.
    #[inline]
    pub fn total_streams(&self) -> u64 {
        self.total_stream.load(Ordering::Relaxed)
    }
}

impl ConnectionEventListener for ActiveClient {
    fn on_event(&self, event: ConnectionEvent) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_connection_event(self, event);
        }
    }
}

impl CodecClientCallbacks for ActiveClient {
    fn on_stream_destroy(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_stream_destroy(self);
        }
    }

    fn on_stream_reset(&self, reason: StreamResetReason) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_stream_reset(self, reason);
        }
    }
}

struct PoolState {
    free: Vec<Arc<ActiveClient>>,
    total_client_count: u64,
}

struct PoolInner {
    protocol: ProtocolId,
    host: Arc<Host>,
    config: ProxyConfig,
    clients: Mutex<PoolState>,
}

/// The per-host connection pool.
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl ConnPool {
    pub fn new(protocol: ProtocolId, host: Arc<Host>, config: ProxyConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                protocol,
                host,
                config,
                clients: Mutex::new(PoolState { free: Vec::new(), total_client_count: 0 }),
            }),
        }
    }

    #[inline]
    pub fn protocol(&self) -> ProtocolId {
        self.inner.protocol
    }

    #[inline]
    pub fn host(&self) -> &Arc<Host> {
        &self.inner.host
    }

    /// Hand out one stream on a pooled client.
    ///
    /// Admission happens in two stages: the connections ceiling when no
    /// free client exists, then the per-cluster requests resource. A client
    /// allocated past the second check stays allocated; it returns to the
    /// free list on stream destroy.
    pub async fn new_stream(
        &self, receiver: Option<Arc<dyn StreamReceiver>>, listener: &dyn PoolEventListener,
    ) {
        let host = self.inner.host.clone();
        enum Got {
            Free(Arc<ActiveClient>),
            Create,
            AtCeiling,
        }
        let got = {
            let mut state = self.inner.clients.lock().unwrap();
            match state.free.pop() {
                Some(c) => Got::Free(c),
                None => {
                    let max = host.cluster.resource_manager.connections.max();
                    if state.total_client_count < max {
                        state.total_client_count += 1;
                        Got::Create
                    } else {
                        host.stats.upstream_request_pending_overflow.inc(1);
                        host.cluster.stats.upstream_request_pending_overflow.inc(1);
                        Got::AtCeiling
                    }
                }
            }
        };
        let client = match got {
            Got::Free(c) => c,
            Got::AtCeiling => {
                listener.on_failure(PoolFailureReason::Overflow, host.clone());
                return;
            }
            Got::Create => match ActiveClient::connect(&self.inner).await {
                Ok(c) => c,
                Err(reason) => {
                    listener.on_failure(reason, host.clone());
                    return;
                }
            },
        };

        if !host.cluster.resource_manager.requests.can_create() {
            host.stats.upstream_request_pending_overflow.inc(1);
            host.cluster.stats.upstream_request_pending_overflow.inc(1);
            listener.on_failure(PoolFailureReason::Overflow, host.clone());
            return;
        }

        host.stats.upstream_request_total.inc(1);
        host.stats.upstream_request_active.inc(1);
        host.cluster.stats.upstream_request_total.inc(1);
        host.cluster.stats.upstream_request_active.inc(1);
        host.cluster.resource_manager.requests.increase();

        let sender = client.codec.new_stream(receiver);
        client.total_stream.fetch_add(1, Ordering::Relaxed);
        listener.on_ready(sender, host);
    }

    /// Close every idle client. In-use clients close through their own
    /// paths.
    pub fn close(&self) {
        let free: Vec<_> = self.inner.clients.lock().unwrap().free.clone();
        for c in free {
            c.codec.close();
        }
    }

    pub fn total_client_count(&self) -> u64 {
        self.inner.clients.lock().unwrap().total_client_count
    }

    pub fn free_client_count(&self) -> usize {
        self.inner.clients.lock().unwrap().free.len()
    }
}

impl PoolInner {
    fn on_connection_event(&self, client: &ActiveClient, event: ConnectionEvent) {
        let host = &self.host;
        if event.is_close() {
            if client.close_with_active_req.load(Ordering::Acquire) {
                if event == ConnectionEvent::LocalClose {
                    host.stats.upstream_connection_local_close_with_active_request.inc(1);
                    host.cluster.stats.upstream_connection_local_close_with_active_request.inc(1);
                } else if event == ConnectionEvent::RemoteClose {
                    host.stats.upstream_connection_remote_close_with_active_request.inc(1);
                    host.cluster.stats.upstream_connection_remote_close_with_active_request.inc(1);
                }
            }
            host.stats.upstream_connection_active.dec(1);
            host.cluster.stats.upstream_connection_active.dec(1);

            let mut state = self.clients.lock().unwrap();
            state.total_client_count -= 1;
            state.free.retain(|c| !std::ptr::eq(c.as_ref(), client));
            client.closed.store(true, Ordering::SeqCst);
        } else if event == ConnectionEvent::ConnectTimeout {
            host.stats.upstream_request_timeout.inc(1);
            host.cluster.stats.upstream_request_timeout.inc(1);
            client.codec.close();
        } else if event == ConnectionEvent::ConnectFailed {
            host.stats.upstream_connection_con_fail.inc(1);
            host.cluster.stats.upstream_connection_con_fail.inc(1);
        }
    }

    fn on_stream_destroy(&self, client: &ActiveClient) {
        let host = &self.host;
        host.stats.upstream_request_active.dec(1);
        host.cluster.stats.upstream_request_active.dec(1);
        host.cluster.resource_manager.requests.decrease();

        // return to pool
        let mut state = self.clients.lock().unwrap();
        if !client.closed.load(Ordering::SeqCst) {
            if let Some(me) = client.weak_self.upgrade() {
                state.free.push(me);
            }
        }
    }

    fn on_stream_reset(&self, client: &ActiveClient, reason: StreamResetReason) {
        let host = &self.host;
        if reason.is_connection_scoped() {
            host.stats.upstream_request_failure_eject.inc(1);
            host.cluster.stats.upstream_request_failure_eject.inc(1);
            client.close_with_active_req.store(true, Ordering::Release);
        } else if reason == StreamResetReason::StreamLocalReset {
            host.stats.upstream_request_local_reset.inc(1);
            host.cluster.stats.upstream_request_local_reset.inc(1);
        } else if reason == StreamResetReason::StreamRemoteReset {
            host.stats.upstream_request_remote_reset.inc(1);
            host.cluster.stats.upstream_request_remote_reset.inc(1);
        }
    }
}
