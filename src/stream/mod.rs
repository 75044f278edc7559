//! The stream layer: one [StreamCore] per request/response exchange, the
//! receiver/sender capabilities the driver works with, and the per-protocol
//! stream-connection factories with magic-prefix detection.

pub mod http1;
pub mod rpc;

use crate::buffer::IoBuffer;
use crate::error::{ProxyError, StreamResetReason};
use crate::net::Connection;
use crate::protocol::{HeaderMap, MatchResult, ProtocolId};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// The capability for delivering decoded headers, body and trailers to
/// whoever drives the stream.
pub trait StreamReceiver: Send + Sync + 'static {
    fn on_receive_headers(&self, headers: HeaderMap, end_stream: bool);

    fn on_receive_data(&self, data: IoBuffer, end_stream: bool);

    fn on_receive_trailers(&self, trailers: HeaderMap) {
        let _ = trailers;
    }
}

pub trait StreamEventListener: Send + Sync + 'static {
    fn on_reset_stream(&self, reason: StreamResetReason);
}

/// The encoder half handed to the driver; appends are terminal once
/// `end_stream` is passed.
pub trait StreamSender: Send + Sync + 'static {
    fn append_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), ProxyError>;

    fn append_data(&self, data: IoBuffer, end_stream: bool) -> Result<(), ProxyError>;

    fn append_trailers(&self, trailers: HeaderMap) -> Result<(), ProxyError>;

    fn stream(&self) -> &StreamCore;

    /// Pause or resume delivery on the bound stream. Implementations that
    /// park decoded messages re-deliver them when the counter drops to
    /// zero.
    fn read_disable(&self, disable: bool) {
        self.stream().read_disable(disable);
    }
}

/// State shared by every stream flavor: id, receiver, event listeners, the
/// read-disable counter, and the terminal-event latch.
pub struct StreamCore {
    id: u64,
    receiver: Mutex<Option<Arc<dyn StreamReceiver>>>,
    listeners: Mutex<Vec<Arc<dyn StreamEventListener>>>,
    read_disable_count: AtomicI32,
    terminated: AtomicBool,
}

impl StreamCore {
    pub fn new(id: u64, receiver: Option<Arc<dyn StreamReceiver>>) -> Self {
        Self {
            id,
            receiver: Mutex::new(receiver),
            listeners: Mutex::new(Vec::new()),
            read_disable_count: AtomicI32::new(0),
            terminated: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_receiver(&self, receiver: Arc<dyn StreamReceiver>) {
        self.receiver.lock().unwrap().replace(receiver);
    }

    pub fn receiver(&self) -> Option<Arc<dyn StreamReceiver>> {
        self.receiver.lock().unwrap().clone()
    }

    pub fn add_event_listener(&self, l: Arc<dyn StreamEventListener>) {
        self.listeners.lock().unwrap().push(l);
    }

    /// Removal is by stable identity of the listener allocation.
    pub fn remove_event_listener(&self, l: &Arc<dyn StreamEventListener>) {
        self.listeners.lock().unwrap().retain(|x| !Arc::ptr_eq(x, l));
    }

    /// Adjust the read-disable counter; returns the new value. Delivery is
    /// paused while the counter is positive.
    pub fn read_disable(&self, disable: bool) -> i32 {
        if disable {
            self.read_disable_count.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.read_disable_count.fetch_sub(1, Ordering::SeqCst) - 1
        }
    }

    #[inline]
    pub fn read_disabled(&self) -> bool {
        self.read_disable_count.load(Ordering::SeqCst) > 0
    }

    /// Latch the terminal event; true exactly once.
    pub fn mark_terminated(&self) -> bool {
        !self.terminated.swap(true, Ordering::SeqCst)
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Tear the stream down. Connection-scoped reasons are not delivered
    /// through per-stream listeners; the codec client reports those while
    /// draining its in-flight table.
    pub fn reset(&self, reason: StreamResetReason) {
        if !self.mark_terminated() {
            return;
        }
        if reason.is_connection_scoped() {
            return;
        }
        let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
        for l in listeners {
            l.on_reset_stream(reason);
        }
    }
}

/// Client side of a stream connection: initiates streams, reads responses.
pub trait ClientStreamConnection: Send + Sync + 'static {
    fn protocol(&self) -> ProtocolId;

    /// Allocate a fresh stream bound to `receiver` and return its encoder.
    fn new_stream(&self, receiver: Option<Arc<dyn StreamReceiver>>) -> Arc<dyn StreamSender>;

    /// Total streams ever created on this connection; the keep-alive idle
    /// counter watches this.
    fn streams_created(&self) -> u64;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Server side: accepts streams and hands each to the upstream callbacks to
/// obtain a receiver.
pub trait ServerStreamConnection: Send + Sync + 'static {
    fn protocol(&self) -> ProtocolId;
}

pub trait ServerStreamCallbacks: Send + Sync + 'static {
    fn new_stream_detect(&self, sender: Arc<dyn StreamSender>) -> Arc<dyn StreamReceiver>;
}

/// Codec-specific construction and detection behavior, registered once at
/// process init.
pub trait StreamConnFactory: Send + Sync + 'static {
    fn protocol(&self) -> ProtocolId;

    fn protocol_match(&self, prefix: &[u8]) -> MatchResult;

    fn create_client_stream(&self, conn: Connection) -> Arc<dyn ClientStreamConnection>;

    fn create_server_stream(
        &self, conn: Connection, callbacks: Arc<dyn ServerStreamCallbacks>,
    ) -> Arc<dyn ServerStreamConnection>;
}

fn factories() -> &'static Vec<Arc<dyn StreamConnFactory>> {
    static REGISTRY: OnceLock<Vec<Arc<dyn StreamConnFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        vec![Arc::new(rpc::RpcStreamFactory), Arc::new(http1::Http1StreamFactory)]
    })
}

fn factory(protocol: ProtocolId) -> Option<Arc<dyn StreamConnFactory>> {
    factories().iter().find(|f| f.protocol() == protocol).cloned()
}

pub fn new_client_stream_connection(
    protocol: ProtocolId, conn: Connection,
) -> Option<Arc<dyn ClientStreamConnection>> {
    factory(protocol).map(|f| f.create_client_stream(conn))
}

pub fn new_server_stream_connection(
    protocol: ProtocolId, conn: Connection, callbacks: Arc<dyn ServerStreamCallbacks>,
) -> Option<Arc<dyn ServerStreamConnection>> {
    factory(protocol).map(|f| f.create_server_stream(conn, callbacks))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectResult {
    Matched(ProtocolId),
    NeedMoreData,
    Failed,
}

/// Probe the first bytes of a connection against every registered protocol.
pub fn select_protocol(prefix: &[u8]) -> SelectResult {
    let mut need_more = false;
    for f in factories().iter() {
        match f.protocol_match(prefix) {
            MatchResult::Matched => return SelectResult::Matched(f.protocol()),
            MatchResult::NeedMoreData => need_more = true,
            MatchResult::Failed => {}
        }
    }
    if need_more {
        SelectResult::NeedMoreData
    } else {
        SelectResult::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;

    struct Recorder(Mutex<Vec<StreamResetReason>>);

    impl StreamEventListener for Recorder {
        fn on_reset_stream(&self, reason: StreamResetReason) {
            self.0.lock().unwrap().push(reason);
        }
    }

    #[test]
    fn test_select_protocol() {
        assert_eq!(
            select_protocol(&[protocol::rpc::PROTOCOL_CODE]),
            SelectResult::Matched(ProtocolId::MeshRpc)
        );
        assert_eq!(select_protocol(b"GET "), SelectResult::Matched(ProtocolId::Http1));
        assert_eq!(select_protocol(b"GE"), SelectResult::NeedMoreData);
        assert_eq!(select_protocol(b"XYZZY!!"), SelectResult::Failed);
    }

    #[test]
    fn test_listener_identity_removal() {
        let core = StreamCore::new(1, None);
        let a = Arc::new(Recorder(Mutex::new(Vec::new())));
        let b = Arc::new(Recorder(Mutex::new(Vec::new())));
        let a_dyn: Arc<dyn StreamEventListener> = a.clone();
        core.add_event_listener(a.clone());
        core.add_event_listener(b.clone());
        core.remove_event_listener(&a_dyn);
        core.reset(StreamResetReason::StreamLocalReset);
        // a was removed before the reset, only b observed it
        assert!(a.0.lock().unwrap().is_empty());
        assert_eq!(b.0.lock().unwrap().as_slice(), &[StreamResetReason::StreamLocalReset]);
    }

    #[test]
    fn test_single_terminal_event() {
        let core = StreamCore::new(2, None);
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        core.add_event_listener(rec.clone());
        core.reset(StreamResetReason::StreamRemoteReset);
        core.reset(StreamResetReason::StreamLocalReset);
        assert_eq!(rec.0.lock().unwrap().as_slice(), &[StreamResetReason::StreamRemoteReset]);
    }

    #[test]
    fn test_connection_scoped_reset_skips_listeners() {
        let core = StreamCore::new(3, None);
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        core.add_event_listener(rec.clone());
        core.reset(StreamResetReason::StreamConnectionTermination);
        assert!(rec.0.lock().unwrap().is_empty());
        assert!(core.is_terminated());
    }

    #[test]
    fn test_read_disable_counter() {
        let core = StreamCore::new(4, None);
        assert!(!core.read_disabled());
        assert_eq!(core.read_disable(true), 1);
        assert_eq!(core.read_disable(true), 2);
        assert!(core.read_disabled());
        assert_eq!(core.read_disable(false), 1);
        assert_eq!(core.read_disable(false), 0);
        assert!(!core.read_disabled());
    }
}
