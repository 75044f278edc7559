//! Application-level keep-alive for an upstream RPC codec: periodic probe
//! streams with per-probe timers, a consecutive-failure threshold that
//! closes the connection, and an idle counter that frees connections
//! carrying nothing but heartbeats.

use crate::config::KeepAliveConfig;
use crate::buffer::IoBuffer;
use crate::protocol::{rpc, HeaderMap, HEADER_RPC_REQUEST_ID};
use crate::stream::rpc::RpcClientStreamConnection;
use crate::stream::{ClientStreamConnection, StreamReceiver, StreamSender};
use crate::util::Cancellable;
use crossfire::{mpmc, mpsc, MAsyncRx, MTx};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeepAliveStatus {
    Success,
    Timeout,
}

pub type KeepAliveCallback = Box<dyn Fn(KeepAliveStatus) + Send + Sync>;

/// The keep-alive controller attached to one upstream RPC codec after
/// connect. States: idle, probing, stopped. Once stopped no further probe
/// is sent; a single successful probe resets the failure counter to zero.
pub struct RpcKeepAlive {
    inner: Arc<KeepAliveInner>,
}

struct KeepAliveInner {
    codec: Arc<RpcClientStreamConnection>,
    timeout: Duration,
    fail_threshold: u32,
    timeout_count: AtomicU32,
    /// request id -> timer cancellation; removal decides the
    /// response-vs-timer race, the loser does nothing
    pending: Mutex<FxHashMap<u32, MTx<()>>>,
    callbacks: Mutex<Vec<KeepAliveCallback>>,
    stopped: AtomicBool,
    stop_tx: Mutex<Option<MTx<()>>>,
    stop_rx: MAsyncRx<()>,
    idle_enabled: AtomicBool,
    max_idle_count: u32,
    idle_count: AtomicU32,
    last_stream_count: AtomicU64,
}

impl RpcKeepAlive {
    pub fn new(codec: Arc<RpcClientStreamConnection>, config: &KeepAliveConfig) -> Self {
        let (stop_tx, stop_rx) = mpmc::unbounded_async::<()>();
        Self {
            inner: Arc::new(KeepAliveInner {
                last_stream_count: AtomicU64::new(codec.streams_created()),
                codec,
                timeout: config.timeout,
                fail_threshold: config.fail_threshold,
                timeout_count: AtomicU32::new(0),
                pending: Mutex::new(FxHashMap::default()),
                callbacks: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                stop_tx: Mutex::new(Some(stop_tx)),
                stop_rx,
                idle_enabled: AtomicBool::new(false),
                max_idle_count: config.max_idle_count,
                idle_count: AtomicU32::new(0),
            }),
        }
    }

    pub fn add_callback(&self, cb: impl Fn(KeepAliveStatus) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().push(Box::new(cb));
    }

    /// Enable idle accounting: probes sent while no application stream was
    /// created count toward `max_idle_count`; reaching it closes the codec.
    pub fn start_idle_timeout(&self) {
        self.inner.last_stream_count.store(self.inner.codec.streams_created(), Ordering::Release);
        self.inner.idle_enabled.store(true, Ordering::Release);
    }

    /// Send one heartbeat probe. Safe to call concurrently; a no-op once
    /// the controller is stopped.
    pub fn send_keep_alive(&self) {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Acquire) {
            return;
        }
        if inner.idle_enabled.load(Ordering::Acquire) && inner.max_idle_count > 0 {
            let cur = inner.codec.streams_created();
            if cur == inner.last_stream_count.load(Ordering::Acquire) {
                let idle = inner.idle_count.fetch_add(1, Ordering::AcqRel) + 1;
                if idle >= inner.max_idle_count {
                    info!("keepalive: connection idle for {} probes, free it", idle);
                    inner.stop_and_close();
                    return;
                }
            } else {
                inner.idle_count.store(0, Ordering::Release);
            }
        }

        let receiver: Arc<dyn StreamReceiver> = inner.clone();
        let sender = inner.codec.new_rpc_stream(Some(receiver));
        let id = sender.request_id();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_async::<()>();
        inner.pending.lock().unwrap().insert(id, cancel_tx);
        inner.last_stream_count.store(inner.codec.streams_created(), Ordering::Release);

        let timer_inner = inner.clone();
        let timeout = inner.timeout;
        tokio::spawn(async move {
            match Cancellable::new(cancel_rx.recv(), tokio::time::sleep(timeout)).await {
                Ok(_) => {} // answered first, or the controller went away
                Err(_) => timer_inner.handle_timeout(id),
            }
        });

        if sender.append_headers(rpc::heartbeat_headers(), true).is_err() {
            // lost write; the probe timer records the miss
            debug!("keepalive: heartbeat write failed, request_id={}", id);
        }
    }

    #[inline]
    pub fn timeout_count(&self) -> u32 {
        self.inner.timeout_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Resolves once the controller transitions to stopped.
    pub async fn wait_stopped(&self) {
        // nothing is ever sent; recv returns Err when the stop sender drops
        let _ = self.inner.stop_rx.recv().await;
    }
}

impl KeepAliveInner {
    fn handle_success(&self, id: u32) {
        let tx = self.pending.lock().unwrap().remove(&id);
        if let Some(tx) = tx {
            let _ = tx.send(());
            self.timeout_count.store(0, Ordering::Release);
            self.notify(KeepAliveStatus::Success);
        }
    }

    fn handle_timeout(&self, id: u32) {
        if self.pending.lock().unwrap().remove(&id).is_none() {
            return;
        }
        let count = self.timeout_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.notify(KeepAliveStatus::Timeout);
        if count >= self.fail_threshold {
            warn!("keepalive: {} consecutive heartbeat timeouts, close connection", count);
            self.stop_and_close();
        }
    }

    fn stop_and_close(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.codec.close();
        let _ = self.stop_tx.lock().unwrap().take();
    }

    fn notify(&self, status: KeepAliveStatus) {
        let callbacks = self.callbacks.lock().unwrap();
        for cb in callbacks.iter() {
            cb(status);
        }
    }
}

/// Probe responses are intercepted here and never reach an application
/// receiver.
impl StreamReceiver for KeepAliveInner {
    fn on_receive_headers(&self, headers: HeaderMap, _end_stream: bool) {
        if let Some(id) = headers.get(HEADER_RPC_REQUEST_ID).and_then(|v| v.parse::<u32>().ok()) {
            self.handle_success(id);
        }
    }

    fn on_receive_data(&self, _data: IoBuffer, _end_stream: bool) {}
}
