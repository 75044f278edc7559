//! # mesh-stream
//!
//! The stream core of a sidecar network proxy: terminates client
//! connections, decodes framed protocol messages into logical streams,
//! multiplexes those streams onto upstream connections drawn from per-host
//! pools, and keeps those connections healthy with application-level
//! heartbeats.
//!
//! ## Components
//!
//! - [`buffer`]: drainable byte buffers and the rendezvous pipe that adapts
//!   push-style transport reads into a pull-style reader for the parsers.
//! - [`protocol`]: per-protocol frame codecs (a binary RPC framing and
//!   HTTP/1) and protocol detection by magic prefix.
//! - [`stream`]: stream connections binding one transport connection to a
//!   codec, in client and server variants.
//! - [`pool`]: per-host upstream connection pools with admission control.
//! - [`keepalive`]: the heartbeat controller driving probes on an upstream
//!   codec.
//! - [`metrics`]: counters, gauges and histograms keyed by cluster and host,
//!   plus the graceful handoff of accumulated values over a local socket.
//!
//! Configuration loading, service discovery, TLS, routing and the top-level
//! proxy pipeline are collaborators; they appear here only as the interfaces
//! the core consumes.

#[macro_use]
extern crate captains_log;

pub mod buffer;
pub mod cluster;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod metrics;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod stream;
pub mod util;

pub use config::{KeepAliveConfig, ProxyConfig, TimeoutSetting};
pub use error::{PoolFailureReason, ProxyError, StreamResetReason};
