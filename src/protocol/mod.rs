//! Protocol-level types shared by the codecs: the ordered header map,
//! reserved internal header names, stream-id generation, and the protocol
//! detection contract.

pub mod http1;
pub mod rpc;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reserved prefix for internal routing metadata carried inside header
/// maps. These names never appear on the wire of an egress HTTP message.
pub const INTERNAL_HEADER_PREFIX: &str = "x-mesh-";

pub const HEADER_METHOD: &str = "x-mesh-method";
pub const HEADER_PATH: &str = "x-mesh-path";
pub const HEADER_QUERY_STRING: &str = "x-mesh-querystring";
pub const HEADER_HOST: &str = "x-mesh-host";
pub const HEADER_STATUS: &str = "x-mesh-status";
/// The 32-bit request id of a decoded RPC frame, surfaced so the dispatcher
/// can correlate responses to streams.
pub const HEADER_RPC_REQUEST_ID: &str = "x-mesh-rpc-request-id";
/// Marks an RPC request as a heartbeat when encoding; stripped from the
/// wire header block.
pub const HEADER_RPC_HEARTBEAT: &str = "x-mesh-rpc-heartbeat";
/// Per-request timeout in milliseconds for the RPC framing (-1 = none).
pub const HEADER_RPC_TIMEOUT_MS: &str = "x-mesh-rpc-timeout-ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    MeshRpc,
    Http1,
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MeshRpc => write!(f, "mesh-rpc"),
            Self::Http1 => write!(f, "http1"),
        }
    }
}

/// Result of probing a connection's first bytes against one protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchResult {
    Matched,
    NeedMoreData,
    Failed,
}

static STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonically increasing stream id.
#[inline]
pub fn generate_stream_id() -> u64 {
    STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// An ordered mapping from header name to value.
///
/// Duplicates are permitted and insertion order is preserved for wire
/// emission. `get` returns the first match; `set` replaces the first match
/// and removes later duplicates.
#[derive(Default, Clone, PartialEq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: &str) {
        let mut found = false;
        self.entries.retain_mut(|(k, v)| {
            if k.eq_ignore_ascii_case(name) {
                if found {
                    return false;
                }
                found = true;
                *v = value.to_string();
            }
            true
        });
        if !found {
            self.entries.push((name.to_string(), value.to_string()));
        }
    }

    /// Append without replacing earlier entries of the same name.
    pub fn add(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    pub fn del(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Remove and return the first value of `name`.
    pub fn take(&mut self, name: &str) -> Option<String> {
        let v = self.get(name).map(|v| v.to_string());
        if v.is_some() {
            self.del(name);
        }
        v
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every internal routing entry; called on HTTP egress.
    pub fn strip_internal(&mut self) {
        self.entries.retain(|(k, _)| !k.to_ascii_lowercase().starts_with(INTERNAL_HEADER_PREFIX));
    }
}

impl fmt::Debug for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.entries.iter().map(|(k, v)| (k, v))).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_order_and_duplicates() {
        let mut h = HeaderMap::new();
        h.add("a", "1");
        h.add("b", "2");
        h.add("a", "3");
        assert_eq!(h.get("a"), Some("1"));
        let keys: Vec<&str> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "a"]);
        h.set("a", "9");
        assert_eq!(h.len(), 2);
        assert_eq!(h.get("a"), Some("9"));
        h.del("a");
        assert_eq!(h.get("a"), None);
    }

    #[test]
    fn test_header_map_case_insensitive() {
        let mut h = HeaderMap::new();
        h.set("Content-Length", "10");
        assert_eq!(h.get("content-length"), Some("10"));
    }

    #[test]
    fn test_strip_internal() {
        let mut h = HeaderMap::new();
        h.set(HEADER_METHOD, "GET");
        h.set("user-agent", "mesh");
        h.strip_internal();
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("user-agent"), Some("mesh"));
    }

    #[test]
    fn test_stream_id_monotonic() {
        let a = generate_stream_id();
        let b = generate_stream_id();
        assert!(b > a);
    }
}
