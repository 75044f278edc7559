//! The binary RPC framing.
//!
//! Fixed head, 20 bytes:
//!
//! | 1B    | 1B       | 2B       | 1B  | 4B         | 1B    | 4B      | 2B         | 4B          |
//! | proto | cmd_type | cmd_code | ver | request_id | codec | timeout | header_len | content_len |
//!
//! All multi-byte fields are big-endian. The head is followed by a
//! length-prefixed header block (`u32 key_len, key, u32 val_len, val` per
//! entry, insertion order preserved) and the content. Responses reuse the
//! same layout; status travels in the header map.

use crate::buffer::{IoBuffer, PipeReader};
use crate::error::ProxyError;
use crate::protocol::{
    HeaderMap, MatchResult, HEADER_RPC_HEARTBEAT, HEADER_RPC_REQUEST_ID, HEADER_RPC_TIMEOUT_MS,
};
use std::mem::size_of;
use zerocopy::byteorder::{I32, U16, U32, BE};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const PROTOCOL_CODE: u8 = 1;
pub const PROTOCOL_VERSION: u8 = 1;

pub const CMD_TYPE_RESPONSE: u8 = 0;
pub const CMD_TYPE_REQUEST: u8 = 1;
pub const CMD_TYPE_ONEWAY: u8 = 2;

pub const CMD_CODE_HEARTBEAT: u16 = 0;
pub const CMD_CODE_REQUEST: u16 = 1;
pub const CMD_CODE_RESPONSE: u16 = 2;

/// Serialization code of the length-prefixed header block.
pub const CODEC_SIMPLE: u8 = 1;

/// -1 means no per-request timeout.
pub const TIMEOUT_NONE: i32 = -1;

#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct RpcFrameHead {
    pub proto: u8,
    pub cmd_type: u8,
    pub cmd_code: U16<BE>,
    pub version: u8,
    pub request_id: U32<BE>,
    pub codec: u8,
    pub timeout: I32<BE>,
    pub header_len: U16<BE>,
    pub content_len: U32<BE>,
}

pub const RPC_HEAD_LEN: usize = size_of::<RpcFrameHead>();

/// One decoded frame, request or response.
pub struct RpcFrame {
    pub cmd_type: u8,
    pub cmd_code: u16,
    pub request_id: u32,
    pub timeout: i32,
    pub headers: HeaderMap,
    pub content: IoBuffer,
}

impl RpcFrame {
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.cmd_code == CMD_CODE_HEARTBEAT
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.cmd_type == CMD_TYPE_REQUEST || self.cmd_type == CMD_TYPE_ONEWAY
    }
}

#[derive(Debug, PartialEq)]
pub enum DecodeError {
    /// The pipe closed; the parser loop must exit.
    Closed,
    Invalid(&'static str),
}

/// The header map marking an encoded request as a heartbeat probe.
pub fn heartbeat_headers() -> HeaderMap {
    let mut h = HeaderMap::new();
    h.set(HEADER_RPC_HEARTBEAT, "1");
    h
}

fn encode_header_block(headers: &HeaderMap) -> Vec<u8> {
    let mut block = Vec::with_capacity(64);
    for (k, v) in headers.iter() {
        // correlation and framing hints never enter the wire block
        if k == HEADER_RPC_HEARTBEAT || k == HEADER_RPC_TIMEOUT_MS || k == HEADER_RPC_REQUEST_ID {
            continue;
        }
        block.extend_from_slice(&(k.len() as u32).to_be_bytes());
        block.extend_from_slice(k.as_bytes());
        block.extend_from_slice(&(v.len() as u32).to_be_bytes());
        block.extend_from_slice(v.as_bytes());
    }
    block
}

fn decode_header_block(mut block: &[u8]) -> Result<HeaderMap, DecodeError> {
    let mut headers = HeaderMap::new();
    while !block.is_empty() {
        let (k, rest) = take_kv(block)?;
        let (v, rest) = take_kv(rest)?;
        headers.add(k, v);
        block = rest;
    }
    Ok(headers)
}

fn take_kv(buf: &[u8]) -> Result<(&str, &[u8]), DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Invalid("short header block"));
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return Err(DecodeError::Invalid("short header entry"));
    }
    let s = std::str::from_utf8(&buf[4..4 + len])
        .map_err(|_| DecodeError::Invalid("header entry not utf-8"))?;
    Ok((s, &buf[4 + len..]))
}

fn encode_frame(
    cmd_type: u8, cmd_code: u16, request_id: u32, timeout: i32, headers: &HeaderMap,
    content: &[u8],
) -> Result<IoBuffer, ProxyError> {
    let block = encode_header_block(headers);
    if block.len() > u16::MAX as usize {
        return Err(ProxyError::Encode("header block exceeds u16 length"));
    }
    let head = RpcFrameHead {
        proto: PROTOCOL_CODE,
        cmd_type,
        cmd_code: U16::new(cmd_code),
        version: PROTOCOL_VERSION,
        request_id: U32::new(request_id),
        codec: CODEC_SIMPLE,
        timeout: I32::new(timeout),
        header_len: U16::new(block.len() as u16),
        content_len: U32::new(content.len() as u32),
    };
    let mut buf = IoBuffer::with_capacity(RPC_HEAD_LEN + block.len() + content.len());
    buf.write(head.as_bytes());
    buf.write(&block);
    buf.write(content);
    Ok(buf)
}

/// Encode a request frame. `x-mesh-rpc-heartbeat` in the headers selects the
/// heartbeat command code and `x-mesh-rpc-timeout-ms` the protocol timeout
/// field; both are consumed here and never appear on the wire.
pub fn encode_request(
    request_id: u32, headers: &HeaderMap, content: &[u8],
) -> Result<IoBuffer, ProxyError> {
    let cmd_code =
        if headers.get(HEADER_RPC_HEARTBEAT).is_some() { CMD_CODE_HEARTBEAT } else { CMD_CODE_REQUEST };
    let timeout = match headers.get(HEADER_RPC_TIMEOUT_MS) {
        Some(v) => v.parse::<i32>().map_err(|_| ProxyError::Encode("bad rpc timeout header"))?,
        None => TIMEOUT_NONE,
    };
    encode_frame(CMD_TYPE_REQUEST, cmd_code, request_id, timeout, headers, content)
}

/// Encode a response frame echoing `request_id`.
pub fn encode_response(
    request_id: u32, headers: &HeaderMap, content: &[u8],
) -> Result<IoBuffer, ProxyError> {
    let cmd_code =
        if headers.get(HEADER_RPC_HEARTBEAT).is_some() { CMD_CODE_HEARTBEAT } else { CMD_CODE_RESPONSE };
    encode_frame(CMD_TYPE_RESPONSE, cmd_code, request_id, 0, headers, content)
}

/// The ack a server emits for a heartbeat request, echoing its id.
pub fn encode_heartbeat_ack(request_id: u32) -> IoBuffer {
    // empty header block and content cannot overflow
    encode_frame(CMD_TYPE_RESPONSE, CMD_CODE_HEARTBEAT, request_id, 0, &HeaderMap::new(), &[])
        .unwrap()
}

/// Blocking-read one frame from the pipe.
pub async fn decode_frame(reader: &mut PipeReader) -> Result<RpcFrame, DecodeError> {
    let mut head_buf = [0u8; RPC_HEAD_LEN];
    if reader.read_exact(&mut head_buf).await.is_err() {
        return Err(DecodeError::Closed);
    }
    let head = match RpcFrameHead::ref_from(&head_buf[..]) {
        Some(h) => h,
        None => return Err(DecodeError::Invalid("short head")),
    };
    if head.proto != PROTOCOL_CODE {
        warn!("rpc decode: wrong protocol code {}", head.proto);
        return Err(DecodeError::Invalid("wrong protocol code"));
    }
    if head.version != PROTOCOL_VERSION {
        warn!("rpc decode: version {} not supported", head.version);
        return Err(DecodeError::Invalid("version not supported"));
    }
    let header_len = head.header_len.get() as usize;
    let content_len = head.content_len.get() as usize;
    let cmd_type = head.cmd_type;
    let cmd_code = head.cmd_code.get();
    let request_id = head.request_id.get();
    let timeout = head.timeout.get();

    let mut block = vec![0u8; header_len];
    if reader.read_exact(&mut block).await.is_err() {
        return Err(DecodeError::Closed);
    }
    let headers = decode_header_block(&block)?;
    let mut content = vec![0u8; content_len];
    if reader.read_exact(&mut content).await.is_err() {
        return Err(DecodeError::Closed);
    }
    Ok(RpcFrame {
        cmd_type,
        cmd_code,
        request_id,
        timeout,
        headers,
        content: IoBuffer::from(content),
    })
}

/// Examine the first bytes of a connection.
pub fn protocol_match(prefix: &[u8]) -> MatchResult {
    if prefix.is_empty() {
        return MatchResult::NeedMoreData;
    }
    if prefix[0] == PROTOCOL_CODE {
        MatchResult::Matched
    } else {
        MatchResult::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::conn_pipe;

    #[test]
    fn test_head_len() {
        assert_eq!(RPC_HEAD_LEN, 20);
    }

    #[test]
    fn test_protocol_match() {
        assert_eq!(protocol_match(b""), MatchResult::NeedMoreData);
        assert_eq!(protocol_match(&[PROTOCOL_CODE, 0, 0]), MatchResult::Matched);
        assert_eq!(protocol_match(b"GET "), MatchResult::Failed);
    }

    #[test]
    fn test_request_roundtrip() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut headers = HeaderMap::new();
            headers.set("service", "testSofa");
            let frame = encode_request(42, &headers, b"payload").expect("encode");
            let (mut tx, mut rx) = conn_pipe();
            tokio::spawn(async move {
                tx.dispatch(frame).await.expect("dispatch");
            });
            let decoded = decode_frame(&mut rx).await.expect("decode");
            assert_eq!(decoded.request_id, 42);
            assert_eq!(decoded.cmd_type, CMD_TYPE_REQUEST);
            assert_eq!(decoded.cmd_code, CMD_CODE_REQUEST);
            assert_eq!(decoded.timeout, TIMEOUT_NONE);
            assert_eq!(decoded.headers, headers);
            assert_eq!(decoded.content.bytes(), b"payload");
        });
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let frame = encode_request(7, &heartbeat_headers(), &[]).expect("encode");
            let (mut tx, mut rx) = conn_pipe();
            tokio::spawn(async move {
                tx.dispatch(frame).await.expect("dispatch");
                tx.dispatch(encode_heartbeat_ack(7)).await.expect("dispatch");
            });
            let req = decode_frame(&mut rx).await.expect("decode");
            assert!(req.is_heartbeat());
            assert!(req.is_request());
            // the heartbeat marker never reaches the wire
            assert!(req.headers.is_empty());
            let ack = decode_frame(&mut rx).await.expect("decode");
            assert!(ack.is_heartbeat());
            assert!(!ack.is_request());
            assert_eq!(ack.request_id, 7);
        });
    }

    #[test]
    fn test_duplicate_headers_preserved() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut headers = HeaderMap::new();
            headers.add("set-cookie", "a=1");
            headers.add("set-cookie", "b=2");
            let frame = encode_request(1, &headers, &[]).expect("encode");
            let (mut tx, mut rx) = conn_pipe();
            tokio::spawn(async move {
                tx.dispatch(frame).await.expect("dispatch");
            });
            let decoded = decode_frame(&mut rx).await.expect("decode");
            let values: Vec<&str> =
                decoded.headers.iter().filter(|(k, _)| *k == "set-cookie").map(|(_, v)| v).collect();
            assert_eq!(values, vec!["a=1", "b=2"]);
        });
    }
}
