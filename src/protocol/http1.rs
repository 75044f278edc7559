//! HTTP/1 wire handling: request/response holders recycled through free
//! pools, blocking parse from the connection pipe, and emission with the
//! internal routing metadata stripped.

use crate::buffer::{IoBuffer, PipeReader};
use crate::protocol::{HeaderMap, MatchResult};
use bytes::{Buf, BytesMut};
use std::sync::Mutex;

pub const HK_CONNECTION: &str = "Connection";
pub const HV_KEEP_ALIVE: &str = "keep-alive";
pub const HV_CLOSE: &str = "close";

const MIN_METHOD_LEN: usize = 3; // GET
const MAX_METHOD_LEN: usize = 7; // OPTIONS, CONNECT

const HTTP_METHODS: [&str; 8] =
    ["OPTIONS", "GET", "HEAD", "POST", "PUT", "DELETE", "TRACE", "CONNECT"];

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4 * 1024;
const POOL_LIMIT: usize = 64;

/// Inspect the leading token of a connection against the method set.
/// Need-more until 3 bytes arrived; fail only once enough bytes (>= 7)
/// have ruled out every method.
pub fn protocol_match(prefix: &[u8]) -> MatchResult {
    if prefix.len() < MIN_METHOD_LEN {
        return MatchResult::NeedMoreData;
    }
    let size = std::cmp::min(prefix.len(), MAX_METHOD_LEN);
    for i in MIN_METHOD_LEN..=size {
        if let Ok(token) = std::str::from_utf8(&prefix[..i]) {
            if HTTP_METHODS.contains(&token) {
                return MatchResult::Matched;
            }
        }
    }
    if size < MAX_METHOD_LEN {
        MatchResult::NeedMoreData
    } else {
        MatchResult::Failed
    }
}

#[derive(Debug, PartialEq)]
pub enum H1Error {
    /// The pipe closed mid-message or between messages.
    Closed,
    Parse,
}

#[derive(Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub host: String,
    pub version_11: bool,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub connection_close: bool,
}

impl HttpRequest {
    fn reset(&mut self) {
        self.method.clear();
        self.path.clear();
        self.query.clear();
        self.host.clear();
        self.version_11 = false;
        self.headers = HeaderMap::new();
        self.body.clear();
        self.connection_close = false;
    }
}

#[derive(Default)]
pub struct HttpResponse {
    pub status: u16,
    pub version_11: bool,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub connection_close: bool,
}

impl HttpResponse {
    fn reset(&mut self) {
        self.status = 0;
        self.version_11 = false;
        self.headers = HeaderMap::new();
        self.body.clear();
        self.connection_close = false;
    }
}

static REQUEST_POOL: Mutex<Vec<Box<HttpRequest>>> = Mutex::new(Vec::new());
static RESPONSE_POOL: Mutex<Vec<Box<HttpResponse>>> = Mutex::new(Vec::new());

pub fn acquire_request() -> Box<HttpRequest> {
    REQUEST_POOL.lock().unwrap().pop().unwrap_or_default()
}

pub fn release_request(mut req: Box<HttpRequest>) {
    req.reset();
    let mut pool = REQUEST_POOL.lock().unwrap();
    if pool.len() < POOL_LIMIT {
        pool.push(req);
    }
}

pub fn acquire_response() -> Box<HttpResponse> {
    RESPONSE_POOL.lock().unwrap().pop().unwrap_or_default()
}

pub fn release_response(mut resp: Box<HttpResponse>) {
    resp.reset();
    let mut pool = RESPONSE_POOL.lock().unwrap();
    if pool.len() < POOL_LIMIT {
        pool.push(resp);
    }
}

async fn fill(reader: &mut PipeReader, acc: &mut BytesMut) -> Result<(), H1Error> {
    let mut chunk = [0u8; READ_CHUNK];
    match reader.read(&mut chunk).await {
        Ok(n) => {
            acc.extend_from_slice(&chunk[..n]);
            Ok(())
        }
        Err(_) => Err(H1Error::Closed),
    }
}

fn content_length(headers: &HeaderMap) -> Result<usize, H1Error> {
    match headers.get("content-length") {
        Some(v) => v.trim().parse::<usize>().map_err(|_| H1Error::Parse),
        None => Ok(0),
    }
}

async fn read_body(
    reader: &mut PipeReader, acc: &mut BytesMut, len: usize,
) -> Result<Vec<u8>, H1Error> {
    while acc.len() < len {
        fill(reader, acc).await?;
    }
    let body = acc[..len].to_vec();
    acc.advance(len);
    Ok(body)
}

/// Blocking-parse one request from the pipe into `req`.
pub async fn read_request(
    reader: &mut PipeReader, acc: &mut BytesMut, req: &mut HttpRequest,
) -> Result<(), H1Error> {
    loop {
        let parsed = {
            let mut hdrs = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parser = httparse::Request::new(&mut hdrs);
            match parser.parse(acc) {
                Ok(httparse::Status::Complete(off)) => {
                    let uri = parser.path.ok_or(H1Error::Parse)?;
                    match uri.split_once('?') {
                        Some((p, q)) => {
                            req.path = p.to_string();
                            req.query = q.to_string();
                        }
                        None => {
                            req.path = uri.to_string();
                            req.query.clear();
                        }
                    }
                    req.method = parser.method.ok_or(H1Error::Parse)?.to_string();
                    req.version_11 = parser.version == Some(1);
                    req.headers = HeaderMap::new();
                    for h in parser.headers.iter() {
                        let v = std::str::from_utf8(h.value).map_err(|_| H1Error::Parse)?;
                        req.headers.add(h.name, v);
                    }
                    Some(off)
                }
                Ok(httparse::Status::Partial) => None,
                Err(_) => return Err(H1Error::Parse),
            }
        };
        match parsed {
            Some(off) => {
                acc.advance(off);
                req.host = req.headers.get("host").unwrap_or("").to_string();
                let len = content_length(&req.headers)?;
                req.body = read_body(reader, acc, len).await?;
                req.connection_close = close_requested(&req.headers, req.version_11);
                return Ok(());
            }
            None => fill(reader, acc).await?,
        }
    }
}

/// Blocking-parse one response from the pipe into `resp`.
pub async fn read_response(
    reader: &mut PipeReader, acc: &mut BytesMut, resp: &mut HttpResponse,
) -> Result<(), H1Error> {
    loop {
        let parsed = {
            let mut hdrs = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parser = httparse::Response::new(&mut hdrs);
            match parser.parse(acc) {
                Ok(httparse::Status::Complete(off)) => {
                    resp.status = parser.code.ok_or(H1Error::Parse)?;
                    resp.version_11 = parser.version == Some(1);
                    resp.headers = HeaderMap::new();
                    for h in parser.headers.iter() {
                        let v = std::str::from_utf8(h.value).map_err(|_| H1Error::Parse)?;
                        resp.headers.add(h.name, v);
                    }
                    Some(off)
                }
                Ok(httparse::Status::Partial) => None,
                Err(_) => return Err(H1Error::Parse),
            }
        };
        match parsed {
            Some(off) => {
                acc.advance(off);
                let len = content_length(&resp.headers)?;
                resp.body = read_body(reader, acc, len).await?;
                resp.connection_close = close_requested(&resp.headers, resp.version_11);
                return Ok(());
            }
            None => fill(reader, acc).await?,
        }
    }
}

fn close_requested(headers: &HeaderMap, version_11: bool) -> bool {
    match headers.get(HK_CONNECTION) {
        Some(v) => v.eq_ignore_ascii_case(HV_CLOSE),
        // pre-1.1 closes by default
        None => !version_11,
    }
}

/// Emit a request. Internal routing metadata must already be stripped from
/// `req.headers`.
pub fn encode_request(req: &HttpRequest) -> IoBuffer {
    let mut out = IoBuffer::with_capacity(256 + req.body.len());
    let mut uri = if req.path.is_empty() { "/".to_string() } else { req.path.clone() };
    if !req.query.is_empty() {
        uri.push('?');
        uri.push_str(&req.query);
    }
    out.write(format!("{} {} HTTP/1.1\r\n", req.method, uri).as_bytes());
    if req.headers.get("host").is_none() {
        out.write(format!("Host: {}\r\n", req.host).as_bytes());
    }
    write_headers(&mut out, &req.headers, req.body.len());
    out.write(&req.body);
    out
}

/// Emit a response.
pub fn encode_response(resp: &HttpResponse) -> IoBuffer {
    let mut out = IoBuffer::with_capacity(256 + resp.body.len());
    out.write(format!("HTTP/1.1 {} {}\r\n", resp.status, status_text(resp.status)).as_bytes());
    write_headers(&mut out, &resp.headers, resp.body.len());
    out.write(&resp.body);
    out
}

fn write_headers(out: &mut IoBuffer, headers: &HeaderMap, body_len: usize) {
    let mut has_len = false;
    for (k, v) in headers.iter() {
        if k.eq_ignore_ascii_case("content-length") {
            has_len = true;
            // rewrite to match the actual body
            out.write(format!("Content-Length: {}\r\n", body_len).as_bytes());
            continue;
        }
        out.write(format!("{}: {}\r\n", k, v).as_bytes());
    }
    if !has_len && body_len > 0 {
        out.write(format!("Content-Length: {}\r\n", body_len).as_bytes());
    }
    out.write(b"\r\n");
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
