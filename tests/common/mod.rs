#![allow(dead_code)]

use captains_log::*;
use mesh_stream::protocol::rpc;
use rstest::*;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

pub struct TestRunner {
    rt: Runtime,
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/mesh_stream_test.log", Level::Trace)
            .test()
            .build()
            .expect("log");
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(8)
                .enable_all()
                .build()
                .unwrap(),
        }
    }

    pub fn block_on<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}

impl std::fmt::Debug for TestRunner {
    fn fmt(&self, _f: &mut std::fmt::Formatter) -> std::fmt::Result {
        Ok(())
    }
}

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

/// A TCP server speaking the binary RPC framing, answering every request
/// after an adjustable delay.
pub struct MockRpcServer {
    pub addr: String,
    delay_ms: Arc<AtomicU64>,
}

impl MockRpcServer {
    pub async fn start(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().unwrap().to_string();
        let delay_ms = Arc::new(AtomicU64::new(delay.as_millis() as u64));
        let _delay = delay_ms.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(c) => c,
                    Err(_) => return,
                };
                let delay = _delay.clone();
                tokio::spawn(async move {
                    serve_rpc_conn(stream, delay).await;
                });
            }
        });
        Self { addr, delay_ms }
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

async fn serve_rpc_conn(stream: tokio::net::TcpStream, delay_ms: Arc<AtomicU64>) {
    let (mut rd, wr) = stream.into_split();
    let wr = Arc::new(tokio::sync::Mutex::new(wr));
    loop {
        let mut head = [0u8; rpc::RPC_HEAD_LEN];
        if rd.read_exact(&mut head).await.is_err() {
            return;
        }
        let cmd_code = u16::from_be_bytes([head[2], head[3]]);
        let request_id = u32::from_be_bytes([head[5], head[6], head[7], head[8]]);
        let header_len = u16::from_be_bytes([head[14], head[15]]) as usize;
        let content_len = u32::from_be_bytes([head[16], head[17], head[18], head[19]]) as usize;
        let mut rest = vec![0u8; header_len + content_len];
        if rd.read_exact(&mut rest).await.is_err() {
            return;
        }
        let delay = delay_ms.load(Ordering::SeqCst);
        let wr = wr.clone();
        tokio::spawn(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let reply = if cmd_code == rpc::CMD_CODE_HEARTBEAT {
                rpc::encode_heartbeat_ack(request_id)
            } else {
                let mut headers = mesh_stream::protocol::HeaderMap::new();
                headers.set("mock", "1");
                rpc::encode_response(request_id, &headers, b"").expect("encode")
            };
            let _ = wr.lock().await.write_all(reply.bytes()).await;
        });
    }
}

/// A minimal HTTP/1 echo server: replies 200 with the request body, or
/// "pong" for bodyless requests.
pub struct MockHttpServer {
    pub addr: String,
}

impl MockHttpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(c) => c,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    serve_http_conn(stream).await;
                });
            }
        });
        Self { addr }
    }
}

async fn serve_http_conn(mut stream: tokio::net::TcpStream) {
    let mut acc: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        // accumulate one full request head
        let head_end = loop {
            if let Some(pos) = find_subslice(&acc, b"\r\n\r\n") {
                break pos + 4;
            }
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => acc.extend_from_slice(&chunk[..n]),
            }
        };
        let head = String::from_utf8_lossy(&acc[..head_end]).to_string();
        let content_len = head
            .lines()
            .find_map(|l| {
                let (k, v) = l.split_once(':')?;
                k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        while acc.len() < head_end + content_len {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => acc.extend_from_slice(&chunk[..n]),
            }
        }
        let body: Vec<u8> = if content_len > 0 {
            acc[head_end..head_end + content_len].to_vec()
        } else {
            b"pong".to_vec()
        };
        acc.drain(..head_end + content_len);
        let resp = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        if stream.write_all(resp.as_bytes()).await.is_err() {
            return;
        }
        if stream.write_all(&body).await.is_err() {
            return;
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
