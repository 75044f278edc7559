mod common;

use captains_log::logfn;
use common::*;
use mesh_stream::buffer::IoBuffer;
use mesh_stream::net::Connection;
use mesh_stream::protocol::{
    HeaderMap, HEADER_METHOD, HEADER_PATH, HEADER_RPC_REQUEST_ID, HEADER_STATUS,
};
use mesh_stream::stream::http1::Http1ClientStreamConnection;
use mesh_stream::stream::rpc::RpcClientStreamConnection;
use mesh_stream::stream::{
    new_server_stream_connection, ClientStreamConnection, ServerStreamCallbacks, StreamReceiver,
    StreamSender,
};
use mesh_stream::protocol::ProtocolId;
use rstest::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Replies 200 to every stream, echoing the request path in a header and
/// the request body (or "pong") as the response body.
struct EchoCallbacks;

impl ServerStreamCallbacks for EchoCallbacks {
    fn new_stream_detect(&self, sender: Arc<dyn StreamSender>) -> Arc<dyn StreamReceiver> {
        Arc::new(EchoReceiver { sender, req_headers: Mutex::new(None) })
    }
}

struct EchoReceiver {
    sender: Arc<dyn StreamSender>,
    req_headers: Mutex<Option<HeaderMap>>,
}

impl EchoReceiver {
    fn reply(&self, body: Option<IoBuffer>) {
        let req = self.req_headers.lock().unwrap().take().unwrap_or_default();
        let mut headers = HeaderMap::new();
        headers.set(HEADER_STATUS, "200");
        if let Some(path) = req.get(HEADER_PATH) {
            headers.set("echo-path", path);
        }
        if let Some(service) = req.get("service") {
            headers.set("service", service);
        }
        let body = match body {
            Some(b) => b,
            None => IoBuffer::from(&b"pong"[..]),
        };
        self.sender.append_headers(headers, false).expect("resp headers");
        self.sender.append_data(body, true).expect("resp body");
    }
}

impl StreamReceiver for EchoReceiver {
    fn on_receive_headers(&self, headers: HeaderMap, end_stream: bool) {
        self.req_headers.lock().unwrap().replace(headers);
        if end_stream {
            self.reply(None);
        }
    }

    fn on_receive_data(&self, data: IoBuffer, end_stream: bool) {
        if end_stream {
            self.reply(Some(data));
        }
    }
}

async fn start_stream_server(protocol: ProtocolId) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(c) => c,
                Err(_) => return,
            };
            let conn = Connection::from_accepted(stream);
            let _sc = new_server_stream_connection(protocol, conn, Arc::new(EchoCallbacks))
                .expect("server stream");
        }
    });
    addr
}

struct CaptureReceiver {
    headers: Mutex<Option<HeaderMap>>,
    body: Mutex<Vec<u8>>,
    done_tx: crossfire::MTx<()>,
}

impl CaptureReceiver {
    fn new() -> (Arc<Self>, crossfire::AsyncRx<()>) {
        let (tx, rx) = crossfire::mpsc::unbounded_async::<()>();
        (
            Arc::new(Self {
                headers: Mutex::new(None),
                body: Mutex::new(Vec::new()),
                done_tx: tx,
            }),
            rx,
        )
    }
}

impl StreamReceiver for CaptureReceiver {
    fn on_receive_headers(&self, headers: HeaderMap, end_stream: bool) {
        self.headers.lock().unwrap().replace(headers);
        if end_stream {
            let _ = self.done_tx.send(());
        }
    }

    fn on_receive_data(&self, data: IoBuffer, end_stream: bool) {
        self.body.lock().unwrap().extend_from_slice(data.bytes());
        if end_stream {
            let _ = self.done_tx.send(());
        }
    }
}

#[logfn]
#[rstest]
fn test_http1_stream_end_to_end(runner: TestRunner) {
    runner.block_on(async {
        let addr = start_stream_server(ProtocolId::Http1).await;
        let conn = Connection::new(&addr);
        let client = Http1ClientStreamConnection::new(conn.clone());
        conn.connect(Duration::from_secs(1)).await.expect("connect");

        // sequential requests reuse the same connection
        for i in 0..3 {
            let (receiver, done_rx) = CaptureReceiver::new();
            let sender = client.new_stream(Some(receiver.clone()));
            let mut headers = HeaderMap::new();
            headers.set(HEADER_METHOD, "POST");
            headers.set(HEADER_PATH, "/echo");
            sender.append_headers(headers, false).expect("headers");
            let body = format!("round-{}", i);
            sender.append_data(IoBuffer::from(body.as_bytes()), true).expect("body");

            tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
                .await
                .expect("response in time")
                .expect("response");
            let resp_headers = receiver.headers.lock().unwrap().take().expect("headers");
            assert_eq!(resp_headers.get(HEADER_STATUS), Some("200"));
            assert_eq!(resp_headers.get("echo-path"), Some("/echo"));
            assert_eq!(receiver.body.lock().unwrap().as_slice(), body.as_bytes());
            receiver.body.lock().unwrap().clear();
        }
        assert_eq!(client.streams_created(), 3);
    });
}

#[logfn]
#[rstest]
fn test_rpc_stream_end_to_end(runner: TestRunner) {
    runner.block_on(async {
        let addr = start_stream_server(ProtocolId::MeshRpc).await;
        let conn = Connection::new(&addr);
        let client = RpcClientStreamConnection::new(conn.clone());
        conn.connect(Duration::from_secs(1)).await.expect("connect");

        let (receiver, done_rx) = CaptureReceiver::new();
        let sender = client.new_rpc_stream(Some(receiver.clone()));
        let request_id = sender.request_id();
        let mut headers = HeaderMap::new();
        headers.set("service", "testSofa");
        sender.append_headers(headers, false).expect("headers");
        sender.append_data(IoBuffer::from(&b"payload"[..]), true).expect("body");

        tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .expect("response in time")
            .expect("response");
        let resp_headers = receiver.headers.lock().unwrap().take().expect("headers");
        // the response echoes the request id as a reserved header
        assert_eq!(
            resp_headers.get(HEADER_RPC_REQUEST_ID),
            Some(request_id.to_string().as_str())
        );
        assert_eq!(resp_headers.get("service"), Some("testSofa"));
        assert_eq!(receiver.body.lock().unwrap().as_slice(), b"payload");
    });
}

/// The server-side connection-header rules: explicit close is honored and
/// closes the transport; pre-1.1 requests get an explicit keep-alive.
#[logfn]
#[rstest]
fn test_http1_server_connection_header_rules(runner: TestRunner) {
    runner.block_on(async {
        let addr = start_stream_server(ProtocolId::Http1).await;

        // HTTP/1.0 without close: response carries Connection: keep-alive
        let mut s = tokio::net::TcpStream::connect(&addr).await.expect("connect");
        s.write_all(b"GET /a HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await.unwrap();
        let resp = read_response_head(&mut s).await;
        assert!(resp.contains("Connection: keep-alive"), "resp: {}", resp);

        // explicit close: response echoes it and the server closes
        let mut s = tokio::net::TcpStream::connect(&addr).await.expect("connect");
        s.write_all(b"GET /b HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let resp = read_response_head(&mut s).await;
        assert!(resp.contains("Connection: close"), "resp: {}", resp);
        // the peer shuts the connection down after writing
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), s.read_to_end(&mut rest))
            .await
            .expect("server should close the connection");
    });
}

async fn read_response_head(s: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(2), s.read(&mut chunk))
            .await
            .expect("read in time")
            .expect("read");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}
