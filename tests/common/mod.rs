//! In-process stand-in for the node's HTTP API.
//!
//! wiremock can't hold a response open, so subscription tests use this
//! raw TCP server that speaks just enough HTTP/1.1 to serve chunked
//! `pubsub/sub` streams, `pubsub/ls`, `id` and `shutdown`.

#![allow(dead_code)]

use ipfs_pubsub_bridge::{decode_topic, encode_topic};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Default)]
pub struct FakeNodeState {
    pub sub_requests: AtomicUsize,
    pub shutdown_requests: AtomicUsize,
    /// Status returned by `pubsub/sub`; 0 means 200.
    pub sub_status: AtomicU16,
    /// End each subscription stream after the queued lines are sent.
    pub close_streams: AtomicBool,
    /// Accept `pubsub/sub` requests but never send response headers.
    pub hang_subscriptions: AtomicBool,
    /// Write every line in two separate chunks.
    pub split_writes: AtomicBool,
    /// Lines sent on every new subscription stream.
    pub lines: Mutex<Vec<String>>,
    /// Topic names reported by `pubsub/ls`.
    pub listed_topics: Mutex<Vec<String>>,
    /// Decoded topic of every `pubsub/sub` request, in order.
    pub subscribed: Mutex<Vec<String>>,
}

pub struct FakeNode {
    addr: SocketAddr,
    pub state: Arc<FakeNodeState>,
    task: JoinHandle<()>,
}

impl FakeNode {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(FakeNodeState::default());
        let shared = state.clone();

        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                connections.spawn(handle_connection(stream, shared.clone()));
            }
        });

        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_sub_status(&self, status: u16) {
        self.state.sub_status.store(status, Ordering::SeqCst);
    }

    pub fn set_hang_subscriptions(&self, hang: bool) {
        self.state.hang_subscriptions.store(hang, Ordering::SeqCst);
    }

    pub fn set_lines(&self, lines: &[&str]) {
        *self.state.lines.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn set_listed_topics(&self, topics: &[&str]) {
        *self.state.listed_topics.lock().unwrap() = topics.iter().map(|t| t.to_string()).collect();
    }

    pub fn sub_requests(&self) -> usize {
        self.state.sub_requests.load(Ordering::SeqCst)
    }

    pub fn shutdown_requests(&self) -> usize {
        self.state.shutdown_requests.load(Ordering::SeqCst)
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.state.subscribed.lock().unwrap().clone()
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<FakeNodeState>) {
    let Some(target) = read_request(&mut stream).await else {
        return;
    };
    let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));

    match path {
        "/api/v0/id" => write_json(&mut stream, r#"{"ID":"12D3KooWFakeNode"}"#).await,
        "/api/v0/pubsub/ls" => {
            let strings: Vec<String> = state
                .listed_topics
                .lock()
                .unwrap()
                .iter()
                .map(|t| encode_topic(t))
                .collect();
            let body = serde_json::json!({ "Strings": strings }).to_string();
            write_json(&mut stream, &body).await;
        }
        "/api/v0/shutdown" => {
            state.shutdown_requests.fetch_add(1, Ordering::SeqCst);
            write_json(&mut stream, "").await;
        }
        "/api/v0/pubsub/sub" => serve_subscription(&mut stream, query, &state).await,
        _ => {
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        }
    }
}

async fn serve_subscription(stream: &mut TcpStream, query: &str, state: &FakeNodeState) {
    let topic = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("arg="))
        .map(decode_topic)
        .unwrap_or_default();
    state.subscribed.lock().unwrap().push(topic);
    state.sub_requests.fetch_add(1, Ordering::SeqCst);

    if state.hang_subscriptions.load(Ordering::SeqCst) {
        hold_until_closed(stream).await;
        return;
    }

    let status = state.sub_status.load(Ordering::SeqCst);
    if status != 0 && status != 200 {
        let head = format!(
            "HTTP/1.1 {} Error\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}",
            status
        );
        let _ = stream.write_all(head.as_bytes()).await;
        return;
    }

    let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
    if stream.write_all(head.as_bytes()).await.is_err() {
        return;
    }

    let lines = state.lines.lock().unwrap().clone();
    let split = state.split_writes.load(Ordering::SeqCst);
    for line in lines {
        let payload = format!("{}\n", line);
        let pieces: Vec<&[u8]> = if split && payload.len() > 1 {
            let (a, b) = payload.as_bytes().split_at(payload.len() / 2);
            vec![a, b]
        } else {
            vec![payload.as_bytes()]
        };
        for piece in pieces {
            if write_chunk(stream, piece).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    if state.close_streams.load(Ordering::SeqCst) {
        let _ = stream.write_all(b"0\r\n\r\n").await;
        return;
    }

    hold_until_closed(stream).await;
}

async fn hold_until_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn write_chunk(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    stream.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
    stream.write_all(data).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

async fn write_json(stream: &mut TcpStream, body: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

/// Read the request head and discard any body. Returns the request target.
async fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut remaining = content_length.saturating_sub(buf.len() - head_end);
    while remaining > 0 {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        remaining = remaining.saturating_sub(n);
    }

    head.lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .map(String::from)
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
