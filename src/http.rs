//! HTTP front door — OpenAI-shaped streaming completions plus stats.
//!
//! Endpoints:
//!   POST /v1/chat/completions  — SSE stream relayed from the matched provider
//!   GET  /api/stats            — one-shot stats snapshot (JSON)
//!   GET  /api/peers            — directory of peers that opted in
//!   GET  /ws                   — stats WebSocket (snapshot every 5 s)
//!
//! Requests that are not the WebSocket upgrade are parsed and answered by
//! hand on the accepted TCP stream.

use crate::dispatch::short_key;
use crate::ip_limit::{IpLimitStore, MAX_HTTP_REQUESTS, TIME_WINDOW_MINUTES};
use crate::peers::PeerStore;
use crate::protocol::{Frame, InferencePayload};
use crate::provider_sessions::ProviderSessionStore;
use crate::registry::{Registry, ResponderEvent};
use crate::ws;
use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Chunks buffered between the peer read loop and the HTTP writer.
const RESPONDER_QUEUE: usize = 64;

#[derive(Clone)]
pub struct HttpState {
    pub registry: Registry,
    pub peers: PeerStore,
    pub sessions: ProviderSessionStore,
    pub ip_limit: IpLimitStore,
    pub allowed_origins: Arc<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    session_request: SessionRequest,
    data: ChatData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest {
    model_name: String,
    #[serde(default)]
    #[allow(dead_code)]
    preferred_provider_id: Option<String>,
}

#[derive(Deserialize)]
struct ChatData {
    messages: serde_json::Value,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryEntry {
    key: String,
    name: Option<String>,
    model_name: String,
    website: Option<String>,
    online: bool,
    healthy: bool,
}

/// Bind and serve. Returns the bound address (port 0 picks a free one).
pub async fn start(port: u16, state: HttpState) -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!("HTTP API on http://localhost:{}", addr.port());
    tokio::spawn(async move {
        loop {
            let Ok((stream, addr)) = listener.accept().await else { continue };
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, &state).await {
                    tracing::debug!("HTTP connection error: {e}");
                }
            });
        }
    });
    Ok(addr)
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: std::net::SocketAddr,
    state: &HttpState,
) -> Result<()> {
    // The WebSocket path hands the un-consumed stream to the upgrade
    // handshake, so only peek here.
    let mut peek_buf = [0u8; 256];
    let n = stream.peek(&mut peek_buf).await?;
    let head = String::from_utf8_lossy(&peek_buf[..n]);
    if head.starts_with("GET /ws ") || head.starts_with("GET /ws?") {
        return ws::serve(stream, state.clone()).await;
    }

    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            respond_error(&mut stream, 400, &format!("Bad request: {e}")).await?;
            return Ok(());
        }
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/v1/chat/completions") => {
            chat_completions(stream, addr, request, state).await?;
        }
        ("OPTIONS", _) => {
            let origin = cors_origin(state, &request);
            let resp = format!(
                "HTTP/1.1 204 No Content\r\n\
                 Access-Control-Allow-Origin: {origin}\r\n\
                 Access-Control-Allow-Methods: GET, POST\r\n\
                 Access-Control-Allow-Headers: Content-Type\r\n\
                 Access-Control-Allow-Credentials: true\r\n\
                 Content-Length: 0\r\n\r\n"
            );
            stream.write_all(resp.as_bytes()).await?;
        }
        ("GET", "/api/stats") => match ws::stats_snapshot(state).await {
            Ok(snapshot) => respond_json(&mut stream, &snapshot).await?,
            Err(e) => respond_error(&mut stream, 500, &format!("Stats query failed: {e}")).await?,
        },
        ("GET", "/v1/models") => match state.peers.get_all().await {
            Ok(rows) => {
                let mut models: Vec<&str> = rows
                    .iter()
                    .filter(|row| row.peer.online)
                    .map(|row| row.peer.model_name.as_str())
                    .collect();
                models.sort();
                models.dedup();
                let data: Vec<serde_json::Value> = models
                    .iter()
                    .map(|model| {
                        json!({
                            "id": model,
                            "object": "model",
                            "owned_by": "symmetry",
                        })
                    })
                    .collect();
                respond_json(&mut stream, &json!({ "object": "list", "data": data })).await?;
            }
            Err(e) => respond_error(&mut stream, 500, &format!("Model query failed: {e}")).await?,
        },
        ("GET", "/api/peers") => match state.peers.get_all().await {
            Ok(rows) => {
                let directory: Vec<DirectoryEntry> = rows
                    .into_iter()
                    .filter(|row| row.peer.public)
                    .map(|row| DirectoryEntry {
                        key: row.peer.key,
                        name: row.peer.name,
                        model_name: row.peer.model_name,
                        website: row.peer.website,
                        online: row.peer.online,
                        healthy: row.peer.healthy,
                    })
                    .collect();
                respond_json(&mut stream, &json!(directory)).await?;
            }
            Err(e) => respond_error(&mut stream, 500, &format!("Peer query failed: {e}")).await?,
        },
        _ => {
            respond_error(&mut stream, 404, "Not found").await?;
        }
    }
    Ok(())
}

// ── chat completions relay ──

async fn chat_completions(
    mut stream: TcpStream,
    addr: std::net::SocketAddr,
    request: Request,
    state: &HttpState,
) -> Result<()> {
    let ip = client_ip(&request, &addr);

    let seen = state
        .ip_limit
        .get_in_window(&ip, TIME_WINDOW_MINUTES)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("Rate-limit lookup failed for {ip}: {e}");
            None
        })
        .map(|(count, _)| count)
        .unwrap_or(0);
    if seen >= MAX_HTTP_REQUESTS {
        respond_error(
            &mut stream,
            429,
            &format!("Rate limit exceeded: {MAX_HTTP_REQUESTS} requests per {TIME_WINDOW_MINUTES} minutes"),
        )
        .await?;
        return Ok(());
    }
    if let Err(e) = state.ip_limit.record(&ip).await {
        tracing::warn!("Rate-limit record failed for {ip}: {e}");
    }

    let origin = cors_origin(state, &request);
    let header = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/event-stream\r\n\
         Cache-Control: no-cache\r\n\
         Connection: keep-alive\r\n\
         Access-Control-Allow-Origin: {origin}\r\n\
         Access-Control-Allow-Credentials: true\r\n\r\n"
    );
    stream.write_all(header.as_bytes()).await?;

    let chat: ChatRequest = match serde_json::from_slice(&request.body) {
        Ok(chat) => chat,
        Err(e) => {
            write_sse_error(&mut stream, &format!("Invalid request body: {e}")).await?;
            return Ok(());
        }
    };

    let provider = match state.peers.get_random(&chat.session_request.model_name).await {
        Ok(Some(provider)) => provider,
        Ok(None) => {
            write_sse_error(&mut stream, "No peers available").await?;
            return Ok(());
        }
        Err(e) => {
            write_sse_error(&mut stream, &format!("Provider lookup failed: {e}")).await?;
            return Ok(());
        }
    };

    let Some(sender) = state.registry.sender(&provider.key) else {
        // The store said online but the live connection is gone; close
        // silently and let the record catch up via disconnect handling.
        tracing::debug!("Provider {} has no live connection", short_key(&provider.key));
        return Ok(());
    };

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<ResponderEvent>(RESPONDER_QUEUE);
    if !state.registry.register_responder(&provider.key, chunk_tx) {
        write_sse_error(&mut stream, "Provider busy").await?;
        return Ok(());
    }

    // The inference token is the provider's own key: it is how the later
    // inferenceEnded sentinel finds this responder again.
    state.registry.add_token(&provider.key, &provider.key);
    let frame = Frame::Inference(InferencePayload {
        messages: chat.data.messages,
        key: provider.key.clone(),
    });
    if sender.send(frame.encode()).await.is_err() {
        state.registry.take_responder(&provider.key);
        write_sse_error(&mut stream, "Provider unavailable").await?;
        return Ok(());
    }

    // Relay until the provider ends the stream or the client goes away.
    // Waiting on each write before taking the next chunk is what carries
    // backpressure from the HTTP client up to the peer read loop.
    let (mut read_half, mut write_half) = stream.split();
    let mut probe = [0u8; 512];
    loop {
        tokio::select! {
            event = chunk_rx.recv() => match event {
                Some(ResponderEvent::Chunk(bytes)) => {
                    if write_half.write_all(&bytes).await.is_err()
                        || write_half.flush().await.is_err()
                    {
                        state.registry.take_responder(&provider.key);
                        return Ok(());
                    }
                }
                Some(ResponderEvent::End) | None => break,
                Some(ResponderEvent::Error(message)) => {
                    let event = format!("data: {}\n\n", json!({ "error": message }));
                    let _ = write_half.write_all(event.as_bytes()).await;
                    break;
                }
            },
            read = read_half.read(&mut probe) => match read {
                // The SSE client never sends more data; bytes are ignored,
                // EOF or error means it disconnected.
                Ok(n) if n > 0 => continue,
                _ => {
                    state.registry.take_responder(&provider.key);
                    return Ok(());
                }
            },
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

// ── request plumbing ──

pub(crate) struct Request {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }
}

pub(crate) async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Request> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            anyhow::bail!("request head too large");
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed before request head");
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let raw_path = parts.next().unwrap_or("/");
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        anyhow::bail!("request body too large");
    }

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed mid body");
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Request { method, path, headers, body })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// First `X-Forwarded-For` hop when present, else the transport address.
pub(crate) fn client_ip(request: &Request, addr: &std::net::SocketAddr) -> String {
    request
        .header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

pub(crate) fn cors_origin(state: &HttpState, request: &Request) -> String {
    match request.header("origin") {
        Some(origin) if state.allowed_origins.iter().any(|allowed| allowed == origin) => {
            origin.to_string()
        }
        _ => "*".to_string(),
    }
}

async fn respond_json(stream: &mut TcpStream, body: &serde_json::Value) -> Result<()> {
    let body = body.to_string();
    let resp = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(resp.as_bytes()).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

async fn respond_error(stream: &mut TcpStream, code: u16, msg: &str) -> Result<()> {
    let body = json!({ "error": msg }).to_string();
    let status = match code {
        400 => "Bad Request",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Not Found",
    };
    let resp = format!(
        "HTTP/1.1 {code} {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(resp.as_bytes()).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

async fn write_sse_error<W: tokio::io::AsyncWrite + Unpin>(stream: &mut W, msg: &str) -> Result<()> {
    let event = format!("data: {}\n\n", json!({ "error": msg }));
    stream.write_all(event.as_bytes()).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::temp_db;

    #[tokio::test]
    async fn test_read_request_parses_head_and_body() {
        let raw = b"POST /v1/chat/completions?x=1 HTTP/1.1\r\n\
                    Host: hub\r\n\
                    Content-Type: application/json\r\n\
                    Content-Length: 11\r\n\r\n\
                    {\"a\":\"bcd\"}";
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(raw).await.unwrap();
        drop(a);

        let request = read_request(&mut b).await.unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/v1/chat/completions");
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("Content-Type"), Some("application/json"));
        assert_eq!(request.body, b"{\"a\":\"bcd\"}");
    }

    #[tokio::test]
    async fn test_read_request_body_split_across_reads() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            a.write_all(b"POST /x HTTP/1.1\r\nContent-Length: 6\r\n\r\nabc")
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            a.write_all(b"def").await.unwrap();
        });
        let request = read_request(&mut b).await.unwrap();
        assert_eq!(request.body, b"abcdef");
        handle.await.unwrap();
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let addr: std::net::SocketAddr = "203.0.113.9:443".parse().unwrap();
        let request = Request {
            method: "POST".into(),
            path: "/".into(),
            headers: vec![("x-forwarded-for".into(), "198.51.100.1, 10.0.0.2".into())],
            body: Vec::new(),
        };
        assert_eq!(client_ip(&request, &addr), "198.51.100.1");

        let bare = Request {
            method: "POST".into(),
            path: "/".into(),
            headers: Vec::new(),
            body: Vec::new(),
        };
        assert_eq!(client_ip(&bare, &addr), "203.0.113.9");
    }

    #[tokio::test]
    async fn test_cors_origin_echoes_only_allowed() {
        let (db, _dir) = temp_db().await;
        let state = HttpState {
            registry: Registry::new(),
            peers: PeerStore::new(db.clone()),
            sessions: ProviderSessionStore::new(db.clone()),
            ip_limit: IpLimitStore::new(db.clone()),
            allowed_origins: Arc::new(vec!["https://symmetry.example".to_string()]),
        };

        let allowed = Request {
            method: "GET".into(),
            path: "/".into(),
            headers: vec![("origin".into(), "https://symmetry.example".into())],
            body: Vec::new(),
        };
        assert_eq!(cors_origin(&state, &allowed), "https://symmetry.example");

        let unlisted = Request {
            method: "GET".into(),
            path: "/".into(),
            headers: vec![("origin".into(), "https://elsewhere.example".into())],
            body: Vec::new(),
        };
        assert_eq!(cors_origin(&state, &unlisted), "*");
    }
}
