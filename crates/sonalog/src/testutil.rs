//! Test helpers shared across modules.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// A canned HTTP response.
#[derive(Debug, Clone)]
pub struct HttpReply {
    status: u16,
    body: String,
    stall: bool,
}

impl HttpReply {
    /// A JSON response with the given status.
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            stall: false,
        }
    }

    /// Read the request, then never answer.
    pub fn stall() -> Self {
        Self {
            status: 0,
            body: String::new(),
            stall: true,
        }
    }
}

/// A local HTTP server answering with canned replies.
#[derive(Debug)]
pub struct FakeServer {
    /// `http://127.0.0.1:<port>`
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeServer {
    /// Every request received so far, as raw text (request line, headers, body).
    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

/// Start a server that answers requests with `replies` in order, repeating
/// the last one once the list runs out.
pub async fn serve_http(replies: Vec<HttpReply>) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let requests = Arc::new(Mutex::new(Vec::new()));

    let log = requests.clone();
    tokio::spawn(async move {
        let mut index = 0;
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let Some(request) = read_request(&mut stream).await else {
                continue;
            };
            log.lock().await.push(request);

            let reply = replies
                .get(index)
                .or_else(|| replies.last())
                .cloned()
                .unwrap_or_else(|| HttpReply::json(404, "{}"));
            index += 1;

            if reply.stall {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    drop(stream);
                });
                continue;
            }

            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                reply.status,
                reply.body.len(),
                reply.body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    FakeServer { base_url, requests }
}

async fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Some(String::from_utf8_lossy(&buf).to_string())
}
