//! In-process HTTP fixture server for tests: raw TCP, requests parsed with httparse,
//! one request per connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("request body is JSON")
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    body: Vec<u8>,
    /// Bytes actually written before the connection is closed.
    send: usize,
}

impl Reply {
    pub fn json(status: u16, body: &str) -> Self {
        Self::bytes(status, body.as_bytes().to_vec())
    }

    pub fn bytes(status: u16, body: Vec<u8>) -> Self {
        let send = body.len();
        Self { status, body, send }
    }

    /// Declares the full length but closes after `send` bytes.
    pub fn truncated(body: Vec<u8>, send: usize) -> Self {
        Self {
            status: 200,
            body,
            send,
        }
    }
}

enum Routing {
    /// Replies handed out in order, any path; 404 once exhausted.
    Sequence(Vec<Reply>),
    /// (method, path) to a reply reused on every hit; 404 otherwise.
    Routes(Vec<(String, String, Reply)>),
}

struct State {
    routing: Mutex<Routing>,
    requests: Mutex<Vec<Recorded>>,
}

pub struct FixtureServer {
    addr: SocketAddr,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl FixtureServer {
    pub async fn start(replies: Vec<Reply>) -> Self {
        Self::spawn(Routing::Sequence(replies)).await
    }

    pub async fn with_routes(routes: Vec<(&str, &str, Reply)>) -> Self {
        let routes = routes
            .into_iter()
            .map(|(m, p, r)| (m.to_string(), p.to_string(), r))
            .collect();
        Self::spawn(Routing::Routes(routes)).await
    }

    async fn spawn(routing: Routing) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State {
            routing: Mutex::new(routing),
            requests: Mutex::new(Vec::new()),
        });
        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle(stream, accept_state.clone()));
            }
        });
        Self { addr, state, task }
    }

    /// Add a route once the server address is known. Only for routed servers.
    pub fn route(&self, method: &str, path: &str, reply: Reply) {
        if let Routing::Routes(routes) = &mut *self.state.routing.lock().unwrap() {
            routes.push((method.to_string(), path.to_string(), reply));
        }
    }

    pub fn base(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base(), path)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(mut stream: TcpStream, state: Arc<State>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let (head_len, mut rec) = loop {
        match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                let rec = Recorded {
                    method: req.method.unwrap_or("").to_string(),
                    path: req.path.unwrap_or("").to_string(),
                    headers: req
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_ascii_lowercase(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect(),
                    body: Vec::new(),
                };
                break (len, rec);
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return,
        }
    };
    let content_length: usize = rec
        .header("content-length")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    while buf.len() < head_len + content_length {
        match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
    rec.body = buf[head_len..head_len + content_length].to_vec();

    let reply = pick(&state, &rec);
    state.requests.lock().unwrap().push(rec);

    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
        reply.status,
        reason(reply.status),
        reply.body.len()
    );
    if stream.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    let _ = stream.write_all(&reply.body[..reply.send]).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}

fn pick(state: &State, rec: &Recorded) -> Reply {
    let not_found = Reply::json(404, "");
    let mut routing = state.routing.lock().unwrap();
    match &mut *routing {
        Routing::Sequence(replies) => {
            if replies.is_empty() {
                not_found
            } else {
                replies.remove(0)
            }
        }
        Routing::Routes(routes) => routes
            .iter()
            .find(|(m, p, _)| *m == rec.method && *p == rec.path)
            .map(|(_, _, r)| r.clone())
            .unwrap_or(not_found),
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Deployment-base reply with one artifact served over plain HTTP.
pub fn deployment_json(action_id: &str, download_url: &str, size: u64, sha1: &str) -> String {
    format!(
        r#"{{
            "id": "{action_id}",
            "deployment": {{
                "download": "forced",
                "update": "forced",
                "chunks": [{{
                    "part": "os",
                    "name": "rootfs",
                    "version": "2.0.1",
                    "artifacts": [{{
                        "filename": "bundle.raucb",
                        "size": {size},
                        "hashes": {{ "sha1": "{sha1}" }},
                        "_links": {{ "download-http": {{ "href": "{download_url}" }} }}
                    }}]
                }}]
            }}
        }}"#
    )
}

/// SHA-1 of 1024 zero bytes.
pub const SHA1_1K_ZEROS: &str = "60cacbf3d72e1e7834203da608037b1bf83b40e8";
