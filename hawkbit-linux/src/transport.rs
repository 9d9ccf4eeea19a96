//! HTTP transport: authenticated requests with TLS, timeout and user-agent policy.
//! Non-2xx replies are errors; the caller maps each error to a retry decision.

use std::error::Error as StdError;
use std::time::Duration;

use hawkbit_core::Failure;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

pub const USER_AGENT: &str = concat!("rauc-hawkbit-updater/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid transport setup: {0}")]
    Setup(String),
    #[error("connection to {url} failed: {detail}")]
    Connect { url: String, detail: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("TLS failure talking to {url}: {detail}")]
    Tls { url: String, detail: String },
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed: {detail}")]
    Other { url: String, detail: String },
}

impl TransportError {
    /// 401/403 are auth failures; everything else is worth another try later.
    pub fn failure(&self) -> Failure {
        match self {
            TransportError::Status { status, .. } if *status == 401 || *status == 403 => {
                Failure::Auth
            }
            TransportError::Setup(_) => Failure::Fatal,
            _ => Failure::Retryable,
        }
    }
}

/// A body consumer refused a chunk, or the transfer itself failed.
#[derive(Debug)]
pub enum StreamFailure<E> {
    Transport(TransportError),
    Sink(E),
}

/// Successful (2xx) reply.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub auth_token: String,
    pub connect_timeout: Duration,
    /// Max time without receiving data.
    pub timeout: Duration,
    pub ssl_verify: bool,
}

/// Shared HTTP client. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
}

impl Transport {
    pub fn new(opts: &TransportOptions) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("TargetToken {}", opts.auth_token))
            .map_err(|e| TransportError::Setup(format!("auth token: {}", e)))?;
        headers.insert(AUTHORIZATION, auth);
        if !opts.ssl_verify {
            warn!("TLS certificate verification disabled");
        }
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(opts.connect_timeout)
            .read_timeout(opts.timeout)
            .danger_accept_invalid_certs(!opts.ssl_verify)
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        Ok(Self { client })
    }

    /// Issue one request with an optional JSON body.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<String>,
    ) -> Result<Response, TransportError> {
        debug!(%method, url, "request");
        let mut req = self
            .client
            .request(method, url)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            req = req.header(CONTENT_TYPE, "application/json").body(body);
        }
        let resp = req.send().await.map_err(|e| classify(url, e))?;
        let resp = check_status(url, resp)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| classify(url, e))?.to_vec();
        debug!(url, %status, bytes = body.len(), "response");
        Ok(Response { status, body })
    }

    pub async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        Ok(self.request(Method::GET, url, None).await?.body)
    }

    pub async fn put(&self, url: &str, body: String) -> Result<StatusCode, TransportError> {
        Ok(self.request(Method::PUT, url, Some(body)).await?.status)
    }

    pub async fn post(&self, url: &str, body: String) -> Result<StatusCode, TransportError> {
        Ok(self.request(Method::POST, url, Some(body)).await?.status)
    }

    /// GET `url`, handing each received chunk to `sink` in order. Nothing is buffered
    /// beyond one chunk. Returns the number of bytes delivered.
    pub async fn stream<F, E>(&self, url: &str, mut sink: F) -> Result<u64, StreamFailure<E>>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        debug!(url, "streaming download");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StreamFailure::Transport(classify(url, e)))?;
        let mut resp = check_status(url, resp).map_err(StreamFailure::Transport)?;
        let mut total = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| StreamFailure::Transport(classify(url, e)))?
        {
            sink(&chunk).map_err(StreamFailure::Sink)?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }
}

fn check_status(url: &str, resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(TransportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

fn classify(url: &str, e: reqwest::Error) -> TransportError {
    let url = url.to_string();
    let detail = error_chain(&e);
    if e.is_timeout() {
        TransportError::Timeout { url }
    } else if is_tls(&e) {
        TransportError::Tls { url, detail }
    } else if e.is_connect() {
        TransportError::Connect { url, detail }
    } else {
        TransportError::Other { url, detail }
    }
}

/// True when a rustls error sits anywhere in the chain. `io::Error` hides its payload
/// from `source()`, so it is unwrapped explicitly.
fn is_tls(e: &(dyn StdError + 'static)) -> bool {
    let mut cur: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(err) = cur {
        if err.downcast_ref::<rustls::Error>().is_some() {
            return true;
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if let Some(inner) = io.get_ref() {
                if inner.downcast_ref::<rustls::Error>().is_some() {
                    return true;
                }
            }
        }
        cur = err.source();
    }
    false
}

fn error_chain(e: &(dyn StdError + 'static)) -> String {
    let mut out = e.to_string();
    let mut cur = e.source();
    while let Some(err) = cur {
        out.push_str(": ");
        out.push_str(&err.to_string());
        cur = err.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FixtureServer, Reply};

    fn transport() -> Transport {
        Transport::new(&TransportOptions {
            auth_token: "tok123".into(),
            connect_timeout: Duration::from_secs(2),
            timeout: Duration::from_secs(2),
            ssl_verify: true,
        })
        .unwrap()
    }

    #[test]
    fn failure_classes() {
        let status = |s| TransportError::Status {
            url: "u".into(),
            status: s,
        };
        assert_eq!(status(401).failure(), Failure::Auth);
        assert_eq!(status(403).failure(), Failure::Auth);
        assert_eq!(status(404).failure(), Failure::Retryable);
        assert_eq!(status(503).failure(), Failure::Retryable);
        assert_eq!(
            TransportError::Timeout { url: "u".into() }.failure(),
            Failure::Retryable
        );
    }

    #[test]
    fn invalid_token_is_setup_error() {
        let err = Transport::new(&TransportOptions {
            auth_token: "bad\ntoken".into(),
            connect_timeout: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            ssl_verify: true,
        })
        .err()
        .unwrap();
        assert!(matches!(err, TransportError::Setup(_)));
    }

    #[tokio::test]
    async fn get_sends_token_and_user_agent() {
        let server = FixtureServer::start(vec![Reply::json(200, "{}")]).await;
        let body = transport().get(&server.url("/poll")).await.unwrap();
        assert_eq!(body, b"{}");
        let reqs = server.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method, "GET");
        assert_eq!(reqs[0].path, "/poll");
        assert_eq!(reqs[0].header("authorization"), Some("TargetToken tok123"));
        assert_eq!(reqs[0].header("user-agent"), Some(USER_AGENT));
    }

    #[tokio::test]
    async fn non_success_status_is_error() {
        let server = FixtureServer::start(vec![Reply::json(401, "")]).await;
        let err = transport().get(&server.url("/poll")).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 401, .. }));
        assert_eq!(err.failure(), Failure::Auth);
    }

    #[tokio::test]
    async fn put_carries_json_body() {
        let server = FixtureServer::start(vec![Reply::json(200, "")]).await;
        transport()
            .put(&server.url("/configData"), r#"{"a":1}"#.into())
            .await
            .unwrap();
        let reqs = server.requests();
        assert_eq!(reqs[0].method, "PUT");
        assert_eq!(reqs[0].header("content-type"), Some("application/json"));
        assert_eq!(reqs[0].body, br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn connection_refused_is_retryable() {
        let server = FixtureServer::start(vec![]).await;
        let url = server.url("/x");
        drop(server);
        let err = transport().get(&url).await.unwrap_err();
        assert_eq!(err.failure(), Failure::Retryable);
    }

    #[tokio::test]
    async fn stream_delivers_chunks_in_order() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let server = FixtureServer::start(vec![Reply::bytes(200, payload.clone())]).await;
        let mut got = Vec::new();
        let n = transport()
            .stream(&server.url("/dl"), |c| {
                got.extend_from_slice(c);
                Ok::<(), ()>(())
            })
            .await
            .unwrap();
        assert_eq!(n, 5000);
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn stream_truncated_body_is_transport_error() {
        let server = FixtureServer::start(vec![Reply::truncated(vec![0u8; 1024], 512)]).await;
        let res = transport()
            .stream(&server.url("/dl"), |_| Ok::<(), ()>(()))
            .await;
        match res {
            Err(StreamFailure::Transport(e)) => assert_eq!(e.failure(), Failure::Retryable),
            other => panic!("expected transport failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn stream_sink_error_stops_transfer() {
        let server = FixtureServer::start(vec![Reply::bytes(200, vec![1u8; 100])]).await;
        let res = transport()
            .stream(&server.url("/dl"), |_| Err("full"))
            .await;
        assert!(matches!(res, Err(StreamFailure::Sink("full"))));
    }
}
