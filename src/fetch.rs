//! HTTP fetch capability
//!
//! The registry consumes HTTP as a blocking-style `fetch(url, params) ->
//! body-or-empty` capability: non-2xx responses and transport errors yield
//! an empty body and are logged, never surfaced as fatal. The trait seam
//! lets tests substitute a scripted fetcher.
//!
//! Every call automatically appends the push listener's bound port as the
//! `udpPort` query parameter so the control plane knows where to send push
//! notifications.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

/// Client version advertised to the control plane
pub const CLIENT_VERSION: &str = "svcreg:v0.1.0";

/// HTTP request timeout
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared cell holding the push listener's bound port
///
/// Holds -1 until the listener binds. Cloning shares the underlying cell.
#[derive(Debug, Clone)]
pub struct PushPort(Arc<AtomicI64>);

impl PushPort {
    /// Create an unbound cell
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(-1)))
    }

    /// Publish the bound port
    pub fn set(&self, port: u16) {
        self.0.store(i64::from(port), Ordering::Release);
    }

    /// The bound port, or -1 when the listener is not running
    #[must_use]
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for PushPort {
    fn default() -> Self {
        Self::new()
    }
}

/// Upstream fetch capability consumed by the registry
#[async_trait]
pub trait Fetch: Send + Sync {
    /// GET `url` with the given query parameters, returning the response
    /// body, or an empty string on any failure
    async fn get(&self, url: &str, params: &[(String, String)]) -> String;
}

/// HTTP implementation of [`Fetch`]
pub struct HttpFetcher {
    client: Client<HttpConnector, Full<Bytes>>,
    push_port: PushPort,
}

impl HttpFetcher {
    /// Create a fetcher that advertises the given push port on every call
    #[must_use]
    pub fn new(push_port: PushPort) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, push_port }
    }

    async fn get_inner(&self, url: &str) -> Result<String, String> {
        let uri: Uri = url.parse().map_err(|e| format!("invalid url: {e}"))?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Client-Version", CLIENT_VERSION)
            .body(Full::new(Bytes::new()))
            .map_err(|e| format!("failed to build request: {e}"))?;

        let response = tokio::time::timeout(FETCH_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| format!("request timed out after {FETCH_TIMEOUT:?}"))?
            .map_err(|e| format!("transport error: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("unexpected status: {status}"));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| format!("failed to read body: {e}"))?
            .to_bytes();

        String::from_utf8(body.to_vec()).map_err(|e| format!("body is not utf-8: {e}"))
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get(&self, url: &str, params: &[(String, String)]) -> String {
        let url = encode_url(url, params, self.push_port.get());
        debug!("fetch {url}");

        match self.get_inner(&url).await {
            Ok(body) => body,
            Err(reason) => {
                warn!("error while requesting {url}: {reason}");
                String::new()
            }
        }
    }
}

/// Append query parameters plus the advertised `udpPort` to `url`
fn encode_url(url: &str, params: &[(String, String)], udp_port: i64) -> String {
    let mut out = String::from(url);
    if !out.ends_with('?') {
        out.push('?');
    }

    for (key, value) in params {
        let _ = write!(out, "{}={}&", percent_encode(key), percent_encode(value));
    }
    let _ = write!(out, "udpPort={udp_port}");

    out
}

/// Percent-encode everything outside the URL-unreserved set
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}
