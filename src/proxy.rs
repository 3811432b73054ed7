use crate::error::{json_error_response, ProxyErrorCode, ResolveError};
use crate::resolver::Resolver;
use crate::upstream::{BackendTarget, Scheme, Upstream, UpstreamError, UpstreamStats};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header carrying the backend `host:port` that served the request
pub const REQUESTED_HOST: &str = "requested-host";

pub type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Why a forward attempt failed after the inbound body was read
#[derive(Debug, thiserror::Error)]
enum ForwardError {
    #[error("Cannot read body: {0}")]
    Body(String),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("{0}")]
    Resolve(#[from] ResolveError),

    #[error("cannot create request: {0}")]
    Build(String),

    #[error("cannot join host {host}: {source}")]
    Upstream {
        host: String,
        #[source]
        source: UpstreamError,
    },
}

/// Forwards requests arriving on one service's socket to its backend
pub struct ProxyEngine {
    identifier: String,
    lookup_name: String,
    scheme: Scheme,
    backend_port: u16,
    resolver: Arc<Resolver>,
    upstream: Upstream,
    request_timeout: Duration,
    max_body_bytes: usize,
}

impl ProxyEngine {
    pub fn new(
        identifier: String,
        lookup_name: String,
        backend_port: u16,
        resolver: Arc<Resolver>,
        upstream: Upstream,
        request_timeout: Duration,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            identifier,
            lookup_name,
            scheme: Scheme::for_port(backend_port),
            backend_port,
            resolver,
            upstream,
            request_timeout,
            max_body_bytes,
        }
    }

    pub fn stats(&self) -> Arc<UpstreamStats> {
        self.upstream.stats()
    }

    /// Handle one inbound request. Never fails: every error becomes a response.
    ///
    /// Reading the body, resolution and the backend round trip all share the
    /// request deadline.
    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr) -> ProxyResponse
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let request_id = Uuid::new_v4().to_string();
        let identifier = self.identifier.as_str();
        let (parts, body) = req.into_parts();

        debug!(identifier, request_id, client = %client_addr, method = %parts.method, uri = %parts.uri, "Incoming request");

        let result = tokio::time::timeout(self.request_timeout, self.forward(parts, body, &request_id)).await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e @ ForwardError::Body(_))) => {
                warn!(identifier, request_id, error = %e, "Cannot read request body");
                json_error_response(ProxyErrorCode::BadRequestBody, e.to_string())
            }
            Ok(Err(e @ ForwardError::BodyTooLarge(_))) => {
                warn!(identifier, request_id, limit = self.max_body_bytes, "Request body too large");
                json_error_response(ProxyErrorCode::PayloadTooLarge, e.to_string())
            }
            Ok(Err(ForwardError::Resolve(e))) => {
                error!(identifier, request_id, lookup = %self.lookup_name, error = %e, "Backend resolution failed");
                json_error_response(ProxyErrorCode::ResolutionFailed, e.to_string())
            }
            Ok(Err(e @ ForwardError::Build(_))) => {
                error!(identifier, request_id, error = %e, "Failed to build backend request");
                json_error_response(ProxyErrorCode::RequestBuildFailed, e.to_string())
            }
            Ok(Err(e @ ForwardError::Upstream { .. })) => {
                error!(identifier, request_id, error = %e, "Backend round trip failed");
                json_error_response(ProxyErrorCode::BackendUnreachable, e.to_string())
            }
            Err(_) => {
                warn!(
                    identifier,
                    request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }

    async fn forward<B>(
        &self,
        parts: hyper::http::request::Parts,
        body: B,
        request_id: &str,
    ) -> Result<ProxyResponse, ForwardError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let body = read_body(body, self.max_body_bytes).await?;
        let ip = self.resolver.resolve(&self.lookup_name).await?;
        let target = BackendTarget {
            scheme: self.scheme,
            addr: SocketAddr::new(ip.into(), self.backend_port),
            server_name: self.lookup_name.clone(),
        };

        let outbound = build_backend_request(&parts, body, &target)?;
        debug!(
            identifier = %self.identifier,
            request_id,
            method = %parts.method,
            target = %target.uri(path_and_query(&parts.uri)),
            "Forwarding request"
        );

        let response = self
            .upstream
            .send(outbound, &target)
            .await
            .map_err(|source| ForwardError::Upstream {
                host: target.host(),
                source,
            })?;

        let (mut parts, body) = response.into_parts();
        let host = HeaderValue::from_str(&target.host())
            .map_err(|e| ForwardError::Build(e.to_string()))?;
        parts.headers.append(REQUESTED_HOST, host);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Buffer the inbound body, refusing anything past `limit` bytes
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, ForwardError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(ForwardError::BodyTooLarge(limit)),
        Err(e) => Err(ForwardError::Body(e.to_string())),
    }
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

/// Build the outbound request: same method, origin-form URI, every inbound
/// header value (duplicates kept), same body.
fn build_backend_request(
    parts: &hyper::http::request::Parts,
    body: Bytes,
    target: &BackendTarget,
) -> Result<Request<Full<Bytes>>, ForwardError> {
    let uri: Uri = path_and_query(&parts.uri)
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ForwardError::Build(e.to_string()))?;

    let mut outbound = Request::new(Full::new(body));
    *outbound.method_mut() = parts.method.clone();
    *outbound.uri_mut() = uri;

    let headers = outbound.headers_mut();
    for (name, value) in parts.headers.iter() {
        headers.append(name, value.clone());
    }

    if !headers.contains_key(HOST) {
        let host = HeaderValue::from_str(&target.host())
            .map_err(|e| ForwardError::Build(e.to_string()))?;
        headers.insert(HOST, host);
    }

    Ok(outbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use hyper::{Method, StatusCode};

    fn target() -> BackendTarget {
        BackendTarget {
            scheme: Scheme::Http,
            addr: "10.0.0.5:80".parse().unwrap(),
            server_name: "checkout.api.mikrodock".to_string(),
        }
    }

    #[test]
    fn test_build_request_copies_duplicate_headers() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("http://localhost:8080/cart?item=3")
            .header("host", "localhost:8080")
            .header("x-multi", "a")
            .header("x-multi", "b")
            .header("cookie", "session=1")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();

        let outbound = build_backend_request(&parts, Bytes::from("payload"), &target()).unwrap();

        assert_eq!(outbound.method(), Method::POST);
        assert_eq!(outbound.uri(), "/cart?item=3");
        assert_eq!(outbound.headers().get(HOST).unwrap(), "localhost:8080");
        let multi: Vec<_> = outbound.headers().get_all("x-multi").iter().collect();
        assert_eq!(multi, vec!["a", "b"]);
        assert_eq!(outbound.headers().get("cookie").unwrap(), "session=1");
    }

    #[test]
    fn test_build_request_sets_host_when_missing() {
        let req = Request::builder().uri("/").body(()).unwrap();
        let (parts, _) = req.into_parts();

        let outbound = build_backend_request(&parts, Bytes::new(), &target()).unwrap();
        assert_eq!(outbound.headers().get(HOST).unwrap(), "10.0.0.5:80");
        assert_eq!(outbound.uri(), "/");
    }

    /// Engine whose DNS server has nothing listening
    fn unresolvable_engine(request_timeout: Duration, max_body_bytes: usize) -> ProxyEngine {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let dns_addr = socket.local_addr().unwrap();
        drop(socket);

        ProxyEngine::new(
            "api/checkout".to_string(),
            "checkout.api.mikrodock".to_string(),
            80,
            Arc::new(Resolver::new(dns_addr, 3, Duration::from_millis(50))),
            Upstream::new(crate::upstream::tls_client_config().unwrap()),
            request_timeout,
            max_body_bytes,
        )
    }

    fn client() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_resolution_failure_returns_502() {
        let engine = unresolvable_engine(Duration::from_secs(5), 1024);

        let req = Request::builder()
            .uri("/cart")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = engine.handle(req, client()).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "RESOLUTION_FAILED"
        );
    }

    #[tokio::test]
    async fn test_body_at_limit_is_accepted() {
        let engine = unresolvable_engine(Duration::from_secs(5), 1024);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .body(Full::new(Bytes::from(vec![b'x'; 1024])))
            .unwrap();
        let response = engine.handle(req, client()).await;

        // Got past the body read and failed on resolution
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_oversized_body_returns_413() {
        let engine = unresolvable_engine(Duration::from_secs(5), 1024);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .body(Full::new(Bytes::from(vec![b'x'; 1025])))
            .unwrap();
        let response = engine.handle(req, client()).await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "PAYLOAD_TOO_LARGE"
        );
    }

    #[tokio::test]
    async fn test_streamed_upload_stops_at_limit() {
        use hyper::body::Frame;
        use std::convert::Infallible;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let engine = unresolvable_engine(Duration::from_secs(5), 1024 * 1024);

        // 64 MiB in 64 KiB chunks, counting how many were pulled
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let chunks = futures::stream::iter(0..1024).map(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(Frame::data(Bytes::from(vec![0u8; 64 * 1024])))
        });
        let req = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .body(http_body_util::StreamBody::new(chunks))
            .unwrap();
        let response = engine.handle(req, client()).await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(pulled.load(Ordering::SeqCst) <= 17, "read {} chunks", pulled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stalled_body_hits_request_deadline() {
        use hyper::body::Frame;
        use std::convert::Infallible;

        let engine = unresolvable_engine(Duration::from_millis(200), 1024);

        let stalled = futures::stream::pending::<Result<Frame<Bytes>, Infallible>>();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .body(http_body_util::StreamBody::new(stalled))
            .unwrap();
        let response = engine.handle(req, client()).await;

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
