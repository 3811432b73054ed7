//! Single round trips to resolved backends
//!
//! Every forwarded request opens its own connection to the backend, plain TCP
//! for `http` and TLS for `https`, and the connection is dropped once the
//! response body has been relayed. There is no pooling.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Error type for backend round trips
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Scheme used to reach a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Backends listening on 443 are reached over TLS
    pub fn for_port(port: u16) -> Self {
        if port == 443 {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a single request is sent
#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub scheme: Scheme,
    pub addr: SocketAddr,
    /// Name presented for SNI and certificate verification
    pub server_name: String,
}

impl BackendTarget {
    /// `host:port` actually contacted
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Absolute URI for a path and query
    pub fn uri(&self, path_and_query: &str) -> String {
        format!("{}://{}{}", self.scheme, self.addr, path_and_query)
    }
}

/// Request counters for one service
#[derive(Debug, Default)]
pub struct UpstreamStats {
    pub total_requests: AtomicU64,
    pub failures: AtomicU64,
}

impl UpstreamStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Build the client TLS configuration trusting the Mozilla root store
pub fn tls_client_config() -> anyhow::Result<Arc<rustls::ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    tls_client_config_with_roots(root_store)
}

/// Build a client TLS configuration trusting only `root_store`
pub fn tls_client_config_with_roots(
    root_store: rustls::RootCertStore,
) -> anyhow::Result<Arc<rustls::ClientConfig>> {
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| anyhow::anyhow!("TLS protocol version error: {}", e))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Sends requests for one service
pub struct Upstream {
    tls: TlsConnector,
    stats: Arc<UpstreamStats>,
}

impl Upstream {
    pub fn new(tls_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            tls: TlsConnector::from(tls_config),
            stats: Arc::new(UpstreamStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    /// Perform one round trip. The request URI should be in origin form.
    pub async fn send(
        &self,
        req: Request<Full<Bytes>>,
        target: &BackendTarget,
    ) -> Result<Response<Incoming>, UpstreamError> {
        self.stats.record_request();
        let result = self.round_trip(req, target).await;
        if result.is_err() {
            self.stats.record_failure();
        }
        result
    }

    async fn round_trip(
        &self,
        req: Request<Full<Bytes>>,
        target: &BackendTarget,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let stream = TcpStream::connect(target.addr)
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: target.addr,
                source,
            })?;
        let _ = stream.set_nodelay(true);

        match target.scheme {
            Scheme::Http => send_over(stream, req).await,
            Scheme::Https => {
                let server_name = ServerName::try_from(target.server_name.clone())
                    .map_err(|_| UpstreamError::InvalidServerName(target.server_name.clone()))?;
                let tls_stream = self
                    .tls
                    .connect(server_name, stream)
                    .await
                    .map_err(UpstreamError::Tls)?;
                send_over(tls_stream, req).await
            }
        }
    }
}

async fn send_over<S>(
    stream: S,
    req: Request<Full<Bytes>>,
) -> Result<Response<Incoming>, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    // Drives the connection until the response body is consumed
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Backend connection closed with error");
        }
    });

    Ok(sender.send_request(req).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    #[test]
    fn test_scheme_for_port() {
        assert_eq!(Scheme::for_port(443), Scheme::Https);
        assert_eq!(Scheme::for_port(80), Scheme::Http);
        assert_eq!(Scheme::for_port(8443), Scheme::Http);
        assert_eq!(Scheme::Https.to_string(), "https");
    }

    #[test]
    fn test_target_uri() {
        let target = BackendTarget {
            scheme: Scheme::Http,
            addr: "10.0.0.5:80".parse().unwrap(),
            server_name: "checkout.api.mikrodock".to_string(),
        };
        assert_eq!(target.host(), "10.0.0.5:80");
        assert_eq!(target.uri("/cart?id=1"), "http://10.0.0.5:80/cart?id=1");
    }

    #[test]
    fn test_stats() {
        let stats = UpstreamStats::default();
        assert_eq!(stats.get_total_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failures(), 1);
    }

    #[test]
    fn test_tls_client_config_builds() {
        assert!(tls_client_config().is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_is_counted() {
        // Bind then drop to get a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = Upstream::new(tls_client_config().unwrap());
        let target = BackendTarget {
            scheme: Scheme::Http,
            addr,
            server_name: "x.y.z".to_string(),
        };
        let req = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let err = upstream.send(req, &target).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Connect { .. }));
        assert_eq!(upstream.stats().get_total_requests(), 1);
        assert_eq!(upstream.stats().get_failures(), 1);
    }

    #[tokio::test]
    async fn test_round_trip_plain_http() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\nX-Test: 1\r\n\r\n")
                .await
                .unwrap();
        });

        let upstream = Upstream::new(tls_client_config().unwrap());
        let target = BackendTarget {
            scheme: Scheme::Http,
            addr,
            server_name: "x.y.z".to_string(),
        };
        let req = Request::builder()
            .uri("/ping")
            .header("host", target.host())
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = upstream.send(req, &target).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers().get("x-test").unwrap(), "1");
        assert_eq!(upstream.stats().get_failures(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_https_uses_lookup_name_for_sni() {
        use rcgen::{generate_simple_self_signed, CertifiedKey};
        use rustls::pki_types::{CertificateDer, PrivateKeyDer};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let server_name = "checkout.api.mikrodock";
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec![server_name.to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();

        let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (sni_tx, sni_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(stream).await.unwrap();
            let sni = tls.get_ref().1.server_name().map(str::to_string);
            let _ = sni_tx.send(sni);

            let mut buf = [0u8; 1024];
            let _ = tls.read(&mut buf).await.unwrap();
            tls.write_all(b"HTTP/1.1 200 OK\r\nX-Test: 1\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            tls.flush().await.unwrap();
        });

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let upstream = Upstream::new(tls_client_config_with_roots(roots).unwrap());
        let target = BackendTarget {
            scheme: Scheme::Https,
            addr,
            server_name: server_name.to_string(),
        };
        let req = Request::builder()
            .uri("/secure")
            .header("host", target.host())
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = upstream.send(req, &target).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-test").unwrap(), "1");
        assert_eq!(sni_rx.await.unwrap().as_deref(), Some(server_name));
        assert_eq!(upstream.stats().get_failures(), 0);
    }

    #[tokio::test]
    async fn test_https_rejects_untrusted_certificate() {
        use rcgen::{generate_simple_self_signed, CertifiedKey};
        use rustls::pki_types::{CertificateDer, PrivateKeyDer};

        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["checkout.api.mikrodock".to_string()]).unwrap();
        let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(cert.der().to_vec())],
            PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap(),
        )
        .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = acceptor.accept(stream).await;
        });

        // Only the public roots are trusted, so the self-signed cert fails
        let upstream = Upstream::new(tls_client_config().unwrap());
        let target = BackendTarget {
            scheme: Scheme::Https,
            addr,
            server_name: "checkout.api.mikrodock".to_string(),
        };
        let req = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let err = upstream.send(req, &target).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Tls(_)));
        assert_eq!(upstream.stats().get_failures(), 1);
    }
}
