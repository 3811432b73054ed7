use crate::config::ServiceConfig;
use crate::error::ManagementError;
use crate::manager::ServiceManager;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const SERVICES_PREFIX: &str = "/services";

/// Error body returned by the management API
#[derive(Debug, Serialize)]
struct ApiError<'a> {
    error: &'a str,
}

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::to_string(&ApiError { error: message })
        .unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string());
    json_response(status, body)
}

fn json_ok<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn management_error(err: &ManagementError) -> Response<Full<Bytes>> {
    json_error(err.status_code(), &err.to_string())
}

/// Management API for creating, listing and deleting services
pub struct AdminServer {
    manager: Arc<ServiceManager>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Option<Arc<String>>,
}

impl AdminServer {
    pub fn new(manager: Arc<ServiceManager>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            manager,
            shutdown_rx,
            auth_token: None,
        }
    }

    /// Require `Authorization: Bearer <token>` on the /services routes
    pub fn with_auth_token(mut self, token: String) -> Self {
        self.auth_token = Some(Arc::new(token));
        self
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, auth = self.auth_token.is_some(), "Management API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self.manager);
                            let auth_token = self.auth_token.clone();

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, addr, manager, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Management API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    _addr: SocketAddr,
    manager: Arc<ServiceManager>,
    auth_token: Option<Arc<String>>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let manager = Arc::clone(&manager);
        let token = auth_token.clone();
        async move { handle_admin_request(req, manager, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: Option<&str>) -> bool {
    let Some(expected) = expected_token else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected)
        })
        .unwrap_or(false)
}

/// Split `/services/{stack}/{service}` into its two segments
fn service_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix(SERVICES_PREFIX)?.strip_prefix('/')?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    let (stack, service) = rest.split_once('/')?;
    if stack.is_empty() || service.is_empty() || service.contains('/') {
        return None;
    }
    Some((stack, service))
}

fn is_collection(path: &str) -> bool {
    path == SERVICES_PREFIX || path == "/services/"
}

async fn handle_admin_request(
    req: Request<Incoming>,
    manager: Arc<ServiceManager>,
    auth_token: Option<Arc<String>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    // Health check and version need no auth
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if path.starts_with(SERVICES_PREFIX) && !check_auth(&req, auth_token.as_deref().map(String::as_str)) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(json_error(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match method {
        Method::GET if is_collection(&path) => json_ok(&manager.list_services()),
        Method::POST if is_collection(&path) => create_service(req, &manager).await,
        Method::GET => match service_path(&path) {
            Some((stack, service)) => match manager.get_service(stack, service) {
                Some(info) => json_ok(&info),
                None => management_error(&ManagementError::NotFound(format!("{}/{}", stack, service))),
            },
            None => response(StatusCode::NOT_FOUND, "not found"),
        },
        Method::DELETE => match service_path(&path) {
            Some((stack, service)) => match manager.delete_service(stack, service).await {
                Ok(info) => json_ok(&info),
                Err(e) => management_error(&e),
            },
            None => response(StatusCode::NOT_FOUND, "not found"),
        },
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn create_service(req: Request<Incoming>, manager: &ServiceManager) -> Response<Full<Bytes>> {
    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("Cannot read body: {}", e));
        }
    };

    let request: ServiceConfig = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("Invalid JSON: {}", e));
        }
    };

    match manager.create_service(request).await {
        Ok(info) => json_ok(&info),
        Err(e) => {
            warn!(error = %e, "Service creation rejected");
            management_error(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_path() {
        assert_eq!(service_path("/services/api/checkout"), Some(("api", "checkout")));
        assert_eq!(service_path("/services/api/checkout/"), Some(("api", "checkout")));
        assert_eq!(service_path("/services/api"), None);
        assert_eq!(service_path("/services/"), None);
        assert_eq!(service_path("/services/api/checkout/extra"), None);
        assert_eq!(service_path("/servicesx/api/checkout"), None);
    }

    #[test]
    fn test_is_collection() {
        assert!(is_collection("/services"));
        assert!(is_collection("/services/"));
        assert!(!is_collection("/services/api"));
    }

    #[test]
    fn test_management_error_response() {
        let resp = management_error(&ManagementError::PortConflict {
            port: 8080,
            identifier: "api/checkout".to_string(),
        });
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }
}
