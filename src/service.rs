//! A single proxied service and its listener lifecycle
//!
//! A service moves through `Created -> Listening -> Stopping -> Stopped`.
//! The stop signal is a `watch` channel so it can be fired any number of
//! times, including before the accept loop is waiting on it.

use crate::config::ServiceConfig;
use crate::error::ManagementError;
use crate::proxy::ProxyEngine;
use crate::resolver::{lookup_name, Resolver};
use crate::upstream::{Scheme, Upstream};
use chrono::{DateTime, Utc};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::Mutex;
use serde::Serialize;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Built, socket not bound yet
    Created,
    /// Accepting connections
    Listening,
    /// Listener closed, draining in-flight connections
    Stopping,
    /// All connections finished or dropped
    Stopped,
}

/// Settings shared by every service a manager creates
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Address listeners bind to
    pub bind_ip: IpAddr,
    /// Domain appended to lookup names
    pub domain: String,
    /// Deadline around the body read, resolution and the backend round trip
    pub request_timeout: Duration,
    /// Largest inbound request body accepted, in bytes
    pub max_body_bytes: usize,
    /// How long a stopping service waits for in-flight connections
    pub shutdown_grace_period: Duration,
}

/// Descriptor returned by the management API
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceInfo {
    pub identifier: String,
    pub service_name: String,
    pub stack_name: String,
    pub listen_port: u16,
    pub backend_port: u16,
    pub backend_scheme: Scheme,
    pub lookup_name: String,
    pub state: ServiceState,
    pub created_at: DateTime<Utc>,
    pub requests: u64,
    pub failures: u64,
}

pub struct Service {
    identifier: String,
    service_name: String,
    stack_name: String,
    listen_port: u16,
    backend_port: u16,
    lookup_name: String,
    bind_ip: IpAddr,
    grace_period: Duration,
    created_at: DateTime<Utc>,
    engine: Arc<ProxyEngine>,
    stop_tx: watch::Sender<bool>,
    state_tx: watch::Sender<ServiceState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Service {
    pub fn new(
        config: &ServiceConfig,
        settings: &ServiceSettings,
        resolver: Arc<Resolver>,
        tls_config: Arc<rustls::ClientConfig>,
    ) -> Self {
        let identifier = config.identifier();
        let lookup = lookup_name(&config.service_name, &config.stack_name, &settings.domain);
        let engine = ProxyEngine::new(
            identifier.clone(),
            lookup.clone(),
            config.internal_port,
            resolver,
            Upstream::new(tls_config),
            settings.request_timeout,
            settings.max_body_bytes,
        );

        Self {
            identifier,
            service_name: config.service_name.clone(),
            stack_name: config.stack_name.clone(),
            listen_port: config.public_port,
            backend_port: config.internal_port,
            lookup_name: lookup,
            bind_ip: settings.bind_ip,
            grace_period: settings.shutdown_grace_period,
            created_at: Utc::now(),
            engine: Arc::new(engine),
            stop_tx: watch::channel(false).0,
            state_tx: watch::channel(ServiceState::Created).0,
            task: Mutex::new(None),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn lookup_name(&self) -> &str {
        &self.lookup_name
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    pub fn info(&self) -> ServiceInfo {
        let stats = self.engine.stats();
        ServiceInfo {
            identifier: self.identifier.clone(),
            service_name: self.service_name.clone(),
            stack_name: self.stack_name.clone(),
            listen_port: self.listen_port,
            backend_port: self.backend_port,
            backend_scheme: Scheme::for_port(self.backend_port),
            lookup_name: self.lookup_name.clone(),
            state: self.state(),
            created_at: self.created_at,
            requests: stats.get_total_requests(),
            failures: stats.get_failures(),
        }
    }

    /// Bind the listener and start serving. Only valid from `Created`.
    pub async fn start(&self) -> Result<(), ManagementError> {
        if self.state() != ServiceState::Created {
            return Err(ManagementError::InvalidRequest(format!(
                "service {} was already started",
                self.identifier
            )));
        }

        let addr = SocketAddr::new(self.bind_ip, self.listen_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ManagementError::Bind {
                port: self.listen_port,
                source,
            })?;

        // A stop that raced the bind wins; the listener is released right away
        if *self.stop_tx.borrow() {
            drop(listener);
            self.state_tx.send_replace(ServiceState::Stopped);
            return Err(ManagementError::InvalidRequest(format!(
                "service {} was stopped while starting",
                self.identifier
            )));
        }

        self.state_tx.send_replace(ServiceState::Listening);
        info!(identifier = %self.identifier, addr = %addr, lookup = %self.lookup_name, "Service listening");

        let task = tokio::spawn(serve(
            listener,
            Arc::clone(&self.engine),
            self.stop_tx.subscribe(),
            self.state_tx.clone(),
            self.grace_period,
            self.identifier.clone(),
        ));
        *self.task.lock() = Some(task);

        Ok(())
    }

    /// Signal the service to stop. Safe to call repeatedly; returns true only
    /// for the call that actually initiated the stop.
    pub fn stop(&self) -> bool {
        let already = self.stop_tx.send_replace(true);
        if already {
            return false;
        }

        // Never started: nothing to drain
        self.state_tx.send_if_modified(|state| {
            if *state == ServiceState::Created {
                *state = ServiceState::Stopped;
                true
            } else {
                false
            }
        });

        debug!(identifier = %self.identifier, "Stop signalled");
        true
    }

    /// Wait until the listening socket is closed, up to `timeout`
    pub async fn wait_released(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s >= ServiceState::Stopping))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Wait until the service reaches `Stopped`, up to `timeout`
    pub async fn wait_stopped(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == ServiceState::Stopped))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

async fn serve(
    listener: TcpListener,
    engine: Arc<ProxyEngine>,
    mut stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ServiceState>,
    grace_period: Duration,
    identifier: String,
) {
    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();
    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http2().max_concurrent_streams(250);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let engine = Arc::clone(&engine);
                        let service = service_fn(move |req: Request<Incoming>| {
                            let engine = Arc::clone(&engine);
                            async move { Ok::<_, Infallible>(engine.handle(req, addr).await) }
                        });

                        let conn = builder.serve_connection(TokioIo::new(stream), service);
                        let conn = graceful.watch(conn.into_owned());
                        let id = identifier.clone();
                        connections.spawn(async move {
                            if let Err(e) = conn.await {
                                debug!(identifier = %id, addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(identifier = %identifier, error = %e, "Failed to accept connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = stop_rx.wait_for(|stopped| *stopped) => {
                break;
            }
        }
    }

    drop(listener);
    state_tx.send_replace(ServiceState::Stopping);
    info!(identifier = %identifier, in_flight = connections.len(), "Service stopping");

    match tokio::time::timeout(grace_period, graceful.shutdown()).await {
        Ok(()) => debug!(identifier = %identifier, "All connections drained"),
        Err(_) => {
            warn!(
                identifier = %identifier,
                grace_period_secs = grace_period.as_secs(),
                dropped = connections.len(),
                "Grace period elapsed, dropping in-flight connections"
            );
        }
    }
    connections.shutdown().await;

    state_tx.send_replace(ServiceState::Stopped);
    info!(identifier = %identifier, "Service stopped");
}
