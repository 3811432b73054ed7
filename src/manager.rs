//! Service lifecycle coordination
//!
//! `ServiceManager` is the only writer to the [`Registry`]. Creation reserves
//! the port, binds outside the lock, then commits or rolls back. Deletion
//! signals stop and removes the entry. Shutdown signals every service and
//! waits for each to finish draining.

use crate::config::{Config, ServiceConfig};
use crate::error::ManagementError;
use crate::registry::Registry;
use crate::resolver::Resolver;
use crate::service::{Service, ServiceInfo, ServiceSettings};
use crate::upstream::tls_client_config;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on how long deletion waits for the listener to close
const RELEASE_WAIT: Duration = Duration::from_secs(1);

pub struct ServiceManager {
    registry: Arc<Registry>,
    resolver: Arc<Resolver>,
    tls_config: Arc<rustls::ClientConfig>,
    settings: ServiceSettings,
}

impl ServiceManager {
    /// Create a new manager.
    ///
    /// Returns `Arc<Self>` because the manager is shared between the admin
    /// server and the shutdown path.
    pub fn new(
        registry: Arc<Registry>,
        resolver: Arc<Resolver>,
        tls_config: Arc<rustls::ClientConfig>,
        settings: ServiceSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            resolver,
            tls_config,
            settings,
        })
    }

    pub async fn from_config(config: &Config) -> anyhow::Result<Arc<Self>> {
        let settings = ServiceSettings {
            bind_ip: config.server.bind_ip()?,
            domain: config.dns.domain.clone(),
            request_timeout: config.defaults.request_timeout(),
            max_body_bytes: config.defaults.max_body_bytes,
            shutdown_grace_period: config.defaults.shutdown_grace_period(),
        };

        Ok(Self::new(
            Arc::new(Registry::new()),
            Arc::new(Resolver::from_config(&config.dns).await?),
            tls_client_config()?,
            settings,
        ))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Validate, start and register a service
    pub async fn create_service(
        &self,
        request: ServiceConfig,
    ) -> Result<ServiceInfo, ManagementError> {
        request.validate().map_err(ManagementError::InvalidRequest)?;

        let identifier = request.identifier();
        self.registry.reserve(&identifier, request.public_port)?;

        let service = Arc::new(Service::new(
            &request,
            &self.settings,
            Arc::clone(&self.resolver),
            Arc::clone(&self.tls_config),
        ));

        if let Err(e) = service.start().await {
            self.registry.release(&identifier, request.public_port);
            warn!(identifier, port = request.public_port, error = %e, "Failed to start service");
            return Err(e);
        }

        self.registry.commit(Arc::clone(&service));
        info!(
            identifier,
            public_port = request.public_port,
            internal_port = request.internal_port,
            lookup = %service.lookup_name(),
            "Service created"
        );

        Ok(service.info())
    }

    /// Stop and unregister `stack/name`
    pub async fn delete_service(
        &self,
        stack_name: &str,
        service_name: &str,
    ) -> Result<ServiceInfo, ManagementError> {
        let identifier = format!("{}/{}", stack_name, service_name);
        let service = self.registry.remove(&identifier)?;
        service.stop();

        if !service.wait_released(RELEASE_WAIT).await {
            warn!(identifier, "Listener still open after stop signal");
        }
        info!(identifier, port = service.listen_port(), "Service deleted");

        Ok(service.info())
    }

    pub fn get_service(&self, stack_name: &str, service_name: &str) -> Option<ServiceInfo> {
        self.registry
            .get(&format!("{}/{}", stack_name, service_name))
            .map(|s| s.info())
    }

    pub fn list_services(&self) -> BTreeMap<String, ServiceInfo> {
        self.registry.snapshot()
    }

    /// Signal every registered service to stop, then wait for all of them to
    /// drain. Each service bounds its own drain by the grace period; the
    /// overall wait gets one extra second on top of that.
    pub async fn shutdown_all(&self) {
        let mut signalled = Vec::new();
        self.registry.for_each(|service| {
            service.stop();
            signalled.push(Arc::clone(service));
        });

        info!(count = signalled.len(), "Stopping all services");

        let limit = self.settings.shutdown_grace_period + Duration::from_secs(1);
        let results = futures::future::join_all(
            signalled.iter().map(|service| service.wait_stopped(limit)),
        )
        .await;

        for (service, stopped) in signalled.iter().zip(results) {
            if !stopped {
                warn!(identifier = service.identifier(), "Service did not stop in time");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceState;

    fn manager() -> Arc<ServiceManager> {
        let settings = ServiceSettings {
            bind_ip: "127.0.0.1".parse().unwrap(),
            domain: "mikrodock".to_string(),
            request_timeout: Duration::from_secs(5),
            max_body_bytes: 1024 * 1024,
            shutdown_grace_period: Duration::from_secs(5),
        };
        ServiceManager::new(
            Arc::new(Registry::new()),
            Arc::new(Resolver::new(
                "127.0.0.1:53".parse().unwrap(),
                1,
                Duration::from_millis(50),
            )),
            tls_client_config().unwrap(),
            settings,
        )
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let manager = manager();
        let port = free_port();

        let info = manager
            .create_service(ServiceConfig::new("checkout", "api", port, 80))
            .await
            .unwrap();
        assert_eq!(info.identifier, "api/checkout");
        assert_eq!(info.state, ServiceState::Listening);

        let list = manager.list_services();
        assert_eq!(list.len(), 1);
        assert_eq!(list["api/checkout"].listen_port, port);

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let manager = manager();
        let err = manager
            .create_service(ServiceConfig::new("", "api", 8080, 80))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagementError::InvalidRequest(_)));
        assert!(manager.list_services().is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_rolls_back_reservation() {
        let manager = manager();
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let err = manager
            .create_service(ServiceConfig::new("checkout", "api", port, 80))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagementError::Bind { .. }));
        assert!(manager.list_services().is_empty());
        assert_eq!(manager.registry().port_owner(port), None);
    }

    #[tokio::test]
    async fn test_delete_then_reuse_port() {
        let manager = manager();
        let port = free_port();

        manager
            .create_service(ServiceConfig::new("checkout", "api", port, 80))
            .await
            .unwrap();
        let deleted = manager.delete_service("api", "checkout").await.unwrap();
        assert!(deleted.state >= ServiceState::Stopping);
        assert!(manager.list_services().is_empty());

        manager
            .create_service(ServiceConfig::new("cart", "api", port, 80))
            .await
            .unwrap();
        assert!(manager.get_service("api", "cart").is_some());

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_delete_unknown() {
        let manager = manager();
        let err = manager.delete_service("api", "missing").await.unwrap_err();
        assert!(matches!(err, ManagementError::NotFound(ref id) if id == "api/missing"));
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_everything() {
        let manager = manager();
        let ports = [free_port(), free_port()];
        manager
            .create_service(ServiceConfig::new("a", "api", ports[0], 80))
            .await
            .unwrap();
        manager
            .create_service(ServiceConfig::new("b", "api", ports[1], 80))
            .await
            .unwrap();

        manager.shutdown_all().await;

        for info in manager.list_services().values() {
            assert_eq!(info.state, ServiceState::Stopped);
        }
        for port in ports {
            assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
        }
        // A second shutdown is a no-op
        manager.shutdown_all().await;
    }
}
