use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy manager
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend resolution settings
    #[serde(default)]
    pub dns: DnsConfig,

    /// Settings applied to every proxied service
    #[serde(default)]
    pub defaults: ServiceDefaults,

    /// Services created at startup, before the admin API accepts requests
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address every service listener binds to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Address the management API binds to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub admin_bind: String,

    /// Port for the management API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the /services routes. Unset means no authentication.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Socket address of the management API
    pub fn admin_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .admin_bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid admin bind address '{}': {}", self.admin_bind, e))?;
        Ok(SocketAddr::new(ip, self.admin_port))
    }

    /// IP address service listeners bind to
    pub fn bind_ip(&self) -> anyhow::Result<IpAddr> {
        self.bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsConfig {
    /// DNS server queried for every backend lookup, an IP or a hostname.
    /// A hostname is resolved once at startup through the system resolver.
    #[serde(default = "default_dns_server")]
    pub server: String,

    /// DNS server port
    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// Domain appended to `<service>.<stack>` to build the lookup name
    #[serde(default = "default_dns_domain")]
    pub domain: String,

    /// Total query attempts before a lookup fails
    #[serde(default = "default_dns_attempts")]
    pub attempts: u32,

    /// Timeout for a single query attempt in milliseconds
    #[serde(default = "default_dns_attempt_timeout")]
    pub attempt_timeout_ms: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            server: default_dns_server(),
            port: default_dns_port(),
            domain: default_dns_domain(),
            attempts: default_dns_attempts(),
            attempt_timeout_ms: default_dns_attempt_timeout(),
        }
    }
}

impl DnsConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Socket address of the DNS server, looking the host up if it is not an IP
    pub async fn server_addr(&self) -> anyhow::Result<SocketAddr> {
        if let Ok(ip) = self.server.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        tokio::net::lookup_host((self.server.as_str(), self.port))
            .await
            .map_err(|e| anyhow::anyhow!("Cannot resolve DNS server '{}': {}", self.server, e))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("DNS server '{}' has no addresses", self.server))
    }

    fn server_is_well_formed(&self) -> bool {
        self.server.parse::<IpAddr>().is_ok()
            || self.server.split('.').all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceDefaults {
    /// Deadline for resolving and forwarding a single request, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Time a stopping service waits for in-flight connections, in seconds
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Largest request body a service accepts, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServiceDefaults {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

/// A service creation request, either from the config file or the admin API
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub service_name: String,
    pub stack_name: String,
    pub public_port: u16,
    pub internal_port: u16,
}

impl ServiceConfig {
    pub fn new(service_name: &str, stack_name: &str, public_port: u16, internal_port: u16) -> Self {
        Self {
            service_name: service_name.to_string(),
            stack_name: stack_name.to_string(),
            public_port,
            internal_port,
        }
    }

    /// Registry key, `stack/service`
    pub fn identifier(&self) -> String {
        format!("{}/{}", self.stack_name, self.service_name)
    }

    /// Validate names and ports
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [("service_name", &self.service_name), ("stack_name", &self.stack_name)] {
            if value.is_empty() {
                return Err(format!("'{}' must not be empty", field));
            }
            // Names become DNS labels and path segments
            if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                return Err(format!(
                    "'{}' may only contain alphanumerics, '-' and '_', got '{}'",
                    field, value
                ));
            }
            if value.len() > 63 {
                return Err(format!("'{}' exceeds 63 characters", field));
            }
        }

        if self.public_port == 0 {
            return Err("'public_port' must be greater than 0".to_string());
        }
        if self.internal_port == 0 {
            return Err("'internal_port' must be greater than 0".to_string());
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    10512
}

fn default_dns_server() -> String {
    "8.8.8.8".to_string()
}

fn default_dns_port() -> u16 {
    53
}

fn default_dns_domain() -> String {
    "mikrodock".to_string()
}

fn default_dns_attempts() -> u32 {
    3
}

fn default_dns_attempt_timeout() -> u64 {
    2000 // 2 seconds per query
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.dns.server.is_empty() {
            errors.push("dns.server must not be empty".to_string());
        } else if !self.dns.server_is_well_formed() {
            errors.push(format!("dns.server '{}' is neither an IP nor a hostname", self.dns.server));
        }
        if self.dns.domain.is_empty() {
            errors.push("dns.domain must not be empty".to_string());
        }
        if self.dns.attempts == 0 {
            errors.push("dns.attempts must be at least 1".to_string());
        }
        if self.dns.attempt_timeout_ms == 0 {
            errors.push("dns.attempt_timeout_ms must be greater than 0".to_string());
        }
        if self.defaults.request_timeout_secs == 0 {
            errors.push("defaults.request_timeout_secs must be greater than 0".to_string());
        }
        if self.defaults.shutdown_grace_period_secs == 0 {
            errors.push("defaults.shutdown_grace_period_secs must be greater than 0".to_string());
        }
        if self.defaults.max_body_bytes == 0 {
            errors.push("defaults.max_body_bytes must be greater than 0".to_string());
        }

        let mut ports = HashSet::new();
        ports.insert(self.server.admin_port);
        for service in &self.services {
            if let Err(e) = service.validate() {
                errors.push(format!("Service '{}': {}", service.identifier(), e));
            }
            if !ports.insert(service.public_port) {
                errors.push(format!(
                    "Service '{}': public_port {} is already used",
                    service.identifier(),
                    service.public_port
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
