//! Backend address resolution
//!
//! Each service's backend is found by an A-record query for
//! `<service>.<stack>.<domain>` against a single configured DNS server.
//! Queries are sent over UDP and retried a bounded number of times.

use crate::config::DnsConfig;
use crate::error::{ResolveError, ResolveResult};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Largest DNS message accepted over UDP (EDNS0 default)
const MAX_UDP_MESSAGE: usize = 4096;

/// Build the lookup name for a service
pub fn lookup_name(service_name: &str, stack_name: &str, domain: &str) -> String {
    format!("{}.{}.{}", service_name, stack_name, domain)
}

/// Resolves lookup names to IPv4 addresses through one DNS server
#[derive(Debug, Clone)]
pub struct Resolver {
    server: SocketAddr,
    attempts: u32,
    attempt_timeout: Duration,
}

impl Resolver {
    pub fn new(server: SocketAddr, attempts: u32, attempt_timeout: Duration) -> Self {
        Self {
            server,
            attempts: attempts.max(1),
            attempt_timeout,
        }
    }

    pub async fn from_config(config: &DnsConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            config.server_addr().await?,
            config.attempts,
            config.attempt_timeout(),
        ))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Resolve `name` to the first A record in the answer.
    ///
    /// Transport failures and timeouts are retried; an answer without any A
    /// record fails immediately.
    pub async fn resolve(&self, name: &str) -> ResolveResult {
        let fqdn = Name::from_ascii(format!("{}.", name.trim_end_matches('.')))?;
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            let id = query_id();
            let query = build_query(id, fqdn.clone())?;

            match tokio::time::timeout(self.attempt_timeout, self.exchange(&query, id)).await {
                Ok(Ok(response)) => {
                    return first_a_record(&response)
                        .ok_or_else(|| ResolveError::NoAnswer(name.to_string()));
                }
                Ok(Err(e)) => {
                    warn!(name, attempt, error = %e, "DNS query failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(
                        name,
                        attempt,
                        timeout_ms = self.attempt_timeout.as_millis() as u64,
                        "DNS query timed out"
                    );
                    last_error = "timed out".to_string();
                }
            }
        }

        Err(ResolveError::Exhausted {
            name: name.to_string(),
            attempts: self.attempts,
            last: last_error,
        })
    }

    /// Send one query and wait for the response carrying the same ID
    async fn exchange(&self, query: &[u8], id: u16) -> Result<Message, ResolveError> {
        let local: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.server).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        loop {
            let n = socket.recv(&mut buf).await?;
            let response = Message::from_vec(&buf[..n])?;
            if response.id() == id && response.message_type() == MessageType::Response {
                return Ok(response);
            }
            debug!(expected = id, got = response.id(), "Ignoring unrelated DNS message");
        }
    }
}

fn query_id() -> u16 {
    rand::random::<u16>()
}

fn build_query(id: u16, name: Name) -> Result<Vec<u8>, ResolveError> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));
    Ok(message.to_vec()?)
}

fn first_a_record(response: &Message) -> Option<Ipv4Addr> {
    // CNAMEs ahead of the A record are skipped
    response.answers().iter().find_map(|record| match record.data() {
        Some(RData::A(a)) => Some(a.0),
        _ => None,
    })
}
