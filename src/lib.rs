//! Stackgate - A reverse proxy manager with DNS-resolved backends
//!
//! This library provides a registry of independently listening proxies that:
//! - Bind one public port per service, created and deleted at runtime
//! - Resolve `<service>.<stack>.<domain>` through DNS on every request
//! - Forward each request in a single round trip to the resolved backend
//! - Drain in-flight connections within a grace period when stopped
//! - Expose a small JSON management API for create, list and delete

pub mod admin;
pub mod config;
pub mod error;
pub mod manager;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod upstream;
