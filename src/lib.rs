//! Hostgate - a host-routed HTTP/HTTPS reverse proxy and redirector
//!
//! This crate provides:
//! - Host + path routing over an ordered entry table, with `*.domain` wildcards
//! - A per-entry policy pipeline: basic auth, redirects, CORS, forwarding
//! - Streaming request/response forwarding with `X-Forwarded-*` rewriting
//! - WebSocket upgrade tunneling
//! - SNI-driven certificate selection with subdomain fallback and timed reload

pub mod certificate;
pub mod forward;
pub mod proxy;
pub mod routes;

pub use certificate::CertificateStore;
pub use forward::{empty_body, full_body, ProxyBody};
pub use proxy::{FallbackHandler, ProxyObserver, ProxyServer, Settings};
pub use routes::{RouteTable, RoutingEntry};
