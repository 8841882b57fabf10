//! Edgegate - a single-binary edge gateway
//!
//! This library provides:
//! - Host and path dispatch between local static files, a password-gated
//!   file tree and per-host reverse proxying
//! - Basic Auth with per-user regular-expression allowlists
//! - Security headers, cache headers, gzip/deflate compression and a
//!   combined-format access log
//! - On-demand TLS certificates via ACME HTTP-01, one issuance per hostname
//!   at a time, with an HTTP to HTTPS redirect on the plaintext port
//! - Atomically swappable configuration reloaded on SIGHUP or via the
//!   operator API

pub mod acme;
pub mod admin;
pub mod body;
pub mod config;
pub mod error;
pub mod files;
pub mod gate;
pub mod middleware;
pub mod proxy;
pub mod router;
pub mod server;
pub mod store;
