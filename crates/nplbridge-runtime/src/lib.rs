//! Runtime layer of the NPL agent bridge.
//!
//! Credential management, the resilient engine transport, package discovery,
//! schema-to-tool compilation, the compiled-tool cache, instance reads,
//! metrics and health probing. All network I/O goes through [`http::HttpBackend`].

pub mod auth;
pub mod compiler;
pub mod credentials;
pub mod discovery;
pub mod health;
pub mod http;
pub mod instances;
pub mod metrics;
pub mod openapi;
pub mod retry;
pub mod tool;
pub mod tool_cache;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
