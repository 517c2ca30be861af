//! Read access to protocol instances.
//!
//! Fetching one instance (`GET /npl/{package}/{Protocol}/{id}/`) and paging
//! through a protocol's instances (`GET /npl/{package}/{Protocol}/`). Both
//! go through the resilient transport like any compiled tool.

use crate::http::HttpMethod;
use crate::tool::validate_path_segment;
use crate::transport::{CallRequest, ResilientTransport};
use nplbridge_types::error::{BridgeError, BridgeResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Default page size of an instance query.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// One page of an instance listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceQuery {
    /// Zero-based page index.
    pub page: u32,
    pub size: u32,
    /// Extra query parameters passed through to the engine.
    pub filters: BTreeMap<String, String>,
}

impl Default for InstanceQuery {
    fn default() -> Self {
        Self {
            page: 0,
            size: DEFAULT_PAGE_SIZE,
            filters: BTreeMap::new(),
        }
    }
}

impl InstanceQuery {
    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    pub fn filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(name.into(), value.into());
        self
    }
}

/// Reads protocol instances from the engine.
pub struct InstanceReader {
    transport: Arc<ResilientTransport>,
    engine_url: String,
}

impl InstanceReader {
    pub fn new(transport: Arc<ResilientTransport>, engine_url: &str) -> Self {
        Self {
            transport,
            engine_url: engine_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch one instance by id.
    pub async fn get(
        &self,
        package: &str,
        protocol: &str,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> BridgeResult<Value> {
        validate_path_segment("instance_id", instance_id)?;
        let url = format!("{}{instance_id}/", self.collection_url(package, protocol)?);
        let request = CallRequest::new(
            format!("{}/{protocol}.get", package.trim_matches('/')),
            HttpMethod::Get,
            url,
        );
        debug!(package, protocol, instance_id, "Reading instance");
        self.transport.call(&request, cancel).await
    }

    /// Fetch one page of a protocol's instances.
    pub async fn query(
        &self,
        package: &str,
        protocol: &str,
        query: &InstanceQuery,
        cancel: &CancellationToken,
    ) -> BridgeResult<Value> {
        let base = self.collection_url(package, protocol)?;
        let mut url = Url::parse(&base)
            .map_err(|e| BridgeError::Config(format!("invalid engine URL '{base}': {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("page", &query.page.to_string())
                .append_pair("size", &query.size.to_string());
            for (name, value) in &query.filters {
                pairs.append_pair(name, value);
            }
        }
        let request = CallRequest::new(
            format!("{}/{protocol}.query", package.trim_matches('/')),
            HttpMethod::Get,
            url.to_string(),
        );
        debug!(package, protocol, page = query.page, size = query.size, "Querying instances");
        self.transport.call(&request, cancel).await
    }

    fn collection_url(&self, package: &str, protocol: &str) -> BridgeResult<String> {
        let package = package.trim_matches('/');
        if package.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "package must not be empty".to_string(),
            ));
        }
        validate_path_segment("protocol", protocol)?;
        Ok(format!("{}/npl/{package}/{protocol}/", self.engine_url))
    }
}

/// Instances on a query page: the `items` array, or the body itself when
/// the engine answers with a bare array.
pub fn page_items(page: &Value) -> &[Value] {
    match page {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    }
}
