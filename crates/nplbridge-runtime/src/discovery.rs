//! Package discovery and spec retrieval.
//!
//! Deployed packages are found by scraping the engine's Swagger UI page for
//! spec URLs of the form `/npl/{package}/-/openapi.json`. When that yields
//! nothing, operator-supplied package files (`{"packages": [...]}`) and the
//! static list from the configuration are consulted, in that order.

use crate::http::HttpMethod;
use crate::openapi::OpenApiDocument;
use crate::transport::{CallRequest, ResilientTransport};
use nplbridge_types::config::BridgeConfig;
use nplbridge_types::error::{BridgeError, BridgeResult};
use nplbridge_types::package::PackageDescriptor;
use regex_lite::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Spec URL pattern inside the Swagger UI page.
const SPEC_URL_PATTERN: &str = r#"/npl/([^"'/]+(?:/[^"'/]+)*)/-/openapi\.json"#;

/// Where a package list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Explicit,
    SwaggerUi,
    PackageFile,
    Static,
}

#[derive(Debug, Deserialize)]
struct PackageFile {
    #[serde(default)]
    packages: Vec<String>,
}

/// Enumerates packages and fetches their OpenAPI descriptions.
pub struct PackageDiscovery {
    transport: Arc<ResilientTransport>,
    engine_url: String,
    swagger_ui_url: String,
    package_files: Vec<PathBuf>,
    static_packages: Vec<String>,
    spec_pattern: Option<Regex>,
}

impl PackageDiscovery {
    pub fn new(transport: Arc<ResilientTransport>, config: &BridgeConfig) -> Self {
        let spec_pattern = match Regex::new(SPEC_URL_PATTERN) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(error = %e, "Invalid spec URL pattern, Swagger UI discovery disabled");
                None
            }
        };
        Self {
            transport,
            engine_url: config.engine_base().to_string(),
            swagger_ui_url: config.swagger_ui_url(),
            package_files: config.package_files.iter().map(PathBuf::from).collect(),
            static_packages: config.packages.clone(),
            spec_pattern,
        }
    }

    pub fn engine_url(&self) -> &str {
        &self.engine_url
    }

    /// List deployed packages.
    ///
    /// A non-empty `explicit` list wins outright. Otherwise the Swagger UI
    /// is scraped, then package files, then the static list; if all are
    /// empty the result is `DiscoveryUnavailable`.
    pub async fn list_packages(
        &self,
        explicit: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> BridgeResult<Vec<String>> {
        Ok(self.discover(explicit, cancel).await?.0)
    }

    /// Like [`list_packages`](Self::list_packages), also reporting the source.
    pub async fn discover(
        &self,
        explicit: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> BridgeResult<(Vec<String>, DiscoverySource)> {
        if let Some(list) = explicit {
            let packages = dedup(list.iter().cloned());
            if !packages.is_empty() {
                return Ok((packages, DiscoverySource::Explicit));
            }
        }

        match self.scrape_swagger_ui(cancel).await {
            Ok(packages) if !packages.is_empty() => {
                info!(count = packages.len(), packages = %packages.join(", "), "Discovered packages from Swagger UI");
                return Ok((packages, DiscoverySource::SwaggerUi));
            }
            Ok(_) => warn!(url = %self.swagger_ui_url, "No packages found in Swagger UI"),
            Err(BridgeError::Cancelled) => return Err(BridgeError::Cancelled),
            Err(e) => warn!(url = %self.swagger_ui_url, error = %e, "Swagger UI discovery failed"),
        }

        let from_files = self.packages_from_files().await;
        if !from_files.is_empty() {
            info!(packages = %from_files.join(", "), "Using packages from package file");
            return Ok((from_files, DiscoverySource::PackageFile));
        }

        let configured = dedup(self.static_packages.iter().cloned());
        if !configured.is_empty() {
            info!(packages = %configured.join(", "), "Using configured packages");
            return Ok((configured, DiscoverySource::Static));
        }

        Err(BridgeError::DiscoveryUnavailable(format!(
            "no packages found at {} nor in package files or configuration",
            self.swagger_ui_url
        )))
    }

    /// Scrape spec URLs from the Swagger UI page (unauthenticated).
    pub async fn scrape_swagger_ui(&self, cancel: &CancellationToken) -> BridgeResult<Vec<String>> {
        let request = CallRequest::new("discovery/swagger-ui", HttpMethod::Get, &self.swagger_ui_url)
            .anonymous();
        let html = self.transport.call_text(&request, cancel).await?;
        Ok(self.extract_packages(&html))
    }

    /// Package names referenced by spec URLs in `html`, sorted and unique.
    pub fn extract_packages(&self, html: &str) -> Vec<String> {
        let Some(re) = &self.spec_pattern else {
            return Vec::new();
        };
        dedup(
            re.captures_iter(html)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string())),
        )
    }

    /// Packages listed in the first readable, non-empty package file.
    pub async fn packages_from_files(&self) -> Vec<String> {
        for path in &self.package_files {
            let Ok(content) = tokio::fs::read_to_string(path).await else {
                continue;
            };
            match serde_json::from_str::<PackageFile>(&content) {
                Ok(file) => {
                    let packages = dedup(file.packages.into_iter());
                    if !packages.is_empty() {
                        debug!(path = %path.display(), "Read package file");
                        return packages;
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Invalid package file"),
            }
        }
        Vec::new()
    }

    /// Descriptor for `package` on this engine, stamped now.
    pub fn describe(&self, package: &str) -> PackageDescriptor {
        PackageDescriptor::for_engine(&self.engine_url, package)
    }

    /// Discover packages and describe each of them.
    pub async fn describe_packages(
        &self,
        explicit: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> BridgeResult<Vec<PackageDescriptor>> {
        let packages = self.list_packages(explicit, cancel).await?;
        Ok(packages.iter().map(|p| self.describe(p)).collect())
    }

    /// Fetch and validate a package's OpenAPI description from the
    /// descriptor's spec URL.
    pub async fn fetch_spec(
        &self,
        package: &str,
        cancel: &CancellationToken,
    ) -> BridgeResult<(PackageDescriptor, OpenApiDocument)> {
        let descriptor = self.describe(package);
        let request = CallRequest::new(
            format!("{package}/-/openapi"),
            HttpMethod::Get,
            &descriptor.spec_url,
        );
        let text = self.transport.call_text(&request, cancel).await?;
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| BridgeError::SpecUnparseable {
                package: package.to_string(),
                reason: format!("invalid JSON: {e}"),
            })?;
        let doc = OpenApiDocument::parse(package, value)?;
        debug!(package, spec_url = %descriptor.spec_url, paths = doc.path_count(), "Fetched spec");
        Ok((descriptor, doc))
    }
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    items
        .map(|p| p.trim().trim_matches('/').to_string())
        .filter(|p| !p.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
