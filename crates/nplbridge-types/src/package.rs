//! Deployed package descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A deployed protocol package and where its interface description lives.
///
/// Immutable once produced; a refresh produces a new descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    /// Package name, possibly with path segments (e.g. `objects/iou`).
    pub package_name: String,
    /// Absolute URL of the package's OpenAPI description.
    pub spec_url: String,
    /// When this descriptor was produced.
    pub fetched_at: DateTime<Utc>,
}

impl PackageDescriptor {
    /// Build the descriptor for `package` served by the engine at `engine_url`.
    pub fn for_engine(engine_url: &str, package: &str) -> Self {
        Self {
            package_name: package.to_string(),
            spec_url: spec_url(engine_url, package),
            fetched_at: Utc::now(),
        }
    }
}

/// URL of the OpenAPI description for `package`.
pub fn spec_url(engine_url: &str, package: &str) -> String {
    format!(
        "{}/npl/{}/-/openapi.json",
        engine_url.trim_end_matches('/'),
        package.trim_matches('/')
    )
}

/// Normalize a package name for use inside a tool name.
///
/// Path separators, hyphens and dots become underscores.
pub fn normalize_package_name(package: &str) -> String {
    package
        .trim_matches('/')
        .chars()
        .map(|c| match c {
            '/' | '-' | '.' => '_',
            other => other,
        })
        .collect()
}
