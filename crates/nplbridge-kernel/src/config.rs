//! Configuration loading from `~/.nplbridge/config.toml` with defaults.
//!
//! TOML is the native format. YAML files (`.yaml` / `.yml`) are accepted
//! too, either flat or nested under an `npl:` key. `NPL_*` environment
//! variables override whatever the file says.

use nplbridge_types::config::{AuthConfig, BridgeConfig};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load bridge configuration from a file, with defaults and env overrides.
///
/// A missing, unreadable or unparseable file falls back to defaults.
pub fn load_config(path: Option<&Path>) -> BridgeConfig {
    let mut config = load_config_file(path);
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

/// Load the config file only, without environment overrides.
pub fn load_config_file(path: Option<&Path>) -> BridgeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return BridgeConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return BridgeConfig::default();
        }
    };

    match parse_config(&config_path, &contents) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            BridgeConfig::default()
        }
    }
}

/// Parse config text, choosing the format by file extension.
pub fn parse_config(path: &Path, contents: &str) -> Result<BridgeConfig, String> {
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if !is_yaml {
        return toml::from_str::<BridgeConfig>(contents).map_err(|e| e.to_string());
    }

    let mut value: serde_yaml::Value = serde_yaml::from_str(contents).map_err(|e| e.to_string())?;
    if value.is_null() {
        return Ok(BridgeConfig::default());
    }
    if let Some(nested) = value.get("npl").cloned() {
        value = nested;
    }
    serde_yaml::from_value::<BridgeConfig>(value).map_err(|e| e.to_string())
}

/// Apply `NPL_*` overrides read through `var`.
///
/// `NPL_TOKEN` selects token auth; otherwise `NPL_USERNAME` plus
/// `NPL_PASSWORD` select keycloak auth. `NPL_KEYCLOAK_*` then adjust the
/// keycloak settings.
pub fn apply_env_overrides<F>(config: &mut BridgeConfig, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(url) = get("NPL_ENGINE_URL") {
        config.engine_url = url;
    }

    if let Some(packages) = get("NPL_PACKAGES") {
        config.packages = packages
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
    }

    if let Some(ttl) = get("NPL_CACHE_TTL") {
        match ttl.parse::<f64>() {
            Ok(secs) if secs >= 0.0 && secs.is_finite() => config.cache_ttl_secs = secs as u64,
            _ => warn!(value = %ttl, "Ignoring invalid NPL_CACHE_TTL"),
        }
    }

    if let Some(token) = get("NPL_TOKEN") {
        config.auth = AuthConfig::Token { token };
    } else if let (Some(user), Some(pass)) = (get("NPL_USERNAME"), get("NPL_PASSWORD")) {
        match &mut config.auth {
            AuthConfig::Keycloak {
                username, password, ..
            } => {
                *username = user;
                *password = pass;
            }
            other => {
                *other = AuthConfig::Keycloak {
                    url: None,
                    realm: None,
                    client_id: "npl-client".to_string(),
                    username: user,
                    password: pass,
                    host_header: None,
                };
            }
        }
    }

    if let AuthConfig::Keycloak {
        url,
        realm,
        client_id,
        ..
    } = &mut config.auth
    {
        if let Some(v) = get("NPL_KEYCLOAK_URL") {
            *url = Some(v);
        }
        if let Some(v) = get("NPL_KEYCLOAK_REALM") {
            *realm = Some(v);
        }
        if let Some(v) = get("NPL_KEYCLOAK_CLIENT_ID") {
            *client_id = v;
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    nplbridge_home().join("config.toml")
}

/// Get the default bridge home directory.
pub fn nplbridge_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".nplbridge")
}
