//! Bridge configuration types.
//!
//! Every field has a serde default so a partial (or empty) config file
//! deserializes into a usable configuration.

use serde::{Deserialize, Serialize};

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Engine base URL.
    pub engine_url: String,
    /// Path of the engine's Swagger UI index, scraped for package specs.
    pub swagger_ui_path: String,
    /// Operator-supplied package list, used when scraping finds nothing.
    pub packages: Vec<String>,
    /// JSON files of the form `{"packages": [...]}` checked before `packages`.
    pub package_files: Vec<String>,
    /// How bearer credentials are obtained.
    pub auth: AuthConfig,
    /// Tool cache time-to-live in seconds.
    pub cache_ttl_secs: u64,
    /// Per-attempt request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Transport retry policy.
    pub retry: RetrySettings,
    /// A credential expiring within this many seconds is treated as expired.
    pub refresh_margin_secs: u64,
    /// Records kept per agent in the instance memory.
    pub memory_capacity: usize,
    /// Separator used when flattening nested field paths into parameter names.
    pub name_separator: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            engine_url: "http://localhost:12000".to_string(),
            swagger_ui_path: "/swagger-ui/".to_string(),
            packages: Vec::new(),
            package_files: vec![
                "npl-packages.json".to_string(),
                "public/npl-packages.json".to_string(),
            ],
            auth: AuthConfig::default(),
            cache_ttl_secs: 300,
            request_timeout_secs: 30,
            retry: RetrySettings::default(),
            refresh_margin_secs: 30,
            memory_capacity: 256,
            name_separator: "_".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Engine URL without a trailing slash.
    pub fn engine_base(&self) -> &str {
        self.engine_url.trim_end_matches('/')
    }

    /// Full URL of the Swagger UI index page.
    pub fn swagger_ui_url(&self) -> String {
        let path = self.swagger_ui_path.trim_start_matches('/');
        format!("{}/{}", self.engine_base(), path)
    }

    /// Identity provider URL for keycloak auth.
    ///
    /// An explicit URL wins. Otherwise a local engine on port 12000 implies
    /// the provider on port 11000 of the same host.
    pub fn keycloak_url(&self) -> Option<String> {
        if let AuthConfig::Keycloak { url: Some(url), .. } = &self.auth {
            if !url.trim().is_empty() {
                return Some(url.trim_end_matches('/').to_string());
            }
        }
        let engine = self.engine_base();
        if engine.contains("localhost") || engine.contains("127.0.0.1") {
            return Some(engine.replace(":12000", ":11000"));
        }
        None
    }

    /// Realm for keycloak auth, `poc` when unset.
    pub fn keycloak_realm(&self) -> String {
        match &self.auth {
            AuthConfig::Keycloak {
                realm: Some(realm), ..
            } if !realm.is_empty() => realm.clone(),
            _ => "poc".to_string(),
        }
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.engine_url.trim().is_empty() {
            errors.push("engine_url is required".to_string());
        } else if let Err(e) = url::Url::parse(&self.engine_url) {
            errors.push(format!("engine_url '{}' is not a valid URL: {e}", self.engine_url));
        }

        match &self.auth {
            AuthConfig::Keycloak {
                username, password, ..
            } => {
                if self.keycloak_url().is_none() {
                    errors.push("keycloak url is required for keycloak auth".to_string());
                }
                if username.is_empty() {
                    errors.push("username is required for keycloak auth".to_string());
                }
                if password.is_empty() {
                    errors.push("password is required for keycloak auth".to_string());
                }
            }
            AuthConfig::Token { token } => {
                if token.is_empty() {
                    errors.push("token is required for token auth".to_string());
                }
            }
            AuthConfig::None => {}
        }

        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.min_delay_ms must not exceed retry.max_delay_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            errors.push("retry.jitter must be between 0.0 and 1.0".to_string());
        }
        if self.memory_capacity == 0 {
            errors.push("memory_capacity must be at least 1".to_string());
        }
        if self.name_separator.is_empty() {
            errors.push("name_separator must not be empty".to_string());
        }

        errors
    }
}

/// How the bridge authenticates against the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthConfig {
    /// OAuth2 password grant against a Keycloak realm.
    Keycloak {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        realm: Option<String>,
        #[serde(default = "default_client_id")]
        client_id: String,
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
        /// Host header sent to the token endpoint, so the issued tokens carry
        /// the issuer the engine expects (e.g. `keycloak:11000` in compose).
        #[serde(default)]
        host_header: Option<String>,
    },
    /// Pre-issued bearer token.
    Token {
        #[serde(default)]
        token: String,
    },
    /// No Authorization header.
    #[default]
    None,
}

impl AuthConfig {
    /// Short method name for logs.
    pub fn method(&self) -> &'static str {
        match self {
            AuthConfig::Keycloak { .. } => "keycloak",
            AuthConfig::Token { .. } => "token",
            AuthConfig::None => "none",
        }
    }
}

fn default_client_id() -> String {
    "npl-client".to_string()
}

/// Retry policy for transient transport failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Minimum delay between retries in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Upper bound on the sum of all backoff sleeps for one call.
    pub max_total_wait_ms: u64,
    /// Jitter fraction (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 500,
            max_delay_ms: 30_000,
            max_total_wait_ms: 60_000,
            jitter: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.engine_url, "http://localhost:12000");
        assert_eq!(config.cache_ttl_secs, 300);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.name_separator, "_");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_toml() {
        let config: BridgeConfig = toml::from_str(
            r#"
            engine_url = "https://engine.example.com/"
            packages = ["commerce"]

            [retry]
            max_attempts = 5

            [auth]
            method = "keycloak"
            url = "https://id.example.com"
            username = "alice"
            password = "secret"
        "#,
        )
        .unwrap();
        assert_eq!(config.engine_base(), "https://engine.example.com");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.min_delay_ms, 500);
        assert_eq!(config.keycloak_realm(), "poc");
        assert_eq!(config.keycloak_url().as_deref(), Some("https://id.example.com"));
        match &config.auth {
            AuthConfig::Keycloak { client_id, .. } => assert_eq!(client_id, "npl-client"),
            other => panic!("unexpected auth: {other:?}"),
        }
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_keycloak_url_fallback() {
        let config = BridgeConfig {
            auth: AuthConfig::Keycloak {
                url: None,
                realm: Some("demo".to_string()),
                client_id: default_client_id(),
                username: "u".to_string(),
                password: "p".to_string(),
                host_header: None,
            },
            ..Default::default()
        };
        assert_eq!(
            config.keycloak_url().as_deref(),
            Some("http://localhost:11000")
        );
        assert_eq!(config.keycloak_realm(), "demo");

        let remote = BridgeConfig {
            engine_url: "https://engine.example.com".to_string(),
            ..config
        };
        assert!(remote.keycloak_url().is_none());
        assert!(remote
            .validate()
            .iter()
            .any(|e| e.contains("keycloak url")));
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let config = BridgeConfig {
            engine_url: "not a url".to_string(),
            auth: AuthConfig::Token {
                token: String::new(),
            },
            memory_capacity: 0,
            ..Default::default()
        };
        let errors = config.validate();
        assert_eq!(errors.len(), 3, "{errors:?}");
    }

    #[test]
    fn test_swagger_ui_url() {
        let config = BridgeConfig {
            engine_url: "http://e:1/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.swagger_ui_url(), "http://e:1/swagger-ui/");
    }
}
