//! Identity providers: where bearer credentials come from.
//!
//! - [`KeycloakProvider`]: OAuth2 password grant with refresh-token renewal.
//! - [`StaticTokenProvider`]: a pre-issued token that is never renewed.
//! - [`NoAuthProvider`]: no credential at all (local development engines).

use crate::http::{HttpBackend, HttpMethod, HttpRequest, HttpResponse, TransportFailure};
use crate::retry::{retry_async, RetryConfig};
use async_trait::async_trait;
use chrono::Utc;
use nplbridge_types::config::{AuthConfig, BridgeConfig};
use nplbridge_types::credential::{fingerprint, Credential, TokenResponse};
use nplbridge_types::error::{BridgeError, BridgeResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Token endpoint timeout.
const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest error body echoed into an error message.
const MAX_ERROR_BODY: usize = 200;

/// Source of bearer credentials.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Stable, non-secret identity of the principal the credentials belong to.
    fn identity(&self) -> String;

    /// Obtain a fresh credential from scratch.
    async fn obtain(&self) -> BridgeResult<Credential>;

    /// Renew a credential using its refresh token.
    async fn refresh(&self, refresh_token: &str) -> BridgeResult<Credential>;

    /// Whether [`obtain`](Self::obtain) can be repeated without user input.
    fn can_reauthenticate(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Keycloak
// ---------------------------------------------------------------------------

/// OAuth2 password-grant provider for a Keycloak realm.
pub struct KeycloakProvider {
    backend: Arc<dyn HttpBackend>,
    token_url: String,
    realm: String,
    client_id: String,
    username: String,
    password: Zeroizing<String>,
    host_header: Option<String>,
    retry: RetryConfig,
}

impl KeycloakProvider {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        keycloak_url: &str,
        realm: &str,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Self {
        Self {
            backend,
            token_url: format!(
                "{}/realms/{}/protocol/openid-connect/token",
                keycloak_url.trim_end_matches('/'),
                realm
            ),
            realm: realm.to_string(),
            client_id: client_id.to_string(),
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
            host_header: None,
            retry: RetryConfig::for_token_endpoint(),
        }
    }

    /// Send `Host: <host>` to the token endpoint.
    pub fn with_host_header(mut self, host: Option<String>) -> Self {
        self.host_header = host;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    async fn token_call(
        &self,
        fields: Vec<(String, String)>,
    ) -> Result<HttpResponse, (TokenCallError, u32)> {
        retry_async(
            &self.retry,
            || {
                let mut request =
                    HttpRequest::new(HttpMethod::Post, &self.token_url, TOKEN_TIMEOUT)
                        .header("Accept", "application/json")
                        .form(fields.clone());
                if let Some(host) = &self.host_header {
                    request = request.header("Host", host.clone());
                }
                async move {
                    match self.backend.send(request).await {
                        Ok(resp) if resp.is_success() => Ok(resp),
                        Ok(resp) => Err(TokenCallError::Status(resp)),
                        Err(e) => Err(TokenCallError::Transport(e)),
                    }
                }
            },
            TokenCallError::is_transient,
            TokenCallError::retry_after_ms,
        )
        .await
        .map_err(|e| (e.error, e.attempts))
    }

    fn parse_token(&self, resp: &HttpResponse) -> BridgeResult<Credential> {
        let token: TokenResponse = serde_json::from_str(&resp.body).map_err(|e| {
            BridgeError::Authentication(format!("Invalid token response from Keycloak: {e}"))
        })?;
        if token.access_token.is_empty() {
            return Err(BridgeError::Authentication(
                "Keycloak returned an empty access token".to_string(),
            ));
        }
        Ok(Credential::from_token_response(token, Utc::now()))
    }
}

#[async_trait]
impl IdentityProvider for KeycloakProvider {
    fn name(&self) -> &'static str {
        "keycloak"
    }

    fn identity(&self) -> String {
        fingerprint(&format!("{}@{}", self.username, self.realm))
    }

    async fn obtain(&self) -> BridgeResult<Credential> {
        info!(user = %self.username, realm = %self.realm, "Authenticating with Keycloak");
        let fields = vec![
            ("grant_type".to_string(), "password".to_string()),
            ("username".to_string(), self.username.clone()),
            ("password".to_string(), self.password.to_string()),
            ("scope".to_string(), "openid profile email".to_string()),
            ("client_id".to_string(), self.client_id.clone()),
        ];
        let resp = self
            .token_call(fields)
            .await
            .map_err(|(e, attempts)| {
                e.into_bridge_error("Keycloak authentication failed", attempts)
            })?;
        let credential = self.parse_token(&resp)?;
        info!(
            user = %self.username,
            expires_at = ?credential.expires_at(),
            "Keycloak authentication successful"
        );
        Ok(credential)
    }

    async fn refresh(&self, refresh_token: &str) -> BridgeResult<Credential> {
        debug!(user = %self.username, "Refreshing access token");
        let fields = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
            ("client_id".to_string(), self.client_id.clone()),
        ];
        let resp = self
            .token_call(fields)
            .await
            .map_err(|(e, attempts)| e.into_bridge_error("Token refresh failed", attempts))?;
        self.parse_token(&resp)
    }

    fn can_reauthenticate(&self) -> bool {
        true
    }
}

/// Failure of one token-endpoint call.
#[derive(Debug)]
enum TokenCallError {
    Transport(TransportFailure),
    Status(HttpResponse),
}

impl std::fmt::Display for TokenCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenCallError::Transport(e) => write!(f, "{e}"),
            TokenCallError::Status(resp) => write!(f, "status {}", resp.status),
        }
    }
}

impl TokenCallError {
    fn is_transient(&self) -> bool {
        match self {
            TokenCallError::Transport(e) => e.is_transient(),
            TokenCallError::Status(resp) => resp.status == 429 || resp.status >= 500,
        }
    }

    fn retry_after_ms(&self) -> Option<u64> {
        match self {
            TokenCallError::Status(resp) => resp.retry_after_ms,
            TokenCallError::Transport(_) => None,
        }
    }

    fn into_bridge_error(self, context: &str, attempts: u32) -> BridgeError {
        let transient = self.is_transient();
        match self {
            TokenCallError::Status(resp) if transient => BridgeError::TransientExhausted {
                status: Some(resp.status),
                message: format!("{context}: {}", truncate(&resp.body)),
                attempts,
            },
            TokenCallError::Status(resp) => BridgeError::Authentication(format!(
                "{context}: status {} - {}",
                resp.status,
                truncate(&resp.body)
            )),
            TokenCallError::Transport(e) if transient => BridgeError::TransientExhausted {
                status: None,
                message: format!("{context}: {e}"),
                attempts,
            },
            TokenCallError::Transport(e) => BridgeError::Authentication(format!("{context}: {e}")),
        }
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

// ---------------------------------------------------------------------------
// Static token / no auth
// ---------------------------------------------------------------------------

/// A pre-issued bearer token (service accounts, CI).
pub struct StaticTokenProvider {
    token: Zeroizing<String>,
}

impl StaticTokenProvider {
    pub fn new(token: &str) -> Self {
        Self {
            token: Zeroizing::new(token.to_string()),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    fn name(&self) -> &'static str {
        "token"
    }

    fn identity(&self) -> String {
        fingerprint(&self.token)
    }

    async fn obtain(&self) -> BridgeResult<Credential> {
        info!("Using provided token for authentication");
        Ok(Credential::static_token(self.token.to_string()))
    }

    async fn refresh(&self, _refresh_token: &str) -> BridgeResult<Credential> {
        Err(BridgeError::AuthExpired(
            "static token cannot be refreshed".to_string(),
        ))
    }

    fn can_reauthenticate(&self) -> bool {
        false
    }
}

/// No Authorization header at all.
#[derive(Debug, Default)]
pub struct NoAuthProvider;

#[async_trait]
impl IdentityProvider for NoAuthProvider {
    fn name(&self) -> &'static str {
        "none"
    }

    fn identity(&self) -> String {
        fingerprint("")
    }

    async fn obtain(&self) -> BridgeResult<Credential> {
        warn!("Using no authentication - not recommended for production");
        Ok(Credential::anonymous())
    }

    async fn refresh(&self, _refresh_token: &str) -> BridgeResult<Credential> {
        Err(BridgeError::AuthExpired(
            "engine requires authentication but none is configured".to_string(),
        ))
    }

    fn can_reauthenticate(&self) -> bool {
        false
    }
}

/// Build the provider selected by `config.auth`.
pub fn provider_from_config(
    config: &BridgeConfig,
    backend: Arc<dyn HttpBackend>,
) -> BridgeResult<Arc<dyn IdentityProvider>> {
    match &config.auth {
        AuthConfig::Keycloak {
            client_id,
            username,
            password,
            host_header,
            ..
        } => {
            let url = config.keycloak_url().ok_or_else(|| {
                BridgeError::Config("keycloak url is required for keycloak auth".to_string())
            })?;
            if username.is_empty() || password.is_empty() {
                return Err(BridgeError::Config(
                    "username and password are required for keycloak auth".to_string(),
                ));
            }
            let provider = KeycloakProvider::new(
                backend,
                &url,
                &config.keycloak_realm(),
                client_id,
                username,
                password,
            )
            .with_host_header(host_header.clone());
            Ok(Arc::new(provider))
        }
        AuthConfig::Token { token } => {
            if token.is_empty() {
                return Err(BridgeError::Config(
                    "token is required for token auth".to_string(),
                ));
            }
            Ok(Arc::new(StaticTokenProvider::new(token)))
        }
        AuthConfig::None => Ok(Arc::new(NoAuthProvider)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ReqwestBackend;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            min_delay_ms: 1,
            max_delay_ms: 5,
            max_total_wait_ms: 100,
            jitter: 0.0,
        }
    }

    async fn keycloak(server: &MockServer) -> KeycloakProvider {
        KeycloakProvider::new(
            Arc::new(ReqwestBackend::new().unwrap()),
            &server.uri(),
            "poc",
            "npl-client",
            "alice",
            "secret",
        )
        .with_retry(fast_retry())
    }

    #[tokio::test]
    async fn test_keycloak_password_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realms/poc/protocol/openid-connect/token"))
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains("username=alice"))
            .and(body_string_contains("client_id=npl-client"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1",
                "refresh_token": "rt-1",
                "expires_in": 300
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = keycloak(&server).await;
        let cred = provider.obtain().await.unwrap();
        assert_eq!(cred.access_token(), "at-1");
        assert_eq!(cred.refresh_token(), Some("rt-1"));
        assert!(cred.expires_at().is_some());
    }

    #[tokio::test]
    async fn test_keycloak_refresh_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2",
                "expires_in": 60
            })))
            .mount(&server)
            .await;

        let provider = keycloak(&server).await;
        let cred = provider.refresh("rt-1").await.unwrap();
        assert_eq!(cred.access_token(), "at-2");
    }

    #[tokio::test]
    async fn test_keycloak_rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = keycloak(&server).await;
        let err = provider.obtain().await.unwrap_err();
        assert!(matches!(err, BridgeError::Authentication(ref m) if m.contains("invalid_grant")));
    }

    #[tokio::test]
    async fn test_keycloak_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let provider = keycloak(&server).await;
        let err = provider.obtain().await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::TransientExhausted {
                status: Some(503),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_static_and_no_auth() {
        let token = StaticTokenProvider::new("tok");
        assert_eq!(token.obtain().await.unwrap().access_token(), "tok");
        assert!(!token.can_reauthenticate());
        assert!(matches!(
            token.refresh("x").await,
            Err(BridgeError::AuthExpired(_))
        ));
        assert_eq!(token.identity().len(), 10);

        let none = NoAuthProvider;
        assert!(none.obtain().await.unwrap().is_anonymous());
        assert_eq!(none.identity(), "no_auth");
    }

    #[test]
    fn test_provider_from_config() {
        let backend: Arc<dyn HttpBackend> = Arc::new(ReqwestBackend::new().unwrap());

        let config = BridgeConfig::default();
        assert_eq!(
            provider_from_config(&config, backend.clone()).unwrap().name(),
            "none"
        );

        let config = BridgeConfig {
            auth: AuthConfig::Token {
                token: String::new(),
            },
            ..Default::default()
        };
        assert!(matches!(
            provider_from_config(&config, backend.clone()),
            Err(BridgeError::Config(_))
        ));

        let config = BridgeConfig {
            auth: AuthConfig::Keycloak {
                url: None,
                realm: None,
                client_id: "npl-client".to_string(),
                username: "alice".to_string(),
                password: "pw".to_string(),
                host_header: None,
            },
            ..Default::default()
        };
        let provider = provider_from_config(&config, backend).unwrap();
        assert_eq!(provider.name(), "keycloak");
        assert!(provider.can_reauthenticate());
    }

    #[test]
    fn test_truncate() {
        let long = "x".repeat(500);
        assert_eq!(truncate(&long).len(), MAX_ERROR_BODY);
        assert_eq!(truncate("short"), "short");
    }
}
