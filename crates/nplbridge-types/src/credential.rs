//! Bearer credentials issued by the identity provider.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Length of the hex fingerprint used as a credential identity key.
const FINGERPRINT_LEN: usize = 10;

/// Upper bound on a token lifetime (ten years).
const MAX_EXPIRES_IN_SECS: u64 = 315_360_000;

/// A bearer credential plus its optional refresh token and expiry.
///
/// Token material is held in zeroizing buffers and never printed by `Debug`.
#[derive(Clone)]
pub struct Credential {
    access_token: Zeroizing<String>,
    refresh_token: Option<Zeroizing<String>>,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Create a credential from raw parts.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_token: Zeroizing::new(access_token.into()),
            refresh_token: refresh_token.map(Zeroizing::new),
            expires_at,
        }
    }

    /// A credential that never expires and carries no refresh token.
    pub fn static_token(access_token: impl Into<String>) -> Self {
        Self::new(access_token, None, None)
    }

    /// The empty credential used when authentication is disabled.
    pub fn anonymous() -> Self {
        Self::new(String::new(), None, None)
    }

    /// Build a credential from a token-endpoint response received at `now`.
    pub fn from_token_response(response: TokenResponse, now: DateTime<Utc>) -> Self {
        let expires_at = response
            .expires_in
            .map(|secs| now + Duration::seconds(secs.min(MAX_EXPIRES_IN_SECS) as i64));
        Self::new(response.access_token, response.refresh_token, expires_at)
    }

    /// The bearer access token.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// The refresh token, if the provider issued one.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_ref().map(|t| t.as_str())
    }

    /// When the access token expires, if known.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the token is expired at `now`, treating tokens that expire
    /// within `margin` as already expired. Tokens without expiry never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => now + margin >= expires_at,
            None => false,
        }
    }

    /// Principal named by the access token's claims, when the token is a
    /// JWT: `sub`, else `azp` with `preferred_username`.
    ///
    /// The signature is not checked; the value only keys caches.
    pub fn subject(&self) -> Option<String> {
        let mut parts = self.access_token.split('.');
        let (Some(_), Some(payload), Some(_), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let claims: Value = serde_json::from_slice(&bytes).ok()?;
        let claim = |name: &str| {
            claims
                .get(name)
                .and_then(Value::as_str)
                .filter(|v| !v.is_empty())
        };
        if let Some(sub) = claim("sub") {
            return Some(sub.to_string());
        }
        let azp = claim("azp")?;
        Some(format!("{azp}/{}", claim("preferred_username").unwrap_or("")))
    }

    /// Whether this credential carries no token at all.
    pub fn is_anonymous(&self) -> bool {
        self.access_token.is_empty()
    }

    /// Value for the `Authorization` header, or `None` when anonymous.
    pub fn bearer_header(&self) -> Option<String> {
        if self.is_anonymous() {
            None
        } else {
            Some(format!("Bearer {}", self.access_token.as_str()))
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// JSON body returned by the identity provider's token endpoint.
///
/// Accepts both OAuth2 snake_case and camelCase field names.
#[derive(Deserialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expiresIn")]
    pub expires_in: Option<u64>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Short, stable fingerprint of a principal or token, safe to log.
pub fn fingerprint(input: &str) -> String {
    if input.is_empty() {
        return "no_auth".to_string();
    }
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_with_margin() {
        let now = Utc::now();
        let cred = Credential::new("tok", None, Some(now + Duration::seconds(20)));
        assert!(!cred.is_expired_at(now, Duration::zero()));
        assert!(cred.is_expired_at(now, Duration::seconds(30)));

        let forever = Credential::static_token("tok");
        assert!(!forever.is_expired_at(now, Duration::seconds(3600)));
    }

    #[test]
    fn test_token_response_aliases() {
        let snake: TokenResponse = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r","expires_in":300}"#,
        )
        .unwrap();
        assert_eq!(snake.access_token, "a");
        assert_eq!(snake.refresh_token.as_deref(), Some("r"));

        let camel: TokenResponse =
            serde_json::from_str(r#"{"accessToken":"b","expiresIn":60}"#).unwrap();
        assert_eq!(camel.access_token, "b");
        assert!(camel.refresh_token.is_none());
        assert_eq!(camel.expires_in, Some(60));
    }

    #[test]
    fn test_from_token_response_sets_expiry() {
        let now = Utc::now();
        let resp = TokenResponse {
            access_token: "a".to_string(),
            refresh_token: Some("r".to_string()),
            expires_in: Some(300),
        };
        let cred = Credential::from_token_response(resp, now);
        assert_eq!(cred.expires_at(), Some(now + Duration::seconds(300)));
        assert_eq!(cred.refresh_token(), Some("r"));
        assert_eq!(cred.bearer_header().as_deref(), Some("Bearer a"));
    }

    #[test]
    fn test_debug_redacts_token() {
        let cred = Credential::new("super-secret", Some("also-secret".to_string()), None);
        let printed = format!("{cred:?}");
        assert!(!printed.contains("super-secret"));
        assert!(!printed.contains("also-secret"));
    }

    fn jwt(claims: &str) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256"}"#),
            URL_SAFE_NO_PAD.encode(claims)
        )
    }

    #[test]
    fn test_subject_from_jwt_claims() {
        let cred = Credential::static_token(jwt(r#"{"sub":"f3a1","azp":"poc"}"#));
        assert_eq!(cred.subject().as_deref(), Some("f3a1"));

        let cred = Credential::static_token(jwt(r#"{"azp":"poc","preferred_username":"alice"}"#));
        assert_eq!(cred.subject().as_deref(), Some("poc/alice"));

        assert!(Credential::static_token(jwt(r#"{"scope":"openid"}"#)).subject().is_none());
        assert!(Credential::static_token("opaque-token").subject().is_none());
        assert!(Credential::static_token("a.!!!.c").subject().is_none());
        assert!(Credential::anonymous().subject().is_none());
    }

    #[test]
    fn test_anonymous_has_no_header() {
        assert!(Credential::anonymous().bearer_header().is_none());
    }

    #[test]
    fn test_fingerprint() {
        assert_eq!(fingerprint(""), "no_auth");
        let a = fingerprint("alice@poc");
        assert_eq!(a.len(), 10);
        assert_eq!(a, fingerprint("alice@poc"));
        assert_ne!(a, fingerprint("bob@poc"));
    }
}
