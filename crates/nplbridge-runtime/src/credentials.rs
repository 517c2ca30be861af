//! Credential manager: hands out valid bearer credentials.
//!
//! Readers take a consistent snapshot without waiting. Replacing the
//! credential (login, refresh, re-authentication) happens behind a single
//! async gate, so concurrent expirations trigger one provider call and all
//! waiters observe its result.

use crate::auth::IdentityProvider;
use chrono::Utc;
use nplbridge_types::credential::{fingerprint, Credential};
use nplbridge_types::error::{BridgeError, BridgeResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// A credential together with the generation it was stored under.
///
/// The generation lets a caller that saw a 401 tell whether the credential
/// has already been replaced since it read it.
#[derive(Debug, Clone)]
pub struct CredentialSnapshot {
    pub credential: Arc<Credential>,
    pub generation: u64,
}

/// Owns the current credential for one identity provider.
pub struct CredentialManager {
    provider: Arc<dyn IdentityProvider>,
    current: RwLock<Option<CredentialSnapshot>>,
    generation: AtomicU64,
    refresh_gate: tokio::sync::Mutex<()>,
    margin: chrono::Duration,
}

impl CredentialManager {
    /// Create a manager. `refresh_margin_secs` ahead of expiry a credential
    /// is treated as expired.
    pub fn new(provider: Arc<dyn IdentityProvider>, refresh_margin_secs: u64) -> Self {
        Self {
            provider,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_gate: tokio::sync::Mutex::new(()),
            margin: chrono::Duration::seconds(refresh_margin_secs.min(86_400) as i64),
        }
    }

    /// Non-secret identity of the principal; changes when the principal does.
    ///
    /// The provider's configured principal, qualified by a fingerprint of
    /// the stored token's subject when the token names one.
    pub fn identity(&self) -> String {
        let principal = self.provider.identity();
        match self.snapshot().and_then(|s| s.credential.subject()) {
            Some(subject) => format!("{principal}:{}", fingerprint(&subject)),
            None => principal,
        }
    }

    /// Name of the underlying provider.
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// The stored credential, if any, without validity checks.
    pub fn snapshot(&self) -> Option<CredentialSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether a credential is stored.
    pub fn is_authenticated(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Log in from scratch, replacing any stored credential.
    pub async fn authenticate(&self) -> BridgeResult<CredentialSnapshot> {
        let _gate = self.refresh_gate.lock().await;
        let credential = self.provider.obtain().await?;
        Ok(self.store(credential))
    }

    /// Drop the stored credential.
    pub fn logout(&self) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Return a credential that is not expired (with margin), refreshing or
    /// logging in first when needed.
    pub async fn get_valid_credential(&self) -> BridgeResult<CredentialSnapshot> {
        if let Some(snapshot) = self.snapshot() {
            if !self.is_expired(&snapshot) {
                return Ok(snapshot);
            }
        }

        let _gate = self.refresh_gate.lock().await;
        // Another caller may have refreshed while we waited.
        match self.snapshot() {
            Some(snapshot) if !self.is_expired(&snapshot) => Ok(snapshot),
            Some(snapshot) => {
                debug!(provider = self.provider.name(), "Credential expired, renewing");
                self.renew(&snapshot.credential).await
            }
            None => {
                let credential = self.provider.obtain().await?;
                Ok(self.store(credential))
            }
        }
    }

    /// Called after the engine answered 401 to a request made with `stale`.
    ///
    /// Renews once. If the credential was already replaced since `stale` was
    /// read, the newer credential is returned without another provider call.
    pub async fn on_unauthorized(
        &self,
        stale: &CredentialSnapshot,
    ) -> BridgeResult<CredentialSnapshot> {
        let _gate = self.refresh_gate.lock().await;
        if let Some(current) = self.snapshot() {
            if current.generation != stale.generation {
                debug!("Credential already replaced by a concurrent refresh");
                return Ok(current);
            }
        }
        warn!(
            provider = self.provider.name(),
            "Engine rejected credential, renewing"
        );
        self.renew(&stale.credential).await
    }

    fn is_expired(&self, snapshot: &CredentialSnapshot) -> bool {
        snapshot.credential.is_expired_at(Utc::now(), self.margin)
    }

    /// Must be called with the gate held.
    async fn renew(&self, old: &Credential) -> BridgeResult<CredentialSnapshot> {
        if let Some(refresh_token) = old.refresh_token() {
            match self.provider.refresh(refresh_token).await {
                Ok(credential) => {
                    info!(provider = self.provider.name(), "Token refresh successful");
                    return Ok(self.store(credential));
                }
                Err(e) if self.provider.can_reauthenticate() => {
                    warn!(error = %e, "Token refresh failed, falling back to full authentication");
                }
                Err(e) => return Err(as_auth_expired(e)),
            }
        } else if !self.provider.can_reauthenticate() {
            return Err(BridgeError::AuthExpired(
                "credential expired and no refresh token is available".to_string(),
            ));
        }

        match self.provider.obtain().await {
            Ok(credential) => Ok(self.store(credential)),
            Err(e) => Err(as_auth_expired(e)),
        }
    }

    fn store(&self, credential: Credential) -> CredentialSnapshot {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = CredentialSnapshot {
            credential: Arc::new(credential),
            generation,
        };
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Some(snapshot.clone());
        snapshot
    }
}

/// A rejected renewal means no valid credential is obtainable. Transient
/// and cancellation failures keep their kind.
fn as_auth_expired(e: BridgeError) -> BridgeError {
    match e {
        BridgeError::Authentication(msg) => BridgeError::AuthExpired(msg),
        other => other,
    }
}
