//! Credential Broker (C1). Mints and caches short-lived installation
//! tokens from the app-level private key, and verifies webhook signatures.
//! JWT minting follows the teacher's `auth.rs` `encode`/`EncodingKey`
//! pattern, generalized from HS256 to RS256.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::CredentialConfig;
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

/// One minute of safety margin below the broker's cache TTL keeps
/// `expires_at` itself meaningful to callers that inspect it directly.
const TOKEN_SAFETY_MARGIN_SECS: i64 = 5 * 60;
const APP_JWT_TTL_SECS: i64 = 10 * 60;
const APP_JWT_BACKDATE_SECS: i64 = 60;

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub permissions: serde_json::Value,
    pub repo_selection: String,
    pub repo_list: Option<Vec<String>>,
}

impl InstallationToken {
    fn is_usable(&self) -> bool {
        self.expires_at - Utc::now() > Duration::seconds(TOKEN_SAFETY_MARGIN_SECS)
    }
}

#[derive(Debug, Deserialize)]
struct MintedTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    permissions: serde_json::Value,
    #[serde(default)]
    repository_selection: Option<String>,
    #[serde(default)]
    repositories: Option<Vec<MintedRepo>>,
}

#[derive(Debug, Deserialize)]
struct MintedRepo {
    full_name: String,
}

/// A function that performs the actual "create installation access token"
/// upstream call. C2 (the upstream client) supplies a concrete one; keeping
/// this broker independent of `UpstreamClient` avoids a dependency cycle
/// (C2 needs a token from C1 to authenticate its own calls).
#[async_trait::async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint(&self, installation_id: i64, app_jwt: &str) -> AppResult<InstallationToken>;
}

pub struct ReqwestTokenMinter {
    client: reqwest::Client,
    api_base: String,
}

impl ReqwestTokenMinter {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenMinter for ReqwestTokenMinter {
    async fn mint(&self, installation_id: i64, app_jwt: &str) -> AppResult<InstallationToken> {
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(app_jwt)
            .header("accept", "application/vnd.github+json")
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Err(AppError::InstallationNotFound);
        }
        if !response.status().is_success() {
            return Err(AppError::UpstreamError {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body: MintedTokenResponse = response.json().await?;
        Ok(InstallationToken {
            token: body.token,
            expires_at: body.expires_at,
            permissions: body.permissions,
            repo_selection: body.repository_selection.unwrap_or_else(|| "all".into()),
            repo_list: body
                .repositories
                .map(|rs| rs.into_iter().map(|r| r.full_name).collect()),
        })
    }
}

pub struct CredentialBroker {
    config: CredentialConfig,
    minter: Arc<dyn TokenMinter>,
    cache: DashMap<i64, InstallationToken>,
    locks: DashMap<i64, Arc<AsyncMutex<()>>>,
}

impl CredentialBroker {
    pub fn new(config: CredentialConfig, minter: Arc<dyn TokenMinter>) -> Self {
        Self {
            config,
            minter,
            cache: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Mints a fresh app-level JWT. `iat` is backdated a minute to absorb
    /// clock skew; `exp` never exceeds the upstream's 10-minute ceiling.
    pub fn mint_app_jwt(&self) -> AppResult<String> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - APP_JWT_BACKDATE_SECS,
            exp: now + APP_JWT_TTL_SECS,
            iss: self.config.app_id,
        };
        let key = EncodingKey::from_rsa_pem(self.config.private_key_pem.as_bytes())
            .map_err(|e| AppError::Internal(format!("invalid app private key: {e}")))?;
        let header = Header::new(Algorithm::RS256);
        Ok(encode(&header, &claims, &key)?)
    }

    /// Mint-on-miss, cached until expiry minus the safety margin.
    pub async fn installation_token(&self, installation_id: i64) -> AppResult<InstallationToken> {
        if let Some(cached) = self.cache.get(&installation_id) {
            if cached.is_usable() {
                return Ok(cached.clone());
            }
        }

        let lock = self
            .locks
            .entry(installation_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check: another caller may have refreshed while we waited.
        if let Some(cached) = self.cache.get(&installation_id) {
            if cached.is_usable() {
                return Ok(cached.clone());
            }
        }

        let app_jwt = self.mint_app_jwt()?;
        let token = self.minter.mint(installation_id, &app_jwt).await?;
        self.cache.insert(installation_id, token.clone());
        Ok(token)
    }

    /// Constant-time HMAC-SHA256 comparison against `sha256=<hex>`. Any
    /// malformation of the header (missing prefix, bad hex) is `false`.
    pub fn verify_webhook_signature(payload: &[u8], header_value: &str, secret: &str) -> bool {
        let Some(hex_digest) = header_value.strip_prefix("sha256=") else {
            return false;
        };
        let Ok(expected_bytes) = hex::decode(hex_digest) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&expected_bytes).is_ok()
    }
}

/// Sleeps respecting the `StdDuration` the caller already computed; kept as
/// a function (rather than inlined) so C2's retry loop and this module
/// share one obvious place to stub out in tests.
pub async fn sleep(duration: StdDuration) {
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_webhook_signature_accepts_matching_digest() {
        let secret = "topsecret";
        let payload = b"{\"hello\":\"world\"}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        let digest = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={digest}");
        assert!(CredentialBroker::verify_webhook_signature(
            payload, &header, secret
        ));
    }

    #[test]
    fn verify_webhook_signature_rejects_bad_prefix() {
        assert!(!CredentialBroker::verify_webhook_signature(
            b"{}",
            "deadbeef",
            "secret"
        ));
    }

    #[test]
    fn verify_webhook_signature_rejects_wrong_secret() {
        let mut mac = HmacSha256::new_from_slice(b"right").unwrap();
        mac.update(b"payload");
        let digest = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={digest}");
        assert!(!CredentialBroker::verify_webhook_signature(
            b"payload", &header, "wrong"
        ));
    }

    #[test]
    fn installation_token_usability_respects_safety_margin() {
        let fresh = InstallationToken {
            token: "t".into(),
            expires_at: Utc::now() + Duration::minutes(55),
            permissions: serde_json::json!({}),
            repo_selection: "all".into(),
            repo_list: None,
        };
        assert!(fresh.is_usable());

        let stale = InstallationToken {
            token: "t".into(),
            expires_at: Utc::now() + Duration::minutes(2),
            permissions: serde_json::json!({}),
            repo_selection: "all".into(),
            repo_list: None,
        };
        assert!(!stale.is_usable());
    }
}
