//! OAuth2 access tokens for API calls.
//!
//! Tokens come from a [`TokenProvider`].  The crate ships the providers
//! behind Application Default Credentials (ADC):
//!   - `GOOGLE_APPLICATION_CREDENTIALS` (service account or user JSON)
//!   - gcloud user credentials (`gcloud auth application-default login`)
//!   - the compute metadata server
//!
//! plus a fixed token and anonymous access.  JWT construction and RSA
//! signing for the service-account grant are delegated to `jsonwebtoken`.
//!
//! [`Credentials`] wraps a provider with a cache that refreshes the token
//! 60 seconds before it expires.

use http::HeaderValue;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::{CredentialsConfig, CredentialsKind};
use crate::errors::{Result, StorageError};

/// OAuth2 scope requested for storage access.
pub const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";

/// Default OAuth2 token endpoint.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const METADATA_EMAIL_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/email";

/// Tokens are refreshed this long before their reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime assumed when a token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: u64 = 3600;

/// Boxed future returned by provider trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bearer token and its lifetime.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Duration,
}

/// Source of OAuth2 access tokens.
pub trait TokenProvider: Send + Sync + 'static {
    /// Fetch a fresh token, bypassing any cache.
    fn fetch_token(&self) -> BoxFuture<'_, Result<AccessToken>>;
}

// -- Key files ----------------------------------------------------------------

/// A service account JSON key file.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    /// Parse a key from its JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let key: ServiceAccountKey = serde_json::from_str(json)
            .map_err(|e| StorageError::Auth(format!("Failed to parse service account key: {e}")))?;
        if key.key_type != "service_account" {
            return Err(StorageError::Auth(format!(
                "Expected a service_account key, found type {}",
                key.key_type
            )));
        }
        Ok(key)
    }

    /// Read and parse a key file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StorageError::Auth(format!("Failed to read service account key {path}: {e}"))
        })?;
        Self::from_json(&contents)
    }

    /// The RSA private key in the form `jsonwebtoken` signs with.
    pub fn encoding_key(&self) -> Result<EncodingKey> {
        EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| StorageError::Auth(format!("Invalid service account private key: {e}")))
    }
}

/// gcloud user credentials (`authorized_user`).
#[derive(Clone, Deserialize)]
pub struct AuthorizedUser {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

async fn read_token_response(resp: reqwest::Response, context: &str) -> Result<AccessToken> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(StorageError::Auth(format!(
            "{context} failed ({status}): {body}"
        )));
    }
    let parsed: TokenResponse = resp
        .json()
        .await
        .map_err(|e| StorageError::Auth(format!("{context}: invalid token response: {e}")))?;
    Ok(AccessToken {
        token: parsed.access_token,
        expires_in: Duration::from_secs(parsed.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME)),
    })
}

// -- Providers ----------------------------------------------------------------

/// A fixed token supplied by the caller.
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn fetch_token(&self) -> BoxFuture<'_, Result<AccessToken>> {
        Box::pin(async move {
            Ok(AccessToken {
                token: self.0.clone(),
                expires_in: Duration::from_secs(DEFAULT_TOKEN_LIFETIME),
            })
        })
    }
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Exchanges a self-signed JWT for an access token (RFC 7523 bearer grant).
pub struct ServiceAccountProvider {
    client: reqwest::Client,
    key: ServiceAccountKey,
}

impl ServiceAccountProvider {
    pub fn new(client: reqwest::Client, key: ServiceAccountKey) -> Self {
        Self { client, key }
    }

    /// Build the signed assertion for a grant issued at `issued_at`.
    fn assertion(&self, issued_at: i64) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        let claims = JwtClaims {
            iss: &self.key.client_email,
            scope: STORAGE_SCOPE,
            aud: &self.key.token_uri,
            iat: issued_at,
            exp: issued_at + DEFAULT_TOKEN_LIFETIME as i64,
        };
        Ok(jsonwebtoken::encode(&header, &claims, &self.key.encoding_key()?)?)
    }
}

impl TokenProvider for ServiceAccountProvider {
    fn fetch_token(&self) -> BoxFuture<'_, Result<AccessToken>> {
        Box::pin(async move {
            let assertion = self.assertion(chrono::Utc::now().timestamp())?;
            debug!("Exchanging JWT for {}", self.key.client_email);
            let resp = self
                .client
                .post(&self.key.token_uri)
                .form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ])
                .send()
                .await
                .map_err(|e| StorageError::Auth(format!("JWT token request failed: {e}")))?;
            read_token_response(resp, "JWT token exchange").await
        })
    }
}

/// Refreshes gcloud user credentials.
pub struct AuthorizedUserProvider {
    client: reqwest::Client,
    user: AuthorizedUser,
}

impl AuthorizedUserProvider {
    pub fn new(client: reqwest::Client, user: AuthorizedUser) -> Self {
        Self { client, user }
    }
}

impl TokenProvider for AuthorizedUserProvider {
    fn fetch_token(&self) -> BoxFuture<'_, Result<AccessToken>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(&self.user.token_uri)
                .form(&[
                    ("client_id", self.user.client_id.as_str()),
                    ("client_secret", self.user.client_secret.as_str()),
                    ("refresh_token", self.user.refresh_token.as_str()),
                    ("grant_type", "refresh_token"),
                ])
                .send()
                .await
                .map_err(|e| StorageError::Auth(format!("Token refresh request failed: {e}")))?;
            read_token_response(resp, "Token refresh").await
        })
    }
}

/// Tokens from the compute metadata server.
pub struct MetadataServerProvider {
    client: reqwest::Client,
    token_url: String,
}

impl MetadataServerProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            token_url: METADATA_TOKEN_URL.to_string(),
        }
    }

    /// Email of the default service account of the instance.
    pub async fn service_account_email(client: &reqwest::Client) -> Result<String> {
        let resp = client
            .get(METADATA_EMAIL_URL)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| StorageError::Auth(format!("Metadata server request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(StorageError::Auth(format!(
                "Metadata server returned {}",
                resp.status()
            )));
        }
        Ok(resp.text().await?.trim().to_string())
    }
}

impl TokenProvider for MetadataServerProvider {
    fn fetch_token(&self) -> BoxFuture<'_, Result<AccessToken>> {
        Box::pin(async move {
            let resp = self
                .client
                .get(&self.token_url)
                .header("Metadata-Flavor", "Google")
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map_err(|e| {
                    StorageError::Auth(format!(
                        "Metadata server request failed: {e}. Set \
                         GOOGLE_APPLICATION_CREDENTIALS or run \
                         'gcloud auth application-default login'."
                    ))
                })?;
            read_token_response(resp, "Metadata server token").await
        })
    }
}

// -- Caching wrapper ------------------------------------------------------------

struct CachedToken {
    header: HeaderValue,
    expiry: Instant,
}

struct TokenCache {
    provider: Box<dyn TokenProvider>,
    cached: tokio::sync::Mutex<Option<CachedToken>>,
}

/// Credentials attached to every request.
///
/// Cloning is cheap; clones share the token cache.
#[derive(Clone)]
pub struct Credentials {
    cache: Option<Arc<TokenCache>>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("anonymous", &self.cache.is_none())
            .finish()
    }
}

impl Credentials {
    /// No `Authorization` header.
    pub fn anonymous() -> Self {
        Self { cache: None }
    }

    /// Wrap a provider with a refreshing cache.
    pub fn from_provider<P: TokenProvider>(provider: P) -> Self {
        Self {
            cache: Some(Arc::new(TokenCache {
                provider: Box::new(provider),
                cached: tokio::sync::Mutex::new(None),
            })),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.cache.is_none()
    }

    /// Resolve credentials as described by configuration.
    pub fn from_config(config: &CredentialsConfig, client: &reqwest::Client) -> Result<Self> {
        let path = config.path.as_deref();
        match config.kind {
            CredentialsKind::Anonymous => Ok(Self::anonymous()),
            CredentialsKind::Token => {
                let token = config.token.clone().ok_or_else(|| {
                    StorageError::Auth("credentials.kind is 'token' but no token is set".into())
                })?;
                Ok(Self::from_provider(StaticToken(token)))
            }
            CredentialsKind::ServiceAccount => {
                let path = path.ok_or_else(|| {
                    StorageError::Auth("credentials.kind is 'service_account' but no path".into())
                })?;
                let key = ServiceAccountKey::from_file(path)?;
                Ok(Self::from_provider(ServiceAccountProvider::new(
                    client.clone(),
                    key,
                )))
            }
            CredentialsKind::AuthorizedUser => {
                let path = path.ok_or_else(|| {
                    StorageError::Auth("credentials.kind is 'authorized_user' but no path".into())
                })?;
                Self::from_credentials_file(path, client)
            }
            CredentialsKind::Metadata => Ok(Self::from_provider(MetadataServerProvider::new(
                client.clone(),
            ))),
            CredentialsKind::Default => Self::application_default(client),
        }
    }

    /// Application Default Credentials resolution.
    pub fn application_default(client: &reqwest::Client) -> Result<Self> {
        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            info!("Using credentials from GOOGLE_APPLICATION_CREDENTIALS={}", path);
            return Self::from_credentials_file(&path, client);
        }

        let adc_path = application_default_credentials_path();
        if std::path::Path::new(&adc_path).exists() {
            info!("Using gcloud application default credentials at {}", adc_path);
            return Self::from_credentials_file(&adc_path, client);
        }

        info!("No credentials file found; using the metadata server");
        Ok(Self::from_provider(MetadataServerProvider::new(
            client.clone(),
        )))
    }

    /// Load a credentials file of either `service_account` or
    /// `authorized_user` type.
    pub fn from_credentials_file(path: &str, client: &reqwest::Client) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Auth(format!("Failed to read credentials {path}: {e}")))?;
        Self::from_credentials_json(&contents, client)
    }

    fn from_credentials_json(contents: &str, client: &reqwest::Client) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| StorageError::Auth(format!("Failed to parse credentials: {e}")))?;
        match value.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "service_account" => {
                let key = ServiceAccountKey::from_json(contents)?;
                Ok(Self::from_provider(ServiceAccountProvider::new(
                    client.clone(),
                    key,
                )))
            }
            "authorized_user" => {
                let user: AuthorizedUser = serde_json::from_value(value)
                    .map_err(|e| StorageError::Auth(format!("Invalid user credentials: {e}")))?;
                Ok(Self::from_provider(AuthorizedUserProvider::new(
                    client.clone(),
                    user,
                )))
            }
            other => Err(StorageError::Auth(format!(
                "Unsupported credential type: {other}"
            ))),
        }
    }

    /// The `Authorization` header value, or `None` when anonymous.
    ///
    /// Returns a cached token while it is more than 60 seconds from expiry.
    pub async fn authorization(&self) -> Result<Option<HeaderValue>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };

        let mut cached = cache.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expiry > Instant::now() {
                return Ok(Some(token.header.clone()));
            }
        }

        let fresh = cache.provider.fetch_token().await?;
        let mut header = HeaderValue::from_str(&format!("Bearer {}", fresh.token))
            .map_err(|e| StorageError::Auth(format!("Invalid auth header value: {e}")))?;
        header.set_sensitive(true);
        *cached = Some(CachedToken {
            header: header.clone(),
            expiry: Instant::now() + fresh.expires_in.saturating_sub(EXPIRY_MARGIN),
        });
        Ok(Some(header))
    }

    /// Drop the cached token so the next request fetches a new one.
    pub async fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            *cache.cached.lock().await = None;
        }
    }
}

/// Path of the gcloud application-default credentials file.
pub fn application_default_credentials_path() -> String {
    if let Ok(config_dir) = std::env::var("CLOUDSDK_CONFIG") {
        return format!("{config_dir}/application_default_credentials.json");
    }
    if let Ok(home) = std::env::var("HOME") {
        return format!("{home}/.config/gcloud/application_default_credentials.json");
    }
    ".config/gcloud/application_default_credentials.json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_fake_service, TEST_SERVICE_ACCOUNT_JSON};
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        calls: Arc<AtomicU32>,
        lifetime: Duration,
    }

    impl TokenProvider for CountingProvider {
        fn fetch_token(&self) -> BoxFuture<'_, Result<AccessToken>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(AccessToken {
                    token: format!("token-{n}"),
                    expires_in: self.lifetime,
                })
            })
        }
    }

    #[tokio::test]
    async fn test_anonymous_has_no_header() {
        let creds = Credentials::anonymous();
        assert!(creds.is_anonymous());
        assert!(creds.authorization().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let calls = Arc::new(AtomicU32::new(0));
        let creds = Credentials::from_provider(CountingProvider {
            calls: calls.clone(),
            lifetime: Duration::from_secs(3600),
        });
        let first = creds.authorization().await.unwrap().unwrap();
        let second = creds.authorization().await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_str().unwrap(), "Bearer token-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_lived_token_is_refreshed() {
        let calls = Arc::new(AtomicU32::new(0));
        // Lifetime inside the safety margin: never served from cache.
        let creds = Credentials::from_provider(CountingProvider {
            calls: calls.clone(),
            lifetime: Duration::from_secs(30),
        });
        creds.authorization().await.unwrap();
        let second = creds.authorization().await.unwrap().unwrap();
        assert_eq!(second.to_str().unwrap(), "Bearer token-2");
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let calls = Arc::new(AtomicU32::new(0));
        let creds = Credentials::from_provider(CountingProvider {
            calls: calls.clone(),
            lifetime: Duration::from_secs(3600),
        });
        creds.authorization().await.unwrap();
        creds.invalidate().await;
        creds.authorization().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_service_account_key_parsing() {
        let key = ServiceAccountKey::from_json(TEST_SERVICE_ACCOUNT_JSON).unwrap();
        assert_eq!(key.client_email, "signer@test-project.iam.gserviceaccount.com");
        assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);
        assert!(key.encoding_key().is_ok());
        // Debug output must not leak the private key.
        assert!(!format!("{key:?}").contains("PRIVATE KEY"));
    }

    #[test]
    fn test_rejects_wrong_key_type() {
        let json = r#"{"type":"authorized_user","client_email":"a","private_key":"b"}"#;
        assert!(ServiceAccountKey::from_json(json).is_err());
    }

    #[test]
    fn test_jwt_assertion_claims() {
        let key = ServiceAccountKey::from_json(TEST_SERVICE_ACCOUNT_JSON).unwrap();
        let provider = ServiceAccountProvider::new(reqwest::Client::new(), key);
        let jwt = provider.assertion(1_700_000_000).unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["iss"], "signer@test-project.iam.gserviceaccount.com");
        assert_eq!(claims["scope"], STORAGE_SCOPE);
        assert_eq!(claims["aud"], DEFAULT_TOKEN_URI);
        assert_eq!(claims["exp"], 1_700_003_600i64);
        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "RS256");
    }

    #[tokio::test]
    async fn test_authorized_user_refresh_against_fake_endpoint() {
        let app = Router::new().route(
            "/token",
            post(|body: String| async move {
                assert!(body.contains("grant_type=refresh_token"));
                assert!(body.contains("refresh_token=rt-1"));
                axum::Json(serde_json::json!({
                    "access_token": "ya29.fresh",
                    "expires_in": 1800,
                    "token_type": "Bearer"
                }))
            }),
        );
        let base = spawn_fake_service(app).await;
        let provider = AuthorizedUserProvider::new(
            reqwest::Client::new(),
            AuthorizedUser {
                client_id: "cid".to_string(),
                client_secret: "secret".to_string(),
                refresh_token: "rt-1".to_string(),
                token_uri: format!("{base}/token"),
            },
        );
        let token = provider.fetch_token().await.unwrap();
        assert_eq!(token.token, "ya29.fresh");
        assert_eq!(token.expires_in, Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_token_endpoint_error_is_auth_error() {
        let app = Router::new().route(
            "/token",
            post(|| async { (http::StatusCode::BAD_REQUEST, "invalid_grant") }),
        );
        let base = spawn_fake_service(app).await;
        let provider = AuthorizedUserProvider::new(
            reqwest::Client::new(),
            AuthorizedUser {
                client_id: "cid".to_string(),
                client_secret: "secret".to_string(),
                refresh_token: "revoked".to_string(),
                token_uri: format!("{base}/token"),
            },
        );
        let err = provider.fetch_token().await.unwrap_err();
        assert!(matches!(err, StorageError::Auth(ref m) if m.contains("invalid_grant")));
    }

    #[test]
    fn test_from_config_token_requires_value() {
        let config = CredentialsConfig {
            kind: CredentialsKind::Token,
            ..Default::default()
        };
        assert!(Credentials::from_config(&config, &reqwest::Client::new()).is_err());
    }

    #[test]
    fn test_from_credentials_json_user() {
        let json = r#"{"type":"authorized_user","client_id":"a","client_secret":"b","refresh_token":"c"}"#;
        let creds = Credentials::from_credentials_json(json, &reqwest::Client::new()).unwrap();
        assert!(!creds.is_anonymous());
        let bad = r#"{"type":"external_account"}"#;
        assert!(Credentials::from_credentials_json(bad, &reqwest::Client::new()).is_err());
    }

    #[test]
    fn test_application_default_credentials_path() {
        let path = application_default_credentials_path();
        assert!(path.ends_with("application_default_credentials.json"));
    }
}
