//! Key material behind signed URLs.
//!
//! A [`UrlSigner`] turns the string-to-sign into signature bytes.  The
//! canonicalization code never sees the key itself.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::canonical::{derive_signing_key, hmac_sha256};
use crate::credentials::{BoxFuture, Credentials, ServiceAccountKey};
use crate::errors::{Result, StorageError};

/// Default IAM Credentials endpoint used by [`IamSigner`].
pub const DEFAULT_IAM_ENDPOINT: &str = "https://iamcredentials.googleapis.com";

/// Signature algorithm a signer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    /// RSA PKCS#1 v1.5 over SHA-256.
    RsaSha256,
    /// HMAC-SHA256 with a date-scoped derived key.
    HmacSha256,
}

impl SigningAlgorithm {
    /// The V4 algorithm tag, e.g. `GOOG4-RSA-SHA256`.
    pub fn v4_name(&self) -> &'static str {
        match self {
            SigningAlgorithm::RsaSha256 => "GOOG4-RSA-SHA256",
            SigningAlgorithm::HmacSha256 => "GOOG4-HMAC-SHA256",
        }
    }
}

/// Produces signatures for signed URLs and POST policies.
pub trait UrlSigner: Send + Sync {
    fn algorithm(&self) -> SigningAlgorithm;

    /// Service account email or HMAC access id placed in the credential.
    fn credential_id(&self) -> &str;

    /// Sign `blob`.  `date_stamp` (`YYYYMMDD`) selects the derived key for
    /// HMAC signers and is ignored by RSA signers.
    fn sign<'a>(&'a self, date_stamp: &'a str, blob: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>>>;
}

// -- Local RSA key ------------------------------------------------------------

/// Signs locally with a service account private key.
pub struct ServiceAccountSigner {
    client_email: String,
    key: EncodingKey,
}

impl ServiceAccountSigner {
    pub fn new(key: &ServiceAccountKey) -> Result<Self> {
        Ok(Self {
            client_email: key.client_email.clone(),
            key: key.encoding_key()?,
        })
    }

    pub fn from_file(path: &str) -> Result<Self> {
        Self::new(&ServiceAccountKey::from_file(path)?)
    }

    /// RSA-SHA256 signature bytes of `blob`.
    pub fn sign_bytes(&self, blob: &[u8]) -> Result<Vec<u8>> {
        // jsonwebtoken returns the signature base64url-encoded without padding.
        let encoded = jsonwebtoken::crypto::sign(blob, &self.key, Algorithm::RS256)?;
        URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| StorageError::Signing(format!("Malformed RSA signature: {e}")))
    }
}

impl std::fmt::Debug for ServiceAccountSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountSigner")
            .field("client_email", &self.client_email)
            .finish_non_exhaustive()
    }
}

impl UrlSigner for ServiceAccountSigner {
    fn algorithm(&self) -> SigningAlgorithm {
        SigningAlgorithm::RsaSha256
    }

    fn credential_id(&self) -> &str {
        &self.client_email
    }

    fn sign<'a>(&'a self, _date_stamp: &'a str, blob: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { self.sign_bytes(blob) })
    }
}

// -- Remote signBlob ------------------------------------------------------------

#[derive(Serialize)]
struct SignBlobRequest {
    payload: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignBlobResponse {
    signed_blob: String,
}

/// Delegates RSA signing to the IAM Credentials `signBlob` method.
///
/// Used when the caller holds only an access token (metadata server, user
/// credentials with impersonation) and no private key.
pub struct IamSigner {
    client: reqwest::Client,
    credentials: Credentials,
    service_account: String,
    endpoint: String,
}

impl IamSigner {
    pub fn new(client: reqwest::Client, credentials: Credentials, service_account: String) -> Self {
        Self {
            client,
            credentials,
            service_account,
            endpoint: DEFAULT_IAM_ENDPOINT.to_string(),
        }
    }

    /// Point the signer at a different IAM Credentials endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn sign_blob_url(&self) -> String {
        format!(
            "{}/v1/projects/-/serviceAccounts/{}:signBlob",
            self.endpoint,
            super::canonical::uri_encode(&self.service_account, true)
        )
    }
}

impl UrlSigner for IamSigner {
    fn algorithm(&self) -> SigningAlgorithm {
        SigningAlgorithm::RsaSha256
    }

    fn credential_id(&self) -> &str {
        &self.service_account
    }

    fn sign<'a>(&'a self, _date_stamp: &'a str, blob: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            debug!("signBlob as {}", self.service_account);
            let mut req = self.client.post(self.sign_blob_url()).json(&SignBlobRequest {
                payload: STANDARD.encode(blob),
            });
            if let Some(auth) = self.credentials.authorization().await? {
                req = req.header(http::header::AUTHORIZATION, auth);
            }
            let resp = req.send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(StorageError::Signing(format!(
                    "signBlob failed ({status}): {body}"
                )));
            }
            let parsed: SignBlobResponse = resp.json().await?;
            STANDARD
                .decode(parsed.signed_blob)
                .map_err(|e| StorageError::Signing(format!("Malformed signBlob response: {e}")))
        })
    }
}

// -- HMAC key -----------------------------------------------------------------

/// Signs with an HMAC key (access id + secret).
pub struct HmacSigner {
    access_id: String,
    secret: String,
}

impl HmacSigner {
    pub fn new(access_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            access_id: access_id.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner")
            .field("access_id", &self.access_id)
            .finish_non_exhaustive()
    }
}

impl UrlSigner for HmacSigner {
    fn algorithm(&self) -> SigningAlgorithm {
        SigningAlgorithm::HmacSha256
    }

    fn credential_id(&self) -> &str {
        &self.access_id
    }

    fn sign<'a>(&'a self, date_stamp: &'a str, blob: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let key = derive_signing_key(&self.secret, date_stamp);
            Ok(hmac_sha256(&key, blob))
        })
    }
}
