//! Signed URLs and signed POST policies.
//!
//! A signed URL grants time-limited access to a bucket or object to anyone
//! holding it.  [`sign_url`] dispatches to the V4 or legacy V2 scheme;
//! [`policy::generate_post_policy_v4`] produces browser form uploads.
//!
//! Canonicalization ([`canonical`]) is pure and separate from the key
//! material ([`signer`]), so the exact bytes can be checked against fixed
//! inputs and a frozen clock.

pub mod canonical;
pub mod policy;
pub mod signer;
pub mod v2;
pub mod v4;

use chrono::{DateTime, Utc};
use http::Method;
use std::collections::BTreeMap;

use crate::errors::Result;

pub use policy::{PolicyV4Options, SignedPostPolicyV4};
pub use signer::{HmacSigner, IamSigner, ServiceAccountSigner, SigningAlgorithm, UrlSigner};

/// Longest lifetime accepted for a V4 signed URL or policy (seven days).
pub const MAX_V4_EXPIRATION_SECS: i64 = 604_800;

/// Host of the public endpoint; virtual-hosted URLs prepend the bucket.
pub const SIGNING_HOST: &str = "storage.googleapis.com";

/// Signing scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignedUrlVersion {
    V2,
    #[default]
    V4,
}

/// Options for [`sign_url`].
#[derive(Debug, Clone)]
pub struct SignedUrlConfig {
    pub method: Method,
    /// Instant the URL stops working.
    pub expires: DateTime<Utc>,
    /// Instant the URL starts working (V4 only).  Defaults to now.
    pub accessible_at: Option<DateTime<Utc>>,
    pub version: SignedUrlVersion,
    /// Headers the holder must send verbatim.
    pub extension_headers: BTreeMap<String, String>,
    /// Additional query parameters covered by the signature.
    pub query_params: BTreeMap<String, String>,
    pub content_md5: Option<String>,
    pub content_type: Option<String>,
    /// Use `https://{bucket}.storage.googleapis.com`.
    pub virtual_hosted_style: bool,
    /// Custom domain (e.g. `https://cdn.example.com`) mapped to the bucket.
    pub cname: Option<String>,
    /// Sets `response-content-disposition`.
    pub response_disposition: Option<String>,
    /// Shorthand for `attachment; filename="..."` disposition.
    pub prompt_save_as: Option<String>,
    /// Sets `response-content-type`.
    pub response_type: Option<String>,
    pub generation: Option<i64>,
}

impl SignedUrlConfig {
    pub fn new(method: Method, expires: DateTime<Utc>) -> Self {
        Self {
            method,
            expires,
            accessible_at: None,
            version: SignedUrlVersion::V4,
            extension_headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            content_md5: None,
            content_type: None,
            virtual_hosted_style: false,
            cname: None,
            response_disposition: None,
            prompt_save_as: None,
            response_type: None,
            generation: None,
        }
    }

    /// A download URL.
    pub fn read(expires: DateTime<Utc>) -> Self {
        Self::new(Method::GET, expires)
    }

    /// An upload URL.
    pub fn write(expires: DateTime<Utc>) -> Self {
        Self::new(Method::PUT, expires)
    }

    /// A URL that starts a resumable upload session.
    pub fn resumable(expires: DateTime<Utc>) -> Self {
        let mut config = Self::new(Method::POST, expires);
        config
            .extension_headers
            .insert("x-goog-resumable".to_string(), "start".to_string());
        config
    }

    /// Query parameters including those derived from the response
    /// overrides and generation.
    pub fn effective_query_params(&self) -> BTreeMap<String, String> {
        let mut params = self.query_params.clone();
        if let Some(generation) = self.generation {
            params.insert("generation".to_string(), generation.to_string());
        }
        if let Some(response_type) = &self.response_type {
            params.insert("response-content-type".to_string(), response_type.clone());
        }
        if let Some(name) = &self.prompt_save_as {
            params.insert(
                "response-content-disposition".to_string(),
                format!("attachment; filename=\"{name}\""),
            );
        }
        if let Some(disposition) = &self.response_disposition {
            params.insert(
                "response-content-disposition".to_string(),
                disposition.clone(),
            );
        }
        params
    }
}

/// The bucket or object a URL grants access to.
#[derive(Debug, Clone, Copy)]
pub struct SignedResource<'a> {
    /// Origin used for path-style URLs.
    pub endpoint: &'a str,
    pub bucket: &'a str,
    pub object: Option<&'a str>,
}

impl<'a> SignedResource<'a> {
    pub fn new(endpoint: &'a str, bucket: &'a str, object: Option<&'a str>) -> Self {
        Self {
            endpoint,
            bucket,
            object,
        }
    }

    /// Scheme and host the URL is rooted at.
    pub fn origin(&self, config: &SignedUrlConfig) -> String {
        if let Some(cname) = &config.cname {
            return cname.trim_end_matches('/').to_string();
        }
        if config.virtual_hosted_style {
            return format!("https://{}.{SIGNING_HOST}", self.bucket);
        }
        self.endpoint.trim_end_matches('/').to_string()
    }

    /// Encoded request path.  The bucket is part of the path only for
    /// path-style URLs.
    pub fn path(&self, config: &SignedUrlConfig) -> String {
        let object = self
            .object
            .map(|o| canonical::uri_encode(o, false))
            .unwrap_or_default();
        if config.cname.is_some() || config.virtual_hosted_style {
            format!("/{object}")
        } else if self.object.is_some() {
            format!("/{}/{object}", self.bucket)
        } else {
            format!("/{}", self.bucket)
        }
    }

    /// `/{bucket}/{object}` regardless of URL style (V2 resource).
    pub fn bucket_path(&self) -> String {
        match self.object {
            Some(o) => format!("/{}/{}", self.bucket, canonical::uri_encode(o, false)),
            None => format!("/{}", self.bucket),
        }
    }
}

/// `host[:port]` of an origin such as `https://example.com:8443`.
pub fn host_of(origin: &str) -> &str {
    let rest = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    rest.split('/').next().unwrap_or(rest)
}

/// Produce a signed URL for `resource` as of `now`.
pub async fn sign_url(
    signer: &dyn UrlSigner,
    resource: &SignedResource<'_>,
    config: &SignedUrlConfig,
    now: DateTime<Utc>,
) -> Result<String> {
    match config.version {
        SignedUrlVersion::V4 => v4::sign_url(signer, resource, config, now).await,
        SignedUrlVersion::V2 => v2::sign_url(signer, resource, config, now).await,
    }
}
