//! V4 signed URLs.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::canonical::{
    build_canonical_request, build_string_to_sign, canonical_headers, canonical_query_string,
    credential_scope, CONTENT_SHA256_HEADER, UNSIGNED_PAYLOAD,
};
use super::{host_of, SignedResource, SignedUrlConfig, SigningAlgorithm, UrlSigner};
use super::MAX_V4_EXPIRATION_SECS;
use crate::errors::{Result, StorageError};

/// Everything that goes into a V4 URL except the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedV4 {
    pub canonical_request: String,
    pub string_to_sign: String,
    /// Canonical query string, without `X-Goog-Signature`.
    pub canonical_query: String,
    /// `origin + path`.
    pub base_url: String,
    /// `YYYYMMDD` of the signing timestamp.
    pub date_stamp: String,
}

impl PreparedV4 {
    /// Append a signature to produce the final URL.
    pub fn into_url(self, signature: &[u8]) -> String {
        format!(
            "{}?{}&X-Goog-Signature={}",
            self.base_url,
            self.canonical_query,
            hex::encode(signature)
        )
    }
}

/// `YYYYMMDDTHHMMSSZ`.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.format("%Y%m%dT%H%M%SZ").to_string()
}

/// `YYYYMMDD`.
pub fn format_date_stamp(t: &DateTime<Utc>) -> String {
    t.format("%Y%m%d").to_string()
}

/// Seconds between the signing time and expiry, validated against the
/// seven day limit.
pub fn expiration_seconds(
    expires: &DateTime<Utc>,
    signed_at: &DateTime<Utc>,
    now: &DateTime<Utc>,
) -> Result<i64> {
    if expires <= now {
        return Err(StorageError::InvalidArgument(
            "The expiration date provided was in the past.".into(),
        ));
    }
    let period = (*expires - *signed_at).num_seconds();
    if period <= 0 {
        return Err(StorageError::InvalidArgument(
            "The expiration date must be later than the accessible-at date.".into(),
        ));
    }
    if period > MAX_V4_EXPIRATION_SECS {
        return Err(StorageError::InvalidArgument(format!(
            "Max allowed expiration is seven days ({MAX_V4_EXPIRATION_SECS} seconds)."
        )));
    }
    Ok(period)
}

/// Build the canonical request and string-to-sign for a V4 URL.
pub fn prepare(
    algorithm: SigningAlgorithm,
    credential_id: &str,
    resource: &SignedResource<'_>,
    config: &SignedUrlConfig,
    now: DateTime<Utc>,
) -> Result<PreparedV4> {
    let signed_at = config.accessible_at.unwrap_or(now);
    let expires_in = expiration_seconds(&config.expires, &signed_at, &now)?;

    let timestamp = format_timestamp(&signed_at);
    let date_stamp = format_date_stamp(&signed_at);
    let scope = credential_scope(&date_stamp);

    let origin = resource.origin(config);
    let path = resource.path(config);
    let host = host_of(&origin).to_string();

    // Headers: caller's extension headers, the optional content headers,
    // and always the host.
    let mut header_list: Vec<(&str, &str)> = config
        .extension_headers
        .iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case("host"))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    if let Some(md5) = &config.content_md5 {
        header_list.push(("content-md5", md5));
    }
    if let Some(content_type) = &config.content_type {
        header_list.push(("content-type", content_type));
    }
    header_list.push(("host", &host));
    let headers = canonical_headers(header_list);

    let payload_hash = config
        .extension_headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(CONTENT_SHA256_HEADER))
        .map(|(_, v)| v.as_str())
        .unwrap_or(UNSIGNED_PAYLOAD);

    let mut query: BTreeMap<String, String> = BTreeMap::new();
    query.insert("X-Goog-Algorithm".into(), algorithm.v4_name().into());
    query.insert(
        "X-Goog-Credential".into(),
        format!("{credential_id}/{scope}"),
    );
    query.insert("X-Goog-Date".into(), timestamp.clone());
    query.insert("X-Goog-Expires".into(), expires_in.to_string());
    query.insert("X-Goog-SignedHeaders".into(), headers.signed.clone());
    query.extend(config.effective_query_params());
    let canonical_query =
        canonical_query_string(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let canonical_request = build_canonical_request(
        config.method.as_str(),
        &path,
        &canonical_query,
        &headers,
        payload_hash,
    );
    let string_to_sign =
        build_string_to_sign(algorithm.v4_name(), &timestamp, &scope, &canonical_request);

    Ok(PreparedV4 {
        canonical_request,
        string_to_sign,
        canonical_query,
        base_url: format!("{origin}{path}"),
        date_stamp,
    })
}

/// Produce a V4 signed URL.
pub async fn sign_url(
    signer: &dyn UrlSigner,
    resource: &SignedResource<'_>,
    config: &SignedUrlConfig,
    now: DateTime<Utc>,
) -> Result<String> {
    let prepared = prepare(
        signer.algorithm(),
        signer.credential_id(),
        resource,
        config,
        now,
    )?;
    let signature = signer
        .sign(&prepared.date_stamp, prepared.string_to_sign.as_bytes())
        .await?;
    Ok(prepared.into_url(&signature))
}
