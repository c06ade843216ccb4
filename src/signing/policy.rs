//! V4 signed POST policies for browser form uploads.
//!
//! The policy document lists the conditions an upload form must satisfy
//! and its expiration.  It is serialized as compact JSON with non-ASCII
//! characters escaped, base64-encoded, and the base64 text is signed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::canonical::credential_scope;
use super::v4::{format_date_stamp, format_timestamp};
use super::{UrlSigner, MAX_V4_EXPIRATION_SECS, SIGNING_HOST};
use crate::errors::{Result, StorageError};

/// Form fields that are echoed back but never become conditions.
const IGNORED_FIELD_PREFIX: &str = "x-ignore-";

/// Options for [`generate_post_policy_v4`].
#[derive(Debug, Clone)]
pub struct PolicyV4Options {
    pub expires: DateTime<Utc>,
    /// Extra conditions, e.g. `["content-length-range", 0, 1048576]` or
    /// `["starts-with", "$key", "uploads/"]`.
    pub conditions: Vec<Value>,
    /// Form fields to include; each becomes an exact-match condition.
    pub fields: BTreeMap<String, String>,
    pub virtual_hosted_style: bool,
    /// Custom domain the form posts to.
    pub bucket_bound_hostname: Option<String>,
}

impl PolicyV4Options {
    pub fn new(expires: DateTime<Utc>) -> Self {
        Self {
            expires,
            conditions: Vec::new(),
            fields: BTreeMap::new(),
            virtual_hosted_style: false,
            bucket_bound_hostname: None,
        }
    }
}

/// A form target and the fields the form must post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedPostPolicyV4 {
    pub url: String,
    pub fields: BTreeMap<String, String>,
}

/// Escape every non-ASCII character as `\uXXXX` (UTF-16 code units).
fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut units = [0u16; 2];
    for ch in json.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

/// Build the policy document JSON (before base64).
pub fn policy_document(
    bucket: &str,
    object: &str,
    options: &PolicyV4Options,
    credential: &str,
    algorithm: &str,
    timestamp: &str,
) -> String {
    let mut conditions = options.conditions.clone();
    conditions.push(json!({ "bucket": bucket }));
    for (name, value) in &options.fields {
        if !name.starts_with(IGNORED_FIELD_PREFIX) {
            let mut condition = serde_json::Map::new();
            condition.insert(name.clone(), Value::String(value.clone()));
            conditions.push(Value::Object(condition));
        }
    }
    conditions.push(json!({ "key": object }));
    conditions.push(json!({ "x-goog-date": timestamp }));
    conditions.push(json!({ "x-goog-credential": credential }));
    conditions.push(json!({ "x-goog-algorithm": algorithm }));

    let policy = json!({
        "conditions": conditions,
        "expiration": options.expires.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    });
    escape_non_ascii(&policy.to_string())
}

/// Sign a POST policy for uploading `object` into `bucket`.
pub async fn generate_post_policy_v4(
    signer: &dyn UrlSigner,
    endpoint: &str,
    bucket: &str,
    object: &str,
    options: &PolicyV4Options,
    now: DateTime<Utc>,
) -> Result<SignedPostPolicyV4> {
    if options.expires <= now {
        return Err(StorageError::InvalidArgument(
            "The expiration date provided was in the past.".into(),
        ));
    }
    if (options.expires - now).num_seconds() > MAX_V4_EXPIRATION_SECS {
        return Err(StorageError::InvalidArgument(format!(
            "Max allowed expiration is seven days ({MAX_V4_EXPIRATION_SECS} seconds)."
        )));
    }

    let timestamp = format_timestamp(&now);
    let date_stamp = format_date_stamp(&now);
    let credential = format!(
        "{}/{}",
        signer.credential_id(),
        credential_scope(&date_stamp)
    );
    let algorithm = signer.algorithm().v4_name();

    let document = policy_document(bucket, object, options, &credential, algorithm, &timestamp);
    let encoded = STANDARD.encode(document.as_bytes());
    let signature = signer.sign(&date_stamp, encoded.as_bytes()).await?;

    let mut fields = options.fields.clone();
    fields.insert("key".to_string(), object.to_string());
    fields.insert("x-goog-date".to_string(), timestamp);
    fields.insert("x-goog-credential".to_string(), credential);
    fields.insert("x-goog-algorithm".to_string(), algorithm.to_string());
    fields.insert("policy".to_string(), encoded);
    fields.insert("x-goog-signature".to_string(), hex::encode(signature));

    let url = if let Some(host) = &options.bucket_bound_hostname {
        format!("{}/", host.trim_end_matches('/'))
    } else if options.virtual_hosted_style {
        format!("https://{bucket}.{SIGNING_HOST}/")
    } else {
        format!("{}/{bucket}/", endpoint.trim_end_matches('/'))
    };

    Ok(SignedPostPolicyV4 { url, fields })
}
