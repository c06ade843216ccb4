//! JSON API resource representations.
//!
//! Field names follow the service's camelCase wire format.  The service
//! encodes 64-bit integers (generation, size, metageneration, retention
//! period) as JSON strings; [`int64`] accepts both forms and writes
//! strings.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `Option<int>` carried as a JSON string.
pub mod int64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Display,
    {
        match value {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr,
        T::Err: Display,
    {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        let text = match raw {
            None | Some(serde_json::Value::Null) => return Ok(None),
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(serde::de::Error::custom(format!(
                    "expected integer or string, found {other}"
                )))
            }
        };
        text.parse::<T>()
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

// -- Buckets ------------------------------------------------------------------

/// Bucket resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(default, with = "int64", skip_serializing_if = "Option::is_none")]
    pub project_number: Option<u64>,
    #[serde(default, with = "int64", skip_serializing_if = "Option::is_none")]
    pub metageneration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versioning: Option<Versioning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors: Option<Vec<Cors>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<RetentionPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing: Option<Billing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Logging>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<Website>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<Encryption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iam_configuration: Option<IamConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_event_based_hold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl: Option<Vec<AclEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_object_acl: Option<Vec<AclEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpo: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioning {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    #[serde(default)]
    pub rule: Vec<LifecycleRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cors {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origin: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub method: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_header: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default, with = "int64", skip_serializing_if = "Option::is_none")]
    pub retention_period: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_locked: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Billing {
    pub requester_pays: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Logging {
    pub log_bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_object_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Website {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_page_suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_found_page: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Encryption {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_kms_key_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uniform_bucket_level_access: Option<UniformBucketLevelAccess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_access_prevention: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniformBucketLevelAccess {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_time: Option<DateTime<Utc>>,
}

// -- Lifecycle rules --------------------------------------------------------------

/// Object lifecycle management rule.
///
/// ```
/// use gcsclient::model::LifecycleRule;
/// let rule = LifecycleRule::set_storage_class("COLDLINE")
///     .age(30)
///     .matches_prefix(["logs/"]);
/// assert_eq!(rule.action.storage_class.as_deref(), Some("COLDLINE"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub action: LifecycleAction,
    #[serde(default)]
    pub condition: LifecycleCondition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_before: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_time_before: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_since_custom_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_since_noncurrent_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noncurrent_time_before: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_live: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches_prefix: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches_suffix: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches_storage_class: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_newer_versions: Option<u32>,
}

impl LifecycleRule {
    fn with_action(action_type: &str, storage_class: Option<String>) -> Self {
        Self {
            action: LifecycleAction {
                action_type: action_type.to_string(),
                storage_class,
            },
            condition: LifecycleCondition::default(),
        }
    }

    pub fn delete() -> Self {
        Self::with_action("Delete", None)
    }

    pub fn set_storage_class(storage_class: impl Into<String>) -> Self {
        Self::with_action("SetStorageClass", Some(storage_class.into()))
    }

    pub fn abort_incomplete_multipart_upload() -> Self {
        Self::with_action("AbortIncompleteMultipartUpload", None)
    }

    /// Age in days.
    pub fn age(mut self, days: u32) -> Self {
        self.condition.age = Some(days);
        self
    }

    pub fn created_before(mut self, date: NaiveDate) -> Self {
        self.condition.created_before = Some(date);
        self
    }

    pub fn custom_time_before(mut self, date: NaiveDate) -> Self {
        self.condition.custom_time_before = Some(date);
        self
    }

    pub fn days_since_custom_time(mut self, days: u32) -> Self {
        self.condition.days_since_custom_time = Some(days);
        self
    }

    pub fn days_since_noncurrent_time(mut self, days: u32) -> Self {
        self.condition.days_since_noncurrent_time = Some(days);
        self
    }

    pub fn noncurrent_time_before(mut self, date: NaiveDate) -> Self {
        self.condition.noncurrent_time_before = Some(date);
        self
    }

    pub fn is_live(mut self, live: bool) -> Self {
        self.condition.is_live = Some(live);
        self
    }

    pub fn matches_prefix<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.condition.matches_prefix = Some(prefixes.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches_suffix<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.condition.matches_suffix = Some(suffixes.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches_storage_class<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.condition.matches_storage_class =
            Some(classes.into_iter().map(Into::into).collect());
        self
    }

    pub fn num_newer_versions(mut self, versions: u32) -> Self {
        self.condition.num_newer_versions = Some(versions);
        self
    }
}

// -- Objects ------------------------------------------------------------------

/// Object resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,
    #[serde(default, with = "int64", skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, with = "int64", skip_serializing_if = "Option::is_none")]
    pub metageneration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    #[serde(default, with = "int64", skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crc32c: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_deleted: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kms_key_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporary_hold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_based_hold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl: Option<Vec<AclEntry>>,
}

/// Generation and metageneration preconditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub if_generation_match: Option<i64>,
    pub if_generation_not_match: Option<i64>,
    pub if_metageneration_match: Option<i64>,
    pub if_metageneration_not_match: Option<i64>,
}

impl Preconditions {
    /// Only succeed if the live generation equals `generation`.  Zero means
    /// "the object must not exist".
    pub fn if_generation_match(generation: i64) -> Self {
        Self {
            if_generation_match: Some(generation),
            ..Self::default()
        }
    }

    pub fn if_metageneration_match(metageneration: i64) -> Self {
        Self {
            if_metageneration_match: Some(metageneration),
            ..Self::default()
        }
    }

    /// Query parameters for the target of a request.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(v) = self.if_generation_match {
            pairs.push(("ifGenerationMatch", v.to_string()));
        }
        if let Some(v) = self.if_generation_not_match {
            pairs.push(("ifGenerationNotMatch", v.to_string()));
        }
        if let Some(v) = self.if_metageneration_match {
            pairs.push(("ifMetagenerationMatch", v.to_string()));
        }
        if let Some(v) = self.if_metageneration_not_match {
            pairs.push(("ifMetagenerationNotMatch", v.to_string()));
        }
        pairs
    }

    /// Query parameters applying these preconditions to a rewrite source.
    pub fn source_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(v) = self.if_generation_match {
            pairs.push(("ifSourceGenerationMatch", v.to_string()));
        }
        if let Some(v) = self.if_generation_not_match {
            pairs.push(("ifSourceGenerationNotMatch", v.to_string()));
        }
        if let Some(v) = self.if_metageneration_match {
            pairs.push(("ifSourceMetagenerationMatch", v.to_string()));
        }
        if let Some(v) = self.if_metageneration_not_match {
            pairs.push(("ifSourceMetagenerationNotMatch", v.to_string()));
        }
        pairs
    }

    /// Whether a write is pinned to a generation.
    pub fn pins_generation(&self) -> bool {
        self.if_generation_match.is_some()
    }

    /// Whether a metadata update is pinned to a metageneration.
    pub fn pins_metageneration(&self) -> bool {
        self.if_metageneration_match.is_some()
    }
}

/// One source of a compose request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceObject {
    pub name: String,
    #[serde(default, with = "int64", skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_preconditions: Option<SourcePreconditions>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePreconditions {
    #[serde(default, with = "int64", skip_serializing_if = "Option::is_none")]
    pub if_generation_match: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeRequest {
    pub source_objects: Vec<SourceObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<Object>,
}

/// Progress of an `objects.rewrite` call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteResponse {
    #[serde(default, with = "int64")]
    pub total_bytes_rewritten: Option<u64>,
    #[serde(default, with = "int64")]
    pub object_size: Option<u64>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub rewrite_token: Option<String>,
    #[serde(default)]
    pub resource: Option<Object>,
}

// -- Access control -------------------------------------------------------------

/// ACL entry for a bucket, object, or default object ACL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclEntry {
    pub entity: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_team: Option<ProjectTeam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectTeam {
    pub project_number: String,
    pub team: String,
}

/// IAM policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expr>,
}

/// IAM condition expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expr {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TestPermissionsResponse {
    #[serde(default)]
    pub permissions: Vec<String>,
}

// -- HMAC keys ------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HmacKeyState {
    Active,
    Inactive,
    Deleted,
}

impl HmacKeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HmacKeyState::Active => "ACTIVE",
            HmacKeyState::Inactive => "INACTIVE",
            HmacKeyState::Deleted => "DELETED",
        }
    }
}

/// HMAC key metadata (never includes the secret).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmacKeyMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub access_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_email: Option<String>,
    pub state: HmacKeyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// A newly created HMAC key.  The secret is returned only once.
#[derive(Clone, Deserialize)]
pub struct HmacKey {
    pub secret: String,
    pub metadata: HmacKeyMetadata,
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacKey")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

// -- Notifications --------------------------------------------------------------

/// Pub/Sub notification configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_attributes: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_name_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

/// The project's storage service agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    pub email_address: String,
}

// -- Listing --------------------------------------------------------------------

/// One page of a list call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    /// Common prefixes when listing objects with a delimiter.
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl<T> Default for ListPage<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            prefixes: Vec::new(),
            next_page_token: None,
        }
    }
}
