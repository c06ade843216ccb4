//! Bucket operations.

use futures_util::stream::{self, StreamExt};
use garde::Validate;
use http::Method;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::acl::{AclHandle, AclScope, ALL_USERS, READER};
use super::iam::Iam;
use super::notification::{NotificationHandle, NotificationOptions};
use super::object::ObjectHandle;
use super::BULK_CONCURRENCY;
use crate::client::Storage;
use crate::errors::{Result, StorageError};
use crate::model::{
    Bucket, Cors, LifecycleRule, ListPage, Notification, Object, Preconditions,
};
use crate::retry::Idempotency;
use crate::transport::{encode_path_segment, ApiRequest};

#[derive(Validate)]
struct BucketName {
    #[garde(length(min = 3, max = 63), pattern(r"^[a-z0-9][a-z0-9._-]*[a-z0-9]$"))]
    name: String,
}

/// Check a bucket name against the service's naming rules: 3 to 63
/// characters of lowercase letters, digits, `-`, `.` and `_`, starting and
/// ending with a letter or digit.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    BucketName {
        name: name.to_string(),
    }
    .validate()
    .map_err(|report| StorageError::InvalidArgument(format!("invalid bucket name {name:?}: {report}")))
}

/// Options for creating a bucket.
#[derive(Debug, Clone, Default)]
pub struct CreateBucketRequest {
    /// Owning project; defaults to the client's project.
    pub project: Option<String>,
    /// Initial metadata (location, storage class, labels, ...).
    pub metadata: Bucket,
    pub predefined_acl: Option<String>,
    pub predefined_default_object_acl: Option<String>,
}

/// Filters for listing objects.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsQuery {
    pub prefix: Option<String>,
    /// Group names sharing a prefix up to this delimiter into `prefixes`.
    pub delimiter: Option<String>,
    pub include_trailing_delimiter: bool,
    pub start_offset: Option<String>,
    pub end_offset: Option<String>,
    pub match_glob: Option<String>,
    /// Include noncurrent generations.
    pub versions: bool,
    pub max_results: Option<usize>,
}

/// Handle to a bucket.
#[derive(Debug, Clone)]
pub struct BucketHandle {
    storage: Storage,
    name: String,
}

impl BucketHandle {
    pub(crate) fn new(storage: Storage, name: String) -> Self {
        Self { storage, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// `/b/{bucket}`.
    pub(crate) fn path(&self) -> String {
        format!("/b/{}", encode_path_segment(&self.name))
    }

    pub(crate) fn request(&self, method: Method, suffix: &str) -> ApiRequest {
        let transport = self.storage.transport();
        ApiRequest::new(method, transport.json_url(&format!("{}{suffix}", self.path())))
            .resource(self.name.clone())
    }

    /// Handle to an object in this bucket.
    pub fn object(&self, name: impl Into<String>) -> ObjectHandle {
        ObjectHandle::new(self.clone(), name.into())
    }

    /// The bucket's access control list.
    pub fn acl(&self) -> AclHandle {
        AclHandle::new(self.storage.clone(), AclScope::Bucket(self.name.clone()))
    }

    /// ACL applied to new objects that do not specify one.
    pub fn default_object_acl(&self) -> AclHandle {
        AclHandle::new(
            self.storage.clone(),
            AclScope::DefaultObject(self.name.clone()),
        )
    }

    pub fn iam(&self) -> Iam {
        Iam::new(self.clone())
    }

    pub fn notification(&self, id: impl Into<String>) -> NotificationHandle {
        NotificationHandle::new(self.clone(), id.into())
    }

    // -- Metadata -----------------------------------------------------------

    pub async fn create(&self, request: &CreateBucketRequest) -> Result<Bucket> {
        validate_bucket_name(&self.name)?;
        let project = self.storage.resolve_project(request.project.as_deref())?;
        let mut metadata = request.metadata.clone();
        metadata.name = self.name.clone();

        let transport = self.storage.transport();
        let req = ApiRequest::new(Method::POST, transport.json_url("/b"))
            .operation("create_bucket")
            .resource(self.name.clone())
            .idempotency(Idempotency::Idempotent)
            .query("project", project)
            .query_opt("predefinedAcl", request.predefined_acl.as_deref())
            .query_opt(
                "predefinedDefaultObjectAcl",
                request.predefined_default_object_acl.as_deref(),
            )
            .json(&metadata)?;
        let bucket: Bucket = transport.json(req).await?;
        debug!("Created bucket {}", self.name);
        Ok(bucket)
    }

    pub async fn get_metadata(&self) -> Result<Bucket> {
        let req = self.request(Method::GET, "").operation("get_bucket");
        self.storage.transport().json(req).await
    }

    pub async fn exists(&self) -> Result<bool> {
        match self.get_metadata().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Patch the bucket with `metadata`'s set fields.
    pub async fn patch(&self, metadata: &Bucket, preconditions: &Preconditions) -> Result<Bucket> {
        self.set_metadata(serde_json::to_value(metadata)?, preconditions)
            .await
    }

    /// Patch with a raw JSON body.  `null` clears a field.
    pub async fn set_metadata(&self, patch: Value, preconditions: &Preconditions) -> Result<Bucket> {
        let req = self
            .request(Method::PATCH, "")
            .operation("patch_bucket")
            .idempotency(Idempotency::conditional(preconditions.pins_metageneration()))
            .query_pairs(preconditions.query_pairs())
            .json(&patch)?;
        self.storage.transport().json(req).await
    }

    async fn patch_field(&self, field: &str, value: Value) -> Result<Bucket> {
        let mut body = Map::new();
        body.insert(field.to_string(), value);
        self.set_metadata(Value::Object(body), &Preconditions::default())
            .await
    }

    /// Delete the bucket.  It must be empty.
    pub async fn delete(&self, preconditions: &Preconditions) -> Result<()> {
        let req = self
            .request(Method::DELETE, "")
            .operation("delete_bucket")
            .idempotency(Idempotency::Idempotent)
            .query_pairs(preconditions.query_pairs());
        self.storage.transport().empty(req).await
    }

    /// Permanently lock the retention policy.  `metageneration` must be the
    /// bucket's current metageneration.
    pub async fn lock_retention_policy(&self, metageneration: i64) -> Result<Bucket> {
        let req = self
            .request(Method::POST, "/lockRetentionPolicy")
            .operation("lock_retention_policy")
            .idempotency(Idempotency::Idempotent)
            .query("ifMetagenerationMatch", metageneration);
        self.storage.transport().json(req).await
    }

    pub async fn set_storage_class(&self, storage_class: &str) -> Result<Bucket> {
        self.patch_field("storageClass", json!(storage_class)).await
    }

    pub async fn get_labels(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.get_metadata().await?.labels.unwrap_or_default())
    }

    /// Merge `labels` into the bucket's labels.
    pub async fn set_labels(&self, labels: &BTreeMap<String, String>) -> Result<Bucket> {
        self.patch_field("labels", serde_json::to_value(labels)?).await
    }

    /// Remove the named labels, or every label when `keys` is empty.
    pub async fn delete_labels(&self, keys: &[&str]) -> Result<Bucket> {
        let keys: Vec<String> = if keys.is_empty() {
            self.get_labels().await?.into_keys().collect()
        } else {
            keys.iter().map(|k| k.to_string()).collect()
        };
        let labels: Map<String, Value> = keys.into_iter().map(|k| (k, Value::Null)).collect();
        self.patch_field("labels", Value::Object(labels)).await
    }

    pub async fn set_cors(&self, cors: &[Cors]) -> Result<Bucket> {
        self.patch_field("cors", serde_json::to_value(cors)?).await
    }

    /// Minimum time objects are retained, in seconds.
    pub async fn set_retention_period(&self, seconds: u64) -> Result<Bucket> {
        self.patch_field(
            "retentionPolicy",
            json!({ "retentionPeriod": seconds.to_string() }),
        )
        .await
    }

    pub async fn remove_retention_period(&self) -> Result<Bucket> {
        self.patch_field("retentionPolicy", Value::Null).await
    }

    pub async fn enable_requester_pays(&self) -> Result<Bucket> {
        self.patch_field("billing", json!({ "requesterPays": true }))
            .await
    }

    pub async fn disable_requester_pays(&self) -> Result<Bucket> {
        self.patch_field("billing", json!({ "requesterPays": false }))
            .await
    }

    /// Write access logs into `log_bucket`.
    pub async fn enable_logging(&self, log_bucket: &str, prefix: Option<&str>) -> Result<Bucket> {
        let mut logging = json!({ "logBucket": log_bucket });
        if let Some(prefix) = prefix {
            logging["logObjectPrefix"] = json!(prefix);
        }
        self.patch_field("logging", logging).await
    }

    pub async fn set_versioning(&self, enabled: bool) -> Result<Bucket> {
        self.patch_field("versioning", json!({ "enabled": enabled }))
            .await
    }

    // -- Lifecycle ------------------------------------------------------------

    /// Add a lifecycle rule.  With `append` the rule joins the existing
    /// rules; otherwise it replaces them.
    pub async fn add_lifecycle_rule(&self, rule: LifecycleRule, append: bool) -> Result<Bucket> {
        let mut rules = if append {
            let current = self.get_metadata().await?;
            current.lifecycle.map(|l| l.rule).unwrap_or_default()
        } else {
            Vec::new()
        };
        rules.push(rule);
        self.set_lifecycle_rules(&rules).await
    }

    pub async fn set_lifecycle_rules(&self, rules: &[LifecycleRule]) -> Result<Bucket> {
        self.patch_field("lifecycle", json!({ "rule": rules })).await
    }

    pub async fn delete_lifecycle_rules(&self) -> Result<Bucket> {
        self.patch_field("lifecycle", Value::Null).await
    }

    // -- Access ---------------------------------------------------------------

    /// Grant `allUsers` read access to the bucket and, through the default
    /// object ACL, to new objects.  With `include_files` existing objects
    /// are made public too.
    pub async fn make_public(&self, include_files: bool) -> Result<()> {
        self.acl().add(ALL_USERS, READER).await?;
        self.default_object_acl().add(ALL_USERS, READER).await?;
        if include_files {
            self.for_each_object(&ListObjectsQuery::default(), false, |object| async move {
                object.make_public().await
            })
            .await?;
        }
        Ok(())
    }

    /// Reset bucket and default object ACLs to `projectPrivate`.
    pub async fn make_private(&self, include_files: bool) -> Result<()> {
        let req = self
            .request(Method::PATCH, "")
            .operation("make_bucket_private")
            .query("predefinedAcl", "projectPrivate")
            .query("predefinedDefaultObjectAcl", "projectPrivate")
            .json(&json!({ "acl": null, "defaultObjectAcl": null }))?;
        let _: Bucket = self.storage.transport().json(req).await?;
        if include_files {
            self.for_each_object(&ListObjectsQuery::default(), false, |object| async move {
                object.make_private().await
            })
            .await?;
        }
        Ok(())
    }

    // -- Objects --------------------------------------------------------------

    fn list_request(&self, query: &ListObjectsQuery) -> ApiRequest {
        let mut req = self
            .request(Method::GET, "/o")
            .operation("list_objects")
            .query_opt("prefix", query.prefix.as_deref())
            .query_opt("delimiter", query.delimiter.as_deref())
            .query_opt("startOffset", query.start_offset.as_deref())
            .query_opt("endOffset", query.end_offset.as_deref())
            .query_opt("matchGlob", query.match_glob.as_deref())
            .query_opt("maxResults", query.max_results);
        if query.include_trailing_delimiter {
            req = req.query("includeTrailingDelimiter", true);
        }
        if query.versions {
            req = req.query("versions", true);
        }
        req
    }

    /// One page of objects.
    pub async fn list_files_page(
        &self,
        query: &ListObjectsQuery,
        page_token: Option<&str>,
    ) -> Result<ListPage<Object>> {
        self.storage
            .transport()
            .list_page(self.list_request(query), page_token)
            .await
    }

    /// All matching objects, following page tokens.
    pub async fn get_files(&self, query: &ListObjectsQuery) -> Result<ListPage<Object>> {
        self.storage
            .transport()
            .list_all(self.list_request(query), query.max_results)
            .await
    }

    /// Run `op` on every listed object, a bounded number at a time.
    ///
    /// Without `force` the first failure is returned.  With `force` every
    /// object is attempted and the failures are returned.
    async fn for_each_object<F, Fut>(
        &self,
        query: &ListObjectsQuery,
        force: bool,
        op: F,
    ) -> Result<Vec<(String, StorageError)>>
    where
        F: Fn(ObjectHandle) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let listing = self.get_files(query).await?;
        let handles = listing.items.into_iter().map(|o| {
            let handle = self.object(o.name.clone());
            match o.generation {
                Some(g) if query.versions => handle.with_generation(g),
                _ => handle,
            }
        });

        let mut results = stream::iter(handles)
            .map(|handle| {
                let name = handle.name().to_string();
                let fut = op(handle);
                async move { (name, fut.await) }
            })
            .buffer_unordered(BULK_CONCURRENCY);

        let mut failures = Vec::new();
        while let Some((name, result)) = results.next().await {
            if let Err(e) = result {
                if !force {
                    return Err(e);
                }
                warn!("Failed to process gs://{}/{}: {}", self.name, name, e);
                failures.push((name, e));
            }
        }
        Ok(failures)
    }

    /// Delete every object matching `query`.
    pub async fn delete_files(
        &self,
        query: &ListObjectsQuery,
        force: bool,
    ) -> Result<Vec<(String, StorageError)>> {
        self.for_each_object(query, force, |object| async move {
            object.delete(&Preconditions::default()).await
        })
        .await
    }

    // -- Notifications ----------------------------------------------------------

    /// Publish change notifications for this bucket to `topic`.
    ///
    /// `topic` may be a bare topic name, `projects/p/topics/t`, or the full
    /// `//pubsub.googleapis.com/...` resource name.
    pub async fn create_notification(
        &self,
        topic: &str,
        options: &NotificationOptions,
    ) -> Result<Notification> {
        super::notification::create(self, topic, options).await
    }

    pub async fn get_notifications(&self) -> Result<Vec<Notification>> {
        let req = self
            .request(Method::GET, "/notificationConfigs")
            .operation("list_notifications");
        let page: ListPage<Notification> = self.storage.transport().json(req).await?;
        Ok(page.items)
    }
}
