//! Pub/Sub notification configurations of a bucket.

use http::Method;
use std::collections::BTreeMap;
use tracing::info;

use super::bucket::BucketHandle;
use crate::errors::{Result, StorageError};
use crate::model::Notification;
use crate::retry::Idempotency;
use crate::transport::encode_path_segment;

const PUBSUB_PREFIX: &str = "//pubsub.googleapis.com/";

pub const PAYLOAD_JSON_API_V1: &str = "JSON_API_V1";
pub const PAYLOAD_NONE: &str = "NONE";

/// Settings for a new notification configuration.
#[derive(Debug, Clone)]
pub struct NotificationOptions {
    /// e.g. `OBJECT_FINALIZE`, `OBJECT_DELETE`.  Empty means all events.
    pub event_types: Vec<String>,
    pub custom_attributes: BTreeMap<String, String>,
    pub payload_format: String,
    pub object_name_prefix: Option<String>,
}

impl Default for NotificationOptions {
    fn default() -> Self {
        Self {
            event_types: Vec::new(),
            custom_attributes: BTreeMap::new(),
            payload_format: PAYLOAD_JSON_API_V1.to_string(),
            object_name_prefix: None,
        }
    }
}

/// Full Pub/Sub resource name of `topic`.
///
/// A bare topic name is placed in `project`; qualified names need none.
pub fn normalize_topic(topic: &str, project: Option<&str>) -> Result<String> {
    if topic.starts_with(PUBSUB_PREFIX) {
        return Ok(topic.to_string());
    }
    if topic.starts_with("projects/") {
        return Ok(format!("{PUBSUB_PREFIX}{topic}"));
    }
    let project = project.ok_or_else(|| {
        StorageError::InvalidArgument(format!(
            "topic {topic:?} is not qualified and no project ID is configured"
        ))
    })?;
    Ok(format!("{PUBSUB_PREFIX}projects/{project}/topics/{topic}"))
}

pub(crate) async fn create(
    bucket: &BucketHandle,
    topic: &str,
    options: &NotificationOptions,
) -> Result<Notification> {
    let body = Notification {
        topic: normalize_topic(topic, bucket.storage().project_id())?,
        event_types: (!options.event_types.is_empty()).then(|| options.event_types.clone()),
        custom_attributes: (!options.custom_attributes.is_empty())
            .then(|| options.custom_attributes.clone()),
        payload_format: Some(options.payload_format.clone()),
        object_name_prefix: options.object_name_prefix.clone(),
        ..Notification::default()
    };
    let req = bucket
        .request(Method::POST, "/notificationConfigs")
        .operation("create_notification")
        .idempotency(Idempotency::NonIdempotent)
        .json(&body)?;
    let created: Notification = bucket.storage().transport().json(req).await?;
    info!(
        "Created notification {:?} on {} for {}",
        created.id,
        bucket.name(),
        created.topic
    );
    Ok(created)
}

/// Handle to one notification configuration.
#[derive(Debug, Clone)]
pub struct NotificationHandle {
    bucket: BucketHandle,
    id: String,
}

impl NotificationHandle {
    pub(crate) fn new(bucket: BucketHandle, id: String) -> Self {
        Self { bucket, id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn suffix(&self) -> String {
        format!("/notificationConfigs/{}", encode_path_segment(&self.id))
    }

    pub async fn get(&self) -> Result<Notification> {
        let req = self
            .bucket
            .request(Method::GET, &self.suffix())
            .operation("get_notification");
        self.bucket.storage().transport().json(req).await
    }

    pub async fn exists(&self) -> Result<bool> {
        match self.get().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self) -> Result<()> {
        let req = self
            .bucket
            .request(Method::DELETE, &self.suffix())
            .operation("delete_notification")
            .idempotency(Idempotency::Idempotent);
        self.bucket.storage().transport().empty(req).await?;
        info!("Deleted notification {} on {}", self.id, self.bucket.name());
        Ok(())
    }
}
