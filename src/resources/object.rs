//! Object operations.

use bytes::Bytes;
use chrono::Utc;
use http::Method;
use serde_json::{json, Value};
use std::path::Path;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use super::acl::{AclHandle, AclScope, ALL_USERS, READER};
use super::bucket::BucketHandle;
use crate::client::Storage;
use crate::download::{self, ByteRange, DownloadOptions, ObjectReader};
use crate::errors::{Result, StorageError};
use crate::model::{
    ComposeRequest, Object, Preconditions, RewriteResponse, SourceObject, SourcePreconditions,
};
use crate::retry::Idempotency;
use crate::signing::{
    self, policy, PolicyV4Options, SignedPostPolicyV4, SignedResource, SignedUrlConfig,
};
use crate::transport::{encode_path_segment, ApiRequest};
use crate::upload::resumable::ResumableUpload;
use crate::upload::xml_multipart::XmlMultipartUpload;
use crate::upload::{self, UploadOptions};

/// Most sources a single compose call accepts.
pub const MAX_COMPOSE_SOURCES: usize = 32;

/// Options for [`ObjectHandle::copy`].
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Metadata for the destination; the source's metadata is kept when
    /// unset.
    pub destination_metadata: Option<Object>,
    pub destination_preconditions: Preconditions,
    pub source_preconditions: Preconditions,
    pub destination_predefined_acl: Option<String>,
    pub destination_kms_key_name: Option<String>,
    /// Bound the bytes copied per rewrite call (testing large copies).
    pub max_bytes_rewritten_per_call: Option<u64>,
}

/// Options for [`ObjectHandle::compose`].
#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    pub destination_metadata: Option<Object>,
    pub preconditions: Preconditions,
    pub destination_predefined_acl: Option<String>,
}

/// Handle to an object, optionally pinned to a generation.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    bucket: BucketHandle,
    name: String,
    generation: Option<i64>,
}

impl ObjectHandle {
    pub(crate) fn new(bucket: BucketHandle, name: String) -> Self {
        Self {
            bucket,
            name,
            generation: None,
        }
    }

    /// Address a specific generation.
    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bucket(&self) -> &BucketHandle {
        &self.bucket
    }

    pub fn generation(&self) -> Option<i64> {
        self.generation
    }

    pub(crate) fn storage(&self) -> &Storage {
        self.bucket.storage()
    }

    /// `/b/{bucket}/o/{object}`.
    pub(crate) fn path(&self) -> String {
        format!("{}/o/{}", self.bucket.path(), encode_path_segment(&self.name))
    }

    /// `bucket/object`, used in errors and logs.
    pub(crate) fn display_name(&self) -> String {
        format!("{}/{}", self.bucket.name(), self.name)
    }

    pub(crate) fn request(&self, method: Method, suffix: &str) -> ApiRequest {
        let transport = self.storage().transport();
        ApiRequest::new(method, transport.json_url(&format!("{}{suffix}", self.path())))
            .resource(self.display_name())
            .query_opt("generation", self.generation)
    }

    /// A request against the XML API path of this object.
    pub(crate) fn xml_request(&self, method: Method) -> ApiRequest {
        let transport = self.storage().transport();
        ApiRequest::new(method, transport.xml_url(self.bucket.name(), &self.name))
            .resource(self.display_name())
    }

    pub fn acl(&self) -> AclHandle {
        AclHandle::new(
            self.storage().clone(),
            AclScope::Object {
                bucket: self.bucket.name().to_string(),
                object: self.name.clone(),
                generation: self.generation,
            },
        )
    }

    // -- Metadata -----------------------------------------------------------

    pub async fn get_metadata(&self) -> Result<Object> {
        let req = self.request(Method::GET, "").operation("get_object");
        self.storage().transport().json(req).await
    }

    pub async fn exists(&self) -> Result<bool> {
        match self.get_metadata().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Patch with a raw JSON body.  `null` clears a field; custom metadata
    /// keys set to `null` are removed.
    pub async fn set_metadata(&self, patch: Value, preconditions: &Preconditions) -> Result<Object> {
        let req = self
            .request(Method::PATCH, "")
            .operation("patch_object")
            .idempotency(Idempotency::conditional(preconditions.pins_metageneration()))
            .query_pairs(preconditions.query_pairs())
            .json(&patch)?;
        self.storage().transport().json(req).await
    }

    /// Patch the object with `metadata`'s set fields.
    pub async fn patch(&self, metadata: &Object, preconditions: &Preconditions) -> Result<Object> {
        self.set_metadata(serde_json::to_value(metadata)?, preconditions)
            .await
    }

    /// Delete the object (or the pinned generation).
    pub async fn delete(&self, preconditions: &Preconditions) -> Result<()> {
        let pinned = self.generation.is_some() || preconditions.pins_generation();
        let req = self
            .request(Method::DELETE, "")
            .operation("delete_object")
            .idempotency(Idempotency::conditional(pinned))
            .query_pairs(preconditions.query_pairs());
        self.storage().transport().empty(req).await
    }

    // -- Rewrite, copy, move ----------------------------------------------------

    /// Server-side copy to `destination`, following `rewriteToken` until
    /// the service reports completion.
    pub async fn copy(&self, destination: &ObjectHandle, options: &CopyOptions) -> Result<Object> {
        let suffix = format!(
            "/rewriteTo/b/{}/o/{}",
            encode_path_segment(destination.bucket.name()),
            encode_path_segment(&destination.name)
        );
        let body = match &options.destination_metadata {
            Some(metadata) => serde_json::to_value(metadata)?,
            None => json!({}),
        };
        let base = ApiRequest::new(
            Method::POST,
            self.storage()
                .transport()
                .json_url(&format!("{}{suffix}", self.path())),
        )
        .operation("rewrite_object")
        .resource(self.display_name())
        .idempotency(Idempotency::conditional(
            options.destination_preconditions.pins_generation(),
        ))
        .query_opt("sourceGeneration", self.generation)
        .query_pairs(options.destination_preconditions.query_pairs())
        .query_pairs(options.source_preconditions.source_query_pairs())
        .query_opt(
            "destinationPredefinedAcl",
            options.destination_predefined_acl.as_deref(),
        )
        .query_opt(
            "destinationKmsKeyName",
            options.destination_kms_key_name.as_deref(),
        )
        .query_opt(
            "maxBytesRewrittenPerCall",
            options.max_bytes_rewritten_per_call,
        )
        .json(&body)?;

        let mut token: Option<String> = None;
        loop {
            let req = base.clone().query_opt("rewriteToken", token.as_deref());
            let progress: RewriteResponse = self.storage().transport().json(req).await?;
            debug!(
                "Rewrite {} -> {}: {}/{} bytes",
                self.display_name(),
                destination.display_name(),
                progress.total_bytes_rewritten.unwrap_or(0),
                progress.object_size.unwrap_or(0)
            );
            if progress.done {
                return progress.resource.ok_or_else(|| {
                    StorageError::InvalidArgument("rewrite finished without a resource".into())
                });
            }
            match progress.rewrite_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => {
                    return Err(StorageError::InvalidArgument(
                        "rewrite is not done but returned no rewriteToken".into(),
                    ))
                }
            }
        }
    }

    /// Copy to `destination`, then delete this object.  Both steps are
    /// pinned to the source generation so a concurrent overwrite of the
    /// source is not deleted.
    pub async fn move_to(&self, destination: &ObjectHandle, options: &CopyOptions) -> Result<Object> {
        let generation = match self.generation {
            Some(g) => g,
            None => self.get_metadata().await?.generation.ok_or_else(|| {
                StorageError::InvalidArgument(format!(
                    "{} has no generation",
                    self.display_name()
                ))
            })?,
        };
        let mut options = options.clone();
        options.source_preconditions.if_generation_match = Some(generation);
        let copied = self.copy(destination, &options).await?;

        if self.bucket.name() == destination.bucket.name() && self.name == destination.name {
            return Ok(copied);
        }
        self.delete(&Preconditions::if_generation_match(generation))
            .await?;
        info!("Moved {} to {}", self.display_name(), destination.display_name());
        Ok(copied)
    }

    /// Move within the same bucket.
    pub async fn rename(&self, new_name: &str) -> Result<Object> {
        let destination = self.bucket.object(new_name);
        self.move_to(&destination, &CopyOptions::default()).await
    }

    /// Concatenate `sources` (same bucket) into this object.
    pub async fn compose(&self, sources: &[ObjectHandle], options: &ComposeOptions) -> Result<Object> {
        if sources.is_empty() || sources.len() > MAX_COMPOSE_SOURCES {
            return Err(StorageError::InvalidArgument(format!(
                "compose takes 1 to {MAX_COMPOSE_SOURCES} sources, got {}",
                sources.len()
            )));
        }
        if let Some(other) = sources.iter().find(|s| s.bucket.name() != self.bucket.name()) {
            return Err(StorageError::InvalidArgument(format!(
                "compose sources must be in bucket {}, not {}",
                self.bucket.name(),
                other.bucket.name()
            )));
        }

        let mut destination = options.destination_metadata.clone().unwrap_or_default();
        if destination.content_type.is_none() {
            destination.content_type = Some("application/octet-stream".to_string());
        }
        let body = ComposeRequest {
            source_objects: sources
                .iter()
                .map(|s| SourceObject {
                    name: s.name.clone(),
                    generation: s.generation,
                    object_preconditions: s.generation.map(|g| SourcePreconditions {
                        if_generation_match: Some(g),
                    }),
                })
                .collect(),
            destination: Some(destination),
        };

        let req = ApiRequest::new(
            Method::POST,
            self.storage()
                .transport()
                .json_url(&format!("{}/compose", self.path())),
        )
        .operation("compose_object")
        .resource(self.display_name())
        .idempotency(Idempotency::conditional(options.preconditions.pins_generation()))
        .query_pairs(options.preconditions.query_pairs())
        .query_opt(
            "destinationPredefinedAcl",
            options.destination_predefined_acl.as_deref(),
        )
        .json(&body)?;
        self.storage().transport().json(req).await
    }

    /// Change the storage class by rewriting the object onto itself.
    pub async fn set_storage_class(
        &self,
        storage_class: &str,
        preconditions: &Preconditions,
    ) -> Result<Object> {
        let options = CopyOptions {
            destination_metadata: Some(Object {
                storage_class: Some(storage_class.to_string()),
                ..Object::default()
            }),
            destination_preconditions: *preconditions,
            ..CopyOptions::default()
        };
        self.copy(self, &options).await
    }

    // -- Access ---------------------------------------------------------------

    pub async fn make_public(&self) -> Result<()> {
        self.acl().add(ALL_USERS, READER).await.map(|_| ())
    }

    pub async fn make_private(&self) -> Result<()> {
        let req = self
            .request(Method::PATCH, "")
            .operation("make_object_private")
            .query("predefinedAcl", "projectPrivate")
            .json(&json!({ "acl": null }))?;
        let _: Object = self.storage().transport().json(req).await?;
        Ok(())
    }

    /// Unauthenticated download URL (works only for public objects).
    pub fn public_url(&self) -> String {
        self.storage()
            .transport()
            .public_url(self.bucket.name(), &self.name)
    }

    // -- Signing ------------------------------------------------------------------

    /// A signed URL granting `config.method` on this object until
    /// `config.expires`.
    pub async fn get_signed_url(&self, config: &SignedUrlConfig) -> Result<String> {
        let signer = self.storage().signer()?;
        let mut config = config.clone();
        if config.generation.is_none() {
            config.generation = self.generation;
        }
        let resource = SignedResource::new(
            self.storage().transport().endpoint(),
            self.bucket.name(),
            Some(&self.name),
        );
        signing::sign_url(signer, &resource, &config, Utc::now()).await
    }

    /// A signed POST policy for uploading this object from a browser form.
    pub async fn generate_signed_post_policy_v4(
        &self,
        options: &PolicyV4Options,
    ) -> Result<SignedPostPolicyV4> {
        let signer = self.storage().signer()?;
        policy::generate_post_policy_v4(
            signer,
            self.storage().transport().endpoint(),
            self.bucket.name(),
            &self.name,
            options,
            Utc::now(),
        )
        .await
    }

    // -- Data -----------------------------------------------------------------------

    /// Download the whole object, verifying its MD5 when available.
    pub async fn download(&self) -> Result<Bytes> {
        download::download(self, &DownloadOptions::default()).await
    }

    pub async fn download_range(&self, range: ByteRange) -> Result<Bytes> {
        let options = DownloadOptions {
            range,
            ..DownloadOptions::default()
        };
        download::download(self, &options).await
    }

    pub async fn download_to_file(&self, path: impl AsRef<Path>) -> Result<u64> {
        download::download_to_file(self, path.as_ref(), &DownloadOptions::default()).await
    }

    /// Stream the object's bytes.
    pub async fn read_stream(&self, options: &DownloadOptions) -> Result<ObjectReader> {
        download::read_stream(self, options).await
    }

    /// Upload `data`, replacing the object.
    pub async fn save(&self, data: impl Into<Bytes>, options: &UploadOptions) -> Result<Object> {
        upload::upload_bytes(self, data.into(), options).await
    }

    /// Upload everything `reader` yields through a resumable session.
    pub async fn upload_from_reader<R>(&self, reader: R, options: &UploadOptions) -> Result<Object>
    where
        R: AsyncRead + Unpin + Send,
    {
        upload::upload_from_reader(self, reader, options).await
    }

    /// Upload a local file; files above the resumable threshold (or with
    /// `resumable: Some(true)`) stream through a session.
    pub async fn upload_from_file(
        &self,
        path: impl AsRef<Path>,
        options: &UploadOptions,
    ) -> Result<Object> {
        let path = path.as_ref();
        let len = tokio::fs::metadata(path).await?.len();
        let small = len <= upload::RESUMABLE_THRESHOLD as u64;
        if options.resumable != Some(true) && small {
            let data = tokio::fs::read(path).await?;
            return self.save(data, options).await;
        }
        let file = tokio::fs::File::open(path).await?;
        self.upload_from_reader(file, options).await
    }

    /// A resumable upload session for this object.  Nothing is sent until
    /// the first write.
    pub fn resumable_upload(&self, options: &UploadOptions) -> ResumableUpload {
        ResumableUpload::new(self, options.clone())
    }

    /// Continue a session whose URI was persisted earlier.
    pub async fn resume_upload(
        &self,
        session_uri: &str,
        options: &UploadOptions,
    ) -> Result<ResumableUpload> {
        ResumableUpload::resume(self, session_uri, options.clone()).await
    }

    /// Start a multipart upload through the XML API.
    pub async fn start_multipart_upload(
        &self,
        options: &UploadOptions,
    ) -> Result<XmlMultipartUpload> {
        XmlMultipartUpload::initiate(self, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{HmacSigner, SignedUrlConfig};
    use crate::testing::{json_response, spawn_recording_service, test_storage};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_paths_and_public_url() {
        let storage = test_storage("http://localhost:4443");
        let object = storage.bucket("b").object("dir/a b.txt");
        assert_eq!(object.path(), "/b/b/o/dir%2Fa%20b.txt");
        assert_eq!(object.public_url(), "http://localhost:4443/b/dir/a%20b.txt");
    }

    #[tokio::test]
    async fn test_copy_follows_rewrite_token() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let (base, seen) = spawn_recording_service(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                json_response(
                    StatusCode::OK,
                    json!({"done": false, "rewriteToken": "tok", "totalBytesRewritten": "10",
                           "objectSize": "30"}),
                )
            } else {
                json_response(
                    StatusCode::OK,
                    json!({"done": true, "resource": {"name": "dst", "bucket": "b2",
                                                      "generation": "9"}}),
                )
            }
        })
        .await;
        let storage = test_storage(&base);
        let src = storage.bucket("b1").object("src").with_generation(4);
        let dst = storage.bucket("b2").object("dst");
        let options = CopyOptions {
            destination_preconditions: Preconditions::if_generation_match(0),
            ..CopyOptions::default()
        };
        let copied = src.copy(&dst, &options).await.unwrap();
        assert_eq!(copied.generation, Some(9));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].path, "/storage/v1/b/b1/o/src/rewriteTo/b/b2/o/dst");
        assert_eq!(seen[0].query["sourceGeneration"], "4");
        assert_eq!(seen[0].query["ifGenerationMatch"], "0");
        assert!(!seen[0].query.contains_key("rewriteToken"));
        assert_eq!(seen[2].query["rewriteToken"], "tok");
    }

    #[tokio::test]
    async fn test_move_pins_source_generation() {
        let (base, seen) = spawn_recording_service(|req| match req.method {
            Method::GET => json_response(StatusCode::OK, json!({"name": "old", "generation": "12"})),
            Method::POST => json_response(
                StatusCode::OK,
                json!({"done": true, "resource": {"name": "new", "generation": "13"}}),
            ),
            _ => StatusCode::NO_CONTENT.into_response(),
        })
        .await;
        let storage = test_storage(&base);
        let moved = storage.bucket("b").object("old").rename("new").await.unwrap();
        assert_eq!(moved.name, "new");

        let seen = seen.lock().unwrap();
        assert_eq!(seen[1].query["ifSourceGenerationMatch"], "12");
        assert_eq!(seen[2].method, Method::DELETE);
        assert_eq!(seen[2].path, "/storage/v1/b/b/o/old");
        assert_eq!(seen[2].query["ifGenerationMatch"], "12");
    }

    #[tokio::test]
    async fn test_compose() {
        let (base, seen) = spawn_recording_service(|_| {
            json_response(StatusCode::OK, json!({"name": "all", "componentCount": 2}))
        })
        .await;
        let storage = test_storage(&base);
        let bucket = storage.bucket("b");
        let parts = [bucket.object("p1").with_generation(1), bucket.object("p2")];
        let composed = bucket
            .object("all")
            .compose(&parts, &ComposeOptions::default())
            .await
            .unwrap();
        assert_eq!(composed.component_count, Some(2));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].path, "/storage/v1/b/b/o/all/compose");
        assert_eq!(
            seen[0].json(),
            json!({
                "sourceObjects": [
                    {"name": "p1", "generation": "1",
                     "objectPreconditions": {"ifGenerationMatch": "1"}},
                    {"name": "p2"}
                ],
                "destination": {"contentType": "application/octet-stream"}
            })
        );
    }

    #[tokio::test]
    async fn test_compose_argument_checks() {
        let storage = test_storage("http://127.0.0.1:1");
        let dst = storage.bucket("b").object("all");
        assert!(dst.compose(&[], &ComposeOptions::default()).await.is_err());
        let foreign = [storage.bucket("other").object("x")];
        assert!(matches!(
            dst.compose(&foreign, &ComposeOptions::default()).await,
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_retry_depends_on_generation() {
        let (base, seen) = spawn_recording_service(|_| {
            json_response(StatusCode::SERVICE_UNAVAILABLE, json!({"error": {"code": 503}}))
        })
        .await;
        let storage = test_storage(&base);
        let object = storage.bucket("b").object("o");
        assert!(object.delete(&Preconditions::default()).await.is_err());
        assert_eq!(seen.lock().unwrap().len(), 1);

        seen.lock().unwrap().clear();
        let err = object
            .clone()
            .with_generation(3)
            .delete(&Preconditions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_signed_url_uses_client_signer() {
        let storage = test_storage("https://storage.googleapis.com")
            .with_signer(Arc::new(HmacSigner::new("GOOG1ID", "secret")));
        let object = storage.bucket("b").object("o.txt").with_generation(7);
        let expires = Utc::now() + chrono::Duration::minutes(10);
        let url = object
            .get_signed_url(&SignedUrlConfig::read(expires))
            .await
            .unwrap();
        assert!(url.starts_with("https://storage.googleapis.com/b/o.txt?"));
        assert!(url.contains("X-Goog-Algorithm=GOOG4-HMAC-SHA256"));
        assert!(url.contains("generation=7"));
        assert!(url.contains("&X-Goog-Signature="));
    }
}
