//! Object uploads through the upload API.
//!
//! Small payloads go up in one request: `uploadType=media` when only the
//! content type is set, `uploadType=multipart` (a `multipart/related` body
//! of JSON metadata followed by the media) otherwise.  Large payloads and
//! readers use a [`resumable::ResumableUpload`] session.
//!
//! Uploads replace the object, so they are retried under the conditional
//! policy: only when `ifGenerationMatch` pins the generation being
//! replaced.

pub mod resumable;
pub mod xml_multipart;

use bytes::{BufMut, Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::errors::Result;
use crate::metrics;
use crate::model::{Object, Preconditions};
use crate::resources::object::ObjectHandle;
use crate::retry::Idempotency;
use crate::transport::{encode_path_segment, ApiRequest};
use resumable::ResumableUpload;

/// Payloads larger than this use a resumable session unless told otherwise.
pub const RESUMABLE_THRESHOLD: usize = 5 * 1024 * 1024;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Options shared by every upload path.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Metadata for the new object.  `name` and `bucket` are ignored.
    pub metadata: Object,
    pub preconditions: Preconditions,
    pub predefined_acl: Option<String>,
    pub kms_key_name: Option<String>,
    /// Force (`Some(true)`) or forbid (`Some(false)`) a resumable session;
    /// by default sessions are used above [`RESUMABLE_THRESHOLD`].
    pub resumable: Option<bool>,
    /// Resumable chunk size; defaults to the client's configured size.
    pub chunk_size: Option<usize>,
    pub cancel: Option<CancellationToken>,
}

impl UploadOptions {
    pub fn content_type(&self) -> &str {
        self.metadata
            .content_type
            .as_deref()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    pub(crate) fn idempotency(&self) -> Idempotency {
        Idempotency::conditional(self.preconditions.pins_generation())
    }

    /// Whether the metadata carries more than a content type.
    fn has_extra_metadata(&self) -> bool {
        let bare = Object {
            content_type: self.metadata.content_type.clone(),
            ..Object::default()
        };
        let mut metadata = self.metadata.clone();
        metadata.name.clear();
        metadata.bucket.clear();
        metadata != bare
    }

    /// Metadata as sent in upload bodies.
    pub(crate) fn metadata_for(&self, object: &ObjectHandle) -> Object {
        let mut metadata = self.metadata.clone();
        metadata.name = object.name().to_string();
        metadata.bucket.clear();
        if metadata.content_type.is_none() {
            metadata.content_type = Some(DEFAULT_CONTENT_TYPE.to_string());
        }
        metadata
    }
}

/// `POST {upload endpoint}/b/{bucket}/o` with the common query parameters.
pub(crate) fn insert_request(
    object: &ObjectHandle,
    upload_type: &str,
    options: &UploadOptions,
) -> ApiRequest {
    let transport = object.storage().transport();
    let url = transport.upload_url(&format!(
        "/b/{}/o",
        encode_path_segment(object.bucket().name())
    ));
    ApiRequest::new(Method::POST, url)
        .resource(object.display_name())
        .idempotency(options.idempotency())
        .cancel_on(options.cancel.clone())
        .query("uploadType", upload_type)
        .query("name", object.name())
        .query_pairs(options.preconditions.query_pairs())
        .query_opt("predefinedAcl", options.predefined_acl.as_deref())
        .query_opt("kmsKeyName", options.kms_key_name.as_deref())
}

/// Build a `multipart/related` body: JSON metadata, then the media.
///
/// Returns the body and its content type.
pub fn multipart_related_body(
    metadata: &Object,
    data: &[u8],
    content_type: &str,
    boundary: &str,
) -> Result<(Bytes, String)> {
    let json = serde_json::to_vec(metadata)?;
    let mut body = BytesMut::with_capacity(json.len() + data.len() + 256);
    body.put_slice(format!("--{boundary}\r\n").as_bytes());
    body.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.put_slice(&json);
    body.put_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.put_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.put_slice(data);
    body.put_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    Ok((
        body.freeze(),
        format!("multipart/related; boundary={boundary}"),
    ))
}

/// Upload `data` in a single request.
pub async fn upload_simple(
    object: &ObjectHandle,
    data: Bytes,
    options: &UploadOptions,
) -> Result<Object> {
    let len = data.len();
    let req = if options.has_extra_metadata() {
        let boundary = format!("gcsclient-{}", Uuid::new_v4().simple());
        let (body, content_type) = multipart_related_body(
            &options.metadata_for(object),
            &data,
            options.content_type(),
            &boundary,
        )?;
        insert_request(object, "multipart", options)
            .operation("upload_multipart")
            .bytes(body, content_type)
    } else {
        insert_request(object, "media", options)
            .operation("upload_media")
            .bytes(data, options.content_type())
    };
    let uploaded: Object = object.storage().transport().json(req).await?;
    metrics::record_uploaded(len as u64);
    debug!("Uploaded {} bytes to {}", len, object.display_name());
    Ok(uploaded)
}

/// Upload `data`, choosing between a single request and a session.
pub async fn upload_bytes(
    object: &ObjectHandle,
    data: Bytes,
    options: &UploadOptions,
) -> Result<Object> {
    let resumable = options
        .resumable
        .unwrap_or(data.len() > RESUMABLE_THRESHOLD);
    if !resumable {
        return upload_simple(object, data, options).await;
    }
    let mut session = ResumableUpload::new(object, options.clone());
    session.start(Some(data.len() as u64)).await?;
    session.write(&data).await?;
    session.finish().await
}

/// Upload everything `reader` yields through a resumable session.
pub async fn upload_from_reader<R>(
    object: &ObjectHandle,
    mut reader: R,
    options: &UploadOptions,
) -> Result<Object>
where
    R: AsyncRead + Unpin + Send,
{
    let mut session = ResumableUpload::new(object, options.clone());
    session.start(None).await?;
    let mut buf = vec![0u8; session.chunk_size()];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        session.write(&buf[..n]).await?;
    }
    session.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{json_response, spawn_recording_service, test_storage};
    use axum::http::StatusCode;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_multipart_related_body() {
        let metadata = Object {
            name: "a.txt".to_string(),
            content_type: Some("text/plain".to_string()),
            ..Object::default()
        };
        let (body, content_type) =
            multipart_related_body(&metadata, b"hi", "text/plain", "XYZ").unwrap();
        assert_eq!(content_type, "multipart/related; boundary=XYZ");
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            "--XYZ\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n\
             {\"name\":\"a.txt\",\"contentType\":\"text/plain\"}\r\n\
             --XYZ\r\nContent-Type: text/plain\r\n\r\nhi\r\n--XYZ--\r\n"
        );
    }

    #[test]
    fn test_extra_metadata_detection() {
        let mut options = UploadOptions::default();
        assert!(!options.has_extra_metadata());
        options.metadata.content_type = Some("text/plain".to_string());
        assert!(!options.has_extra_metadata());
        options.metadata.metadata = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
        assert!(options.has_extra_metadata());
    }

    #[tokio::test]
    async fn test_media_and_multipart_uploads() {
        let (base, seen) = spawn_recording_service(|req| {
            json_response(
                StatusCode::OK,
                json!({"name": req.query["name"], "bucket": "b", "generation": "1"}),
            )
        })
        .await;
        let object = test_storage(&base).bucket("b").object("dir/file.txt");

        let mut options = UploadOptions::default();
        options.metadata.content_type = Some("text/plain".to_string());
        options.preconditions = Preconditions::if_generation_match(0);
        let uploaded = object.save(&b"hello"[..], &options).await.unwrap();
        assert_eq!(uploaded.name, "dir/file.txt");

        options.metadata.cache_control = Some("no-cache".to_string());
        object.save(&b"hello"[..], &options).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].path, "/upload/storage/v1/b/b/o");
        assert_eq!(seen[0].query["uploadType"], "media");
        assert_eq!(seen[0].query["ifGenerationMatch"], "0");
        assert_eq!(seen[0].header("content-type"), Some("text/plain"));
        assert_eq!(&seen[0].body[..], b"hello");

        assert_eq!(seen[1].query["uploadType"], "multipart");
        let content_type = seen[1].header("content-type").unwrap();
        assert!(content_type.starts_with("multipart/related; boundary="));
        let body = std::str::from_utf8(&seen[1].body).unwrap();
        assert!(body.contains("\"cacheControl\":\"no-cache\""));
        assert!(body.contains("\r\n\r\nhello\r\n"));
    }
}
