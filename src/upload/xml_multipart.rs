//! Multipart uploads through the XML API.
//!
//! An upload is initiated with `POST /{bucket}/{object}?uploads`, parts are
//! sent with `PUT ?partNumber=N&uploadId=ID` and the object is assembled
//! with `POST ?uploadId=ID` carrying a `CompleteMultipartUpload` document
//! that lists every part number with the ETag returned for it.

use bytes::Bytes;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use http::header::{HeaderName, HeaderValue, ETAG};
use http::Method;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Cursor;
use tracing::{debug, info, warn};

use super::UploadOptions;
use crate::errors::{Result, StorageError};
use crate::metrics;
use crate::resources::object::ObjectHandle;
use crate::resources::BULK_CONCURRENCY;
use crate::retry::Idempotency;

pub const MAX_PARTS: u32 = 10_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

/// Response to a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CompletedUpload {
    #[serde(rename = "Location", default)]
    pub location: Option<String>,
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "ETag")]
    pub etag: String,
}

fn xml_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Xml(e.to_string())
}

fn parse_xml<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    quick_xml::de::from_str(body).map_err(xml_error)
}

fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    tag: &str,
    text: &str,
) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(xml_error)
}

/// Render the `CompleteMultipartUpload` body.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <CompleteMultipartUpload>
///   <Part><PartNumber>1</PartNumber><ETag>"abc"</ETag></Part>
/// </CompleteMultipartUpload>
/// ```
pub fn render_complete_multipart_upload(parts: &BTreeMap<u32, String>) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Start(BytesStart::new("CompleteMultipartUpload")))
        .map_err(xml_error)?;
    for (number, etag) in parts {
        writer
            .write_event(Event::Start(BytesStart::new("Part")))
            .map_err(xml_error)?;
        write_text_element(&mut writer, "PartNumber", &number.to_string())?;
        write_text_element(&mut writer, "ETag", etag)?;
        writer
            .write_event(Event::End(BytesEnd::new("Part")))
            .map_err(xml_error)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("CompleteMultipartUpload")))
        .map_err(xml_error)?;
    String::from_utf8(writer.into_inner().into_inner()).map_err(xml_error)
}

fn header(name: &'static str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| StorageError::InvalidArgument(format!("invalid {name} header: {e}")))?;
    Ok((HeaderName::from_static(name), value))
}

/// An in-progress XML API multipart upload.
#[derive(Debug)]
pub struct XmlMultipartUpload {
    object: ObjectHandle,
    upload_id: String,
    options: UploadOptions,
    /// ETag of every part uploaded so far, keyed by part number.
    parts: BTreeMap<u32, String>,
}

impl XmlMultipartUpload {
    /// Start an upload.  Content type and custom metadata are fixed here.
    pub async fn initiate(object: &ObjectHandle, options: &UploadOptions) -> Result<Self> {
        let mut req = object
            .xml_request(Method::POST)
            .operation("initiate_multipart_upload")
            .idempotency(Idempotency::NonIdempotent)
            .query("uploads", "");
        for (name, value) in options.metadata.metadata.iter().flatten() {
            let value = HeaderValue::from_str(value).map_err(|e| {
                StorageError::InvalidArgument(format!("invalid metadata value for {name}: {e}"))
            })?;
            let name = HeaderName::try_from(format!("x-goog-meta-{name}")).map_err(|e| {
                StorageError::InvalidArgument(format!("invalid metadata key {name}: {e}"))
            })?;
            req = req.header(name, value);
        }
        if let Some(acl) = &options.predefined_acl {
            let (name, value) = header("x-goog-acl", acl)?;
            req = req.header(name, value);
        }
        req = req.bytes(Bytes::new(), options.content_type());

        let result: InitiateMultipartUploadResult = object
            .storage()
            .transport()
            .run(&req, |resp| async move { parse_xml(&resp.text().await?) })
            .await?;
        info!(
            "Initiated multipart upload {} for {}",
            result.upload_id,
            object.display_name()
        );
        Ok(Self {
            object: object.clone(),
            upload_id: result.upload_id,
            options: options.clone(),
            parts: BTreeMap::new(),
        })
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn parts(&self) -> &BTreeMap<u32, String> {
        &self.parts
    }

    /// Upload one part (1..=10000) and remember its ETag.
    ///
    /// Re-uploading a part number replaces the earlier part.
    pub async fn upload_part(&mut self, part_number: u32, data: Bytes) -> Result<String> {
        let etag = upload_part(&self.object, &self.upload_id, part_number, data).await?;
        self.parts.insert(part_number, etag.clone());
        Ok(etag)
    }

    /// Upload `chunks` as parts numbered from 1, several at a time.
    pub async fn upload_parts(&mut self, chunks: Vec<Bytes>) -> Result<()> {
        if chunks.len() > MAX_PARTS as usize {
            return Err(StorageError::InvalidArgument(format!(
                "a multipart upload has at most {MAX_PARTS} parts, got {}",
                chunks.len()
            )));
        }
        let object = &self.object;
        let upload_id = self.upload_id.as_str();
        let uploaded: Vec<(u32, String)> = stream::iter(chunks.into_iter().zip(1u32..))
            .map(|(data, number)| async move {
                let etag = upload_part(object, upload_id, number, data).await?;
                Ok::<_, StorageError>((number, etag))
            })
            .buffer_unordered(BULK_CONCURRENCY)
            .try_collect()
            .await?;
        self.parts.extend(uploaded);
        Ok(())
    }

    /// Assemble the uploaded parts into the object.
    pub async fn complete(self) -> Result<CompletedUpload> {
        if self.parts.is_empty() {
            return Err(StorageError::InvalidArgument(
                "cannot complete a multipart upload with no parts".into(),
            ));
        }
        let body = render_complete_multipart_upload(&self.parts)?;
        let mut req = self
            .object
            .xml_request(Method::POST)
            .operation("complete_multipart_upload")
            .idempotency(self.options.idempotency())
            .query("uploadId", &self.upload_id)
            .bytes(Bytes::from(body), "application/xml");
        if let Some(generation) = self.options.preconditions.if_generation_match {
            let (name, value) = header("x-goog-if-generation-match", &generation.to_string())?;
            req = req.header(name, value);
        }
        let completed: CompletedUpload = self
            .object
            .storage()
            .transport()
            .run(&req, |resp| async move { parse_xml(&resp.text().await?) })
            .await?;
        info!(
            "Completed multipart upload {} of {} parts to {}",
            self.upload_id,
            self.parts.len(),
            self.object.display_name()
        );
        Ok(completed)
    }

    /// Discard the upload and every part sent for it.
    pub async fn abort(self) -> Result<()> {
        let req = self
            .object
            .xml_request(Method::DELETE)
            .operation("abort_multipart_upload")
            .idempotency(Idempotency::Idempotent)
            .query("uploadId", &self.upload_id);
        match self.object.storage().transport().empty(req).await {
            Ok(()) => {
                info!("Aborted multipart upload {}", self.upload_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!("Multipart upload {} was already gone", self.upload_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn upload_part(
    object: &ObjectHandle,
    upload_id: &str,
    part_number: u32,
    data: Bytes,
) -> Result<String> {
    if part_number == 0 || part_number > MAX_PARTS {
        return Err(StorageError::InvalidArgument(format!(
            "part number must be between 1 and {MAX_PARTS}, got {part_number}"
        )));
    }
    let len = data.len() as u64;
    let req = object
        .xml_request(Method::PUT)
        .operation("upload_part")
        .idempotency(Idempotency::Idempotent)
        .query("partNumber", part_number)
        .query("uploadId", upload_id)
        .bytes(data, "application/octet-stream");
    let etag = object
        .storage()
        .transport()
        .run(&req, |resp| async move {
            resp.headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| StorageError::Xml("upload part response has no ETag".into()))
        })
        .await?;
    metrics::record_uploaded(len);
    debug!("Uploaded part {} ({} bytes) of {}", part_number, len, upload_id);
    Ok(etag)
}
