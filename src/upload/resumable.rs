//! Resumable upload sessions.
//!
//! ```text
//! NotStarted --start--> Active { session_uri, offset } --final chunk--> Finalized
//!                           |  ^                          \--cancel--> Cancelled
//!                           |  '-- 308 Range: bytes=0-N (offset = N + 1)
//!                           '----- 404 / 410 -----------------------> Failed
//! ```
//!
//! The session URI comes from the `Location` header of the initiating
//! POST.  Chunks are sent with `Content-Range: bytes a-b/total` (`*` while
//! the total is unknown) and every non-final chunk is a multiple of
//! 256 KiB.  The server may persist less than it was sent; bytes past the
//! persisted offset stay buffered and are sent again.  After a retryable
//! failure the session is queried with `Content-Range: bytes */total` and
//! the upload continues from the server's offset.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_RANGE, LOCATION, RANGE};
use http::{Method, StatusCode};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{insert_request, UploadOptions};
use crate::errors::{Result, StorageError};
use crate::metrics;
use crate::model::Object;
use crate::resources::object::ObjectHandle;
use crate::retry::{random_jitter, Idempotency, RetryDecision};
use crate::transport::{check_response, ApiRequest};

/// Non-final chunks must be a multiple of this many bytes.
pub const CHUNK_GRANULARITY: usize = 256 * 1024;

const RESUME_INCOMPLETE: u16 = 308;
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Round `size` down to a multiple of [`CHUNK_GRANULARITY`] (at least one).
pub fn round_chunk_size(size: usize) -> usize {
    (size / CHUNK_GRANULARITY).max(1) * CHUNK_GRANULARITY
}

/// `Content-Range` for `len` bytes at `offset`.  A zero length produces
/// the `bytes */total` form used for status queries and empty final
/// chunks.
pub fn content_range(offset: u64, len: usize, total: Option<u64>) -> String {
    let total = total.map_or_else(|| "*".to_string(), |t| t.to_string());
    if len == 0 {
        format!("bytes */{total}")
    } else {
        format!("bytes {}-{}/{total}", offset, offset + len as u64 - 1)
    }
}

/// Bytes the server has persisted, from a `Range: bytes=0-N` header.
pub fn persisted_bytes(range: Option<&HeaderValue>) -> Option<u64> {
    let value = range?.to_str().ok()?;
    let (_, end) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    end.parse::<u64>().ok().map(|n| n + 1)
}

/// Where a session stands.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadState {
    NotStarted,
    Active { session_uri: String, offset: u64 },
    Finalized(Box<Object>),
    Cancelled,
    Failed,
}

/// A resumable upload of one object.
#[derive(Debug)]
pub struct ResumableUpload {
    object: ObjectHandle,
    options: UploadOptions,
    state: UploadState,
    chunk_size: usize,
    /// Bytes from the persisted offset onward that the server has not
    /// acknowledged.
    buffer: BytesMut,
    total_size: Option<u64>,
    invocation_id: String,
}

impl ResumableUpload {
    pub(crate) fn new(object: &ObjectHandle, options: UploadOptions) -> Self {
        let chunk_size = round_chunk_size(
            options
                .chunk_size
                .unwrap_or_else(|| object.storage().upload_chunk_size()),
        );
        Self {
            object: object.clone(),
            options,
            state: UploadState::NotStarted,
            chunk_size,
            buffer: BytesMut::new(),
            total_size: None,
            invocation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Reattach to `session_uri` and learn how much the server has.
    ///
    /// The caller continues writing from [`offset`](Self::offset).
    pub(crate) async fn resume(
        object: &ObjectHandle,
        session_uri: &str,
        options: UploadOptions,
    ) -> Result<Self> {
        let mut upload = Self::new(object, options);
        upload.state = UploadState::Active {
            session_uri: session_uri.to_string(),
            offset: 0,
        };
        upload.query_status().await?;
        Ok(upload)
    }

    pub fn state(&self) -> &UploadState {
        &self.state
    }

    /// The session URI, which can be persisted to resume later.
    pub fn session_uri(&self) -> Option<&str> {
        match &self.state {
            UploadState::Active { session_uri, .. } => Some(session_uri),
            _ => None,
        }
    }

    /// Bytes the server has persisted.
    pub fn offset(&self) -> u64 {
        match &self.state {
            UploadState::Active { offset, .. } => *offset,
            _ => 0,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn active(&self) -> Result<(String, u64)> {
        match &self.state {
            UploadState::Active {
                session_uri,
                offset,
            } => Ok((session_uri.clone(), *offset)),
            other => Err(StorageError::InvalidArgument(format!(
                "upload session is not active ({other:?})"
            ))),
        }
    }

    /// Open the session.  `total_size` is announced when known.
    pub async fn start(&mut self, total_size: Option<u64>) -> Result<String> {
        if self.state != UploadState::NotStarted {
            return Err(StorageError::InvalidArgument(
                "upload session already started".into(),
            ));
        }
        self.total_size = total_size;

        let mut req = insert_request(&self.object, "resumable", &self.options)
            .operation("start_resumable_upload")
            .json(&self.options.metadata_for(&self.object))?;
        if let Ok(value) = HeaderValue::from_str(self.options.content_type()) {
            req = req.header(HeaderName::from_static("x-upload-content-type"), value);
        }
        if let Some(total) = total_size {
            req = req.header(
                HeaderName::from_static("x-upload-content-length"),
                HeaderValue::from(total),
            );
        }

        let session_uri = self
            .object
            .storage()
            .transport()
            .run(&req, |resp| async move {
                resp.headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        StorageError::InvalidArgument(
                            "resumable upload response has no Location header".into(),
                        )
                    })
            })
            .await?;

        info!("Started resumable upload of {}", self.object.display_name());
        self.state = UploadState::Active {
            session_uri: session_uri.clone(),
            offset: 0,
        };
        Ok(session_uri)
    }

    /// Buffer `data`, sending full chunks as they accumulate.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.state == UploadState::NotStarted {
            self.start(None).await?;
        }
        self.active()?;
        self.buffer.extend_from_slice(data);
        while self.buffer.len() > self.chunk_size {
            self.send(false).await?;
            if !matches!(self.state, UploadState::Active { .. }) {
                return Err(StorageError::InvalidArgument(
                    "upload finalized before all data was sent".into(),
                ));
            }
        }
        Ok(())
    }

    /// Send the remaining bytes as the final chunk.
    pub async fn finish(&mut self) -> Result<Object> {
        if self.state == UploadState::NotStarted {
            self.start(Some(self.buffer.len() as u64)).await?;
        }
        loop {
            if let UploadState::Finalized(object) = &self.state {
                return Ok((**object).clone());
            }
            self.active()?;
            self.send(true).await?;
        }
    }

    /// Abandon the session.  The service answers 499 on success.
    pub async fn cancel(&mut self) -> Result<()> {
        let (uri, _) = self.active()?;
        let req = ApiRequest::new(Method::DELETE, uri)
            .operation("cancel_resumable_upload")
            .resource(self.object.display_name());
        let resp = self
            .object
            .storage()
            .transport()
            .send_attempt(&req, &self.invocation_id, 1)
            .await?;
        let status = resp.status();
        if status.is_success() || status.as_u16() == CLIENT_CLOSED_REQUEST {
            self.state = UploadState::Cancelled;
            self.buffer.clear();
            info!("Cancelled upload of {}", self.object.display_name());
            return Ok(());
        }
        check_response(resp, &self.object.display_name()).await?;
        Ok(())
    }

    /// Ask the server how much it has persisted and sync the offset.
    pub async fn query_status(&mut self) -> Result<&UploadState> {
        let (uri, _) = self.active()?;
        let req = ApiRequest::new(Method::PUT, uri)
            .operation("query_upload_status")
            .resource(self.object.display_name())
            .idempotency(Idempotency::Idempotent)
            .cancel_on(self.options.cancel.clone())
            .header(
                CONTENT_RANGE,
                header_value(&content_range(0, 0, self.total_size))?,
            )
            .bytes(Bytes::new(), self.options.content_type());

        let transport = self.object.storage().transport();
        let invocation_id = self.invocation_id.as_str();
        let resource = self.object.display_name();
        let req_ref = &req;
        let resource_ref = resource.as_str();
        let resp = transport
            .retry_policy()
            .run(req.operation, req.idempotency, req.cancel.as_ref(), |attempt| async move {
                let resp = transport.send_attempt(req_ref, invocation_id, attempt).await?;
                screen_session_response(resp, resource_ref).await
            })
            .await;
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => return Err(self.fail_if_expired(e)),
        };
        self.apply_response(resp).await?;
        Ok(&self.state)
    }

    fn fail_if_expired(&mut self, err: StorageError) -> StorageError {
        if matches!(err, StorageError::UploadSessionExpired) {
            warn!("Upload session for {} expired", self.object.display_name());
            self.state = UploadState::Failed;
        }
        err
    }

    /// Send the next chunk (or the final one), retrying under the upload's
    /// idempotency with a status query before each retry.
    async fn send(&mut self, last: bool) -> Result<()> {
        let policy = self.object.storage().transport().retry_policy().clone();
        let idempotency = self.options.idempotency();
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.put_chunk(last, attempt).await {
                Ok(()) => return Ok(()),
                Err(e) => self.fail_if_expired(e),
            };
            if matches!(
                err,
                StorageError::UploadSessionExpired | StorageError::Cancelled
            ) {
                return Err(err);
            }
            match policy.decide(&err, attempt, started.elapsed(), idempotency, random_jitter()) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        "Chunk upload for {} failed: {}; retrying in {:?}",
                        self.object.display_name(),
                        err,
                        delay
                    );
                    metrics::record_retry("upload_chunk");
                    self.sleep_or_cancel(delay).await?;
                    self.query_status().await?;
                    if !matches!(self.state, UploadState::Active { .. }) {
                        return Ok(());
                    }
                }
                RetryDecision::Stop(reason) => {
                    debug!("Giving up on chunk upload: {:?}", reason);
                    self.state = UploadState::Failed;
                    return Err(err);
                }
            }
        }
    }

    async fn sleep_or_cancel(&self, delay: std::time::Duration) -> Result<()> {
        match &self.options.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(StorageError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    async fn put_chunk(&mut self, last: bool, attempt: u32) -> Result<()> {
        if self
            .options
            .cancel
            .as_ref()
            .is_some_and(|t| t.is_cancelled())
        {
            return Err(StorageError::Cancelled);
        }
        let (uri, offset) = self.active()?;
        let len = if last {
            self.buffer.len()
        } else {
            self.chunk_size.min(self.buffer.len())
        };
        let total = if last {
            Some(offset + len as u64)
        } else {
            self.total_size
        };
        let chunk = Bytes::copy_from_slice(&self.buffer[..len]);

        let req = ApiRequest::new(Method::PUT, uri)
            .operation("upload_chunk")
            .resource(self.object.display_name())
            .header(CONTENT_RANGE, header_value(&content_range(offset, len, total))?)
            .bytes(chunk, self.options.content_type());
        debug!(
            "Uploading {} bytes at offset {} of {}",
            len,
            offset,
            self.object.display_name()
        );
        let resp = self
            .object
            .storage()
            .transport()
            .send_attempt(&req, &self.invocation_id, attempt)
            .await?;
        let resp = screen_session_response(resp, &self.object.display_name()).await?;
        if self.apply_response(resp).await? {
            return Ok(());
        }
        warn!(
            "Upload of {} made no progress at offset {}",
            self.object.display_name(),
            offset
        );
        Err(StorageError::UploadStalled { offset })
    }

    /// Apply a 308 or a final 200/201 to the session state.  Returns
    /// whether the session moved forward.
    async fn apply_response(&mut self, resp: reqwest::Response) -> Result<bool> {
        if resp.status().as_u16() != RESUME_INCOMPLETE {
            let object: Object = resp.json().await?;
            metrics::record_uploaded(self.buffer.len() as u64);
            self.buffer.clear();
            info!(
                "Finalized upload of {} (generation {:?})",
                self.object.display_name(),
                object.generation
            );
            self.state = UploadState::Finalized(Box::new(object));
            return Ok(true);
        }

        let (uri, offset) = self.active()?;
        let persisted = persisted_bytes(resp.headers().get(RANGE)).unwrap_or(0);
        if persisted < offset {
            self.state = UploadState::Failed;
            return Err(StorageError::InvalidArgument(format!(
                "server persisted {persisted} bytes but {offset} were already acknowledged"
            )));
        }
        let advanced = ((persisted - offset) as usize).min(self.buffer.len());
        self.buffer.advance(advanced);
        metrics::record_uploaded(advanced as u64);
        self.state = UploadState::Active {
            session_uri: uri,
            offset: persisted,
        };
        Ok(persisted > offset)
    }
}

/// Pass through 308 and success; map 404/410 to an expired session and
/// everything else to an error.
async fn screen_session_response(
    resp: reqwest::Response,
    resource: &str,
) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() || status.as_u16() == RESUME_INCOMPLETE {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Err(StorageError::UploadSessionExpired);
    }
    check_response(resp, resource).await
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| StorageError::InvalidArgument(format!("invalid header value {value:?}: {e}")))
}
