//! Media downloads.
//!
//! Bodies are streamed with `bytes_stream`.  When the whole object is read
//! and the service did not decompress it on the way out, the bytes are
//! hashed and checked against the MD5 in `x-goog-hash`; a mismatch ends
//! the stream with [`StorageError::DataCorruption`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use http::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, RANGE};
use http::{Method, StatusCode};
use md5::{Digest, Md5};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::{Result, StorageError};
use crate::metrics;
use crate::resources::object::ObjectHandle;
use crate::retry::Idempotency;
use crate::transport::ApiRequest;

const HASH_HEADER: &str = "x-goog-hash";
const STORED_ENCODING_HEADER: &str = "x-goog-stored-content-encoding";
const GENERATION_HEADER: &str = "x-goog-generation";

/// Most that `collect_bytes` reserves up front from a declared length.
const MAX_PREALLOCATION: usize = 8 * 1024 * 1024;

fn initial_capacity(content_length: Option<u64>) -> usize {
    content_length.map_or(0, |len| len.min(MAX_PREALLOCATION as u64) as usize)
}

/// Portion of an object to read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ByteRange {
    #[default]
    Full,
    /// From `start` to the end.
    From(u64),
    /// `start..=end`.
    Inclusive { start: u64, end: u64 },
    /// The last `n` bytes.
    Last(u64),
}

impl ByteRange {
    pub fn header_value(&self) -> Option<String> {
        match *self {
            ByteRange::Full => None,
            ByteRange::From(start) => Some(format!("bytes={start}-")),
            ByteRange::Inclusive { start, end } => Some(format!("bytes={start}-{end}")),
            ByteRange::Last(n) => Some(format!("bytes=-{n}")),
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, ByteRange::Full | ByteRange::From(0))
    }
}

/// Options for reading an object.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub range: ByteRange,
    /// Verify the MD5 of whole-object reads.
    pub validate: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            range: ByteRange::Full,
            validate: true,
        }
    }
}

/// Extract the base64 MD5 from an `x-goog-hash` header such as
/// `crc32c=n03x6A==,md5=Ojk9c3dhfxgoKVVHYwFbHQ==`.
pub fn md5_from_hash_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(HASH_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|part| part.trim().strip_prefix("md5=").map(str::to_string))
}

/// Whether the service decompressed a gzip-stored object while serving it.
fn is_transcoded(headers: &HeaderMap) -> bool {
    let stored_gzip = headers
        .get(STORED_ENCODING_HEADER)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
        .unwrap_or(false);
    let served_gzip = headers
        .get(CONTENT_ENCODING)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
        .unwrap_or(false);
    stored_gzip && !served_gzip
}

/// A stream of object bytes that validates the checksum at the end.
pub struct ObjectReader {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    hasher: Option<Md5>,
    expected_md5: Option<String>,
    content_length: Option<u64>,
    generation: Option<i64>,
    finished: bool,
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("expected_md5", &self.expected_md5)
            .field("content_length", &self.content_length)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl ObjectReader {
    fn new(resp: reqwest::Response, options: &DownloadOptions) -> Self {
        let headers = resp.headers();
        let whole = options.range.is_full() && resp.status() != StatusCode::PARTIAL_CONTENT;
        let expected_md5 = if options.validate && whole && !is_transcoded(headers) {
            md5_from_hash_header(headers)
        } else {
            None
        };
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let generation = headers
            .get(GENERATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Self {
            hasher: expected_md5.as_ref().map(|_| Md5::new()),
            expected_md5,
            content_length,
            generation,
            finished: false,
            inner: resp.bytes_stream().boxed(),
        }
    }

    /// `Content-Length` of the response, when sent.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Generation being served.
    pub fn generation(&self) -> Option<i64> {
        self.generation
    }

    fn verify(&mut self) -> Result<()> {
        let (Some(hasher), Some(expected)) = (self.hasher.take(), self.expected_md5.as_ref()) else {
            return Ok(());
        };
        let actual = STANDARD.encode(hasher.finalize());
        if &actual != expected {
            return Err(StorageError::DataCorruption {
                expected: expected.clone(),
                actual,
            });
        }
        debug!("MD5 verified: {}", actual);
        Ok(())
    }

    /// Read the rest of the stream into memory.
    pub async fn collect_bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(initial_capacity(self.content_length));
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ObjectReader {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                metrics::record_downloaded(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.finished = true;
                match this.verify() {
                    Ok(()) => Poll::Ready(None),
                    Err(e) => Poll::Ready(Some(Err(e))),
                }
            }
        }
    }
}

fn media_request(object: &ObjectHandle, options: &DownloadOptions) -> ApiRequest {
    let mut req = object
        .request(Method::GET, "")
        .operation("download_object")
        .idempotency(Idempotency::Idempotent)
        .query("alt", "media");
    if let Some(range) = options.range.header_value() {
        if let Ok(value) = HeaderValue::from_str(&range) {
            req = req.header(RANGE, value);
        }
    }
    req
}

/// Open a streaming download.  Only the request is retried; a body that
/// fails mid-stream surfaces as an error item.
pub async fn read_stream(object: &ObjectHandle, options: &DownloadOptions) -> Result<ObjectReader> {
    let resp = object
        .storage()
        .transport()
        .execute(media_request(object, options))
        .await?;
    Ok(ObjectReader::new(resp, options))
}

/// Download into memory.  Interrupted bodies are re-requested under the
/// retry policy.
pub async fn download(object: &ObjectHandle, options: &DownloadOptions) -> Result<Bytes> {
    let req = media_request(object, options);
    object
        .storage()
        .transport()
        .run(&req, |resp| async move {
            ObjectReader::new(resp, options).collect_bytes().await
        })
        .await
}

/// Stream into a local file, returning the bytes written.  The file is
/// removed if the checksum does not match.
pub async fn download_to_file(
    object: &ObjectHandle,
    path: &Path,
    options: &DownloadOptions,
) -> Result<u64> {
    let mut reader = read_stream(object, options).await?;
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = reader.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                if let Err(rm) = tokio::fs::remove_file(path).await {
                    warn!("Failed to remove partial download {}: {}", path.display(), rm);
                }
                return Err(e);
            }
        };
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    debug!("Downloaded {} bytes to {}", written, path.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_recording_service, test_storage};
    use axum::response::IntoResponse;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const BODY: &[u8] = b"hello world";

    fn md5_b64(data: &[u8]) -> String {
        STANDARD.encode(Md5::digest(data))
    }

    #[test]
    fn test_range_header_values() {
        assert_eq!(ByteRange::Full.header_value(), None);
        assert_eq!(ByteRange::From(5).header_value().unwrap(), "bytes=5-");
        assert_eq!(
            ByteRange::Inclusive { start: 0, end: 9 }.header_value().unwrap(),
            "bytes=0-9"
        );
        assert_eq!(ByteRange::Last(4).header_value().unwrap(), "bytes=-4");
        assert!(ByteRange::From(0).is_full());
        assert!(!ByteRange::Last(4).is_full());
    }

    #[test]
    fn test_initial_capacity_is_capped() {
        assert_eq!(initial_capacity(None), 0);
        assert_eq!(initial_capacity(Some(11)), 11);
        assert_eq!(initial_capacity(Some(u64::MAX)), MAX_PREALLOCATION);
    }

    #[test]
    fn test_md5_from_hash_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HASH_HEADER,
            HeaderValue::from_static("crc32c=n03x6A==,md5=XrY7u+Ae7tCTyyK7j1rNww=="),
        );
        assert_eq!(
            md5_from_hash_header(&headers).as_deref(),
            Some("XrY7u+Ae7tCTyyK7j1rNww==")
        );

        let mut split = HeaderMap::new();
        split.append(HASH_HEADER, HeaderValue::from_static("crc32c=n03x6A=="));
        split.append(HASH_HEADER, HeaderValue::from_static("md5=abc"));
        assert_eq!(md5_from_hash_header(&split).as_deref(), Some("abc"));
    }

    #[test]
    fn test_is_transcoded() {
        let mut headers = HeaderMap::new();
        headers.insert(STORED_ENCODING_HEADER, HeaderValue::from_static("gzip"));
        assert!(is_transcoded(&headers));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(!is_transcoded(&headers));
    }

    #[tokio::test]
    async fn test_download_validates_md5() {
        let (base, seen) = spawn_recording_service(|req| {
            let md5 = if req.path.ends_with("/good") {
                md5_b64(BODY)
            } else {
                md5_b64(b"something else")
            };
            ([(HASH_HEADER, format!("crc32c=AAAAAA==,md5={md5}"))], BODY).into_response()
        })
        .await;
        let bucket = test_storage(&base).bucket("b");

        let data = bucket.object("good").download().await.unwrap();
        assert_eq!(&data[..], BODY);
        assert_eq!(seen.lock().unwrap()[0].query["alt"], "media");

        let err = bucket.object("bad").download().await.unwrap_err();
        assert!(matches!(err, StorageError::DataCorruption { .. }));
    }

    #[tokio::test]
    async fn test_range_reads_skip_validation() {
        let (base, seen) = spawn_recording_service(|_| {
            (
                StatusCode::PARTIAL_CONTENT,
                [(HASH_HEADER, "md5=AAAAAAAAAAAAAAAAAAAAAA==")],
                &BODY[6..],
            )
                .into_response()
        })
        .await;
        let object = test_storage(&base).bucket("b").object("o");
        let data = object.download_range(ByteRange::From(6)).await.unwrap();
        assert_eq!(&data[..], b"world");
        assert_eq!(seen.lock().unwrap()[0].header("range"), Some("bytes=6-"));
    }

    #[tokio::test]
    async fn test_download_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let (base, _) = spawn_recording_service(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                StatusCode::BAD_GATEWAY.into_response()
            } else {
                BODY.into_response()
            }
        })
        .await;
        let data = test_storage(&base)
            .bucket("b")
            .object("o")
            .download()
            .await
            .unwrap();
        assert_eq!(&data[..], BODY);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_download_to_file_removes_corrupt_file() {
        let (base, _) = spawn_recording_service(|req| {
            let md5 = if req.path.ends_with("/good") {
                md5_b64(BODY)
            } else {
                md5_b64(b"nope")
            };
            ([(HASH_HEADER, format!("md5={md5}"))], BODY).into_response()
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let bucket = test_storage(&base).bucket("b");

        let good = dir.path().join("good.txt");
        let written = bucket.object("good").download_to_file(&good).await.unwrap();
        assert_eq!(written, BODY.len() as u64);
        assert_eq!(std::fs::read(&good).unwrap(), BODY);

        let bad = dir.path().join("bad.txt");
        assert!(bucket.object("bad").download_to_file(&bad).await.is_err());
        assert!(!bad.exists());
    }
}
