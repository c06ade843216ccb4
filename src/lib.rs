//! gcsclient: a client for the Cloud Storage JSON and XML APIs.
//!
//! The [`Storage`] client hands out cheap handles for buckets, objects,
//! ACLs, IAM policies, notifications and HMAC keys.  Every request goes
//! through one transport that attaches credentials, retries transient
//! failures with exponential backoff, and maps error bodies into
//! [`StorageError`].  Signed URLs (V2 and V4) and V4 POST policies are
//! computed locally from a service account key or an HMAC key.
//!
//! ```no_run
//! # async fn demo() -> gcsclient::Result<()> {
//! use gcsclient::{ClientConfig, Storage};
//!
//! let storage = Storage::from_config(ClientConfig::default())?;
//! let object = storage.bucket("my-bucket").object("reports/today.csv");
//! let data = object.download().await?;
//! println!("{} bytes", data.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod credentials;
pub mod download;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod resources;
pub mod retry;
pub mod signing;
pub mod transport;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ListBucketsQuery, Storage};
pub use config::ClientConfig;
pub use credentials::{AccessToken, Credentials, TokenProvider};
pub use download::{ByteRange, DownloadOptions};
pub use errors::{Result, StorageError};
pub use model::{Bucket, Object, Preconditions};
pub use resources::bucket::{BucketHandle, CreateBucketRequest, ListObjectsQuery};
pub use resources::object::ObjectHandle;
pub use signing::{SignedUrlConfig, SignedUrlVersion};
pub use upload::UploadOptions;
