//! The [`Storage`] client: entry point for buckets, HMAC keys, and the
//! project service account.

use http::Method;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::{ClientConfig, CredentialsKind};
use crate::credentials::{Credentials, ServiceAccountKey, TokenProvider};
use crate::errors::{Result, StorageError};
use crate::model::{Bucket, ListPage, ServiceAccount};
use crate::resources::bucket::{BucketHandle, CreateBucketRequest};
use crate::resources::hmac::HmacKeys;
use crate::signing::{ServiceAccountSigner, UrlSigner};
use crate::transport::{encode_path_segment, ApiRequest, Transport};

/// Filters for [`Storage::list_buckets`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListBucketsQuery {
    /// Project to list; defaults to the client's project.
    pub project: Option<String>,
    pub prefix: Option<String>,
    /// Stop after this many buckets.
    pub max_results: Option<usize>,
}

struct Inner {
    transport: Transport,
    project_id: Option<String>,
    upload_chunk_size: usize,
}

/// A cloneable handle to the storage service.
///
/// Clones share the HTTP connection pool and the credential cache.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
    signer: Option<Arc<dyn UrlSigner>>,
}

/// Redirects stay off: resumable uploads answer `308 Resume Incomplete`.
fn http_client_builder(config: &ClientConfig) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .timeout(config.api.request_timeout())
        .redirect(reqwest::redirect::Policy::none())
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("endpoint", &self.inner.transport.endpoint())
            .field("project_id", &self.inner.project_id)
            .field("signer", &self.signer.as_ref().map(|s| s.credential_id()))
            .finish()
    }
}

impl Storage {
    /// Build a client from configuration and already-resolved credentials.
    pub fn new(config: ClientConfig, credentials: Credentials) -> Result<Self> {
        let client = http_client_builder(&config).build()?;
        Ok(Self::with_http_client(config, client, credentials))
    }

    /// Build a client that obtains tokens from `provider`.
    pub fn with_token_provider<P: TokenProvider>(
        config: ClientConfig,
        provider: P,
    ) -> Result<Self> {
        Self::new(config, Credentials::from_provider(provider))
    }

    fn with_http_client(
        config: ClientConfig,
        client: reqwest::Client,
        credentials: Credentials,
    ) -> Self {
        let transport = Transport::new(&config, client, credentials);
        Self {
            inner: Arc::new(Inner {
                transport,
                project_id: config.project_id.clone(),
                upload_chunk_size: config.api.upload_chunk_size,
            }),
            signer: None,
        }
    }

    /// Resolve credentials as configured.  A service account key file, when
    /// configured, also becomes the URL signer.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let client = http_client_builder(&config).build()?;
        let credentials = Credentials::from_config(&config.credentials, &client)?;

        let key_path = match config.credentials.kind {
            CredentialsKind::ServiceAccount => config.credentials.path.clone(),
            CredentialsKind::Default => std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok(),
            _ => None,
        };
        let signer = key_path
            .and_then(|path| ServiceAccountKey::from_file(&path).ok())
            .map(|key| ServiceAccountSigner::new(&key))
            .transpose()?;

        let mut storage = Self::with_http_client(config, client, credentials);
        if let Some(signer) = signer {
            info!("Signing URLs as {}", signer.credential_id());
            storage.signer = Some(Arc::new(signer));
        }
        Ok(storage)
    }

    /// Use `signer` for signed URLs and POST policies.
    pub fn with_signer(mut self, signer: Arc<dyn UrlSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn signer(&self) -> Result<&dyn UrlSigner> {
        self.signer.as_deref().ok_or_else(|| {
            StorageError::Signing(
                "no signer configured; use a service account key or Storage::with_signer".into(),
            )
        })
    }

    pub fn project_id(&self) -> Option<&str> {
        self.inner.project_id.as_deref()
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub(crate) fn upload_chunk_size(&self) -> usize {
        self.inner.upload_chunk_size
    }

    /// `explicit`, else the configured project.
    pub(crate) fn resolve_project(&self, explicit: Option<&str>) -> Result<String> {
        explicit
            .or(self.project_id())
            .map(str::to_string)
            .ok_or_else(|| {
                StorageError::InvalidArgument(
                    "a project ID is required; set project_id or GOOGLE_CLOUD_PROJECT".into(),
                )
            })
    }

    /// Handle to a bucket.  No request is made.
    pub fn bucket(&self, name: impl Into<String>) -> BucketHandle {
        BucketHandle::new(self.clone(), name.into())
    }

    /// List the project's buckets, following page tokens.
    pub async fn list_buckets(&self, query: &ListBucketsQuery) -> Result<ListPage<Bucket>> {
        let project = self.resolve_project(query.project.as_deref())?;
        let transport = self.transport();
        let req = ApiRequest::new(Method::GET, transport.json_url("/b"))
            .operation("list_buckets")
            .query("project", project)
            .query_opt("prefix", query.prefix.as_deref())
            .query_opt("maxResults", query.max_results);
        transport.list_all(req, query.max_results).await
    }

    /// Create a bucket in the client's project.
    pub async fn create_bucket(
        &self,
        name: &str,
        request: &CreateBucketRequest,
    ) -> Result<Bucket> {
        self.bucket(name).create(request).await
    }

    /// HMAC keys of a project.
    pub fn hmac_keys(&self) -> HmacKeys {
        HmacKeys::new(self.clone())
    }

    /// The service agent that acts for Cloud Storage in `project`.
    pub async fn get_service_account(&self, project: Option<&str>) -> Result<ServiceAccount> {
        let project = self.resolve_project(project)?;
        let transport = self.transport();
        let url = transport.json_url(&format!(
            "/projects/{}/serviceAccount",
            encode_path_segment(&project)
        ));
        transport
            .json(ApiRequest::new(Method::GET, url).operation("get_service_account"))
            .await
    }
}
