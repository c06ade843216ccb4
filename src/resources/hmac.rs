//! HMAC keys for service accounts, used with the XML API and V2-style
//! signing by interoperable clients.

use http::Method;
use serde_json::json;
use tracing::info;

use crate::client::Storage;
use crate::errors::{Result, StorageError};
use crate::model::{HmacKey, HmacKeyMetadata, HmacKeyState, ListPage};
use crate::retry::Idempotency;
use crate::transport::{encode_path_segment, ApiRequest};

/// Filters for [`HmacKeys::list`].
#[derive(Debug, Clone, Default)]
pub struct ListHmacKeysQuery {
    pub project: Option<String>,
    pub service_account_email: Option<String>,
    pub show_deleted_keys: bool,
    pub max_results: Option<usize>,
}

/// HMAC keys of a project.
#[derive(Debug, Clone)]
pub struct HmacKeys {
    storage: Storage,
}

impl HmacKeys {
    pub(crate) fn new(storage: Storage) -> Self {
        Self { storage }
    }

    fn request(
        &self,
        method: Method,
        project: Option<&str>,
        access_id: Option<&str>,
    ) -> Result<ApiRequest> {
        let project = self.storage.resolve_project(project)?;
        let mut path = format!("/projects/{}/hmacKeys", encode_path_segment(&project));
        if let Some(id) = access_id {
            path.push('/');
            path.push_str(&encode_path_segment(id));
        }
        let url = self.storage.transport().json_url(&path);
        Ok(ApiRequest::new(method, url).resource(access_id.unwrap_or(&project).to_string()))
    }

    /// Create a key for `service_account_email`.  The secret in the
    /// response cannot be retrieved again.
    pub async fn create(&self, service_account_email: &str) -> Result<HmacKey> {
        let req = self
            .request(Method::POST, None, None)?
            .operation("create_hmac_key")
            .idempotency(Idempotency::NonIdempotent)
            .query("serviceAccountEmail", service_account_email);
        let key: HmacKey = self.storage.transport().json(req).await?;
        info!(
            "Created HMAC key {} for {}",
            key.metadata.access_id, service_account_email
        );
        Ok(key)
    }

    pub async fn list(&self, query: &ListHmacKeysQuery) -> Result<ListPage<HmacKeyMetadata>> {
        let req = self
            .request(Method::GET, query.project.as_deref(), None)?
            .operation("list_hmac_keys")
            .query_opt("serviceAccountEmail", query.service_account_email.as_deref())
            .query_opt("showDeletedKeys", query.show_deleted_keys.then_some(true))
            .query_opt("maxResults", query.max_results);
        self.storage
            .transport()
            .list_all(req, query.max_results)
            .await
    }

    pub async fn get(&self, access_id: &str) -> Result<HmacKeyMetadata> {
        let req = self
            .request(Method::GET, None, Some(access_id))?
            .operation("get_hmac_key");
        self.storage.transport().json(req).await
    }

    /// Activate or deactivate a key.  With `etag` the update only applies
    /// to the version that was read, which also makes it safe to retry.
    pub async fn update_state(
        &self,
        access_id: &str,
        state: HmacKeyState,
        etag: Option<&str>,
    ) -> Result<HmacKeyMetadata> {
        if state == HmacKeyState::Deleted {
            return Err(StorageError::InvalidArgument(
                "use delete() to delete an HMAC key".into(),
            ));
        }
        let mut body = json!({ "state": state.as_str() });
        if let Some(etag) = etag {
            body["etag"] = json!(etag);
        }
        let req = self
            .request(Method::PUT, None, Some(access_id))?
            .operation("update_hmac_key")
            .idempotency(Idempotency::conditional(etag.is_some()))
            .json(&body)?;
        self.storage.transport().json(req).await
    }

    /// Delete a key.  Only `INACTIVE` keys can be deleted.
    pub async fn delete(&self, access_id: &str) -> Result<()> {
        let metadata = self.get(access_id).await?;
        if metadata.state != HmacKeyState::Inactive {
            return Err(StorageError::InvalidArgument(format!(
                "HMAC key {access_id} is {}; deactivate it before deleting",
                metadata.state.as_str()
            )));
        }
        let req = self
            .request(Method::DELETE, None, Some(access_id))?
            .operation("delete_hmac_key")
            .idempotency(Idempotency::Idempotent);
        self.storage.transport().empty(req).await?;
        info!("Deleted HMAC key {}", access_id);
        Ok(())
    }
}
