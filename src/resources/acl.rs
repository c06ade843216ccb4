//! Access control lists for buckets, objects, and default object ACLs.
//!
//! Entities are strings such as `user-jane@example.com`,
//! `group-admins@example.com`, `domain-example.com`,
//! `project-viewers-123`, `allUsers` and `allAuthenticatedUsers`.

use http::Method;
use serde_json::json;

use crate::client::Storage;
use crate::errors::Result;
use crate::model::{AclEntry, ListPage};
use crate::retry::Idempotency;
use crate::transport::{encode_path_segment, ApiRequest};

pub const OWNER: &str = "OWNER";
pub const READER: &str = "READER";
pub const WRITER: &str = "WRITER";

pub const ALL_USERS: &str = "allUsers";
pub const ALL_AUTHENTICATED_USERS: &str = "allAuthenticatedUsers";

/// Which list an [`AclHandle`] edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclScope {
    Bucket(String),
    DefaultObject(String),
    Object {
        bucket: String,
        object: String,
        generation: Option<i64>,
    },
}

impl AclScope {
    fn path(&self) -> String {
        match self {
            AclScope::Bucket(bucket) => format!("/b/{}/acl", encode_path_segment(bucket)),
            AclScope::DefaultObject(bucket) => {
                format!("/b/{}/defaultObjectAcl", encode_path_segment(bucket))
            }
            AclScope::Object { bucket, object, .. } => format!(
                "/b/{}/o/{}/acl",
                encode_path_segment(bucket),
                encode_path_segment(object)
            ),
        }
    }

    fn generation(&self) -> Option<i64> {
        match self {
            AclScope::Object { generation, .. } => *generation,
            _ => None,
        }
    }

    fn resource(&self) -> String {
        match self {
            AclScope::Bucket(bucket) | AclScope::DefaultObject(bucket) => bucket.clone(),
            AclScope::Object { bucket, object, .. } => format!("{bucket}/{object}"),
        }
    }
}

/// An access control list.
#[derive(Debug, Clone)]
pub struct AclHandle {
    storage: Storage,
    scope: AclScope,
}

impl AclHandle {
    pub(crate) fn new(storage: Storage, scope: AclScope) -> Self {
        Self { storage, scope }
    }

    pub fn scope(&self) -> &AclScope {
        &self.scope
    }

    fn request(&self, method: Method, entity: Option<&str>) -> ApiRequest {
        let mut path = self.scope.path();
        if let Some(entity) = entity {
            path.push('/');
            path.push_str(&encode_path_segment(entity));
        }
        let transport = self.storage.transport();
        let req = ApiRequest::new(method, transport.json_url(&path))
            .resource(self.scope.resource())
            .query_opt("generation", self.scope.generation());
        if req.method == Method::GET {
            req
        } else {
            // Mutations are read-modify-write on the server.
            req.idempotency(Idempotency::NonIdempotent)
        }
    }

    pub async fn list(&self) -> Result<Vec<AclEntry>> {
        let req = self.request(Method::GET, None).operation("list_acl");
        let page: ListPage<AclEntry> = self.storage.transport().json(req).await?;
        Ok(page.items)
    }

    pub async fn get(&self, entity: &str) -> Result<AclEntry> {
        let req = self.request(Method::GET, Some(entity)).operation("get_acl");
        self.storage.transport().json(req).await
    }

    pub async fn add(&self, entity: &str, role: &str) -> Result<AclEntry> {
        let req = self
            .request(Method::POST, None)
            .operation("insert_acl")
            .json(&json!({ "entity": entity, "role": role }))?;
        self.storage.transport().json(req).await
    }

    pub async fn update(&self, entity: &str, role: &str) -> Result<AclEntry> {
        let req = self
            .request(Method::PUT, Some(entity))
            .operation("update_acl")
            .json(&json!({ "role": role }))?;
        self.storage.transport().json(req).await
    }

    pub async fn delete(&self, entity: &str) -> Result<()> {
        let req = self
            .request(Method::DELETE, Some(entity))
            .operation("delete_acl");
        self.storage.transport().empty(req).await
    }

    pub fn owners(&self) -> AclRole<'_> {
        AclRole { acl: self, role: OWNER }
    }

    pub fn readers(&self) -> AclRole<'_> {
        AclRole { acl: self, role: READER }
    }

    pub fn writers(&self) -> AclRole<'_> {
        AclRole { acl: self, role: WRITER }
    }
}

/// Entity helpers bound to one role.
///
/// ```no_run
/// # async fn demo(storage: gcsclient::Storage) -> gcsclient::Result<()> {
/// let acl = storage.bucket("my-bucket").acl();
/// acl.readers().add_all_users().await?;
/// acl.owners().add_user("jane@example.com").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct AclRole<'a> {
    acl: &'a AclHandle,
    role: &'static str,
}

impl AclRole<'_> {
    pub async fn add_user(&self, email: &str) -> Result<AclEntry> {
        self.acl.add(&format!("user-{email}"), self.role).await
    }

    pub async fn delete_user(&self, email: &str) -> Result<()> {
        self.acl.delete(&format!("user-{email}")).await
    }

    pub async fn add_group(&self, email: &str) -> Result<AclEntry> {
        self.acl.add(&format!("group-{email}"), self.role).await
    }

    pub async fn delete_group(&self, email: &str) -> Result<()> {
        self.acl.delete(&format!("group-{email}")).await
    }

    pub async fn add_domain(&self, domain: &str) -> Result<AclEntry> {
        self.acl.add(&format!("domain-{domain}"), self.role).await
    }

    pub async fn delete_domain(&self, domain: &str) -> Result<()> {
        self.acl.delete(&format!("domain-{domain}")).await
    }

    /// `team` is `owners`, `editors` or `viewers`.
    pub async fn add_project(&self, team: &str, project_number: &str) -> Result<AclEntry> {
        self.acl
            .add(&format!("project-{team}-{project_number}"), self.role)
            .await
    }

    pub async fn delete_project(&self, team: &str, project_number: &str) -> Result<()> {
        self.acl
            .delete(&format!("project-{team}-{project_number}"))
            .await
    }

    pub async fn add_all_users(&self) -> Result<AclEntry> {
        self.acl.add(ALL_USERS, self.role).await
    }

    pub async fn delete_all_users(&self) -> Result<()> {
        self.acl.delete(ALL_USERS).await
    }

    pub async fn add_all_authenticated_users(&self) -> Result<AclEntry> {
        self.acl.add(ALL_AUTHENTICATED_USERS, self.role).await
    }

    pub async fn delete_all_authenticated_users(&self) -> Result<()> {
        self.acl.delete(ALL_AUTHENTICATED_USERS).await
    }
}
