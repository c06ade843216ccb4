//! Bucket IAM policies.

use http::Method;

use super::bucket::BucketHandle;
use crate::errors::Result;
use crate::model::{Policy, TestPermissionsResponse};
use crate::retry::Idempotency;

/// IAM policy of a bucket.
#[derive(Debug, Clone)]
pub struct Iam {
    bucket: BucketHandle,
}

impl Iam {
    pub(crate) fn new(bucket: BucketHandle) -> Self {
        Self { bucket }
    }

    /// Fetch the policy.  Ask for version 3 to see conditional bindings.
    pub async fn get_policy(&self, requested_version: Option<u32>) -> Result<Policy> {
        let req = self
            .bucket
            .request(Method::GET, "/iam")
            .operation("get_iam_policy")
            .query_opt("optionsRequestedPolicyVersion", requested_version);
        self.bucket.storage().transport().json(req).await
    }

    /// Replace the policy.  Retried only when `policy.etag` guards against
    /// a concurrent change.
    pub async fn set_policy(&self, policy: &Policy) -> Result<Policy> {
        let req = self
            .bucket
            .request(Method::PUT, "/iam")
            .operation("set_iam_policy")
            .idempotency(Idempotency::conditional(policy.etag.is_some()))
            .json(policy)?;
        self.bucket.storage().transport().json(req).await
    }

    /// The subset of `permissions` the caller holds on the bucket.
    pub async fn test_permissions(&self, permissions: &[&str]) -> Result<Vec<String>> {
        let req = self
            .bucket
            .request(Method::GET, "/iam/testPermissions")
            .operation("test_iam_permissions")
            .query_pairs(permissions.iter().map(|p| ("permissions", *p)));
        let resp: TestPermissionsResponse = self.bucket.storage().transport().json(req).await?;
        Ok(resp.permissions)
    }
}
