//! Handles for the service's resources.
//!
//! Handles are cheap: they hold a [`Storage`](crate::Storage) clone and the
//! resource's name, and make no request until a method is called.

pub mod acl;
pub mod bucket;
pub mod hmac;
pub mod iam;
pub mod notification;
pub mod object;

/// Object deletions in flight at once during bulk operations.
pub(crate) const BULK_CONCURRENCY: usize = 10;
