//! Versioned storage contract
//!
//! [`crate::git::GitStore`] is the production implementation. The processor
//! and pusher only see this trait so they can run against in-memory fakes.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// Durable, versioned storage of named file contents
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Record `content` as the new version of the repository-relative `name`
    async fn save(&self, name: &Path, content: &[u8]) -> Result<()>;

    /// Record the removal of `name`. Unknown names are an error.
    async fn delete(&self, name: &Path) -> Result<()>;

    /// Transmit all recorded but unpublished versions to the remote.
    ///
    /// Having nothing to publish is not an error.
    async fn publish(&self) -> Result<()>;
}
