//! Scanner seam.

use async_trait::async_trait;

use crate::Result;

/// Refreshes the versions known for one resource by contacting its
/// external source.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, resource_name: &str) -> Result<()>;
}
