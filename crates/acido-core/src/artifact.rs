use std::sync::Arc;

use uuid::Uuid;

use crate::cloud::{CloudError, CloudProvider, retry_transient};

/// Stateless blob-store wrapper. The identifier minted by [`put`] is the only
/// handle; containers receive it through their environment and download the
/// shard by it.
///
/// [`put`]: ArtifactStore::put
#[derive(Clone)]
pub struct ArtifactStore {
    cloud: Arc<dyn CloudProvider>,
}

impl ArtifactStore {
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Self {
        Self { cloud }
    }

    pub async fn put(&self, data: Vec<u8>) -> Result<String, CloudError> {
        let id = Uuid::new_v4().to_string();
        retry_transient(4, || self.cloud.upload_blob(&id, data.clone())).await?;
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Vec<u8>, CloudError> {
        self.cloud.download_blob(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), CloudError> {
        self.cloud.delete_blob(id).await
    }
}
