use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("storage configuration error: {0}")]
    Config(String),
}

/// Port for persisting generated artwork. Returns the storage key under
/// which the image was written.
#[async_trait]
pub trait ArtworkStore: Send + Sync {
    async fn store(
        &self,
        user_id: &str,
        job_id: Uuid,
        bytes: &[u8],
        format: &str,
    ) -> Result<String, StorageError>;
}

/// Artwork storage on Cloudflare R2 (S3-compatible).
pub struct R2ArtworkStore {
    bucket: Box<Bucket>,
}

impl R2ArtworkStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    /// Download a stored artwork by key.
    pub async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await.map_err(StorageError::S3)?;
        Ok(response.to_vec())
    }

    /// Delete a stored artwork.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.bucket.delete_object(key).await.map_err(StorageError::S3)?;
        Ok(())
    }
}

#[async_trait]
impl ArtworkStore for R2ArtworkStore {
    async fn store(
        &self,
        user_id: &str,
        job_id: Uuid,
        bytes: &[u8],
        format: &str,
    ) -> Result<String, StorageError> {
        let key = format!("artwork/{user_id}/{job_id}.{format}");
        let content_type = format!("image/{format}");
        self.bucket
            .put_object_with_content_type(&key, bytes, &content_type)
            .await
            .map_err(StorageError::S3)?;
        Ok(key)
    }
}
