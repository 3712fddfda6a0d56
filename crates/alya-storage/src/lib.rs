// alya-storage - OpenDAL-based object store for batch output files
//
// One abstraction across backends:
// - S3 (production)
// - Filesystem (local development)
// - Memory (tests)

use anyhow::{Context, Result};
use async_trait::async_trait;
use opendal::Operator;

use alya_core::store::ObjectStore;

#[derive(Clone)]
pub struct OpendalStore {
    operator: Operator,
}

impl OpendalStore {
    /// Create storage for S3. The `bucket` argument of [`ObjectStore::put`]
    /// becomes a key prefix inside this bucket.
    #[cfg(feature = "services-s3")]
    pub fn new_s3(bucket: &str, region: &str, endpoint: Option<&str>) -> Result<Self> {
        use opendal::services;

        let mut builder = services::S3::default().bucket(bucket).region(region);
        if let Some(ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        let operator = Operator::new(builder)
            .context("Failed to configure S3 storage")?
            .finish();
        Ok(Self { operator })
    }

    /// Create storage on the local filesystem; buckets map to directories.
    #[cfg(feature = "services-fs")]
    pub fn new_fs(root: &str) -> Result<Self> {
        use opendal::services;

        let builder = services::Fs::default().root(root);
        let operator = Operator::new(builder)
            .context("Failed to configure filesystem storage")?
            .finish();
        Ok(Self { operator })
    }

    /// In-memory storage for tests.
    #[cfg(feature = "services-memory")]
    pub fn new_memory() -> Result<Self> {
        use opendal::services;

        let operator = Operator::new(services::Memory::default())
            .context("Failed to configure memory storage")?
            .finish();
        Ok(Self { operator })
    }

    /// Read an object back (verification and tests).
    pub async fn read(&self, bucket: &str, object: &str) -> Result<Vec<u8>> {
        let data = self
            .operator
            .read(&format!("{bucket}/{object}"))
            .await
            .with_context(|| format!("Failed to read object {bucket}/{object}"))?;
        Ok(data.to_vec())
    }
}

#[async_trait]
impl ObjectStore for OpendalStore {
    async fn put(
        &self,
        bucket: &str,
        object: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        self.operator
            .write_with(&format!("{bucket}/{object}"), data)
            .content_type(content_type)
            .await
            .with_context(|| format!("Failed to upload object {bucket}/{object}"))?;
        Ok(())
    }
}
