use bytes::Bytes;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::StorageConfig;
use crate::error::{CirrusError, Result};

/// ETag of an object as last read, used for compare-and-swap writes.
/// `None` means the object did not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectVersion(pub Option<String>);

/// Wrapper around the `object_store` crate providing a unified interface
/// for S3, local and in-memory storage backends.
#[derive(Clone)]
pub struct CirrusStore {
    inner: Arc<dyn ObjectStore>,
}

impl CirrusStore {
    /// Create a new store from configuration.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.backend.as_str() {
            "s3" => {
                let mut builder = AmazonS3Builder::new().with_bucket_name(&config.bucket);

                if let Some(ref region) = config.s3_region {
                    builder = builder.with_region(region);
                }
                if let Some(ref endpoint) = config.s3_endpoint {
                    if !endpoint.is_empty() {
                        builder = builder.with_endpoint(endpoint);
                    }
                }
                if let Some(ref key_id) = config.s3_access_key_id {
                    builder = builder.with_access_key_id(key_id);
                }
                if let Some(ref secret) = config.s3_secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                if config.s3_allow_http {
                    builder = builder.with_allow_http(true);
                }

                // Conditional PUT backs infrastructure CAS and change-batch creation.
                builder = builder.with_conditional_put(S3ConditionalPut::ETagMatch);

                let client_options = ClientOptions::new()
                    .with_pool_max_idle_per_host(64)
                    .with_timeout(std::time::Duration::from_secs(30))
                    .with_connect_timeout(std::time::Duration::from_secs(10))
                    .with_pool_idle_timeout(std::time::Duration::from_secs(90));
                builder = builder.with_client_options(client_options);

                Arc::new(builder.build().map_err(|e| {
                    CirrusError::Config(format!("failed to build S3 store: {e}"))
                })?)
            }
            "local" => {
                let path = std::path::Path::new(&config.bucket);
                if !path.exists() {
                    std::fs::create_dir_all(path)?;
                }
                Arc::new(
                    object_store::local::LocalFileSystem::new_with_prefix(path).map_err(|e| {
                        CirrusError::Config(format!("failed to build local store: {e}"))
                    })?,
                )
            }
            "memory" => Arc::new(InMemory::new()),
            backend => {
                return Err(CirrusError::Config(format!(
                    "unsupported storage backend: {backend}"
                )));
            }
        };

        Ok(Self { inner: store })
    }

    /// Create a store directly from an ObjectStore instance.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { inner: store }
    }

    /// Fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    fn map_not_found(e: object_store::Error, operation: &str) -> CirrusError {
        crate::metrics::STORE_ERRORS_TOTAL
            .with_label_values(&[operation])
            .inc();
        match e {
            object_store::Error::NotFound { path, .. } => CirrusError::NotFound { key: path },
            other => CirrusError::Storage(other),
        }
    }

    fn observe(operation: &str, start: std::time::Instant) {
        crate::metrics::STORE_OPERATION_DURATION
            .with_label_values(&[operation])
            .observe(start.elapsed().as_secs_f64());
    }

    /// Put an object at the given key.
    #[instrument(skip(self, data), fields(key = key, size = data.len()))]
    pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        self.inner.put(&path, PutPayload::from(data)).await?;
        debug!(elapsed_ms = start.elapsed().as_millis(), "store put");
        Self::observe("put", start);
        Ok(())
    }

    /// Get an object by key. Returns NotFound if it doesn't exist.
    #[instrument(skip(self), fields(key = key))]
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let (bytes, _) = self.get_versioned(key).await?;
        Ok(bytes)
    }

    /// Get an object along with its version for a later `put_if_match`.
    #[instrument(skip(self), fields(key = key))]
    pub async fn get_versioned(&self, key: &str) -> Result<(Bytes, ObjectVersion)> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        let result = self
            .inner
            .get(&path)
            .await
            .map_err(|e| Self::map_not_found(e, "get"))?;
        let etag = result.meta.e_tag.clone();
        let bytes = result.bytes().await?;
        debug!(
            elapsed_ms = start.elapsed().as_millis(),
            size = bytes.len(),
            etag = ?etag,
            "store get"
        );
        Self::observe("get", start);
        Ok((bytes, ObjectVersion(etag)))
    }

    /// Put an object only if it is still at `version` (compare-and-swap).
    ///
    /// A missing version degrades to create-if-absent. Returns `Conflict`
    /// when another writer got there first. Backends without conditional
    /// update support (local file system) fall back to a plain put.
    #[instrument(skip(self, data, version), fields(key = key))]
    pub async fn put_if_match(&self, key: &str, data: Bytes, version: &ObjectVersion) -> Result<()> {
        let Some(etag) = version.0.clone() else {
            return self.put_if_not_exists(key, data).await;
        };
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        let options = PutOptions {
            mode: PutMode::Update(UpdateVersion {
                e_tag: Some(etag),
                version: None,
            }),
            ..PutOptions::default()
        };
        match self
            .inner
            .put_opts(&path, PutPayload::from(data.clone()), options)
            .await
        {
            Ok(_) => {}
            Err(object_store::Error::Precondition { .. }) => {
                return Err(CirrusError::Conflict {
                    key: key.to_string(),
                });
            }
            Err(object_store::Error::NotImplemented) => {
                warn!(key, "conditional update unsupported by backend, writing unconditionally");
                self.inner.put(&path, PutPayload::from(data)).await?;
            }
            Err(other) => {
                crate::metrics::STORE_ERRORS_TOTAL
                    .with_label_values(&["put"])
                    .inc();
                return Err(CirrusError::Storage(other));
            }
        }
        debug!(elapsed_ms = start.elapsed().as_millis(), "store put_if_match");
        Self::observe("put", start);
        Ok(())
    }

    /// Put an object only if it does NOT already exist (atomic create).
    /// Returns `Conflict` if the key already exists.
    #[instrument(skip(self, data), fields(key = key))]
    pub async fn put_if_not_exists(&self, key: &str, data: Bytes) -> Result<()> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        let options = PutOptions {
            mode: PutMode::Create,
            ..PutOptions::default()
        };
        self.inner
            .put_opts(&path, PutPayload::from(data), options)
            .await
            .map_err(|e| match e {
                object_store::Error::AlreadyExists { .. } => CirrusError::Conflict {
                    key: key.to_string(),
                },
                other => {
                    crate::metrics::STORE_ERRORS_TOTAL
                        .with_label_values(&["put"])
                        .inc();
                    CirrusError::Storage(other)
                }
            })?;
        debug!(elapsed_ms = start.elapsed().as_millis(), "store put_if_not_exists");
        Self::observe("put", start);
        Ok(())
    }

    /// Delete an object by key. Deleting a missing object is not an error.
    #[instrument(skip(self), fields(key = key))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        match self.inner.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(Self::map_not_found(e, "delete")),
        }
        debug!(elapsed_ms = start.elapsed().as_millis(), "store delete");
        Self::observe("delete", start);
        Ok(())
    }

    /// List object keys under a prefix, sorted lexicographically.
    #[instrument(skip(self), fields(prefix = prefix))]
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        use futures::TryStreamExt;
        let start = std::time::Instant::now();
        let path = Path::parse(prefix)?;
        let objects: Vec<_> = self
            .inner
            .list(Some(&path))
            .try_collect()
            .await
            .map_err(|e| Self::map_not_found(e, "list_prefix"))?;
        let mut keys: Vec<String> = objects.iter().map(|o| o.location.to_string()).collect();
        keys.sort();
        debug!(
            elapsed_ms = start.elapsed().as_millis(),
            count = keys.len(),
            "store list_prefix"
        );
        Self::observe("list_prefix", start);
        Ok(keys)
    }

    /// Check if an object exists.
    #[instrument(skip(self), fields(key = key))]
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        let result = match self.inner.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(Self::map_not_found(e, "exists")),
        };
        Self::observe("exists", start);
        result
    }

    /// Delete all objects under a prefix.
    #[instrument(skip(self), fields(prefix = prefix))]
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list_prefix(prefix).await?;
        let count = keys.len();
        let results = futures::future::join_all(keys.iter().map(|key| self.delete(key))).await;
        for result in results {
            result?;
        }
        debug!(count, "store delete_prefix");
        Ok(count)
    }
}
