use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};

use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Blob store manager over an `object_store` backend.
///
/// All document bytes live under a per-user prefix so tenant cleanup is a
/// prefix delete.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
    local_base: Option<PathBuf>,
}

/// Prefix under which all of a user's blobs are stored.
pub fn user_prefix(user_id: &str) -> String {
    format!("user_{user_id}")
}

/// Build the object location for an upload: `user_{user_id}/{ts}_{safe-name}`.
///
/// The filename is sanitized to a conservative character set; the timestamp
/// keeps re-uploads of the same name from colliding.
pub fn object_location(user_id: &str, filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stamp = Utc::now().timestamp_millis();
    format!("{}/{stamp}_{safe}", user_prefix(user_id))
}

impl StorageManager {
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        let backend_kind = cfg.storage.clone();
        let (store, local_base) = create_storage_backend(cfg).await?;

        Ok(Self {
            store,
            backend_kind,
            local_base,
        })
    }

    /// Create a StorageManager with a custom storage backend, useful for
    /// injecting a specific backend in tests.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            backend_kind,
            local_base: None,
        }
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    pub fn local_base_path(&self) -> Option<&Path> {
        self.local_base.as_deref()
    }

    /// Store bytes at the specified location.
    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        let payload = object_store::PutPayload::from_bytes(data);
        self.store.put(&path, payload).await.map(|_| ())
    }

    /// Retrieve bytes from the specified location, fully buffered.
    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        result.bytes().await
    }

    /// Delete a single object.
    pub async fn delete(&self, location: &str) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        self.store.delete(&path).await
    }

    /// Delete all objects below the specified prefix.
    ///
    /// For local filesystem backends this also attempts to clean up empty
    /// directories left behind.
    pub async fn delete_prefix(&self, prefix: &str) -> object_store::Result<()> {
        let prefix_path = ObjPath::from(prefix);
        let locations = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|m| m.location)
            .boxed();
        self.store
            .delete_stream(locations)
            .try_collect::<Vec<_>>()
            .await?;

        if matches!(self.backend_kind, StorageKind::Local) {
            self.cleanup_filesystem_directories(prefix).await?;
        }

        Ok(())
    }

    pub async fn list(
        &self,
        prefix: Option<&str>,
    ) -> object_store::Result<Vec<object_store::ObjectMeta>> {
        let prefix_path = prefix.map(ObjPath::from);
        self.store.list(prefix_path.as_ref()).try_collect().await
    }

    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        self.store
            .head(&path)
            .await
            .map(|_| true)
            .or_else(|e| match e {
                object_store::Error::NotFound { .. } => Ok(false),
                _ => Err(e),
            })
    }

    async fn cleanup_filesystem_directories(&self, prefix: &str) -> object_store::Result<()> {
        let Some(base) = &self.local_base else {
            return Ok(());
        };

        let relative = Path::new(prefix);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            tracing::warn!(
                prefix = %prefix,
                "Skipping directory cleanup for unsupported prefix components"
            );
            return Ok(());
        }

        let mut current = base.join(relative);

        while current.starts_with(base) && current.as_path() != base.as_path() {
            match tokio::fs::remove_dir(&current).await {
                Ok(()) => {}
                Err(err) => match err.kind() {
                    ErrorKind::NotFound => {}
                    ErrorKind::DirectoryNotEmpty => break,
                    _ => tracing::debug!(
                        error = %err,
                        path = %current.display(),
                        "Failed to remove directory during cleanup"
                    ),
                },
            }

            if let Some(parent) = current.parent() {
                current = parent.to_path_buf();
            } else {
                break;
            }
        }

        Ok(())
    }
}

async fn create_storage_backend(
    cfg: &AppConfig,
) -> object_store::Result<(DynStore, Option<PathBuf>)> {
    match cfg.storage {
        StorageKind::Local => {
            let base = resolve_base_dir(cfg);
            if !base.exists() {
                tokio::fs::create_dir_all(&base).await.map_err(|e| {
                    object_store::Error::Generic {
                        store: "LocalFileSystem",
                        source: e.into(),
                    }
                })?;
            }
            let store = LocalFileSystem::new_with_prefix(base.clone())?;
            Ok((Arc::new(store), Some(base)))
        }
        StorageKind::Memory => {
            let store = InMemory::new();
            Ok((Arc::new(store), None))
        }
    }
}

/// Resolve the absolute base directory used for local storage from config.
pub fn resolve_base_dir(cfg: &AppConfig) -> PathBuf {
    if cfg.data_dir.starts_with('/') {
        PathBuf::from(&cfg.data_dir)
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(&cfg.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::AppConfig;
    use bytes::Bytes;
    use uuid::Uuid;

    fn test_config_memory() -> AppConfig {
        AppConfig {
            storage: StorageKind::Memory,
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn memory_backend_basic_operations() {
        let cfg = test_config_memory();
        let storage = StorageManager::new(&cfg)
            .await
            .expect("create storage manager");
        assert!(storage.local_base_path().is_none());

        let location = "user_a/file.txt";
        let data = b"stored bytes";

        storage
            .put(location, Bytes::from(data.to_vec()))
            .await
            .expect("put");
        let retrieved = storage.get(location).await.expect("get");
        assert_eq!(retrieved.as_ref(), data);

        assert!(storage.exists(location).await.expect("exists check"));

        storage.delete_prefix("user_a/").await.expect("delete");
        assert!(!storage
            .exists(location)
            .await
            .expect("exists check after delete"));
    }

    #[tokio::test]
    async fn local_backend_round_trip_and_cleanup() {
        let base = format!("/tmp/rag_storage_test_{}", Uuid::new_v4());
        let cfg = AppConfig {
            storage: StorageKind::Local,
            data_dir: base.clone(),
            ..AppConfig::default()
        };
        let storage = StorageManager::new(&cfg)
            .await
            .expect("create storage manager");

        let location = "user_b/nested/file.txt";
        let data = b"local bytes";

        storage
            .put(location, Bytes::from(data.to_vec()))
            .await
            .expect("put");
        assert_eq!(storage.get(location).await.expect("get").as_ref(), data);

        storage.delete_prefix("user_b/").await.expect("delete");
        assert!(!storage.exists(location).await.expect("exists after delete"));

        let _ = tokio::fs::remove_dir_all(&base).await;
    }

    #[test]
    fn object_location_sanitizes_and_prefixes() {
        let location = object_location("u1", "我的 report (final).pdf");
        assert!(location.starts_with("user_u1/"));
        assert!(location.ends_with(".pdf"));
        assert!(!location.contains(' '));
        assert!(!location.contains('('));
    }

    #[tokio::test]
    async fn list_is_scoped_by_prefix() {
        let cfg = test_config_memory();
        let storage = StorageManager::new(&cfg)
            .await
            .expect("create storage manager");

        storage
            .put("user_a/one.txt", Bytes::from_static(b"1"))
            .await
            .expect("put one");
        storage
            .put("user_b/two.txt", Bytes::from_static(b"2"))
            .await
            .expect("put two");

        let user_a = storage.list(Some("user_a/")).await.expect("list user_a");
        assert_eq!(user_a.len(), 1);
        assert!(user_a[0].location.as_ref().contains("one.txt"));
    }
}
