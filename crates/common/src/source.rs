//! Source byte access.
//!
//! Original document bytes live in external object/file storage; the core
//! only needs `read(path) -> bytes`. The filesystem implementation covers
//! worker deployments with a mounted upload volume; the in-memory one backs
//! tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::{AppError, Result};

/// Narrow contract over the object/file storage that owns source bytes.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
}

/// Reads documents from the local filesystem.
#[derive(Debug, Default)]
pub struct FsSourceStore;

#[async_trait]
impl SourceStore for FsSourceStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound {
                    resource_type: "source file".to_string(),
                    id: path.to_string(),
                }
            } else {
                AppError::StoreTransient {
                    message: format!("read {path}: {e}"),
                }
            }
        })
    }
}

/// In-memory source store for tests.
#[derive(Debug, Default)]
pub struct MemorySourceStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files
            .write()
            .expect("source store lock")
            .insert(path.into(), bytes.into());
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .read()
            .expect("source store lock")
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::NotFound {
                resource_type: "source file".to_string(),
                id: path.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemorySourceStore::new();
        store.put("a.md", "# hi".as_bytes());
        assert_eq!(store.read("a.md").await.unwrap(), b"# hi");
        assert!(store.read("missing.md").await.is_err());
    }
}
