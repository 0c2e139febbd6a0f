//! Descriptor persistence as YAML files
//!
//! ```text
//! /descriptors/
//!   ais.yaml
//!   ports.yaml
//! ```

use super::DescriptorStore;
use crate::error::{Error, Result};
use crate::schema::CollectionDescriptor;
use crate::validation::validate_collection_name;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

/// One `{name}.yaml` file per collection under a directory
#[derive(Debug, Clone)]
pub struct FileDescriptorStore {
    path: PathBuf,
}

impl FileDescriptorStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_for(&self, name: &str) -> Result<PathBuf> {
        validate_collection_name(name)?;
        Ok(self.path.join(format!("{}.yaml", name)))
    }

    async fn read(path: &Path) -> Result<CollectionDescriptor> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| Error::StoreReadError {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

#[async_trait]
impl DescriptorStore for FileDescriptorStore {
    async fn get(&self, name: &str) -> Result<Option<CollectionDescriptor>> {
        let path = self.file_for(name)?;
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).await.map(Some)
    }

    async fn put(&self, descriptor: &CollectionDescriptor) -> Result<()> {
        let path = self.file_for(&descriptor.name)?;
        let write_error = |source| Error::StoreWriteError {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.path).await.map_err(write_error)?;
        let content = serde_yaml::to_string(descriptor)?;
        fs::write(&path, content).await.map_err(write_error)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.file_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(Error::StoreWriteError { path, source }),
        }
    }

    async fn list_all(&self) -> Result<Vec<CollectionDescriptor>> {
        let mut descriptors = Vec::new();
        if !self.path.exists() {
            return Ok(descriptors);
        }

        let paths: Vec<PathBuf> = WalkDir::new(&self.path)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|entry| entry.into_path())
            .filter(|path| path.extension().map_or(false, |ext| ext == "yaml"))
            .collect();
        for path in paths {
            descriptors.push(Self::read(&path).await?);
        }
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let temp = TempDir::new().unwrap();
        let store = FileDescriptorStore::open(temp.path().join("descriptors"));

        let mut descriptor = CollectionDescriptor::new("ais", "ais-*");
        descriptor.exclude_fields = vec!["internal.*".into()];
        store.put(&descriptor).await.unwrap();

        assert!(temp.path().join("descriptors/ais.yaml").exists());
        assert_eq!(store.get("ais").await.unwrap(), Some(descriptor));
        assert_eq!(store.get("ports").await.unwrap(), None);

        assert!(store.delete("ais").await.unwrap());
        assert!(!store.delete("ais").await.unwrap());
        assert_eq!(store.get("ais").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_all_is_sorted() {
        let temp = TempDir::new().unwrap();
        let store = FileDescriptorStore::open(temp.path());
        for name in ["ports", "ais"] {
            store.put(&CollectionDescriptor::new(name, name)).await.unwrap();
        }
        std::fs::write(temp.path().join("README.md"), "not a descriptor").unwrap();

        let names: Vec<String> = store.list_all().await.unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["ais", "ports"]);
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let temp = TempDir::new().unwrap();
        let store = FileDescriptorStore::open(temp.path());
        assert!(store.get("../etc").await.is_err());
    }
}
