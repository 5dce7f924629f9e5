//! Volume drivers
//!
//! `MemoryDriver` backs tests and the client-side build; `DiskDriver` maps a
//! mount onto a local directory.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use walkdir::WalkDir;

use super::{FileKind, VolumeDriver};
use crate::errors::{BuildError, Result};

/// In-memory volume.
#[derive(Default)]
pub struct MemoryDriver {
    files: RwLock<FxHashMap<String, String>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed content without dispatching change events.
    pub fn seed(&self, path: &str, text: &str) {
        self.files.write().insert(path.to_string(), text.to_string());
    }
}

#[async_trait::async_trait]
impl VolumeDriver for MemoryDriver {
    async fn kind(&self, path: &str) -> Option<FileKind> {
        let files = self.files.read();
        if files.contains_key(path) {
            return Some(FileKind::File);
        }
        let dir_prefix = format!("{}/", path.trim_end_matches('/'));
        if path.is_empty() || files.keys().any(|k| k.starts_with(&dir_prefix)) {
            return Some(FileKind::Directory);
        }
        None
    }

    async fn read_text(&self, path: &str) -> Result<String> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| BuildError::fs(format!("{} not found", path)))
    }

    async fn write_text(&self, path: &str, text: &str) -> Result<bool> {
        Ok(self
            .files
            .write()
            .insert(path.to_string(), text.to_string())
            .is_none())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.files
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| BuildError::fs(format!("{} not found", path)))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        let files = self.files.read();
        let mut entries: Vec<String> = files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| match rest.split_once('/') {
                Some((dir, _)) => format!("{}/", dir),
                None => rest.to_string(),
            })
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }
}

/// Volume backed by a local directory.
pub struct DiskDriver {
    root: PathBuf,
}

impl DiskDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskDriver { root: root.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait::async_trait]
impl VolumeDriver for DiskDriver {
    async fn kind(&self, path: &str) -> Option<FileKind> {
        let full = self.full_path(path);
        let metadata = tokio::task::block_in_place(|| std::fs::metadata(full)).ok()?;
        if metadata.is_dir() {
            Some(FileKind::Directory)
        } else {
            Some(FileKind::File)
        }
    }

    async fn read_text(&self, path: &str) -> Result<String> {
        let full = self.full_path(path);
        tokio::task::block_in_place(|| std::fs::read_to_string(full)).map_err(BuildError::from)
    }

    async fn write_text(&self, path: &str, text: &str) -> Result<bool> {
        let full = self.full_path(path);
        let created = !full.exists();
        tokio::task::block_in_place(|| {
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&full, text)
        })?;
        Ok(created)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        tokio::task::block_in_place(|| std::fs::remove_file(full)).map_err(BuildError::from)
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let full = self.full_path(path);
        let root = full.clone();
        tokio::task::block_in_place(|| {
            let mut entries = Vec::new();
            for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
                let entry = entry.map_err(|e| BuildError::fs(e.to_string()))?;
                let name = relative_name(entry.path(), &root)?;
                if entry.file_type().is_dir() {
                    entries.push(format!("{}/", name));
                } else {
                    entries.push(name);
                }
            }
            entries.sort();
            Ok(entries)
        })
    }
}

fn relative_name(path: &Path, root: &Path) -> Result<String> {
    path.strip_prefix(root)
        .map_err(|_| BuildError::fs(format!("{} escaped its volume", path.display())))
        .map(|p| p.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_driver_round_trip() {
        let driver = MemoryDriver::new();
        assert!(driver.write_text("a/b.js", "1").await.unwrap());
        assert!(!driver.write_text("a/b.js", "2").await.unwrap());
        assert_eq!(driver.read_text("a/b.js").await.unwrap(), "2");
        assert_eq!(driver.kind("a").await, Some(FileKind::Directory));
        assert_eq!(driver.kind("a/b.js").await, Some(FileKind::File));
        assert_eq!(driver.kind("missing").await, None);
    }

    #[tokio::test]
    async fn test_memory_driver_list() {
        let driver = MemoryDriver::new();
        driver.seed("src/a.js", "1");
        driver.seed("src/lib/b.js", "2");
        driver.seed("top.js", "3");
        assert_eq!(
            driver.list("").await.unwrap(),
            vec!["src/".to_string(), "top.js".to_string()]
        );
        assert_eq!(
            driver.list("src").await.unwrap(),
            vec!["a.js".to_string(), "lib/".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disk_driver_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let driver = DiskDriver::new(dir.path());
        driver.write_text("out/bundle.js", "export {};").await.unwrap();
        assert_eq!(
            driver.read_text("out/bundle.js").await.unwrap(),
            "export {};"
        );
        assert_eq!(driver.kind("out").await, Some(FileKind::Directory));
        assert_eq!(driver.list("out").await.unwrap(), vec!["bundle.js"]);
    }
}
