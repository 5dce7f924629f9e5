//! Virtual filesystem
//!
//! Byte and text content keyed by URL. Volumes are mounted under URL
//! prefixes (longest prefix wins) and served by drivers; writes dispatch
//! change events to registered listeners, which is how the watch registry
//! learns about local mutations. Remote change events (from a file daemon)
//! enter through [`FileSystem::dispatch_change`] the same way.

pub mod drivers;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;
use url::Url;

use crate::errors::{BuildError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Create,
    Write,
    Remove,
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub url: Url,
    pub kind: FileChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// One mounted volume.
#[async_trait::async_trait]
pub trait VolumeDriver: Send + Sync {
    /// `path` is relative to the mount root, without a leading slash.
    async fn kind(&self, path: &str) -> Option<FileKind>;
    async fn read_text(&self, path: &str) -> Result<String>;
    /// Returns true when the file did not exist before.
    async fn write_text(&self, path: &str, text: &str) -> Result<bool>;
    async fn remove(&self, path: &str) -> Result<()>;
    async fn list(&self, path: &str) -> Result<Vec<String>>;
}

type ChangeListener = Arc<dyn Fn(&FileChange) + Send + Sync>;

/// URL-keyed filesystem facade over mounted volumes.
pub struct FileSystem {
    mounts: RwLock<Vec<(Url, Arc<dyn VolumeDriver>)>>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    pub fn new() -> Self {
        FileSystem {
            mounts: RwLock::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Mount a driver under a URL prefix.
    pub fn mount(&self, root: Url, driver: Arc<dyn VolumeDriver>) {
        let mut mounts = self.mounts.write();
        mounts.push((root, driver));
        // longest prefix wins on lookup
        mounts.sort_by_key(|(root, _)| std::cmp::Reverse(root.as_str().len()));
    }

    /// Listen for file-change events (local writes and dispatched remote
    /// changes alike).
    pub fn add_change_listener(&self, listener: ChangeListener) {
        self.listeners.lock().push(listener);
    }

    /// Deliver an externally-observed change (e.g. from the file daemon
    /// transport) to all listeners.
    pub fn dispatch_change(&self, change: FileChange) {
        debug!(url = %change.url, kind = ?change.kind, "file change");
        for listener in self.listeners.lock().iter() {
            listener(&change);
        }
    }

    fn resolve(&self, url: &Url) -> Result<(Arc<dyn VolumeDriver>, String)> {
        let mounts = self.mounts.read();
        for (root, driver) in mounts.iter() {
            if let Some(rest) = url.as_str().strip_prefix(root.as_str()) {
                return Ok((driver.clone(), rest.trim_start_matches('/').to_string()));
            }
        }
        Err(BuildError::fs(format!("no volume mounted for {}", url)))
    }

    /// Open a descriptor for `url`. With `create`, a missing file comes into
    /// existence on first write.
    pub async fn open(&self, url: &Url, create: bool) -> Result<FileDescriptor> {
        let (driver, path) = self.resolve(url)?;
        let kind = match driver.kind(&path).await {
            Some(kind) => kind,
            None if create => FileKind::File,
            None => return Err(BuildError::fs(format!("{} not found", url))),
        };
        Ok(FileDescriptor {
            url: url.clone(),
            path,
            kind,
            driver,
        })
    }

    pub async fn exists(&self, url: &Url) -> bool {
        match self.resolve(url) {
            Ok((driver, path)) => driver.kind(&path).await.is_some(),
            Err(_) => false,
        }
    }

    /// List the entries of a directory URL.
    pub async fn list(&self, url: &Url) -> Result<Vec<Url>> {
        let (driver, path) = self.resolve(url)?;
        let names = driver.list(&path).await?;
        names
            .into_iter()
            .map(|name| {
                url.join(&name)
                    .map_err(|e| BuildError::fs(format!("bad entry {} under {}: {}", name, url, e)))
            })
            .collect()
    }

    pub async fn remove(&self, url: &Url) -> Result<()> {
        let (driver, path) = self.resolve(url)?;
        driver.remove(&path).await?;
        self.dispatch_change(FileChange {
            url: url.clone(),
            kind: FileChangeKind::Remove,
        });
        Ok(())
    }
}

/// An open handle on one file.
pub struct FileDescriptor {
    url: Url,
    path: String,
    kind: FileKind,
    driver: Arc<dyn VolumeDriver>,
}

impl FileDescriptor {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub async fn read_text(&self) -> Result<String> {
        if self.kind != FileKind::File {
            return Err(BuildError::bug(format!(
                "expecting {} to be a file, but it was a directory",
                self.url
            )));
        }
        self.driver.read_text(&self.path).await
    }

    /// Write and report the change through the owning filesystem's
    /// listeners via the returned event.
    pub async fn write(&self, text: &str) -> Result<FileChange> {
        let created = self.driver.write_text(&self.path, text).await?;
        Ok(FileChange {
            url: self.url.clone(),
            kind: if created {
                FileChangeKind::Create
            } else {
                FileChangeKind::Write
            },
        })
    }

    pub fn close(self) {}
}

/// Convenience: open, read, close.
pub async fn read_text(fs: &FileSystem, url: &Url) -> Result<String> {
    let fd = fs.open(url, false).await?;
    let text = fd.read_text().await?;
    fd.close();
    Ok(text)
}

/// Convenience: open with create, write, dispatch the change, close.
pub async fn write_text(fs: &FileSystem, url: &Url, text: &str) -> Result<()> {
    let fd = fs.open(url, true).await?;
    let change = fd.write(text).await?;
    fd.close();
    fs.dispatch_change(change);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::drivers::MemoryDriver;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_mount_and_read() {
        let fs = FileSystem::new();
        let driver = Arc::new(MemoryDriver::new());
        driver.seed("src/index.js", "console.log(1);");
        fs.mount(url("https://local/"), driver);

        let text = read_text(&fs, &url("https://local/src/index.js"))
            .await
            .unwrap();
        assert_eq!(text, "console.log(1);");
    }

    #[tokio::test]
    async fn test_longest_prefix_mount_wins() {
        let fs = FileSystem::new();
        let outer = Arc::new(MemoryDriver::new());
        outer.seed("a.js", "outer");
        let inner = Arc::new(MemoryDriver::new());
        inner.seed("a.js", "inner");
        fs.mount(url("https://local/"), outer);
        fs.mount(url("https://local/pkg/"), inner);

        let text = read_text(&fs, &url("https://local/pkg/a.js")).await.unwrap();
        assert_eq!(text, "inner");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let fs = FileSystem::new();
        fs.mount(url("https://local/"), Arc::new(MemoryDriver::new()));
        let err = read_text(&fs, &url("https://local/nope.js"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_write_dispatches_change_event() {
        let fs = FileSystem::new();
        fs.mount(url("https://local/"), Arc::new(MemoryDriver::new()));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        fs.add_change_listener(Arc::new(move |change| {
            assert_eq!(change.kind, FileChangeKind::Create);
            seen2.fetch_add(1, Ordering::SeqCst);
        }));
        write_text(&fs, &url("https://local/new.js"), "1").await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
