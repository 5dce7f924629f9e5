//! File nodes
//!
//! `FileNode` is the volatile leaf of the build graph: the runner reads it
//! through the filesystem collaborator, registers it with the watch
//! registry, and decides `changed` by comparing content fingerprints. A
//! `WriteFileNode` writes its sole dependency's text to a target URL and
//! always reports changed.
//!
//! Both are recognized by the runner through their capability traits; their
//! `run()` methods are never called directly.

use url::Url;

use super::{BuilderNode, CacheKey, FileSinkNode, FileSourceNode, NodeInputs, NodeOutput};
use crate::errors::{BuildError, Result};

pub struct FileNode {
    url: Url,
}

impl FileNode {
    pub fn new(url: Url) -> Self {
        FileNode { url }
    }
}

#[async_trait::async_trait]
impl BuilderNode for FileNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::key(format!("file:{}", self.url))
    }

    fn volatile(&self) -> bool {
        true
    }

    async fn run(&self, _inputs: &NodeInputs) -> Result<NodeOutput> {
        Err(BuildError::bug(format!(
            "file node {} must be evaluated by the runner",
            self.url
        )))
    }

    fn as_file_source(&self) -> Option<&dyn FileSourceNode> {
        Some(self)
    }
}

impl FileSourceNode for FileNode {
    fn url(&self) -> &Url {
        &self.url
    }
}

pub struct WriteFileNode {
    url: Url,
    source: super::NodeRef,
}

impl WriteFileNode {
    /// `source` must produce the text (or bundle) to write.
    pub fn new(url: Url, source: super::NodeRef) -> Self {
        WriteFileNode { url, source }
    }
}

#[async_trait::async_trait]
impl BuilderNode for WriteFileNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::key(format!("write-file:{}", self.url))
    }

    fn deps(&self) -> Option<super::DepMap> {
        let mut deps = super::DepMap::new();
        deps.insert("source".to_string(), self.source.clone());
        Some(deps)
    }

    async fn run(&self, _inputs: &NodeInputs) -> Result<NodeOutput> {
        Err(BuildError::bug(format!(
            "write-file node {} must be evaluated by the runner",
            self.url
        )))
    }

    fn as_file_sink(&self) -> Option<&dyn FileSinkNode> {
        Some(self)
    }
}

impl FileSinkNode for WriteFileNode {
    fn url(&self) -> &Url {
        &self.url
    }
}
