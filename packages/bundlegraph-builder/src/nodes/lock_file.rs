//! Lock-file node
//!
//! Reads the project lock file — a JSON document of `specifier -> resolved
//! bundle href` entries — through a file node, so lock-file edits propagate
//! like any other watched input.

use std::sync::Arc;

use url::Url;

use super::{BuilderNode, CacheKey, DepMap, FileNode, NodeInputs, NodeOutput, NodeValue};
use crate::errors::Result;
use bundlegraph_ir::resolution::LockFile;

pub struct LockFileNode {
    url: Url,
}

impl LockFileNode {
    pub fn new(url: Url) -> Self {
        LockFileNode { url }
    }
}

#[async_trait::async_trait]
impl BuilderNode for LockFileNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::key(format!("lock-file:{}", self.url))
    }

    fn deps(&self) -> Option<DepMap> {
        let mut deps = DepMap::new();
        deps.insert(
            "file".to_string(),
            Arc::new(FileNode::new(self.url.clone())),
        );
        Some(deps)
    }

    async fn run(&self, inputs: &NodeInputs) -> Result<NodeOutput> {
        let text = inputs.get("file")?.as_text()?;
        let lock_file: LockFile = serde_json::from_str(text)?;
        Ok(NodeOutput::Value(NodeValue::LockFile(Arc::new(lock_file))))
    }
}
