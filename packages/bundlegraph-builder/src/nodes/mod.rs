//! Builder nodes
//!
//! A node is a unit of cacheable, possibly-async computation identified by a
//! cache key. String keys memoize across builds; identity keys are minted
//! from a process-wide counter and are never reused across builds. A node
//! declares its dependencies dynamically — `deps()` may return different
//! node sets depending on internal state — and its `run()` returns a final
//! value, a continuation node to evaluate instead, or `Unchanged` to reuse
//! the previous cached result verbatim.
//!
//! The runner special-cases two capabilities instead of probing concrete
//! types: `FileSourceNode` (volatile file reads driven by the watch
//! registry) and `FileSinkNode` (writes its sole dependency's text).

pub mod bundle;
pub mod file;
pub mod lock_file;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use url::Url;

use crate::errors::{BuildError, Result};
use bundlegraph_ir::resolution::LockFile;
use bundlegraph_ir::BundleSource;

pub use bundle::{
    BundleInputs, BundleInputsNode, BundleInputsProvider, CombineModulesNode, MakeBundleNode,
};
pub use file::{FileNode, WriteFileNode};
pub use lock_file::LockFileNode;

/// Node identity for memoization. `Key` values are stable across builds;
/// `Ident` values are unique per node object for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Key(String),
    Ident(u64),
}

static NEXT_IDENT: AtomicU64 = AtomicU64::new(1);

impl CacheKey {
    pub fn key(key: impl Into<String>) -> Self {
        CacheKey::Key(key.into())
    }

    /// A key that is never reused across builds.
    pub fn ident() -> Self {
        CacheKey::Ident(NEXT_IDENT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::Key(key) => write!(f, "{}", key),
            CacheKey::Ident(id) => write!(f, "#{}", id),
        }
    }
}

/// Values produced by nodes.
#[derive(Debug, Clone)]
pub enum NodeValue {
    Unit,
    Bool(bool),
    Text(Arc<str>),
    LockFile(Arc<LockFile>),
    Inputs(Arc<bundle::BundleInputs>),
    Bundle(Arc<BundleSource>),
}

impl NodeValue {
    pub fn text(text: impl Into<Arc<str>>) -> Self {
        NodeValue::Text(text.into())
    }

    pub fn as_text(&self) -> Result<&str> {
        match self {
            NodeValue::Text(text) => Ok(text),
            NodeValue::Bundle(bundle) => Ok(&bundle.code),
            other => Err(BuildError::bug(format!(
                "expected a text value, got {:?}",
                other
            ))),
        }
    }

    pub fn as_bundle(&self) -> Result<&Arc<BundleSource>> {
        match self {
            NodeValue::Bundle(bundle) => Ok(bundle),
            other => Err(BuildError::bug(format!(
                "expected a bundle value, got {:?}",
                other
            ))),
        }
    }

    pub fn as_inputs(&self) -> Result<&Arc<bundle::BundleInputs>> {
        match self {
            NodeValue::Inputs(inputs) => Ok(inputs),
            other => Err(BuildError::bug(format!(
                "expected bundle inputs, got {:?}",
                other
            ))),
        }
    }

    pub fn as_lock_file(&self) -> Result<&Arc<LockFile>> {
        match self {
            NodeValue::LockFile(lock_file) => Ok(lock_file),
            other => Err(BuildError::bug(format!(
                "expected a lock file, got {:?}",
                other
            ))),
        }
    }
}

/// Dependency values by declared name.
#[derive(Debug, Default)]
pub struct NodeInputs {
    values: IndexMap<String, NodeValue>,
}

impl NodeInputs {
    pub fn new(values: IndexMap<String, NodeValue>) -> Self {
        NodeInputs { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Result<&NodeValue> {
        self.values
            .get(name)
            .ok_or_else(|| BuildError::bug(format!("missing dependency value '{}'", name)))
    }

    /// The single dependency value of a one-dependency node.
    pub fn sole(&self) -> Result<&NodeValue> {
        match self.values.len() {
            1 => Ok(self.values.values().next().expect("length checked")),
            n => Err(BuildError::bug(format!(
                "expected exactly one dependency value, got {}",
                n
            ))),
        }
    }
}

pub type NodeRef = Arc<dyn BuilderNode>;
pub type DepMap = IndexMap<String, NodeRef>;

/// Result of one `run()`.
pub enum NodeOutput {
    /// A final value.
    Value(NodeValue),
    /// Substitute this node and continue evaluating it.
    Node(NodeRef),
    /// Reuse the previous build's cached result verbatim. Only legal after a
    /// first real run.
    Unchanged,
}

/// Marks a node the runner treats as a watched, volatile file read.
pub trait FileSourceNode {
    fn url(&self) -> &Url;
}

/// Marks a node the runner treats as a file write of its sole dependency.
pub trait FileSinkNode {
    fn url(&self) -> &Url;
}

#[async_trait::async_trait]
pub trait BuilderNode: Send + Sync {
    fn cache_key(&self) -> CacheKey;

    /// Volatile nodes re-run every build regardless of whether their inputs
    /// changed.
    fn volatile(&self) -> bool {
        false
    }

    /// Dynamically-declared dependencies; may differ between builds based on
    /// the node's private state.
    fn deps(&self) -> Option<DepMap> {
        None
    }

    async fn run(&self, inputs: &NodeInputs) -> Result<NodeOutput>;

    fn as_file_source(&self) -> Option<&dyn FileSourceNode> {
        None
    }

    fn as_file_sink(&self) -> Option<&dyn FileSinkNode> {
        None
    }

    /// Human-readable name for diagnostics.
    fn debug_name(&self) -> String {
        self.cache_key().to_string()
    }
}

/// A node with a fixed value; useful as a root or a test stand-in.
pub struct ConstNode {
    key: CacheKey,
    value: NodeValue,
}

impl ConstNode {
    pub fn new(key: impl Into<String>, value: NodeValue) -> Self {
        ConstNode {
            key: CacheKey::key(key),
            value,
        }
    }
}

#[async_trait::async_trait]
impl BuilderNode for ConstNode {
    fn cache_key(&self) -> CacheKey {
        self.key.clone()
    }

    async fn run(&self, _inputs: &NodeInputs) -> Result<NodeOutput> {
        Ok(NodeOutput::Value(self.value.clone()))
    }
}
