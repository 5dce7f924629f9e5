//! Shared node stand-ins for runner and rebuilder tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bundlegraph_builder::{
    BuilderNode, CacheKey, DepMap, NodeInputs, NodeOutput, NodeRef, NodeValue,
};
use bundlegraph_builder::errors::Result;

/// Install a fmt subscriber once, honoring `RUST_LOG`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Counts how many times `run()` actually executes.
pub struct CounterNode {
    key: String,
    runs: Arc<AtomicUsize>,
    deps: DepMap,
    volatile: bool,
}

impl CounterNode {
    pub fn new(key: &str, runs: Arc<AtomicUsize>) -> Self {
        CounterNode {
            key: key.to_string(),
            runs,
            deps: DepMap::new(),
            volatile: false,
        }
    }

    pub fn with_dep(mut self, name: &str, dep: NodeRef) -> Self {
        self.deps.insert(name.to_string(), dep);
        self
    }

    pub fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }
}

#[async_trait::async_trait]
impl BuilderNode for CounterNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::key(self.key.clone())
    }

    fn volatile(&self) -> bool {
        self.volatile
    }

    fn deps(&self) -> Option<DepMap> {
        if self.deps.is_empty() {
            None
        } else {
            Some(self.deps.clone())
        }
    }

    async fn run(&self, inputs: &NodeInputs) -> Result<NodeOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        // pass through the first input's text when there is one
        if let Ok(value) = inputs.sole() {
            return Ok(NodeOutput::Value(value.clone()));
        }
        Ok(NodeOutput::Value(NodeValue::text(self.key.clone())))
    }
}

/// Keeps private state across rebuilds: each run increments an internal
/// counter, so the reported value proves whether the same node object
/// survived from the previous build.
pub struct StatefulNode {
    key: String,
    internal: AtomicUsize,
}

impl StatefulNode {
    pub fn new(key: &str) -> Self {
        StatefulNode {
            key: key.to_string(),
            internal: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl BuilderNode for StatefulNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::key(self.key.clone())
    }

    fn volatile(&self) -> bool {
        true
    }

    async fn run(&self, _inputs: &NodeInputs) -> Result<NodeOutput> {
        let count = self.internal.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(NodeOutput::Value(NodeValue::text(count.to_string())))
    }
}

/// Violates the node contract by claiming `unchanged` on its first run.
pub struct BadUnchangedNode;

#[async_trait::async_trait]
impl BuilderNode for BadUnchangedNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::key("bad-unchanged")
    }

    async fn run(&self, _inputs: &NodeInputs) -> Result<NodeOutput> {
        Ok(NodeOutput::Unchanged)
    }
}

/// Redirects to a continuation node carrying the final value.
pub struct RedirectNode {
    pub target: NodeRef,
}

#[async_trait::async_trait]
impl BuilderNode for RedirectNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::key("redirect")
    }

    async fn run(&self, _inputs: &NodeInputs) -> Result<NodeOutput> {
        Ok(NodeOutput::Node(self.target.clone()))
    }
}

/// Always fails; drives the rebuilder's failure-outcome path.
pub struct FailingNode;

#[async_trait::async_trait]
impl BuilderNode for FailingNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::key("failing")
    }

    async fn run(&self, _inputs: &NodeInputs) -> Result<NodeOutput> {
        Err(bundlegraph_builder::BuildError::fs("refusing to build"))
    }
}
