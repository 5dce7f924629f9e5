//! Bundle nodes
//!
//! The root of a bundle build is a `MakeBundleNode`: it depends on the
//! combined bundle source and on the write node that lands it on disk.
//! `CombineModulesNode` pulls the resolved module graph from the inputs
//! node, runs dependency resolution and the region walk, then redirects to
//! an `AppendModuleNode` chain — one continuation node per module, each
//! rewriting one scope — finishing with a `FinishBundleNode` that serializes
//! the bundle.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::info;
use url::Url;

use super::{
    BuilderNode, CacheKey, DepMap, FileNode, LockFileNode, NodeInputs, NodeOutput, NodeRef,
    NodeValue, WriteFileNode,
};
use crate::errors::{BuildError, Result};
use bundlegraph_ir::module_graph::{BundleAssignment, ModuleGraph, ModuleResolution};
use bundlegraph_ir::resolution::{Dependencies, DependencyResolver, LockFile, PackageCatalog};
use bundlegraph_ir::rewrite::{finish_bundle, HeadState, ModuleRewriter};
use bundlegraph_ir::walker::{exposed_regions, RegionWalker};

/// Everything the resolver/walker/rewriter triad consumes, supplied by the
/// out-of-scope resolve and bundle-assignment collaborators.
#[derive(Debug)]
pub struct BundleInputs {
    pub graph: Arc<ModuleGraph>,
    pub assignments: Arc<Vec<BundleAssignment>>,
    pub resolutions_in_dep_order: Vec<Arc<ModuleResolution>>,
    pub dependencies: Dependencies,
    pub lock_file: Option<LockFile>,
}

/// Collaborator that resolves and assigns the module graph.
pub trait BundleInputsProvider: Send + Sync {
    /// Source files whose changes must invalidate the graph.
    fn watched_files(&self) -> Vec<Url>;
    fn inputs(&self) -> Result<Arc<BundleInputs>>;
}

/// Materializes the resolved module graph, invalidated by its watched
/// source files (and lock file, when one is configured).
pub struct BundleInputsNode {
    name: String,
    provider: Arc<dyn BundleInputsProvider>,
    lock_file: Option<Url>,
}

impl BundleInputsNode {
    pub fn new(name: impl Into<String>, provider: Arc<dyn BundleInputsProvider>) -> Self {
        BundleInputsNode {
            name: name.into(),
            provider,
            lock_file: None,
        }
    }

    pub fn with_lock_file(mut self, url: Url) -> Self {
        self.lock_file = Some(url);
        self
    }
}

#[async_trait::async_trait]
impl BuilderNode for BundleInputsNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::key(format!("bundle-inputs:{}", self.name))
    }

    fn deps(&self) -> Option<DepMap> {
        let mut deps = DepMap::new();
        for (index, url) in self.provider.watched_files().into_iter().enumerate() {
            deps.insert(format!("file{}", index), Arc::new(FileNode::new(url)) as NodeRef);
        }
        if let Some(lock_file) = &self.lock_file {
            deps.insert(
                "lock-file".to_string(),
                Arc::new(LockFileNode::new(lock_file.clone())) as NodeRef,
            );
        }
        Some(deps)
    }

    async fn run(&self, inputs: &NodeInputs) -> Result<NodeOutput> {
        let mut resolved = self.provider.inputs()?;
        if self.lock_file.is_some() {
            let lock_file = inputs.get("lock-file")?.as_lock_file()?.clone();
            let inner = Arc::get_mut(&mut resolved);
            match inner {
                Some(inner) => inner.lock_file = Some((*lock_file).clone()),
                None => {
                    return Err(BuildError::bug(
                        "bundle inputs must be uniquely owned when a lock file overrides them"
                            .to_string(),
                    ))
                }
            }
        }
        Ok(NodeOutput::Value(NodeValue::Inputs(resolved)))
    }
}

/// State threaded through the append chain.
struct CombineState {
    head: HeadState,
    rewriters: Vec<ModuleRewriter>,
    inputs: Arc<BundleInputs>,
}

pub struct CombineModulesNode {
    bundle: Url,
    catalog: Arc<dyn PackageCatalog>,
    inputs_node: NodeRef,
}

impl CombineModulesNode {
    pub fn new(bundle: Url, catalog: Arc<dyn PackageCatalog>, inputs_node: NodeRef) -> Self {
        CombineModulesNode {
            bundle,
            catalog,
            inputs_node,
        }
    }
}

#[async_trait::async_trait]
impl BuilderNode for CombineModulesNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::key(format!("combine-modules:{}", self.bundle))
    }

    fn deps(&self) -> Option<DepMap> {
        let mut deps = DepMap::new();
        deps.insert("inputs".to_string(), self.inputs_node.clone());
        Some(deps)
    }

    async fn run(&self, node_inputs: &NodeInputs) -> Result<NodeOutput> {
        let inputs = node_inputs.get("inputs")?.as_inputs()?.clone();
        let mut resolver = DependencyResolver::new(
            &inputs.dependencies,
            inputs.lock_file.as_ref(),
            inputs.assignments.clone(),
            self.bundle.clone(),
            inputs.graph.clone(),
            self.catalog.clone(),
        )?;
        let exposed = exposed_regions(&self.bundle, &inputs.assignments, &mut resolver)?;
        let walker = RegionWalker::new(
            self.bundle.clone(),
            exposed,
            inputs.assignments.clone(),
            inputs.resolutions_in_dep_order.clone(),
            &mut resolver,
        )?;
        let editors = walker.into_editors()?;
        info!(bundle = %self.bundle, editors = editors.len(), "combining modules");

        let state = CombineState {
            head: HeadState::new(editors),
            rewriters: Vec::new(),
            inputs,
        };
        Ok(NodeOutput::Node(next_append(self.bundle.clone(), state)))
    }
}

/// Build the next continuation node for the append chain: another module
/// rewrite, or the finishing serialization.
fn next_append(bundle: Url, mut state: CombineState) -> NodeRef {
    match state.head.next() {
        Some(editor) => {
            let module = editor.module().url.clone();
            let (done, total) = state.head.progress();
            Arc::new(AppendModuleNode {
                key: CacheKey::ident(),
                bundle,
                module,
                progress: (done, total),
                carry: Mutex::new(Some(AppendCarry { state, editor })),
            }) as NodeRef
        }
        None => Arc::new(FinishBundleNode {
            key: CacheKey::ident(),
            bundle,
            carry: Mutex::new(Some(state)),
        }) as NodeRef,
    }
}

struct AppendCarry {
    state: CombineState,
    editor: bundlegraph_ir::RegionEditor,
}

/// Rewrites one module's scope, then redirects to the next link in the
/// chain. The carried state moves to the successor node, which is why these
/// nodes use identity cache keys.
pub struct AppendModuleNode {
    key: CacheKey,
    bundle: Url,
    module: Url,
    progress: (usize, usize),
    carry: Mutex<Option<AppendCarry>>,
}

#[async_trait::async_trait]
impl BuilderNode for AppendModuleNode {
    fn cache_key(&self) -> CacheKey {
        self.key.clone()
    }

    async fn run(&self, _inputs: &NodeInputs) -> Result<NodeOutput> {
        let AppendCarry { mut state, editor } =
            self.carry.lock().take().ok_or_else(|| {
                BuildError::bug(format!(
                    "append-module node for {} ran twice",
                    self.module
                ))
            })?;
        let rewriter = ModuleRewriter::new(
            &self.bundle,
            editor,
            &mut state.head,
            state.inputs.assignments.as_slice(),
            &state.inputs.graph,
        )?;
        // rewritten entrypoint-first; serialized dependency-first
        state.rewriters.insert(0, rewriter);
        Ok(NodeOutput::Node(next_append(self.bundle.clone(), state)))
    }

    fn debug_name(&self) -> String {
        format!(
            "append-module:{}:{}:{}/{}",
            self.bundle, self.module, self.progress.0, self.progress.1
        )
    }
}

/// Serializes the rewritten modules into the final bundle source.
pub struct FinishBundleNode {
    key: CacheKey,
    bundle: Url,
    carry: Mutex<Option<CombineState>>,
}

#[async_trait::async_trait]
impl BuilderNode for FinishBundleNode {
    fn cache_key(&self) -> CacheKey {
        self.key.clone()
    }

    async fn run(&self, _inputs: &NodeInputs) -> Result<NodeOutput> {
        let state = self.carry.lock().take().ok_or_else(|| {
            BuildError::bug(format!("finish-bundle node for {} ran twice", self.bundle))
        })?;
        let bundle = finish_bundle(
            &self.bundle,
            state.head,
            state.rewriters,
            &state.inputs.assignments,
            &state.inputs.dependencies,
            &state.inputs.graph,
        )?;
        Ok(NodeOutput::Value(NodeValue::Bundle(Arc::new(bundle))))
    }

    fn debug_name(&self) -> String {
        format!("finish-bundle:{}", self.bundle)
    }
}

/// Root node for one output bundle: combine its modules and write the
/// result through the filesystem collaborator.
pub struct MakeBundleNode {
    bundle: Url,
    combine: NodeRef,
    write: NodeRef,
}

impl MakeBundleNode {
    pub fn new(bundle: Url, catalog: Arc<dyn PackageCatalog>, inputs_node: NodeRef) -> Self {
        let combine: NodeRef = Arc::new(CombineModulesNode::new(
            bundle.clone(),
            catalog,
            inputs_node,
        ));
        let write: NodeRef = Arc::new(WriteFileNode::new(bundle.clone(), combine.clone()));
        MakeBundleNode {
            bundle,
            combine,
            write,
        }
    }
}

#[async_trait::async_trait]
impl BuilderNode for MakeBundleNode {
    fn cache_key(&self) -> CacheKey {
        CacheKey::key(format!("bundle:{}", self.bundle))
    }

    fn deps(&self) -> Option<DepMap> {
        let mut deps = DepMap::new();
        deps.insert("bundle".to_string(), self.combine.clone());
        deps.insert("written".to_string(), self.write.clone());
        Some(deps)
    }

    async fn run(&self, inputs: &NodeInputs) -> Result<NodeOutput> {
        Ok(NodeOutput::Value(inputs.get("bundle")?.clone()))
    }
}

/// A record of bundle input/output roots. Input and output may not share an
/// origin: a build writing into its own input space retriggers itself
/// forever.
pub fn validate_roots(roots: &[(Url, Url)]) -> Result<()> {
    for (input, output) in roots {
        if input.origin() == output.origin() {
            return Err(BuildError::bug(format!(
                "the input root origin {} cannot be the same as the output root origin {}. \
                 This situation triggers a run away rebuild.",
                input, output
            )));
        }
    }
    Ok(())
}

/// Convenience: the root map for a set of bundles sharing one inputs node.
pub fn bundle_roots(
    bundles: &[Url],
    catalog: &Arc<dyn PackageCatalog>,
    inputs_node: NodeRef,
) -> IndexMap<String, NodeRef> {
    let mut roots: IndexMap<String, NodeRef> = IndexMap::new();
    for bundle in bundles {
        roots.insert(
            bundle.to_string(),
            Arc::new(MakeBundleNode::new(
                bundle.clone(),
                catalog.clone(),
                inputs_node.clone(),
            )) as NodeRef,
        );
    }
    roots
}
