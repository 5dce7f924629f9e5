//! Incremental build runner
//!
//! `build()` evaluates a record of named root nodes against two node-state
//! tables: the snapshot of the previous completed build and a working table
//! for the current one. Identical cache keys collapse to one evaluation per
//! build; node objects are reused across builds so stateful nodes keep their
//! private state; a non-volatile node whose dependencies all report
//! unchanged short-circuits to its previous result.
//!
//! File reads and writes are special-cased through capability traits: a
//! file-sink node writes its sole dependency's text and always reports
//! changed; a file-source node is always volatile and re-reads only on its
//! first run or when the recently-changed batch names its URL, with a blake3
//! content fingerprint deciding whether the value actually changed.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;
use url::Url;

use crate::errors::{BuildError, Result};
use crate::fs::{self, FileSystem};
use crate::nodes::{CacheKey, DepMap, NodeInputs, NodeOutput, NodeRef, NodeValue};
use crate::watch::WatchRegistry;

#[derive(Clone)]
enum InternalResult {
    Value { value: NodeValue, changed: bool },
    Node { node: NodeRef, changed: bool },
}

impl InternalResult {
    fn with_changed(&self, changed: bool) -> InternalResult {
        match self {
            InternalResult::Value { value, .. } => InternalResult::Value {
                value: value.clone(),
                changed,
            },
            InternalResult::Node { node, .. } => InternalResult::Node {
                node: node.clone(),
                changed,
            },
        }
    }
}

#[derive(Clone)]
struct CompleteState {
    node: NodeRef,
    deps: Option<DepMap>,
    output: InternalResult,
}

enum CurrentState {
    /// Registered as a dependency but not yet evaluated; first writer wins
    /// so stateful node instances keep their identity.
    Initial(NodeRef),
    Evaluating(NodeRef),
    Complete(CompleteState),
}

struct BuildContext {
    states: FxHashMap<CacheKey, CurrentState>,
    changed_files: FxHashSet<Url>,
}

pub struct BuildRunner {
    fs: Arc<FileSystem>,
    watch: Arc<WatchRegistry>,
    roots: IndexMap<String, NodeRef>,
    /// snapshot of the previous completed build
    node_states: FxHashMap<CacheKey, CompleteState>,
    file_fingerprints: FxHashMap<String, blake3::Hash>,
}

impl BuildRunner {
    pub fn new(
        fs: Arc<FileSystem>,
        roots: IndexMap<String, NodeRef>,
        watch: Arc<WatchRegistry>,
    ) -> Self {
        BuildRunner {
            fs,
            watch,
            roots,
            node_states: FxHashMap::default(),
            file_fingerprints: FxHashMap::default(),
        }
    }

    pub fn watch(&self) -> &Arc<WatchRegistry> {
        &self.watch
    }

    /// Cache keys with completed states from the last build; test
    /// instrumentation.
    pub fn cached_cache_keys(&self) -> Vec<String> {
        self.node_states
            .keys()
            .filter_map(|key| match key {
                CacheKey::Key(key) => Some(key.clone()),
                CacheKey::Ident(_) => None,
            })
            .collect()
    }

    pub async fn build(&mut self) -> Result<IndexMap<String, NodeValue>> {
        let mut ctx = BuildContext {
            states: FxHashMap::default(),
            changed_files: self.watch.take_recent_changes(),
        };
        let roots = self.roots.clone();
        let mut values = IndexMap::new();
        for (name, node) in roots {
            let (value, _changed) = self.eval_node(node, &mut ctx).await?;
            values.insert(name, value);
        }

        let mut completed: FxHashMap<CacheKey, CompleteState> = FxHashMap::default();
        for (key, state) in ctx.states {
            match state {
                CurrentState::Complete(state) => {
                    completed.insert(key, state);
                }
                CurrentState::Initial(_) | CurrentState::Evaluating(_) => {
                    return Err(BuildError::bug(format!(
                        "found a node that was not in state \"complete\" at the end of the \
                         build: {}",
                        key
                    )));
                }
            }
        }
        self.node_states = completed;
        debug!(nodes = self.node_states.len(), "build complete");
        Ok(values)
    }

    fn eval_node<'a>(
        &'a mut self,
        node: NodeRef,
        ctx: &'a mut BuildContext,
    ) -> BoxFuture<'a, Result<(NodeValue, bool)>> {
        async move {
            let key = node.cache_key();
            let mut node = node;
            match ctx.states.get(&key) {
                Some(CurrentState::Complete(state)) => {
                    // structural dedup: another call site already evaluated
                    // this cache key
                    let output = state.output.clone();
                    return self.resolve_output(output, ctx).await;
                }
                Some(CurrentState::Evaluating(_)) => {
                    return Err(BuildError::bug(format!(
                        "dependency cycle detected at cache key {}",
                        key
                    )));
                }
                Some(CurrentState::Initial(registered)) => {
                    node = registered.clone();
                }
                None => {
                    if let Some(previous) = self.node_states.get(&key) {
                        // reuse the node object across builds; this is the
                        // hook that lets an instance carry private state
                        // between rebuilds
                        node = previous.node.clone();
                    }
                }
            }

            let deps = node.deps().map(|declared| {
                let mut deduplicated = DepMap::new();
                for (name, dep) in declared {
                    let dep_key = dep.cache_key();
                    let dep = match ctx.states.get(&dep_key) {
                        Some(CurrentState::Initial(existing)) => existing.clone(),
                        Some(CurrentState::Evaluating(existing)) => existing.clone(),
                        Some(CurrentState::Complete(state)) => state.node.clone(),
                        None => {
                            ctx.states
                                .insert(dep_key, CurrentState::Initial(dep.clone()));
                            dep
                        }
                    };
                    deduplicated.insert(name, dep);
                }
                deduplicated
            });

            ctx.states
                .insert(key.clone(), CurrentState::Evaluating(node.clone()));
            let output = self.run_node(&node, deps.as_ref(), ctx).await?;
            ctx.states.insert(
                key,
                CurrentState::Complete(CompleteState {
                    node: node.clone(),
                    deps,
                    output: output.clone(),
                }),
            );
            self.resolve_output(output, ctx).await
        }
        .boxed()
    }

    /// Follow a `{ node }` redirect to its final value.
    fn resolve_output<'a>(
        &'a mut self,
        output: InternalResult,
        ctx: &'a mut BuildContext,
    ) -> BoxFuture<'a, Result<(NodeValue, bool)>> {
        async move {
            match output {
                InternalResult::Value { value, changed } => Ok((value, changed)),
                InternalResult::Node { node, .. } => self.eval_node(node, ctx).await,
            }
        }
        .boxed()
    }

    async fn run_node(
        &mut self,
        node: &NodeRef,
        deps: Option<&DepMap>,
        ctx: &mut BuildContext,
    ) -> Result<InternalResult> {
        let key = node.cache_key();
        let mut inputs = NodeInputs::default();
        let mut stable_inputs = true;
        if let Some(deps) = deps {
            let mut values = IndexMap::new();
            for (name, dep) in deps {
                let (value, changed) = self.eval_node(dep.clone(), ctx).await?;
                stable_inputs &= !changed;
                values.insert(name.clone(), value);
            }
            inputs = NodeInputs::new(values);
        }

        if !node.volatile() && stable_inputs {
            if let Some(previous) = self.node_states.get(&key) {
                return Ok(previous.output.with_changed(false));
            }
        }

        if let Some(sink) = node.as_file_sink() {
            let url = sink.url().clone();
            let text = inputs.sole()?.as_text()?.to_string();
            fs::write_text(&self.fs, &url, &text).await?;
            debug!(url = %url, bytes = text.len(), "wrote output file");
            return Ok(InternalResult::Value {
                value: NodeValue::Unit,
                changed: true,
            });
        }
        if let Some(source) = node.as_file_source() {
            let url = source.url().clone();
            return self.run_file_node(&url, &key, ctx).await;
        }

        match node.run(&inputs).await? {
            NodeOutput::Value(value) => Ok(InternalResult::Value {
                value,
                changed: true,
            }),
            NodeOutput::Node(next) => Ok(InternalResult::Node {
                node: next,
                changed: true,
            }),
            NodeOutput::Unchanged => {
                let previous = self.node_states.get(&key).ok_or_else(|| {
                    BuildError::bug(format!(
                        "node {} returned unchanged from its first run",
                        key
                    ))
                })?;
                Ok(previous.output.with_changed(false))
            }
        }
    }

    /// The volatile file read: re-read on the first run or when the
    /// recently-changed batch names this URL; the content fingerprint
    /// decides whether consumers see a change.
    async fn run_file_node(
        &mut self,
        url: &Url,
        key: &CacheKey,
        ctx: &mut BuildContext,
    ) -> Result<InternalResult> {
        let first_run = self.watch.ensure_watching(url);
        let previous = self.node_states.get(key).map(|s| s.output.clone());

        if !first_run && !ctx.changed_files.contains(url) {
            if let Some(previous) = previous {
                return Ok(previous.with_changed(false));
            }
            // watched but the last build never completed; read fresh
        }

        let text = fs::read_text(&self.fs, url).await?;
        let fingerprint = blake3::hash(text.as_bytes());
        let same_content = self.file_fingerprints.get(url.as_str()) == Some(&fingerprint);
        self.file_fingerprints
            .insert(url.as_str().to_string(), fingerprint);
        if !first_run && same_content {
            if let Some(previous) = previous {
                return Ok(previous.with_changed(false));
            }
        }
        debug!(url = %url, first_run, "read input file");
        Ok(InternalResult::Value {
            value: NodeValue::text(text),
            changed: true,
        })
    }

    /// Diagnostics: one record per node from the last completed build,
    /// sufficient to reconstruct the build dependency graph.
    pub fn explain(&self) -> Explain {
        let mut entries: Vec<ExplainEntry> = self
            .node_states
            .values()
            .map(|state| {
                let deps = state
                    .deps
                    .as_ref()
                    .map(|deps| {
                        deps.iter()
                            .map(|(name, dep)| (name.clone(), dep.debug_name()))
                            .collect()
                    })
                    .unwrap_or_default();
                let (redirected_to, changed) = match &state.output {
                    InternalResult::Value { changed, .. } => (None, *changed),
                    InternalResult::Node { node, changed } => {
                        (Some(node.debug_name()), *changed)
                    }
                };
                ExplainEntry {
                    name: state.node.debug_name(),
                    deps,
                    redirected_to,
                    changed,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Explain { entries }
    }
}

/// One node's record in the build-graph explanation.
#[derive(Debug, Clone)]
pub struct ExplainEntry {
    pub name: String,
    /// dependency name -> dependency node
    pub deps: Vec<(String, String)>,
    /// the node this one redirected to, when it returned a continuation
    pub redirected_to: Option<String>,
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct Explain {
    entries: Vec<ExplainEntry>,
}

impl Explain {
    pub fn entries(&self) -> &[ExplainEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&ExplainEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Graphviz rendering of the build graph; redirect edges are colored.
    pub fn dot(&self) -> String {
        #[derive(Clone, Copy, PartialEq)]
        enum Edge {
            Dep,
            Redirect,
        }
        let mut graph: DiGraph<String, Edge> = DiGraph::new();
        let mut indices = FxHashMap::default();
        let mut node_index = |graph: &mut DiGraph<String, Edge>, name: &str| {
            *indices
                .entry(name.to_string())
                .or_insert_with(|| graph.add_node(name.to_string()))
        };
        for entry in &self.entries {
            let from = node_index(&mut graph, &entry.name);
            for (_, dep) in &entry.deps {
                let to = node_index(&mut graph, dep);
                graph.add_edge(from, to, Edge::Dep);
            }
            if let Some(redirect) = &entry.redirected_to {
                let to = node_index(&mut graph, redirect);
                graph.add_edge(from, to, Edge::Redirect);
            }
        }

        let mut output = vec!["digraph {".to_string()];
        for index in graph.node_indices() {
            output.push(format!("\"{}\"", dot_safe(&graph[index])));
        }
        for edge in graph.edge_references() {
            let from = dot_safe(&graph[edge.source()]);
            let to = dot_safe(&graph[edge.target()]);
            match edge.weight() {
                Edge::Dep => output.push(format!("\"{}\" -> \"{}\"", from, to)),
                Edge::Redirect => {
                    output.push(format!("\"{}\" -> \"{}\" [color=\"blue\"]", from, to))
                }
            }
        }
        output.push("}".to_string());
        output.join("\n")
    }
}

fn dot_safe(name: &str) -> String {
    name.replace('"', "\\\"")
}

/// One-shot builder over a filesystem and a record of roots.
pub struct Builder {
    runner: BuildRunner,
}

impl Builder {
    pub fn new(fs: Arc<FileSystem>, roots: IndexMap<String, NodeRef>) -> Self {
        let watch = WatchRegistry::new();
        watch.clone().subscribe(&fs);
        Builder {
            runner: BuildRunner::new(fs, roots, watch),
        }
    }

    pub async fn build(&mut self) -> Result<IndexMap<String, NodeValue>> {
        self.runner.build().await
    }

    pub fn explain(&self) -> Explain {
        self.runner.explain()
    }

    pub fn cached_cache_keys(&self) -> Vec<String> {
        self.runner.cached_cache_keys()
    }

    pub fn into_runner(self) -> BuildRunner {
        self.runner
    }
}
