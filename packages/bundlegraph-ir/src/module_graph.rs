//! Resolved module graph
//!
//! Modules live in a URL-keyed arena; import edges are stored as URLs rather
//! than references, with `Cyclic` markers identifying members of an import
//! cycle group. The graph is read-only for the duration of one build.

use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use rustc_hash::FxHashMap;
use url::Url;

use crate::errors::{IrError, Result};
use crate::regions::describe::{ExportDescription, ExportKey, ModuleDescription, NameDescription};
use crate::regions::region::{ImportedName, RegionPointer};

/// Target of one import statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportTarget {
    Resolved(Url),
    /// The target participates in an import cycle with the importing module.
    Cyclic(Url),
}

impl ImportTarget {
    pub fn url(&self) -> &Url {
        match self {
            ImportTarget::Resolved(url) | ImportTarget::Cyclic(url) => url,
        }
    }

    pub fn is_cyclic(&self) -> bool {
        matches!(self, ImportTarget::Cyclic(_))
    }
}

/// One module with its resolved import edges.
#[derive(Debug)]
pub struct ModuleResolution {
    pub url: Url,
    pub source: String,
    pub desc: ModuleDescription,
    /// One entry per `desc.imports` index.
    pub resolved_imports: Vec<ImportTarget>,
}

/// URL-keyed arena of resolved modules.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    modules: FxHashMap<String, Arc<ModuleResolution>>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: ModuleResolution) -> Arc<ModuleResolution> {
        let arc = Arc::new(module);
        self.modules.insert(arc.url.as_str().to_string(), arc.clone());
        arc
    }

    pub fn get(&self, url: &Url) -> Option<&Arc<ModuleResolution>> {
        self.modules.get(url.as_str())
    }

    /// Look up a module that the graph is required to contain.
    pub fn module(&self, url: &Url) -> Result<&Arc<ModuleResolution>> {
        self.get(url)
            .ok_or_else(|| IrError::bug(format!("module {} is not in the module graph", url)))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// The import target for `import_index` of `module`.
    pub fn import_target<'a>(
        &self,
        module: &'a ModuleResolution,
        import_index: usize,
    ) -> Result<&'a ImportTarget> {
        module.resolved_imports.get(import_index).ok_or_else(|| {
            IrError::bug(format!(
                "module {} has no resolved import at index {}",
                module.url, import_index
            ))
        })
    }

    /// Modules reachable from `roots`, dependencies first.
    ///
    /// Kahn's algorithm over the import graph; members of a cycle group come
    /// out in insertion order relative to each other.
    pub fn modules_in_dependency_order(&self, roots: &[Url]) -> Result<Vec<Arc<ModuleResolution>>> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut indices: FxHashMap<String, NodeIndex> = FxHashMap::default();
        let mut queue: VecDeque<Url> = roots.iter().cloned().collect();
        let mut seen: Vec<String> = Vec::new();

        while let Some(url) = queue.pop_front() {
            if indices.contains_key(url.as_str()) {
                continue;
            }
            let idx = graph.add_node(url.as_str().to_string());
            indices.insert(url.as_str().to_string(), idx);
            seen.push(url.as_str().to_string());
            let module = self.module(&url)?;
            for target in &module.resolved_imports {
                queue.push_back(target.url().clone());
            }
        }
        // second pass for edges now that every node exists
        for href in &seen {
            let module = &self.modules[href];
            let from = indices[href.as_str()];
            for target in &module.resolved_imports {
                if target.is_cyclic() {
                    continue; // cycle edges would wedge the in-degree count
                }
                let to = indices[target.url().as_str()];
                if from != to {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut in_degree: FxHashMap<NodeIndex, usize> = FxHashMap::default();
        for idx in graph.node_indices() {
            in_degree.insert(idx, 0);
        }
        for edge in graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }
        let mut ready: VecDeque<NodeIndex> = graph
            .node_indices()
            .filter(|idx| in_degree[idx] == 0)
            .collect();
        let mut order = Vec::new();
        while let Some(idx) = ready.pop_front() {
            order.push(graph[idx].clone());
            for neighbor in graph.neighbors(idx) {
                if let Some(degree) = in_degree.get_mut(&neighbor) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(neighbor);
                    }
                }
            }
        }
        // anything left was part of a cycle; append in discovery order
        for href in &seen {
            if !order.contains(href) {
                order.push(href.clone());
            }
        }
        order.reverse();
        Ok(order
            .into_iter()
            .map(|href| self.modules[&href].clone())
            .collect())
    }
}

/// Maps one module to its output bundle, with the bindings the bundle
/// exposes as public API.
#[derive(Debug, Clone)]
pub struct BundleAssignment {
    pub bundle_url: Url,
    pub module: Url,
    pub entrypoint_module_url: Url,
    /// original name -> exposed name
    pub exposed_names: IndexMap<String, String>,
}

/// Assignments for the bundle being built.
pub fn own_assignments<'a>(
    assignments: &'a [BundleAssignment],
    bundle: &Url,
) -> Vec<&'a BundleAssignment> {
    assignments
        .iter()
        .filter(|a| &a.bundle_url == bundle)
        .collect()
}

pub fn assignment_for_module<'a>(
    assignments: &'a [BundleAssignment],
    module: &Url,
) -> Option<&'a BundleAssignment> {
    assignments.iter().find(|a| &a.module == module)
}

/// Where a binding request landed after following import and re-export
/// chains.
#[derive(Debug, Clone)]
pub enum DeclarationSource {
    /// A local declaration inside this bundle's module set.
    Resolved {
        module: Url,
        pointer: RegionPointer,
        declared_name: String,
    },
    /// A namespace import, or a binding that lives in another bundle.
    Unresolved {
        imported_as: ImportedName,
        imported_from_module: Url,
        consuming_module: Url,
        /// The import declaration region in the consuming module, when one
        /// exists.
        imported_pointer: Option<RegionPointer>,
    },
}

/// Follow `imported_name` of `imported_from` to the local declaration that
/// defines it, stopping at namespace imports and bundle boundaries.
pub fn resolve_declaration(
    imported_name: &ImportedName,
    imported_from: &Url,
    consuming_module: &Url,
    own_assignments: &[&BundleAssignment],
    graph: &ModuleGraph,
) -> Result<DeclarationSource> {
    let in_own_bundle = own_assignments
        .iter()
        .any(|a| &a.module == imported_from);
    let name = match imported_name {
        ImportedName::Namespace => {
            return Ok(DeclarationSource::Unresolved {
                imported_as: ImportedName::Namespace,
                imported_from_module: imported_from.clone(),
                consuming_module: consuming_module.clone(),
                imported_pointer: import_pointer(
                    graph,
                    consuming_module,
                    imported_from,
                    imported_name,
                )?,
            });
        }
        ImportedName::Named(name) => name,
    };
    if !in_own_bundle {
        return Ok(DeclarationSource::Unresolved {
            imported_as: imported_name.clone(),
            imported_from_module: imported_from.clone(),
            consuming_module: consuming_module.clone(),
            imported_pointer: import_pointer(graph, consuming_module, imported_from, imported_name)?,
        });
    }

    let module = graph.module(imported_from)?;
    match module.desc.exports.get(&ExportKey::named(name.clone())) {
        Some(ExportDescription::Local { name: local, .. }) => {
            match module.desc.names.get(local) {
                Some(NameDescription::Local { pointer }) => Ok(DeclarationSource::Resolved {
                    module: imported_from.clone(),
                    pointer: *pointer,
                    declared_name: local.clone(),
                }),
                Some(NameDescription::Import {
                    import_index,
                    imported_name: inner,
                    ..
                }) => {
                    let target = graph.import_target(module, *import_index)?.url().clone();
                    resolve_declaration(inner, &target, imported_from, own_assignments, graph)
                }
                None => Err(IrError::bug(format!(
                    "module {} exports '{}' but has no such binding",
                    imported_from, local
                ))),
            }
        }
        Some(ExportDescription::Reexport {
            import_index, name, ..
        }) => {
            let target = graph.import_target(module, *import_index)?.url().clone();
            resolve_declaration(name, &target, imported_from, own_assignments, graph)
        }
        Some(ExportDescription::ExportAll { .. }) | None => {
            // the name may arrive through an export-all
            for desc in module.desc.exports.values() {
                if let ExportDescription::ExportAll { import_index, .. } = desc {
                    let target = graph.import_target(module, *import_index)?.url().clone();
                    if get_exports(&target, graph)?.contains_key(name) {
                        return resolve_declaration(
                            imported_name,
                            &target,
                            imported_from,
                            own_assignments,
                            graph,
                        );
                    }
                }
            }
            Err(IrError::bug(format!(
                "module {} consumed by {} has no export named '{}'",
                imported_from, consuming_module, name
            )))
        }
    }
}

/// All exported names of a module mapped to the module that declares them,
/// with `export * from` statements flattened.
pub fn get_exports(module_url: &Url, graph: &ModuleGraph) -> Result<IndexMap<String, Url>> {
    let module = graph.module(module_url)?;
    let mut exports: IndexMap<String, Url> = IndexMap::new();
    for (key, desc) in &module.desc.exports {
        match (key, desc) {
            (ExportKey::Named(name), ExportDescription::Local { .. })
            | (ExportKey::Named(name), ExportDescription::Reexport { .. }) => {
                exports.insert(name.clone(), module_url.clone());
            }
            (ExportKey::AllFrom(_), ExportDescription::ExportAll { import_index, .. }) => {
                let target = graph.import_target(module, *import_index)?.url().clone();
                for (name, source) in get_exports(&target, graph)? {
                    exports.entry(name).or_insert(source);
                }
            }
            _ => {}
        }
    }
    Ok(exports)
}

/// The import declaration region in `consuming` that binds `imported_name`
/// from `imported_from`.
fn import_pointer(
    graph: &ModuleGraph,
    consuming: &Url,
    imported_from: &Url,
    imported_name: &ImportedName,
) -> Result<Option<RegionPointer>> {
    let module = match graph.get(consuming) {
        Some(m) => m,
        None => return Ok(None),
    };
    for name_desc in module.desc.names.values() {
        if let NameDescription::Import {
            pointer,
            import_index,
            imported_name: bound,
        } = name_desc
        {
            if bound == imported_name
                && module.resolved_imports[*import_index].url() == imported_from
            {
                return Ok(Some(*pointer));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ModuleBuilder;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn assignment(module: &Url, bundle: &Url) -> BundleAssignment {
        BundleAssignment {
            bundle_url: bundle.clone(),
            module: module.clone(),
            entrypoint_module_url: module.clone(),
            exposed_names: IndexMap::new(),
        }
    }

    #[test]
    fn test_dependency_order_puts_leaves_first() {
        let mut graph = ModuleGraph::new();
        let a = url("https://local/a.js");
        let b = url("https://local/b.js");
        let (src_a, desc_a) = ModuleBuilder::new().const_decl("x", "1", &[], true).build();
        graph.insert(ModuleResolution {
            url: a.clone(),
            source: src_a,
            desc: desc_a,
            resolved_imports: vec![],
        });
        let (src_b, desc_b) = ModuleBuilder::new()
            .import("./a.js", &[("x", "x")])
            .const_decl("y", "x + 1", &["x"], true)
            .build();
        graph.insert(ModuleResolution {
            url: b.clone(),
            source: src_b,
            desc: desc_b,
            resolved_imports: vec![ImportTarget::Resolved(a.clone())],
        });

        let order = graph.modules_in_dependency_order(&[b.clone()]).unwrap();
        let hrefs: Vec<&str> = order.iter().map(|m| m.url.as_str()).collect();
        assert_eq!(hrefs, vec![a.as_str(), b.as_str()]);
    }

    #[test]
    fn test_resolve_declaration_follows_reexport() {
        let mut graph = ModuleGraph::new();
        let a = url("https://local/a.js");
        let b = url("https://local/b.js");
        let c = url("https://local/c.js");
        let bundle = url("https://local/out.js");

        let (src_a, desc_a) = ModuleBuilder::new().const_decl("x", "1", &[], true).build();
        graph.insert(ModuleResolution {
            url: a.clone(),
            source: src_a,
            desc: desc_a,
            resolved_imports: vec![],
        });
        // b re-exports x from a
        let (src_b, desc_b) = ModuleBuilder::new().reexport("./a.js", &[("x", "x")]).build();
        graph.insert(ModuleResolution {
            url: b.clone(),
            source: src_b,
            desc: desc_b,
            resolved_imports: vec![ImportTarget::Resolved(a.clone())],
        });
        let (src_c, desc_c) = ModuleBuilder::new()
            .import("./b.js", &[("x", "x")])
            .build();
        graph.insert(ModuleResolution {
            url: c.clone(),
            source: src_c,
            desc: desc_c,
            resolved_imports: vec![ImportTarget::Resolved(b.clone())],
        });

        let assignments = vec![
            assignment(&a, &bundle),
            assignment(&b, &bundle),
            assignment(&c, &bundle),
        ];
        let own: Vec<&BundleAssignment> = assignments.iter().collect();
        let source = resolve_declaration(
            &ImportedName::named("x"),
            &b,
            &c,
            &own,
            &graph,
        )
        .unwrap();
        match source {
            DeclarationSource::Resolved {
                module,
                declared_name,
                ..
            } => {
                assert_eq!(module, a);
                assert_eq!(declared_name, "x");
            }
            other => panic!("expected resolved declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_declaration_stops_at_bundle_boundary() {
        let mut graph = ModuleGraph::new();
        let a = url("https://local/a.js");
        let b = url("https://local/b.js");
        let bundle_a = url("https://local/out-a.js");
        let bundle_b = url("https://local/out-b.js");

        let (src_a, desc_a) = ModuleBuilder::new().const_decl("x", "1", &[], true).build();
        graph.insert(ModuleResolution {
            url: a.clone(),
            source: src_a,
            desc: desc_a,
            resolved_imports: vec![],
        });
        let (src_b, desc_b) = ModuleBuilder::new()
            .import("./a.js", &[("x", "x")])
            .build();
        graph.insert(ModuleResolution {
            url: b.clone(),
            source: src_b,
            desc: desc_b,
            resolved_imports: vec![ImportTarget::Resolved(a.clone())],
        });

        let assignments = vec![assignment(&a, &bundle_a), assignment(&b, &bundle_b)];
        let own: Vec<&BundleAssignment> = assignments
            .iter()
            .filter(|asg| asg.bundle_url == bundle_b)
            .collect();
        let source =
            resolve_declaration(&ImportedName::named("x"), &a, &b, &own, &graph).unwrap();
        match source {
            DeclarationSource::Unresolved {
                imported_from_module,
                imported_pointer,
                ..
            } => {
                assert_eq!(imported_from_module, a);
                assert!(imported_pointer.is_some());
            }
            other => panic!("expected unresolved declaration, got {:?}", other),
        }
    }
}
