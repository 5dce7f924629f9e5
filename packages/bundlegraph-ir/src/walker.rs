//! Region reachability walk and editor assignment
//!
//! Starting from a bundle's exposed bindings and required module side
//! effects, the walker follows dependency edges through the region graphs of
//! every module feeding the bundle, hopping across re-export chains and
//! package-version redirects, and collects the minimal surviving region set.
//! Leaves are then assigned to per-module editors that become the bundle's
//! internal document order.
//!
//! The walk runs on an explicit work stack rather than the call stack; the
//! `seen`/`resolved` tables double as the cycle cutoff: revisiting a region
//! whose walk is still in flight resolves to nothing and the edge is
//! dropped, which is what breaks declaration/reference cycles.

use std::sync::Arc;
use std::time::Instant;

use indexmap::{IndexMap, IndexSet};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};
use url::Url;

use crate::errors::{IrError, Result};
use crate::module_graph::{BundleAssignment, DeclarationSource, ModuleGraph, ModuleResolution};
use crate::regions::editor::RegionEditor;
use crate::regions::region::{
    Declaration, ImportedName, RegionKind, RegionPointer, RegionRef, DOCUMENT_POINTER,
};
use crate::resolution::{DependencyResolver, ResolvedDependency};

/// A region's identity across modules. Namespace markers are pseudo-regions
/// that group the constituent items of a synthesized namespace object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionId {
    pub module: Url,
    pub pointer: IdPointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdPointer {
    Region(RegionPointer),
    Namespace,
}

impl RegionId {
    fn region(module: &Url, pointer: RegionPointer) -> Self {
        RegionId {
            module: module.clone(),
            pointer: IdPointer::Region(pointer),
        }
    }

    fn namespace(module: &Url) -> Self {
        RegionId {
            module: module.clone(),
            pointer: IdPointer::Namespace,
        }
    }

    fn region_pointer(&self) -> Option<RegionPointer> {
        match self.pointer {
            IdPointer::Region(p) => Some(p),
            IdPointer::Namespace => None,
        }
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pointer {
            IdPointer::Region(p) => write!(f, "{}:{}", self.module, p),
            IdPointer::Namespace => write!(f, "{}:namespace", self.module),
        }
    }
}

/// One region a bundle exposes: a public API binding (with its exposed
/// name) or a required module side effect (`exposed_as: None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedRegionInfo {
    pub module: Url,
    pub pointer: RegionPointer,
    pub exposed_as: Option<String>,
}

/// Compute the regions a bundle exposes from its assignments: every exposed
/// name resolved to its defining declaration (winning package versions
/// applied), plus each assigned module's document side effects.
pub fn exposed_regions(
    bundle: &Url,
    assignments: &Arc<Vec<BundleAssignment>>,
    resolver: &mut DependencyResolver,
) -> Result<Vec<ExposedRegionInfo>> {
    let graph = resolver.graph().clone();
    let own: Vec<BundleAssignment> = assignments
        .iter()
        .filter(|a| &a.bundle_url == bundle)
        .cloned()
        .collect();
    let mut results: Vec<ExposedRegionInfo> = Vec::new();

    for assignment in &own {
        let module = graph.module(&assignment.module)?.clone();
        for (original, exposed) in &assignment.exposed_names {
            let (source_module, _) =
                find_export_source(&module, original, &graph)?.ok_or_else(|| {
                    IrError::bug(format!(
                        "cannot determine the module that the export '{}' originally comes \
                         from when evaluating the module {} in the bundle {}",
                        original, module.url, bundle
                    ))
                })?;
            if !own.iter().any(|a| a.module == source_module) {
                // the export comes from an external bundle via an
                // export-all; the assigned-exports step handles it
                continue;
            }
            let own_refs: Vec<&BundleAssignment> = own.iter().collect();
            let source = resolver.resolve_declaration(
                &ImportedName::named(original.clone()),
                &source_module,
                &assignment.module,
                &own_refs,
            )?;
            let info = match source.source {
                DeclarationSource::Resolved {
                    module, pointer, ..
                } => ExposedRegionInfo {
                    module,
                    pointer,
                    exposed_as: Some(exposed.clone()),
                },
                DeclarationSource::Unresolved {
                    consuming_module,
                    imported_pointer,
                    imported_from_module,
                    ..
                } => {
                    let pointer = imported_pointer.ok_or_else(|| {
                        IrError::bug(format!(
                            "don't know which region to expose for '{}' from module {} \
                             consumed by module {} in bundle {}",
                            original, imported_from_module, consuming_module, bundle
                        ))
                    })?;
                    ExposedRegionInfo {
                        module: consuming_module,
                        pointer,
                        exposed_as: Some(exposed.clone()),
                    }
                }
            };
            if !results.contains(&info) {
                results.push(info);
            }
        }

        // required module side effects
        for dep in &module.desc.regions[DOCUMENT_POINTER].depends_on {
            if let RegionRef::Local(pointer) = dep {
                let info = ExposedRegionInfo {
                    module: module.url.clone(),
                    pointer: *pointer,
                    exposed_as: None,
                };
                if !results.contains(&info) {
                    results.push(info);
                }
            }
        }
    }
    Ok(results)
}

/// The module whose export chain ultimately carries `name`, searching
/// through `export *` statements.
fn find_export_source(
    module: &Arc<ModuleResolution>,
    name: &str,
    graph: &ModuleGraph,
) -> Result<Option<(Url, String)>> {
    use crate::regions::describe::{ExportDescription, ExportKey};
    if module.desc.exports.contains_key(&ExportKey::named(name)) {
        return Ok(Some((module.url.clone(), name.to_string())));
    }
    for desc in module.desc.exports.values() {
        if let ExportDescription::ExportAll { import_index, .. } = desc {
            let target = graph.import_target(module, *import_index)?.url().clone();
            let target_module = graph.module(&target)?.clone();
            if let Some(found) = find_export_source(&target_module, name, graph)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

enum Classified {
    Done(Option<RegionId>),
    Redirect(Arc<ModuleResolution>, RegionPointer),
    Push(Frame),
}

struct PlainFrame {
    module: Arc<ModuleResolution>,
    original: RegionId,
    resolved: RegionId,
    deps: Vec<RegionPointer>,
    next_dep: usize,
    collected: Vec<RegionId>,
}

struct NamespaceFrame {
    module: Url,
    marker: RegionId,
    /// export name -> module it comes from
    exports: Vec<(String, Url)>,
    next_export: usize,
    items: Vec<RegionId>,
    /// When the namespace visit came from an import region: that region's
    /// id, kept with the finished marker as its sole dependency.
    keep_import: Option<RegionId>,
    original: RegionId,
}

enum Frame {
    Plain(PlainFrame),
    Namespace(NamespaceFrame),
}

enum Advance {
    PlainDep(Arc<ModuleResolution>, RegionPointer),
    PlainDone,
    NamespaceItem(Url, String, Url),
    NamespaceDone,
}

enum NamespaceItem {
    Walk(Arc<ModuleResolution>, RegionPointer),
    Immediate(RegionId),
    Nested(NamespaceFrame),
}

pub struct RegionWalker<'r> {
    bundle: Url,
    own: Vec<BundleAssignment>,
    resolver: &'r mut DependencyResolver,
    graph: Arc<ModuleGraph>,
    kept_regions: FxHashMap<RegionId, Vec<RegionId>>,
    dependencies_of: FxHashMap<RegionId, IndexSet<RegionId>>,
    leaves: FxHashSet<RegionId>,
    resolved: FxHashMap<RegionId, Option<RegionId>>,
    seen: FxHashSet<RegionId>,
    namespaces_in_flight: FxHashSet<Url>,
    dep_order: Vec<Arc<ModuleResolution>>,
    exposed: Vec<ExposedRegionInfo>,
}

impl<'r> RegionWalker<'r> {
    pub fn new(
        bundle: Url,
        exposed: Vec<ExposedRegionInfo>,
        assignments: Arc<Vec<BundleAssignment>>,
        resolutions_in_dep_order: Vec<Arc<ModuleResolution>>,
        resolver: &'r mut DependencyResolver,
    ) -> Result<Self> {
        let graph = resolver.graph().clone();
        let own: Vec<BundleAssignment> = assignments
            .iter()
            .filter(|a| a.bundle_url == bundle)
            .cloned()
            .collect();
        let mut walker = RegionWalker {
            bundle,
            own,
            resolver,
            graph,
            kept_regions: FxHashMap::default(),
            dependencies_of: FxHashMap::default(),
            leaves: FxHashSet::default(),
            resolved: FxHashMap::default(),
            seen: FxHashSet::default(),
            namespaces_in_flight: FxHashSet::default(),
            dep_order: resolutions_in_dep_order,
            exposed,
        };

        let own_resolutions: Vec<Arc<ModuleResolution>> = walker
            .dep_order
            .iter()
            .filter(|m| walker.own.iter().any(|a| a.module == m.url))
            .cloned()
            .collect();

        let walk_start = Instant::now();
        for module in &own_resolutions {
            // module side effects first, then the exposed API
            walker.run_walk(module.clone(), DOCUMENT_POINTER)?;
            let exposed_pointers: Vec<RegionPointer> = walker
                .exposed
                .iter()
                .filter(|e| e.module == module.url)
                .map(|e| e.pointer)
                .collect();
            for pointer in exposed_pointers {
                walker.run_walk(module.clone(), pointer)?;
            }
        }
        info!(
            bundle = %walker.bundle,
            regions = walker.seen.len(),
            elapsed_ms = walk_start.elapsed().as_millis() as u64,
            "completed walking code regions"
        );
        Ok(walker)
    }

    fn module_in_bundle(&self, url: &Url) -> bool {
        self.own.iter().any(|a| &a.module == url)
    }

    /// Walk one region to completion on an explicit stack, returning the id
    /// it resolved to (if it survived).
    fn run_walk(
        &mut self,
        module: Arc<ModuleResolution>,
        pointer: RegionPointer,
    ) -> Result<Option<RegionId>> {
        let original = RegionId::region(&module.url, pointer);
        let mut stack: Vec<Frame> = Vec::new();
        let mut pending: Option<(Arc<ModuleResolution>, RegionPointer, RegionId)> =
            Some((module, pointer, original));
        let mut result: Option<Option<RegionId>> = None;

        loop {
            // run a redirect chain down to a result or a new frame
            while let Some((module, pointer, original)) = pending.take() {
                match self.classify(module, pointer, original.clone())? {
                    Classified::Done(r) => result = Some(r),
                    Classified::Redirect(next_module, next_pointer) => {
                        pending = Some((next_module, next_pointer, original));
                    }
                    Classified::Push(frame) => stack.push(frame),
                }
            }
            if stack.is_empty() {
                return Ok(result.unwrap_or(None));
            }
            if let Some(r) = result.take() {
                match stack.last_mut().expect("stack checked non-empty") {
                    Frame::Plain(frame) => frame.collected.extend(r),
                    Frame::Namespace(frame) => frame.items.extend(r),
                }
            }

            let advance = match stack.last_mut().expect("stack checked non-empty") {
                Frame::Plain(frame) => {
                    if frame.next_dep < frame.deps.len() {
                        let dep = frame.deps[frame.next_dep];
                        frame.next_dep += 1;
                        Advance::PlainDep(frame.module.clone(), dep)
                    } else {
                        Advance::PlainDone
                    }
                }
                Frame::Namespace(frame) => {
                    if frame.next_export < frame.exports.len() {
                        let (name, source) = frame.exports[frame.next_export].clone();
                        frame.next_export += 1;
                        Advance::NamespaceItem(frame.module.clone(), name, source)
                    } else {
                        Advance::NamespaceDone
                    }
                }
            };

            match advance {
                Advance::PlainDep(module, dep) => {
                    let dep_id = RegionId::region(&module.url, dep);
                    pending = Some((module, dep, dep_id));
                }
                Advance::PlainDone => {
                    let frame = match stack.pop() {
                        Some(Frame::Plain(frame)) => frame,
                        _ => unreachable!("top frame was plain"),
                    };
                    self.keep_region(frame.original, frame.resolved.clone(), frame.collected);
                    result = Some(Some(frame.resolved));
                }
                Advance::NamespaceItem(ns_module, name, source_module) => {
                    match self.namespace_item(&ns_module, &name, &source_module)? {
                        NamespaceItem::Walk(module, pointer) => {
                            let id = RegionId::region(&module.url, pointer);
                            pending = Some((module, pointer, id));
                        }
                        NamespaceItem::Immediate(id) => {
                            match stack.last_mut().expect("namespace frame still on stack") {
                                Frame::Namespace(frame) => frame.items.push(id),
                                Frame::Plain(_) => unreachable!("top frame was namespace"),
                            }
                        }
                        NamespaceItem::Nested(child) => stack.push(Frame::Namespace(child)),
                    }
                }
                Advance::NamespaceDone => {
                    let frame = match stack.pop() {
                        Some(Frame::Namespace(frame)) => frame,
                        _ => unreachable!("top frame was namespace"),
                    };
                    self.namespaces_in_flight.remove(&frame.module);
                    self.keep_region(frame.marker.clone(), frame.marker.clone(), frame.items);
                    let outcome = match frame.keep_import {
                        Some(import_id) => {
                            self.keep_region(
                                frame.original,
                                import_id.clone(),
                                vec![frame.marker],
                            );
                            import_id
                        }
                        None => frame.marker,
                    };
                    result = Some(Some(outcome));
                }
            }
        }
    }

    /// Decide what walking one region means: an immediate (memoized or
    /// terminal) result, a redirect to another region, or a new frame.
    fn classify(
        &mut self,
        module: Arc<ModuleResolution>,
        pointer: RegionPointer,
        original: RegionId,
    ) -> Result<Classified> {
        let id = RegionId::region(&module.url, pointer);
        if self.kept_regions.contains_key(&id) {
            return Ok(Classified::Done(Some(id)));
        }
        if self.seen.contains(&id) {
            // either fully resolved earlier, or still in flight (a cycle):
            // in-flight regions resolve to nothing and the edge is dropped
            return Ok(Classified::Done(self.resolved.get(&id).cloned().flatten()));
        }
        self.seen.insert(id.clone());
        if self.seen.len() % 10_000 == 0 {
            debug!(
                bundle = %self.bundle,
                visited = self.seen.len(),
                "walking code regions"
            );
        }

        let region = &module.desc.regions[pointer];

        // a side effect rolled up from a package: only the winning version
        // of that package contributes its side effects
        if let Some(provenance) = region.original.clone() {
            let pkg_url = self
                .resolver
                .catalog()
                .pkg_info(&provenance.bundle_href)
                .map(|i| i.pkg_url)
                .ok_or_else(|| {
                    IrError::bug(format!(
                        "cannot determine pkgURL that corresponds to the bundle URL {}",
                        provenance.bundle_href
                    ))
                })?;
            let resolution =
                self.resolver
                    .resolution_by_consumption_region(&module.url, pointer, &pkg_url)?;
            if resolution.is_none() {
                // another version of this pkg owns the side effects
                return Ok(Classified::Done(None));
            }
        }

        match region.kind.clone() {
            RegionKind::Declaration(Declaration::Import(import)) => {
                let imported_module = self
                    .graph
                    .import_target(&module, import.import_index)?
                    .url()
                    .clone();
                let own_refs: Vec<&BundleAssignment> = self.own.iter().collect();
                let source = self.resolver.resolve_declaration(
                    &import.imported_name,
                    &imported_module,
                    &module.url,
                    &own_refs,
                )?;
                match source.source {
                    DeclarationSource::Resolved {
                        module: target,
                        pointer,
                        ..
                    } => {
                        let target = self.graph.module(&target)?.clone();
                        Ok(Classified::Redirect(target, pointer))
                    }
                    DeclarationSource::Unresolved {
                        imported_as,
                        imported_from_module,
                        consuming_module,
                        imported_pointer,
                    } => {
                        if let Some(resolution) = &source.resolution {
                            if resolution.imported_source.is_none() {
                                // the resolution points at an already
                                // fashioned namespace object declaration
                                let target = self.graph.module(&resolution.consumed_by)?.clone();
                                return Ok(Classified::Redirect(
                                    target,
                                    resolution.consumed_by_pointer,
                                ));
                            }
                        }
                        let (consuming, kept_pointer) = match &source.resolution {
                            Some(resolution) => (
                                resolution.consumed_by.clone(),
                                Some(resolution.consumed_by_pointer),
                            ),
                            None => (consuming_module, imported_pointer),
                        };
                        let kept_pointer = kept_pointer.ok_or_else(|| {
                            IrError::bug(format!(
                                "could not determine code region pointer for import of '{}' \
                                 from {} in module {}",
                                imported_as, imported_from_module, consuming
                            ))
                        })?;
                        let kept_id = RegionId::region(&consuming, kept_pointer);
                        if self.module_in_bundle(&imported_from_module)
                            && imported_as.is_namespace()
                        {
                            // keep the namespace import as the signal to
                            // manufacture a namespace object; the marker
                            // carries the constituent items
                            let target = source
                                .resolution
                                .as_ref()
                                .and_then(|r| r.imported_source.as_ref())
                                .map(|s| s.declared_in.clone())
                                .unwrap_or(imported_from_module);
                            self.push_namespace(target, kept_id, original)
                        } else {
                            // cross-bundle import marker; the walk stops here
                            self.keep_region(original, kept_id.clone(), Vec::new());
                            Ok(Classified::Done(Some(kept_id)))
                        }
                    }
                }
            }

            RegionKind::Declaration(Declaration::Local(local)) if local.original.is_some() => {
                let provenance = local.original.clone().expect("guarded by match arm");
                let (is_obviated, resolved_module, resolved_pointer, resolution) =
                    self.resolve_pkg_dependency(&provenance.bundle_href, &module.url, pointer)?;
                if is_obviated {
                    let target = self.graph.module(&resolved_module)?.clone();
                    return Ok(Classified::Redirect(target, resolved_pointer));
                }
                if let Some(resolution) = &resolution {
                    if resolution.imported_as.is_namespace() {
                        if let Some(imported_source) = &resolution.imported_source {
                            // the winning resolution replaces this local
                            // namespace object; re-derive it from its source
                            let kept_id = RegionId::region(&resolved_module, resolved_pointer);
                            return self.push_namespace(
                                imported_source.declared_in.clone(),
                                kept_id,
                                original,
                            );
                        }
                    }
                }
                Ok(Classified::Push(Frame::Plain(PlainFrame {
                    resolved: RegionId::region(&resolved_module, resolved_pointer),
                    deps: local_deps(&module, pointer),
                    next_dep: 0,
                    collected: Vec::new(),
                    module,
                    original,
                })))
            }

            RegionKind::Import {
                import_index,
                is_dynamic: false,
                export_type: None,
            } => {
                // side-effect-only import
                let imported_module = self
                    .graph
                    .import_target(&module, import_index)?
                    .url()
                    .clone();
                if self.module_in_bundle(&imported_module) {
                    let target = self.graph.module(&imported_module)?.clone();
                    Ok(Classified::Redirect(target, DOCUMENT_POINTER))
                } else {
                    self.keep_region(original, id.clone(), Vec::new());
                    Ok(Classified::Done(Some(id)))
                }
            }

            _ => Ok(Classified::Push(Frame::Plain(PlainFrame {
                resolved: id,
                deps: local_deps(&module, pointer),
                next_dep: 0,
                collected: Vec::new(),
                module,
                original,
            }))),
        }
    }

    fn push_namespace(
        &mut self,
        target: Url,
        keep_import: RegionId,
        original: RegionId,
    ) -> Result<Classified> {
        let marker = RegionId::namespace(&target);
        if self.kept_regions.contains_key(&marker) || self.namespaces_in_flight.contains(&target) {
            // already materialized (or mid-visit in a cycle); link to it
            self.keep_region(original, keep_import.clone(), vec![marker]);
            return Ok(Classified::Done(Some(keep_import)));
        }
        self.namespaces_in_flight.insert(target.clone());
        let exports = crate::module_graph::get_exports(&target, &self.graph)?;
        Ok(Classified::Push(Frame::Namespace(NamespaceFrame {
            module: target.clone(),
            marker,
            exports: exports.into_iter().collect(),
            next_export: 0,
            items: Vec::new(),
            keep_import: Some(keep_import),
            original,
        })))
    }

    /// Resolve one export of a namespace target into a walk, an immediate
    /// item, or a nested namespace visit.
    fn namespace_item(
        &mut self,
        ns_module: &Url,
        name: &str,
        source_module: &Url,
    ) -> Result<NamespaceItem> {
        let own_refs: Vec<&BundleAssignment> = self.own.iter().collect();
        let source = self.resolver.resolve_declaration(
            &ImportedName::named(name),
            source_module,
            ns_module,
            &own_refs,
        )?;
        match source.source {
            DeclarationSource::Resolved {
                module, pointer, ..
            } => {
                let module = self.graph.module(&module)?.clone();
                Ok(NamespaceItem::Walk(module, pointer))
            }
            DeclarationSource::Unresolved {
                imported_as,
                imported_from_module,
                consuming_module,
                imported_pointer,
            } => {
                let pointer = imported_pointer.ok_or_else(|| {
                    IrError::bug(format!(
                        "could not determine code region pointer for import of '{}' from {} \
                         in module {}",
                        imported_as, imported_from_module, consuming_module
                    ))
                })?;
                let item_id = RegionId::region(&consuming_module, pointer);
                if imported_as.is_namespace() {
                    let marker = RegionId::namespace(&imported_from_module);
                    if self.kept_regions.contains_key(&marker)
                        || self.namespaces_in_flight.contains(&imported_from_module)
                    {
                        self.keep_region(item_id.clone(), item_id.clone(), vec![marker]);
                        return Ok(NamespaceItem::Immediate(item_id));
                    }
                    self.namespaces_in_flight
                        .insert(imported_from_module.clone());
                    let exports =
                        crate::module_graph::get_exports(&imported_from_module, &self.graph)?;
                    Ok(NamespaceItem::Nested(NamespaceFrame {
                        module: imported_from_module.clone(),
                        marker,
                        exports: exports.into_iter().collect(),
                        next_export: 0,
                        items: Vec::new(),
                        keep_import: Some(item_id.clone()),
                        original: item_id,
                    }))
                } else {
                    // an external-bundle item: keep its import region
                    self.keep_region(item_id.clone(), item_id.clone(), Vec::new());
                    Ok(NamespaceItem::Immediate(item_id))
                }
            }
        }
    }

    fn resolve_pkg_dependency(
        &mut self,
        pkg_bundle_href: &Url,
        consuming_module: &Url,
        pointer: RegionPointer,
    ) -> Result<(bool, Url, RegionPointer, Option<ResolvedDependency>)> {
        let pkg_url = match self.resolver.catalog().pkg_info(pkg_bundle_href) {
            Some(info) => info.pkg_url,
            // not all modules are packages
            None => return Ok((false, consuming_module.clone(), pointer, None)),
        };
        let resolution = match self.resolver.resolution_by_consumption_region(
            consuming_module,
            pointer,
            &pkg_url,
        )? {
            Some(resolution) => resolution,
            // not all modules have dep resolutions
            None => return Ok((false, consuming_module.clone(), pointer, None)),
        };
        if &resolution.consumed_by == consuming_module
            && resolution.consumed_by_pointer == pointer
        {
            return Ok((false, consuming_module.clone(), pointer, Some(resolution)));
        }
        // this region is obviated by a different region
        let (module, resolved_pointer) = match &resolution.imported_source {
            Some(imported_source) => {
                (imported_source.declared_in.clone(), imported_source.pointer)
            }
            None => (
                resolution.consumed_by.clone(),
                resolution.consumed_by_pointer,
            ),
        };
        Ok((true, module, resolved_pointer, Some(resolution)))
    }

    fn keep_region(&mut self, original: RegionId, resolved: RegionId, deps: Vec<RegionId>) {
        // document regions are inherently retained
        if resolved.region_pointer() == Some(DOCUMENT_POINTER) {
            return;
        }
        self.resolved.insert(original, Some(resolved.clone()));
        if deps.is_empty() {
            self.leaves.insert(resolved.clone());
        } else {
            self.leaves.remove(&resolved);
        }
        for dep in &deps {
            self.dependencies_of
                .entry(dep.clone())
                .or_default()
                .insert(resolved.clone());
        }
        self.kept_regions.insert(resolved, deps);
    }

    /// Assign every surviving region to per-module editors, dependency
    /// order first.
    pub fn into_editors(self) -> Result<Vec<RegionEditor>> {
        let assigner = EditorAssigner::new(
            self.dependencies_of,
            self.leaves,
            &self.exposed,
            self.dep_order,
            &self.graph,
        )?;
        Ok(assigner.editors)
    }
}

fn local_deps(module: &ModuleResolution, pointer: RegionPointer) -> Vec<RegionPointer> {
    module.desc.regions[pointer]
        .depends_on
        .iter()
        .filter_map(|r| match r {
            RegionRef::Local(p) => Some(*p),
            // stale link into a previous build's arena; nothing to walk
            RegionRef::OriginalModule(_) => None,
        })
        .collect()
}

#[derive(Debug, Clone)]
struct EditorAssignment {
    module: Url,
    editors: IndexSet<RegionId>,
}

struct EditorAssigner {
    editors: Vec<RegionEditor>,
}

impl EditorAssigner {
    fn new(
        dependencies_of: FxHashMap<RegionId, IndexSet<RegionId>>,
        leaves: FxHashSet<RegionId>,
        exposed: &[ExposedRegionInfo],
        dep_order: Vec<Arc<ModuleResolution>>,
        graph: &ModuleGraph,
    ) -> Result<Self> {
        let exposed_ids: FxHashSet<RegionId> = exposed
            .iter()
            .map(|e| RegionId::region(&e.module, e.pointer))
            .collect();

        // leaves in reverse module-dependency order decide assignment
        let mut leaves_in_dep_order: Vec<RegionId> = Vec::new();
        for module in &dep_order {
            leaves_in_dep_order.extend(
                leaves
                    .iter()
                    .filter(|leaf| leaf.module == module.url)
                    .cloned()
                    .collect::<Vec<_>>(),
            );
        }
        leaves_in_dep_order.reverse();

        let assign_start = Instant::now();
        let mut assignments: IndexMap<RegionId, EditorAssignment> = IndexMap::new();
        for leaf in leaves_in_dep_order {
            Self::assign(leaf, &dependencies_of, &exposed_ids, graph, &mut assignments)?;
        }
        debug!(
            elapsed_ms = assign_start.elapsed().as_millis() as u64,
            "completed editor assignment"
        );

        // materialize editors in assignment order (consumers first)
        let mut editor_map: IndexMap<RegionId, RegionEditor> = IndexMap::new();
        for (region_id, assignment) in &assignments {
            let pointer = match region_id.region_pointer() {
                Some(pointer) => pointer,
                // the namespace marker is only a grouping mechanism
                None => continue,
            };
            for editor_id in &assignment.editors {
                if !editor_map.contains_key(editor_id) {
                    let module = graph.module(&region_id.module)?.clone();
                    editor_map.insert(editor_id.clone(), RegionEditor::new(module));
                }
                editor_map
                    .get_mut(editor_id)
                    .expect("just inserted")
                    .keep_region(pointer);
            }
        }

        Self::prune_editors(&mut editor_map);

        let mut editors: Vec<RegionEditor> = editor_map.into_values().collect();
        // assignment order is consumers-first; serialize dependencies first
        editors.reverse();
        Ok(EditorAssigner { editors })
    }

    /// Iterative post-order assignment: a region inherits its consumers'
    /// editors when they all live in its own module (declarations that own
    /// declarators merge into all consumers instead of splitting), and gets
    /// its own editor otherwise.
    fn assign(
        root: RegionId,
        dependencies_of: &FxHashMap<RegionId, IndexSet<RegionId>>,
        exposed_ids: &FxHashSet<RegionId>,
        graph: &ModuleGraph,
        assignments: &mut IndexMap<RegionId, EditorAssignment>,
    ) -> Result<()> {
        let mut stack: Vec<RegionId> = vec![root];
        while let Some(id) = stack.last().cloned() {
            if assignments.contains_key(&id) {
                stack.pop();
                continue;
            }
            let consumers: Vec<RegionId> = dependencies_of
                .get(&id)
                .map(|c| c.iter().cloned().collect())
                .unwrap_or_default();
            let unassigned: Vec<RegionId> = consumers
                .iter()
                .filter(|c| !assignments.contains_key(*c))
                .cloned()
                .collect();
            if !unassigned.is_empty() {
                stack.extend(unassigned);
                continue;
            }
            stack.pop();

            if exposed_ids.contains(&id) {
                // editors are named after the initial region they enclose
                let mut editors = IndexSet::new();
                editors.insert(id.clone());
                assignments.insert(
                    id.clone(),
                    EditorAssignment {
                        module: id.module.clone(),
                        editors,
                    },
                );
                continue;
            }

            let has_declarators = match id.region_pointer() {
                Some(pointer) => {
                    let module = graph.module(&id.module)?;
                    module.desc.regions.iter().any(|r| {
                        matches!(
                            r.declaration(),
                            Some(Declaration::Local(local))
                                if local.declarator_of == Some(pointer)
                        )
                    })
                }
                None => false,
            };

            let same_module =
                !consumers.is_empty() && consumers.iter().all(|c| c.module == id.module);
            if same_module {
                let namespace_id = RegionId::namespace(&id.module);
                let namespace_consumer = consumers.iter().find(|c| {
                    assignments
                        .get(*c)
                        .map(|a| a.editors.contains(&namespace_id))
                        .unwrap_or(false)
                });
                let ordered: Vec<&RegionId> = namespace_consumer
                    .into_iter()
                    .chain(consumers.iter().filter(|c| Some(*c) != namespace_consumer))
                    .collect();
                if !has_declarators {
                    // merge into the favored consumer's editors
                    let editors = assignments[ordered[0]].editors.clone();
                    assignments.insert(
                        id.clone(),
                        EditorAssignment {
                            module: id.module.clone(),
                            editors,
                        },
                    );
                    continue;
                }
                // a declarator cannot be separated from its declaration:
                // merge into all consumers' editors
                let mut editors = IndexSet::new();
                for consumer in ordered {
                    editors.extend(assignments[consumer].editors.iter().cloned());
                }
                assignments.insert(
                    id.clone(),
                    EditorAssignment {
                        module: id.module.clone(),
                        editors,
                    },
                );
                continue;
            }

            let mut editors = IndexSet::new();
            editors.insert(id.clone());
            assignments.insert(
                id.clone(),
                EditorAssignment {
                    module: id.module.clone(),
                    editors,
                },
            );
        }
        Ok(())
    }

    fn prune_editors(editor_map: &mut IndexMap<RegionId, RegionEditor>) {
        use crate::regions::editor::Disposition;
        // remove declaration statements whose declarators were all shaken out
        for editor in editor_map.values_mut() {
            let module = editor.module().clone();
            let mut declarations: FxHashMap<RegionPointer, Vec<RegionPointer>> =
                FxHashMap::default();
            for (pointer, region) in module.desc.regions.iter().enumerate() {
                if let Some(Declaration::Local(local)) = region.declaration() {
                    if let Some(declaration) = local.declarator_of {
                        if !matches!(editor.disposition(declaration), Disposition::Removed) {
                            let declarators = declarations.entry(declaration).or_default();
                            if !matches!(editor.disposition(pointer), Disposition::Removed) {
                                declarators.push(pointer);
                            }
                        }
                    }
                }
            }
            for (declaration, declarators) in declarations {
                if declarators.is_empty() {
                    editor.remove_region(declaration);
                }
            }
        }

        // no-op editors retain only document regions
        editor_map.retain(|_, editor| !editor.is_noop());

        // collapse runs of adjacent editors over the same module
        let ids: Vec<RegionId> = editor_map.keys().cloned().collect();
        let mut runs: Vec<Vec<RegionId>> = Vec::new();
        for id in ids {
            match runs.last_mut() {
                Some(run) if run[0].module == id.module => run.push(id),
                _ => runs.push(vec![id]),
            }
        }
        for run in runs {
            if run.len() < 2 {
                continue;
            }
            let merged: Vec<RegionEditor> = run[1..]
                .iter()
                .filter_map(|id| editor_map.shift_remove(id))
                .collect();
            if let Some(first) = editor_map.get_mut(&run[0]) {
                first.merge_with(merged);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_graph::ImportTarget;
    use crate::regions::editor::Disposition;
    use crate::resolution::{CatalogUrlIndex, Dependencies, DependencyResolver};
    use crate::testing::ModuleBuilder;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn assignment(module: &Url, bundle: &Url, exposed: &[(&str, &str)]) -> BundleAssignment {
        BundleAssignment {
            bundle_url: bundle.clone(),
            module: module.clone(),
            entrypoint_module_url: module.clone(),
            exposed_names: exposed
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }

    fn resolver(
        graph: Arc<ModuleGraph>,
        assignments: Arc<Vec<BundleAssignment>>,
        bundle: &Url,
    ) -> DependencyResolver {
        DependencyResolver::new(
            &Dependencies::new(),
            None,
            assignments,
            bundle.clone(),
            graph,
            Arc::new(CatalogUrlIndex),
        )
        .unwrap()
    }

    #[test]
    fn test_tree_shaking_drops_unreferenced_declaration() {
        let mut graph = ModuleGraph::new();
        let a = url("https://local/a.js");
        let bundle = url("https://local/out.js");
        let (source, desc) = ModuleBuilder::new()
            .const_decl("kept", "1", &[], true)
            .const_decl("dropped", "2", &[], false)
            .build();
        let module = graph.insert(crate::module_graph::ModuleResolution {
            url: a.clone(),
            source,
            desc,
            resolved_imports: vec![],
        });
        let graph = Arc::new(graph);
        let assignments = Arc::new(vec![assignment(&a, &bundle, &[("kept", "kept")])]);
        let mut resolver = resolver(graph.clone(), assignments.clone(), &bundle);

        let exposed = exposed_regions(&bundle, &assignments, &mut resolver).unwrap();
        let walker = RegionWalker::new(
            bundle.clone(),
            exposed,
            assignments,
            vec![module.clone()],
            &mut resolver,
        )
        .unwrap();
        let editors = walker.into_editors().unwrap();
        assert_eq!(editors.len(), 1);
        let editor = &editors[0];
        let (_, kept_pointer) = module.desc.declaration("kept").unwrap();
        let (_, dropped_pointer) = module.desc.declaration("dropped").unwrap();
        assert!(!matches!(
            editor.disposition(kept_pointer),
            Disposition::Removed
        ));
        assert!(matches!(
            editor.disposition(dropped_pointer),
            Disposition::Removed
        ));
    }

    #[test]
    fn test_walk_crosses_modules_dependency_first() {
        let mut graph = ModuleGraph::new();
        let a = url("https://local/a.js");
        let b = url("https://local/b.js");
        let bundle = url("https://local/out.js");

        let (source_a, desc_a) = ModuleBuilder::new().const_decl("x", "1", &[], true).build();
        let module_a = graph.insert(crate::module_graph::ModuleResolution {
            url: a.clone(),
            source: source_a,
            desc: desc_a,
            resolved_imports: vec![],
        });
        let (source_b, desc_b) = ModuleBuilder::new()
            .import("./a.js", &[("x", "x")])
            .const_decl("y", "x + 1", &["x"], true)
            .build();
        let module_b = graph.insert(crate::module_graph::ModuleResolution {
            url: b.clone(),
            source: source_b,
            desc: desc_b,
            resolved_imports: vec![ImportTarget::Resolved(a.clone())],
        });

        let graph = Arc::new(graph);
        let assignments = Arc::new(vec![
            assignment(&a, &bundle, &[]),
            assignment(&b, &bundle, &[("y", "y")]),
        ]);
        let mut resolver = resolver(graph.clone(), assignments.clone(), &bundle);
        let exposed = exposed_regions(&bundle, &assignments, &mut resolver).unwrap();
        let walker = RegionWalker::new(
            bundle.clone(),
            exposed,
            assignments,
            vec![module_a.clone(), module_b.clone()],
            &mut resolver,
        )
        .unwrap();
        let editors = walker.into_editors().unwrap();
        let order: Vec<&str> = editors.iter().map(|e| e.module().url.as_str()).collect();
        assert_eq!(order, vec![a.as_str(), b.as_str()]);
        // x's declaration survives in a's editor
        let (_, x_pointer) = module_a.desc.declaration("x").unwrap();
        assert!(!matches!(
            editors[0].disposition(x_pointer),
            Disposition::Removed
        ));
    }

    #[test]
    fn test_cross_bundle_import_kept_as_marker() {
        let mut graph = ModuleGraph::new();
        let a = url("https://local/a.js");
        let b = url("https://local/b.js");
        let bundle_a = url("https://local/out-a.js");
        let bundle_b = url("https://local/out-b.js");

        let (source_a, desc_a) = ModuleBuilder::new().const_decl("x", "1", &[], true).build();
        graph.insert(crate::module_graph::ModuleResolution {
            url: a.clone(),
            source: source_a,
            desc: desc_a,
            resolved_imports: vec![],
        });
        let (source_b, desc_b) = ModuleBuilder::new()
            .import("./a.js", &[("x", "x")])
            .const_decl("y", "x + 1", &["x"], true)
            .build();
        let module_b = graph.insert(crate::module_graph::ModuleResolution {
            url: b.clone(),
            source: source_b,
            desc: desc_b,
            resolved_imports: vec![ImportTarget::Resolved(a.clone())],
        });

        let graph = Arc::new(graph);
        let assignments = Arc::new(vec![
            assignment(&a, &bundle_a, &[("x", "x")]),
            assignment(&b, &bundle_b, &[("y", "y")]),
        ]);
        let mut resolver = resolver(graph.clone(), assignments.clone(), &bundle_b);
        let exposed = exposed_regions(&bundle_b, &assignments, &mut resolver).unwrap();
        let walker = RegionWalker::new(
            bundle_b.clone(),
            exposed,
            assignments,
            vec![module_b.clone()],
            &mut resolver,
        )
        .unwrap();
        let editors = walker.into_editors().unwrap();
        assert_eq!(editors.len(), 1);
        // the import declaration for x survives as a cross-bundle signal
        let (_, import_pointer) = module_b.desc.declaration("x").unwrap();
        assert!(!matches!(
            editors[0].disposition(import_pointer),
            Disposition::Removed
        ));
    }

    #[test]
    fn test_namespace_import_builds_marker_items() {
        let mut graph = ModuleGraph::new();
        let a = url("https://local/a.js");
        let b = url("https://local/b.js");
        let bundle = url("https://local/out.js");

        let (source_a, desc_a) = ModuleBuilder::new()
            .const_decl("one", "1", &[], true)
            .const_decl("two", "2", &[], true)
            .build();
        let module_a = graph.insert(crate::module_graph::ModuleResolution {
            url: a.clone(),
            source: source_a,
            desc: desc_a,
            resolved_imports: vec![],
        });
        let (source_b, desc_b) = ModuleBuilder::new()
            .import_namespace("./a.js", "ns")
            .const_decl("y", "ns.one", &["ns"], true)
            .build();
        let module_b = graph.insert(crate::module_graph::ModuleResolution {
            url: b.clone(),
            source: source_b,
            desc: desc_b,
            resolved_imports: vec![ImportTarget::Resolved(a.clone())],
        });

        let graph = Arc::new(graph);
        let assignments = Arc::new(vec![
            assignment(&a, &bundle, &[]),
            assignment(&b, &bundle, &[("y", "y")]),
        ]);
        let mut resolver = resolver(graph.clone(), assignments.clone(), &bundle);
        let exposed = exposed_regions(&bundle, &assignments, &mut resolver).unwrap();
        let walker = RegionWalker::new(
            bundle.clone(),
            exposed,
            assignments,
            vec![module_a.clone(), module_b.clone()],
            &mut resolver,
        )
        .unwrap();

        // both exports of a survive as namespace items
        let (_, one_pointer) = module_a.desc.declaration("one").unwrap();
        let (_, two_pointer) = module_a.desc.declaration("two").unwrap();
        assert!(walker
            .kept_regions
            .contains_key(&RegionId::region(&a, one_pointer)));
        assert!(walker
            .kept_regions
            .contains_key(&RegionId::region(&a, two_pointer)));
        assert!(walker.kept_regions.contains_key(&RegionId::namespace(&a)));
        // the namespace import region is the signal for the rewriter
        let (_, ns_pointer) = module_b.desc.declaration("ns").unwrap();
        assert!(walker
            .kept_regions
            .contains_key(&RegionId::region(&b, ns_pointer)));
    }
}
