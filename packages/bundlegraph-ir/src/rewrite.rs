//! Scope merging and bundle serialization
//!
//! Editors arrive from the walker in dependency-first order. Renaming walks
//! them in the opposite direction, closest to the entrypoint first, so that
//! the names a consumer chose win collisions and synthesized suffixes land
//! on bindings furthest from the entrypoint. Serialization then walks the
//! rewriters dependency-first again, emitting import statements for anything
//! crossing a bundle boundary, namespace object declarations, every module's
//! surviving regions, and the bundle's own export statement — plus a
//! re-derived `ModuleDescription` so the output can feed a downstream
//! bundle.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHashMap;
use tracing::debug;
use url::Url;

use crate::errors::{IrError, Result};
use crate::module_graph::{
    assignment_for_module, BundleAssignment, DeclarationSource, ModuleGraph, ModuleResolution,
};
use crate::regions::describe::{
    names_from_regions, ExportDescription, ExportKey, ImportDescription, ModuleDescription,
    NameDescription,
};
use crate::regions::editor::{RegionEditor, SerializedModule};
use crate::regions::region::{
    assign_region_positions, CodeRegion, Declaration, ImportDeclaration, ImportedName,
    LocalDeclaration, RegionKind, RegionPointer, RegionProvenance, RegionRef, DOCUMENT_POINTER,
};
use crate::resolution::Dependencies;

/// A finished bundle: its source text and the description downstream builds
/// consume.
#[derive(Debug)]
pub struct BundleSource {
    pub code: String,
    pub desc: ModuleDescription,
}

/// Emit `target` relative to `base` when they share an origin.
pub fn maybe_relative_url(target: &Url, base: &Url) -> String {
    if target.origin() != base.origin() {
        return target.to_string();
    }
    let target_segments: Vec<&str> = target.path_segments().map(|s| s.collect()).unwrap_or_default();
    let base_segments: Vec<&str> = base.path_segments().map(|s| s.collect()).unwrap_or_default();
    if target_segments.is_empty() {
        return target.to_string();
    }
    // directory part of base (drop the file segment)
    let base_dir = &base_segments[..base_segments.len().saturating_sub(1)];
    let mut common = 0;
    while common < base_dir.len()
        && common < target_segments.len() - 1
        && base_dir[common] == target_segments[common]
    {
        common += 1;
    }
    let ups = base_dir.len() - common;
    let mut out = String::new();
    if ups == 0 {
        out.push_str("./");
    } else {
        for _ in 0..ups {
            out.push_str("../");
        }
    }
    out.push_str(&target_segments[common..].join("/"));
    out
}

/// Shared renaming state for one bundle build.
pub struct HeadState {
    /// editors in dependency-first order; consumed from the back so the
    /// entrypoint-closest module is rewritten first
    remaining: Vec<RegionEditor>,
    total: usize,
    /// every name claimed in the bundle scope
    pub used_names: IndexSet<String>,
    /// module -> original binding name -> assigned bundle name
    pub name_assignments: FxHashMap<Url, FxHashMap<String, String>>,
    /// module -> imported/exported name -> assigned bundle name
    pub assigned_imported_names: FxHashMap<Url, IndexMap<ImportedName, String>>,
    /// assigned namespace binding -> (outside name -> inside assigned name);
    /// entries are removed once their declaration is written out
    pub assigned_namespaces: IndexMap<String, IndexMap<String, String>>,
}

impl HeadState {
    pub fn new(editors: Vec<RegionEditor>) -> Self {
        let total = editors.len();
        HeadState {
            remaining: editors,
            total,
            used_names: IndexSet::new(),
            name_assignments: FxHashMap::default(),
            assigned_imported_names: FxHashMap::default(),
            assigned_namespaces: IndexMap::new(),
        }
    }

    /// The next editor to rewrite, entrypoint-closest first.
    pub fn next(&mut self) -> Option<RegionEditor> {
        self.remaining.pop()
    }

    /// (rewritten so far, total) — stable across `next()` calls, usable in
    /// cache keys.
    pub fn progress(&self) -> (usize, usize) {
        (self.total - self.remaining.len(), self.total)
    }

    fn assigned_import_name(&self, module: &Url, name: &ImportedName) -> Option<&str> {
        self.assigned_imported_names
            .get(module)?
            .get(name)
            .map(|s| s.as_str())
    }

    fn assign_import_name(&mut self, module: &Url, name: ImportedName, assigned: String) {
        self.assigned_imported_names
            .entry(module.clone())
            .or_default()
            .insert(name, assigned);
    }
}

/// Follow re-export chains to the module that actually declares `name`.
fn resolve_reexport(
    name: &ImportedName,
    module: &Url,
    graph: &ModuleGraph,
) -> Result<(ImportedName, Url)> {
    let mut name = name.clone();
    let mut current = module.clone();
    loop {
        let named = match &name {
            ImportedName::Namespace => return Ok((name, current)),
            ImportedName::Named(n) => n.clone(),
        };
        let resolution = graph.module(&current)?;
        match resolution.desc.exports.get(&ExportKey::named(named)) {
            Some(ExportDescription::Reexport {
                import_index,
                name: remote,
                ..
            }) => {
                let target = graph
                    .import_target(resolution, *import_index)?
                    .url()
                    .clone();
                name = remote.clone();
                current = target;
            }
            Some(ExportDescription::Local { name: local, .. }) => {
                match resolution.desc.names.get(local) {
                    Some(NameDescription::Import {
                        import_index,
                        imported_name,
                        ..
                    }) => {
                        let target = graph
                            .import_target(resolution, *import_index)?
                            .url()
                            .clone();
                        name = imported_name.clone();
                        current = target;
                    }
                    _ => return Ok((name, current)),
                }
            }
            _ => return Ok((name, current)),
        }
    }
}

/// Rewrites one module's scope into the shared bundle scope.
pub struct ModuleRewriter {
    pub module: Arc<ModuleResolution>,
    pub editor: RegionEditor,
    /// assigned names of namespace objects this module needs materialized
    pub namespaces: Vec<String>,
}

impl ModuleRewriter {
    pub fn new(
        bundle: &Url,
        mut editor: RegionEditor,
        state: &mut HeadState,
        assignments: &[BundleAssignment],
        graph: &Arc<ModuleGraph>,
    ) -> Result<Self> {
        let module = editor.module().clone();
        let mut namespaces = Vec::new();
        let own: Vec<&BundleAssignment> = assignments
            .iter()
            .filter(|a| &a.bundle_url == bundle)
            .collect();
        let mut default_name: Option<String> = None;

        for (name, name_desc) in &module.desc.names {
            match name_desc {
                NameDescription::Import {
                    import_index,
                    imported_name,
                    pointer,
                } => {
                    let target = graph.import_target(&module, *import_index)?.url().clone();
                    let (remote_name, remote_module) =
                        resolve_reexport(imported_name, &target, graph)?;
                    let in_bundle = own.iter().any(|a| a.module == remote_module);
                    let assigned = if remote_name.is_namespace() && in_bundle {
                        let assigned = maybe_assign_import_name(
                            state,
                            &module,
                            &remote_module,
                            ImportedName::Namespace,
                            name,
                        );
                        if !state.assigned_namespaces.contains_key(&assigned) {
                            let members =
                                namespace_members(state, &module, &remote_module, graph)?;
                            state
                                .assigned_namespaces
                                .insert(assigned.clone(), members);
                        }
                        namespaces.push(assigned.clone());
                        // the import statement served as the walker's signal;
                        // the namespace object replaces it
                        let statement = editor.statement_of(*pointer);
                        editor.remove_region_and_children(statement);
                        assigned
                    } else {
                        maybe_assign_import_name(
                            state,
                            &module,
                            &remote_module,
                            remote_name,
                            name,
                        )
                    };
                    claim_and_rename(state, &mut editor, &module, name, &assigned)?;
                }
                NameDescription::Local { pointer } => {
                    let declaration = module.desc.regions[*pointer].declaration();
                    let original = match declaration {
                        Some(Declaration::Local(local)) => local.original.clone(),
                        _ => None,
                    };
                    if let Some(original) = &original {
                        if let Some(assigned) = state
                            .assigned_import_name(&original.module_href, &original.imported_as)
                            .map(|s| s.to_string())
                        {
                            // a duplicate of a binding another module already
                            // carried into the bundle; remaining references
                            // redirect to the first copy's assigned name
                            editor.remove_declaration(name)?;
                            editor.rename(name, &assigned)?;
                            state
                                .name_assignments
                                .entry(module.url.clone())
                                .or_default()
                                .insert(name.clone(), assigned);
                            continue;
                        }
                    }
                    let assigned = if name == "default" {
                        let assigned = state
                            .assigned_import_name(&module.url, &ImportedName::named("default"))
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| unused_name_like(state, &module, "_default"));
                        state.assign_import_name(
                            &module.url,
                            ImportedName::named("default"),
                            assigned.clone(),
                        );
                        default_name = Some(assigned.clone());
                        assigned
                    } else if let Some((ExportKey::Named(exported), _)) =
                        module.desc.export_of_local(name)
                    {
                        let exported = exported.clone();
                        maybe_assign_import_name(
                            state,
                            &module,
                            &module.url.clone(),
                            ImportedName::Named(exported),
                            name,
                        )
                    } else {
                        unused_name_like(state, &module, name)
                    };
                    if let Some(original) = original {
                        // first copy wins; later duplicates collapse onto it
                        state.assign_import_name(
                            &original.module_href,
                            original.imported_as,
                            assigned.clone(),
                        );
                    }
                    claim_and_rename(state, &mut editor, &module, name, &assigned)?;
                }
            }
        }

        // dynamic imports address the resolved bundle, not the source module
        for (index, import) in module.desc.imports.iter().enumerate() {
            if !import.is_dynamic {
                continue;
            }
            let dep = graph.import_target(&module, index)?.url().clone();
            let dep_assignment = assignment_for_module(assignments, &dep).ok_or_else(|| {
                IrError::bug(format!(
                    "could not find assignment for module {} which is imported by {}",
                    dep, module.url
                ))
            })?;
            let my_assignment =
                assignment_for_module(assignments, &module.url).ok_or_else(|| {
                    IrError::bug(format!("could not find module assignment {}", module.url))
                })?;
            if let Some(specifier_region) = import.specifier_region {
                editor.replace(
                    specifier_region,
                    format!(
                        "\"{}\"",
                        maybe_relative_url(&dep_assignment.bundle_url, &my_assignment.bundle_url)
                    ),
                );
            }
        }

        let fallback = default_name
            .unwrap_or_else(|| unused_name_like(state, &module, "_default"));
        editor.remove_imports_and_exports(&fallback)?;

        Ok(ModuleRewriter {
            module,
            editor,
            namespaces,
        })
    }

    pub fn serialize(&self) -> Result<SerializedModule> {
        self.editor.serialize()
    }
}

/// Assigned names for every member of a namespace object over
/// `remote_module`'s exports.
fn namespace_members(
    state: &mut HeadState,
    consuming: &Arc<ModuleResolution>,
    remote_module: &Url,
    graph: &Arc<ModuleGraph>,
) -> Result<IndexMap<String, String>> {
    let mut members = IndexMap::new();
    for (export_name, source_module) in crate::module_graph::get_exports(remote_module, graph)? {
        let (final_name, declaring) =
            resolve_reexport(&ImportedName::named(export_name.clone()), &source_module, graph)?;
        if final_name.is_namespace() {
            // `export * as ns` members surface under their exported name
            members.insert(export_name.clone(), export_name.clone());
            continue;
        }
        let assigned =
            maybe_assign_import_name(state, consuming, &declaring, final_name, &export_name);
        members.insert(export_name, assigned);
    }
    Ok(members)
}

fn maybe_assign_import_name(
    state: &mut HeadState,
    consuming: &Arc<ModuleResolution>,
    remote_module: &Url,
    remote_name: ImportedName,
    suggested: &str,
) -> String {
    if let Some(existing) = state.assigned_import_name(remote_module, &remote_name) {
        return existing.to_string();
    }
    let assigned = unused_name_like(state, consuming, suggested);
    state.assign_import_name(remote_module, remote_name, assigned.clone());
    assigned
}

/// Find a bundle-unique name: append an incrementing numeric suffix until
/// the candidate collides with neither the module's own declared names nor
/// any name already claimed across the bundle.
fn unused_name_like(state: &HeadState, module: &Arc<ModuleResolution>, name: &str) -> String {
    let mut candidate = name.to_string();
    let mut counter = 0usize;
    while (candidate != name && module.desc.names.contains_key(&candidate))
        || state.used_names.contains(&candidate)
    {
        candidate = format!("{}{}", name, counter);
        counter += 1;
    }
    candidate
}

fn claim_and_rename(
    state: &mut HeadState,
    editor: &mut RegionEditor,
    module: &Arc<ModuleResolution>,
    original_name: &str,
    assigned: &str,
) -> Result<()> {
    state.used_names.insert(assigned.to_string());
    state
        .name_assignments
        .entry(module.url.clone())
        .or_default()
        .insert(original_name.to_string(), assigned.to_string());
    if original_name != assigned {
        editor.rename(original_name, assigned)?;
    }
    Ok(())
}

/// Run the full rewrite pipeline over the walker's editors and serialize
/// the bundle.
pub fn combine_modules(
    bundle: &Url,
    editors: Vec<RegionEditor>,
    assignments: &Arc<Vec<BundleAssignment>>,
    dependencies: &Dependencies,
    graph: &Arc<ModuleGraph>,
) -> Result<BundleSource> {
    let mut state = HeadState::new(editors);
    let mut rewriters: Vec<ModuleRewriter> = Vec::new();
    while let Some(editor) = state.next() {
        let rewriter =
            ModuleRewriter::new(bundle, editor, &mut state, assignments.as_slice(), graph)?;
        // rewritten entrypoint-first; serialized dependency-first
        rewriters.insert(0, rewriter);
    }
    finish_bundle(bundle, state, rewriters, assignments, dependencies, graph)
}

/// Import surface of the bundle: target bundle href -> name mapping, or
/// `None` for a side-effect-only import.
type ImportAssignments = IndexMap<Url, Option<IndexMap<ImportedName, String>>>;

/// Serialize the rewritten modules into the final bundle text and its
/// description.
pub fn finish_bundle(
    bundle: &Url,
    mut state: HeadState,
    mut rewriters: Vec<ModuleRewriter>,
    assignments: &Arc<Vec<BundleAssignment>>,
    dependencies: &Dependencies,
    graph: &Arc<ModuleGraph>,
) -> Result<BundleSource> {
    let import_assignments =
        assigned_imports(bundle, &mut state, &mut rewriters, assignments, graph)?;
    let (exports, reexports) = assigned_exports(bundle, &state, assignments, graph)?;

    let mut builder = BundleBuilder::new();
    builder.build_imports(bundle, &import_assignments)?;
    builder.build_reexports(bundle, &reexports)?;
    builder.build_body(&mut state, &rewriters, assignments, dependencies, graph)?;
    builder.build_exports(bundle, &exports)?;

    if import_assignments.is_empty() && exports.is_empty() && reexports.is_empty() {
        // signal that the output is still an ES module
        builder.push_statement_text("export {};", RegionKind::General, &[]);
    }

    let mut regions = builder.regions;
    for (name, entry) in &builder.declarations {
        if let Some(declaration) = regions[entry.pointer].declaration_mut() {
            *declaration.references_mut() = entry.references.clone();
        } else {
            return Err(IrError::bug(format!(
                "bundle declaration '{}' does not point at a declaration region",
                name
            )));
        }
    }
    assign_region_positions(&mut regions);

    let names = names_from_regions(&regions);
    let mut desc_exports: IndexMap<ExportKey, ExportDescription> = IndexMap::new();
    for (outside, (inside, specifier_region)) in &builder.export_regions {
        desc_exports.insert(
            ExportKey::named(outside.clone()),
            ExportDescription::Local {
                name: inside.clone(),
                export_region: *specifier_region,
            },
        );
    }
    for (bundle_href, mapping) in &reexports {
        // build_reexports registered every re-exported bundle already
        let import_index = *builder.import_indices.get(bundle_href).ok_or_else(|| {
            IrError::bug(format!("re-exported bundle {} has no import entry", bundle_href))
        })?;
        for (outside, inside) in mapping {
            desc_exports.insert(
                ExportKey::named(outside.clone()),
                ExportDescription::Reexport {
                    import_index,
                    name: ImportedName::named(inside.clone()),
                    export_region: builder.reexport_regions[bundle_href],
                },
            );
        }
    }

    debug!(bundle = %bundle, bytes = builder.code.len(), "combined bundle");
    Ok(BundleSource {
        code: builder.code,
        desc: ModuleDescription {
            regions,
            names,
            exports: desc_exports,
            imports: builder.imports,
        },
    })
}

/// Walk the editors' surviving import regions, removing the walker's
/// cross-bundle signals and recording what the bundle must import.
fn assigned_imports(
    bundle: &Url,
    state: &mut HeadState,
    rewriters: &mut [ModuleRewriter],
    assignments: &Arc<Vec<BundleAssignment>>,
    graph: &Arc<ModuleGraph>,
) -> Result<ImportAssignments> {
    let own: Vec<&BundleAssignment> = assignments
        .iter()
        .filter(|a| &a.bundle_url == bundle)
        .collect();
    let mut results: ImportAssignments = IndexMap::new();

    for rewriter in rewriters.iter_mut() {
        let module = rewriter.module.clone();
        let mut included: Vec<RegionPointer> = rewriter.editor.included_regions().collect();
        included.sort_by_key(|p| module.desc.regions[*p].position);
        for pointer in included {
            let region = &module.desc.regions[pointer];
            match &region.kind {
                RegionKind::Import {
                    import_index,
                    is_dynamic: false,
                    export_type: None,
                } => {
                    // side-effect-only import of another bundle
                    let imported = graph.import_target(&module, *import_index)?.url().clone();
                    let assignment =
                        assignment_for_module(assignments, &imported).ok_or_else(|| {
                            IrError::bug(format!("no bundle assignment for module {}", imported))
                        })?;
                    if !own.iter().any(|a| a.bundle_url == assignment.bundle_url) {
                        results
                            .entry(assignment.bundle_url.clone())
                            .or_insert(None);
                    }
                    rewriter.editor.remove_region_and_children(pointer);
                }
                RegionKind::Declaration(Declaration::Import(import)) => {
                    let target = graph.import_target(&module, import.import_index)?.url().clone();
                    let source = crate::module_graph::resolve_declaration(
                        &import.imported_name,
                        &target,
                        &module.url,
                        &own,
                        graph,
                    )?;
                    let (imported_as, imported_from) = match source {
                        DeclarationSource::Resolved { .. } => continue,
                        DeclarationSource::Unresolved {
                            imported_as,
                            imported_from_module,
                            ..
                        } => (imported_as, imported_from_module),
                    };
                    if own.iter().any(|a| a.module == imported_from) {
                        continue;
                    }
                    // the signal region gets refashioned as a bundle import
                    rewriter.editor.remove_region_and_children(pointer);
                    let assignment = match assignment_for_module(assignments, &imported_from) {
                        Some(assignment) => assignment,
                        // a local binding that was originally imported into a
                        // module this bundle already includes
                        None => continue,
                    };
                    let assigned = state
                        .assigned_import_name(&imported_from, &imported_as)
                        .map(|s| s.to_string())
                        .ok_or_else(|| {
                            IrError::bug(format!(
                                "could not find assigned name for import of '{}' from {} in \
                                 module {}",
                                imported_as, imported_from, module.url
                            ))
                        })?;
                    let entry = results
                        .entry(assignment.bundle_url.clone())
                        .or_insert_with(|| Some(IndexMap::new()));
                    let mapping = entry.get_or_insert_with(IndexMap::new);
                    match &imported_as {
                        ImportedName::Namespace => {
                            mapping.insert(ImportedName::Namespace, assigned);
                        }
                        ImportedName::Named(name) => {
                            let exposed =
                                assignment.exposed_names.get(name).cloned().ok_or_else(|| {
                                    IrError::bug(format!(
                                        "tried to import {} from {} from another bundle, but \
                                         it's not exposed",
                                        name, imported_from
                                    ))
                                })?;
                            mapping.insert(ImportedName::named(exposed), assigned);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(results)
}

/// outside name -> inside (assigned) name for the bundle's own exports, plus
/// re-exports grouped by source bundle.
#[allow(clippy::type_complexity)]
fn assigned_exports(
    bundle: &Url,
    state: &HeadState,
    assignments: &Arc<Vec<BundleAssignment>>,
    graph: &Arc<ModuleGraph>,
) -> Result<(IndexMap<String, String>, IndexMap<Url, IndexMap<String, String>>)> {
    let own: Vec<&BundleAssignment> = assignments
        .iter()
        .filter(|a| &a.bundle_url == bundle)
        .collect();
    let mut exports: IndexMap<String, String> = IndexMap::new();
    let mut reexports: IndexMap<Url, IndexMap<String, String>> = IndexMap::new();
    for assignment in &own {
        for (original, exposed) in &assignment.exposed_names {
            let source = crate::module_graph::resolve_declaration(
                &ImportedName::named(original.clone()),
                &assignment.module,
                &assignment.module,
                &own,
                graph,
            )?;
            match source {
                DeclarationSource::Resolved {
                    module,
                    declared_name,
                    ..
                } => {
                    let assigned = state
                        .name_assignments
                        .get(&module)
                        .and_then(|names| names.get(&declared_name))
                        .ok_or_else(|| {
                            IrError::bug(format!(
                                "could not find assigned name for declaration '{}' in {}",
                                declared_name, module
                            ))
                        })?;
                    exports.insert(exposed.clone(), assigned.clone());
                }
                DeclarationSource::Unresolved {
                    imported_as,
                    imported_from_module,
                    ..
                } => {
                    let named = match imported_as {
                        ImportedName::Namespace => {
                            return Err(IrError::Unimplemented(
                                "namespace reexport from an external bundle".to_string(),
                            ))
                        }
                        ImportedName::Named(named) => named,
                    };
                    let target = assignment_for_module(assignments, &imported_from_module)
                        .ok_or_else(|| {
                            IrError::bug(format!(
                                "no bundle assignment for module {}",
                                imported_from_module
                            ))
                        })?;
                    let remote_exposed =
                        target.exposed_names.get(&named).cloned().ok_or_else(|| {
                            IrError::bug(format!(
                                "tried to re-export {} from {} but it's not exposed",
                                named, imported_from_module
                            ))
                        })?;
                    reexports
                        .entry(target.bundle_url.clone())
                        .or_default()
                        .insert(exposed.clone(), remote_exposed);
                }
            }
        }
    }
    Ok((exports, reexports))
}

struct DeclarationEntry {
    pointer: RegionPointer,
    references: Vec<RegionPointer>,
}

/// Accumulates bundle text and its region array statement by statement.
struct BundleBuilder {
    code: String,
    regions: Vec<CodeRegion>,
    declarations: IndexMap<String, DeclarationEntry>,
    imports: Vec<ImportDescription>,
    import_indices: IndexMap<Url, usize>,
    last_statement: Option<RegionPointer>,
    /// outside name -> (inside name, export specifier region)
    export_regions: IndexMap<String, (String, RegionPointer)>,
    reexport_regions: IndexMap<Url, RegionPointer>,
}

impl BundleBuilder {
    fn new() -> Self {
        BundleBuilder {
            code: String::new(),
            regions: vec![CodeRegion {
                position: 0,
                start: 0,
                end: 0,
                first_child: None,
                next_sibling: None,
                depends_on: Vec::new(),
                kind: RegionKind::Document,
                original: None,
            }],
            declarations: IndexMap::new(),
            imports: Vec::new(),
            import_indices: IndexMap::new(),
            last_statement: None,
            export_regions: IndexMap::new(),
            reexport_regions: IndexMap::new(),
        }
    }

    fn ensure_import(&mut self, bundle_href: &Url) -> usize {
        if let Some(index) = self.import_indices.get(bundle_href) {
            return *index;
        }
        let index = self.imports.len();
        self.imports.push(ImportDescription {
            specifier: bundle_href.to_string(),
            is_dynamic: false,
            region: DOCUMENT_POINTER, // fixed up by the statement that emits it
            specifier_region: None,
        });
        self.import_indices.insert(bundle_href.clone(), index);
        index
    }

    /// Begin a document-level statement: writes the separating newline and
    /// returns (region pointer, start cushion length).
    fn begin_statement(&mut self) -> usize {
        if self.code.is_empty() {
            0
        } else {
            self.code.push('\n');
            1
        }
    }

    fn wire_statement(&mut self, pointer: RegionPointer) {
        match self.last_statement {
            Some(previous) => self.regions[previous].next_sibling = Some(pointer),
            None => self.regions[DOCUMENT_POINTER].first_child = Some(pointer),
        }
        self.last_statement = Some(pointer);
    }

    /// A leaf statement with literal text.
    fn push_statement_text(
        &mut self,
        text: &str,
        kind: RegionKind,
        depends_on: &[RegionRef],
    ) -> RegionPointer {
        let start = self.begin_statement();
        self.code.push_str(text);
        let pointer = self.regions.len();
        self.regions.push(CodeRegion {
            position: 0,
            start,
            end: text.len(),
            first_child: None,
            next_sibling: None,
            depends_on: depends_on.to_vec(),
            kind,
            original: None,
        });
        self.wire_statement(pointer);
        pointer
    }

    fn build_imports(
        &mut self,
        bundle: &Url,
        import_assignments: &ImportAssignments,
    ) -> Result<()> {
        for (bundle_href, mapping) in import_assignments {
            let import_index = self.ensure_import(bundle_href);
            let specifier = maybe_relative_url(bundle_href, bundle);
            match mapping {
                None => {
                    let text = format!("import \"{}\";", specifier);
                    let pointer = self.push_statement_text(
                        &text,
                        RegionKind::Import {
                            import_index,
                            is_dynamic: false,
                            export_type: None,
                        },
                        &[],
                    );
                    self.imports[import_index].region = pointer;
                    // a bundle side effect
                    self.regions[DOCUMENT_POINTER]
                        .depends_on
                        .push(RegionRef::Local(pointer));
                }
                Some(mapping) => {
                    let namespace = mapping
                        .iter()
                        .find(|(name, _)| name.is_namespace())
                        .map(|(_, local)| local.clone());
                    let named: Vec<(String, String)> = mapping
                        .iter()
                        .filter_map(|(name, local)| {
                            name.as_str().map(|n| (n.to_string(), local.clone()))
                        })
                        .collect();
                    if let Some(local) = &namespace {
                        self.push_namespace_import(local, &specifier, import_index);
                    }
                    if !named.is_empty() {
                        match &namespace {
                            Some(namespace_local) => {
                                // destructure out of the namespace binding
                                // instead of a second import statement
                                self.push_named_destructure(&named, namespace_local)?;
                            }
                            None => {
                                self.push_named_import(&named, &specifier, import_index);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn push_namespace_import(&mut self, local: &str, specifier: &str, import_index: usize) {
        let start = self.begin_statement();
        self.code
            .push_str(&format!("import * as {} from \"{}\";", local, specifier));
        let statement = self.regions.len();
        let declaration = statement + 1;
        let reference = declaration + 1;
        self.regions.push(CodeRegion {
            position: 0,
            start,
            end: format!(" from \"{}\";", specifier).len(),
            first_child: Some(declaration),
            next_sibling: None,
            depends_on: Vec::new(),
            kind: RegionKind::Import {
                import_index,
                is_dynamic: false,
                export_type: None,
            },
            original: None,
        });
        self.regions.push(CodeRegion {
            position: 0,
            start: "import ".len(),
            end: 0,
            first_child: Some(reference),
            next_sibling: None,
            depends_on: vec![RegionRef::Local(reference)],
            kind: RegionKind::Declaration(Declaration::Import(ImportDeclaration {
                declared_name: local.to_string(),
                references: vec![reference],
                imported_name: ImportedName::Namespace,
                import_index,
            })),
            original: None,
        });
        self.regions.push(CodeRegion {
            position: 0,
            start: "* as ".len(),
            end: local.len(),
            first_child: None,
            next_sibling: None,
            depends_on: vec![RegionRef::Local(declaration)],
            kind: RegionKind::Reference,
            original: None,
        });
        self.imports[import_index].region = statement;
        self.declarations.insert(
            local.to_string(),
            DeclarationEntry {
                pointer: declaration,
                references: vec![reference],
            },
        );
        self.wire_statement(statement);
    }

    fn push_named_import(
        &mut self,
        named: &[(String, String)],
        specifier: &str,
        import_index: usize,
    ) {
        let start = self.begin_statement();
        let specs: Vec<String> = named
            .iter()
            .map(|(exported, local)| {
                if exported == local {
                    exported.clone()
                } else {
                    format!("{} as {}", exported, local)
                }
            })
            .collect();
        self.code.push_str(&format!(
            "import {{ {} }} from \"{}\";",
            specs.join(", "),
            specifier
        ));
        let statement = self.regions.len();
        self.regions.push(CodeRegion {
            position: 0,
            start,
            end: format!(" }} from \"{}\";", specifier).len(),
            first_child: None,
            next_sibling: None,
            depends_on: Vec::new(),
            kind: RegionKind::Import {
                import_index,
                is_dynamic: false,
                export_type: None,
            },
            original: None,
        });
        self.imports[import_index].region = statement;
        let mut previous: Option<RegionPointer> = None;
        for (index, (exported, local)) in named.iter().enumerate() {
            let declaration = self.regions.len();
            let reference = declaration + 1;
            self.regions.push(CodeRegion {
                position: 0,
                start: if index == 0 {
                    "import { ".len()
                } else {
                    ", ".len()
                },
                end: 0,
                first_child: Some(reference),
                next_sibling: None,
                depends_on: vec![RegionRef::Local(reference)],
                kind: RegionKind::Declaration(Declaration::Import(ImportDeclaration {
                    declared_name: local.clone(),
                    references: vec![reference],
                    imported_name: ImportedName::named(exported.clone()),
                    import_index,
                })),
                original: None,
            });
            self.regions.push(CodeRegion {
                position: 0,
                start: if exported == local {
                    0
                } else {
                    exported.len() + " as ".len()
                },
                end: local.len(),
                first_child: None,
                next_sibling: None,
                depends_on: vec![RegionRef::Local(declaration)],
                kind: RegionKind::Reference,
                original: None,
            });
            match previous {
                Some(p) => self.regions[p].next_sibling = Some(declaration),
                None => self.regions[statement].first_child = Some(declaration),
            }
            previous = Some(declaration);
            self.declarations.insert(
                local.clone(),
                DeclarationEntry {
                    pointer: declaration,
                    references: vec![reference],
                },
            );
        }
        self.wire_statement(statement);
    }

    /// `const { a: b, c } = ns;`
    fn push_named_destructure(
        &mut self,
        named: &[(String, String)],
        namespace_local: &str,
    ) -> Result<()> {
        let namespace_entry = self
            .declarations
            .get(namespace_local)
            .map(|e| e.pointer)
            .ok_or_else(|| {
                IrError::bug(format!(
                    "namespace binding '{}' has no declaration region",
                    namespace_local
                ))
            })?;
        let start = self.begin_statement();
        let specs: Vec<String> = named
            .iter()
            .map(|(exported, local)| {
                if exported == local {
                    exported.clone()
                } else {
                    format!("{}: {}", exported, local)
                }
            })
            .collect();
        self.code.push_str(&format!(
            "const {{ {} }} = {};",
            specs.join(", "),
            namespace_local
        ));
        let statement = self.regions.len();
        self.regions.push(CodeRegion {
            position: 0,
            start,
            end: 0,
            first_child: None,
            next_sibling: None,
            depends_on: Vec::new(),
            kind: RegionKind::General,
            original: None,
        });
        let mut previous: Option<RegionPointer> = None;
        for (index, (exported, local)) in named.iter().enumerate() {
            let declaration = self.regions.len();
            let reference = declaration + 1;
            self.regions.push(CodeRegion {
                position: 0,
                start: if index == 0 {
                    "const { ".len()
                } else {
                    ", ".len()
                },
                end: 0,
                first_child: Some(reference),
                next_sibling: None,
                depends_on: vec![RegionRef::Local(reference), RegionRef::Local(statement)],
                kind: RegionKind::Declaration(Declaration::Local(LocalDeclaration {
                    declared_name: Some(local.clone()),
                    references: vec![reference],
                    declarator_of: None,
                    original: None,
                })),
                original: None,
            });
            self.regions.push(CodeRegion {
                position: 0,
                start: if exported == local {
                    0
                } else {
                    exported.len() + ": ".len()
                },
                end: local.len(),
                first_child: None,
                next_sibling: None,
                depends_on: vec![RegionRef::Local(declaration)],
                kind: RegionKind::Reference,
                original: None,
            });
            match previous {
                Some(p) => self.regions[p].next_sibling = Some(declaration),
                None => self.regions[statement].first_child = Some(declaration),
            }
            previous = Some(declaration);
            self.declarations.insert(
                local.clone(),
                DeclarationEntry {
                    pointer: declaration,
                    references: vec![reference],
                },
            );
        }
        // trailing ` } = ns;` with a reference to the namespace binding
        let ns_reference = self.regions.len();
        self.regions.push(CodeRegion {
            position: 0,
            start: " } = ".len(),
            end: namespace_local.len(),
            first_child: None,
            next_sibling: None,
            depends_on: vec![RegionRef::Local(namespace_entry)],
            kind: RegionKind::Reference,
            original: None,
        });
        if let Some(p) = previous {
            self.regions[p].next_sibling = Some(ns_reference);
        }
        self.regions[statement].end = ";".len();
        if let Some(entry) = self.declarations.get_mut(namespace_local) {
            entry.references.push(ns_reference);
        }
        self.wire_statement(statement);
        Ok(())
    }

    fn build_reexports(
        &mut self,
        bundle: &Url,
        reexports: &IndexMap<Url, IndexMap<String, String>>,
    ) -> Result<()> {
        for (bundle_href, mapping) in reexports {
            let import_index = self.ensure_import(bundle_href);
            let specs: Vec<String> = mapping
                .iter()
                .map(|(outside, inside)| {
                    if outside == inside {
                        outside.clone()
                    } else {
                        format!("{} as {}", inside, outside)
                    }
                })
                .collect();
            let text = format!(
                "export {{ {} }} from \"{}\";",
                specs.join(", "),
                maybe_relative_url(bundle_href, bundle)
            );
            let pointer = self.push_statement_text(
                &text,
                RegionKind::Import {
                    import_index,
                    is_dynamic: false,
                    export_type: Some(crate::regions::region::ExportType::Reexport),
                },
                &[],
            );
            self.imports[import_index].region = pointer;
            self.reexport_regions.insert(bundle_href.clone(), pointer);
        }
        Ok(())
    }

    fn build_body(
        &mut self,
        state: &mut HeadState,
        rewriters: &[ModuleRewriter],
        assignments: &Arc<Vec<BundleAssignment>>,
        dependencies: &Dependencies,
        graph: &Arc<ModuleGraph>,
    ) -> Result<()> {
        for rewriter in rewriters {
            // namespace objects needed by this module come first
            for namespace in &rewriter.namespaces {
                if let Some(members) = state.assigned_namespaces.shift_remove(namespace) {
                    self.push_namespace_object(namespace, &members)?;
                }
            }

            let serialized = rewriter.serialize()?;
            if serialized.code.is_empty() {
                continue;
            }
            self.append_module_regions(
                rewriter,
                serialized,
                state,
                assignments,
                dependencies,
                graph,
            )?;
        }
        Ok(())
    }

    /// `const ns = { a: x0, b };`
    fn push_namespace_object(
        &mut self,
        name: &str,
        members: &IndexMap<String, String>,
    ) -> Result<()> {
        let start = self.begin_statement();
        let declarators: Vec<String> = members
            .iter()
            .map(|(outside, inside)| {
                if outside == inside {
                    outside.clone()
                } else {
                    format!("{}: {}", outside, inside)
                }
            })
            .collect();
        self.code.push_str(&format!(
            "const {} = {{ {} }};",
            name,
            declarators.join(", ")
        ));

        let statement = self.regions.len();
        let declarator = statement + 1;
        let ns_reference = declarator + 1;
        let first_member = ns_reference + 1;
        let mut depends_on = vec![
            RegionRef::Local(statement),
            RegionRef::Local(ns_reference),
        ];
        for (index, _) in members.iter().enumerate() {
            depends_on.push(RegionRef::Local(first_member + index));
        }
        self.regions.push(CodeRegion {
            position: 0,
            start,
            end: ";".len(),
            first_child: Some(declarator),
            next_sibling: None,
            depends_on: Vec::new(),
            kind: RegionKind::General,
            original: None,
        });
        self.regions.push(CodeRegion {
            position: 0,
            start: "const ".len(),
            end: " }".len(),
            first_child: Some(ns_reference),
            next_sibling: None,
            depends_on,
            kind: RegionKind::Declaration(Declaration::Local(LocalDeclaration {
                declared_name: Some(name.to_string()),
                references: vec![ns_reference],
                declarator_of: None,
                original: None,
            })),
            original: None,
        });
        self.regions.push(CodeRegion {
            position: 0,
            start: 0,
            end: name.len(),
            first_child: None,
            next_sibling: Some(first_member),
            depends_on: vec![RegionRef::Local(declarator)],
            kind: RegionKind::Reference,
            original: None,
        });
        let member_count = members.len();
        for (index, (outside, inside)) in members.iter().enumerate() {
            let member_entry = self.declarations.get(inside).map(|e| e.pointer);
            let member_pointer = self.regions.len();
            let cushion = if index == 0 {
                format!(" = {{ {}", prefix_for(outside, inside))
            } else {
                format!(", {}", prefix_for(outside, inside))
            };
            self.regions.push(CodeRegion {
                position: 0,
                start: cushion.len(),
                end: inside.len(),
                first_child: None,
                next_sibling: if index + 1 == member_count {
                    None
                } else {
                    Some(member_pointer + 1)
                },
                depends_on: match member_entry {
                    Some(pointer) => vec![RegionRef::Local(pointer)],
                    None => Vec::new(),
                },
                kind: RegionKind::Reference,
                original: None,
            });
            if member_entry.is_some() {
                if let Some(entry) = self.declarations.get_mut(inside) {
                    entry.references.push(member_pointer);
                }
            }
        }
        self.declarations.insert(
            name.to_string(),
            DeclarationEntry {
                pointer: declarator,
                references: vec![ns_reference],
            },
        );
        self.wire_statement(statement);
        Ok(())
    }

    fn append_module_regions(
        &mut self,
        rewriter: &ModuleRewriter,
        serialized: SerializedModule,
        state: &HeadState,
        assignments: &Arc<Vec<BundleAssignment>>,
        dependencies: &Dependencies,
        graph: &Arc<ModuleGraph>,
    ) -> Result<()> {
        let module = &rewriter.module;
        let start = self.begin_statement();
        self.code.push_str(&serialized.code);

        let offset = self.regions.len();
        let mut regions = serialized.regions;
        for region in regions.iter_mut() {
            region.first_child = region.first_child.map(|p| p + offset);
            region.next_sibling = region.next_sibling.map(|p| p + offset);
            region.depends_on = region
                .depends_on
                .iter()
                .map(|r| match r {
                    RegionRef::Local(p) => RegionRef::Local(p + offset),
                    RegionRef::OriginalModule(p) => RegionRef::OriginalModule(*p),
                })
                .collect();
            if let Some(declaration) = region.declaration_mut() {
                let references = declaration.references_mut();
                *references = references.iter().map(|p| p + offset).collect();
                if let Declaration::Local(local) = declaration {
                    local.declarator_of = local.declarator_of.map(|p| p + offset);
                }
            }
        }

        // the module's document region becomes a child of the bundle's
        let module_document = offset;
        regions[0].start = start;

        // denote package-dependency side effects with consumption info
        let dependency = dependencies
            .values()
            .find(|dep| module.url.as_str().starts_with(dep.url.as_str()));
        let document_deps: Vec<RegionRef> = regions[0].depends_on.clone();
        if let Some(dependency) = dependency {
            for dep in &document_deps {
                if let RegionRef::Local(pointer) = dep {
                    let region = &mut regions[pointer - offset];
                    if matches!(region.kind, RegionKind::General) {
                        region.original = Some(RegionProvenance {
                            bundle_href: module.url.clone(),
                            range: dependency.range.clone(),
                        });
                    }
                }
            }
        }

        // hoist module side effects onto the bundle document; stale links to
        // stripped statements (already re-expressed as bundle imports) drop
        self.regions[DOCUMENT_POINTER].depends_on.extend(
            document_deps
                .iter()
                .filter(|d| matches!(d, RegionRef::Local(_)))
                .cloned(),
        );
        regions[0].depends_on = Vec::new();

        // dynamic imports surviving in the body re-index against the
        // bundle's own import table
        for (local_index, region) in regions.iter_mut().enumerate() {
            let first_child = region.first_child;
            if let RegionKind::Import {
                import_index,
                is_dynamic: true,
                ..
            } = &mut region.kind
            {
                let target = graph.import_target(module, *import_index)?.url().clone();
                let target_assignment =
                    assignment_for_module(assignments, &target).ok_or_else(|| {
                        IrError::bug(format!("no bundle assignment for module {}", target))
                    })?;
                let new_index = self.ensure_import(&target_assignment.bundle_url);
                self.imports[new_index].is_dynamic = true;
                self.imports[new_index].region = offset + local_index;
                self.imports[new_index].specifier_region = first_child;
                *import_index = new_index;
            }
        }

        self.regions.extend(regions);

        // marry up declarations and re-wire references whose declarations
        // were stripped with the merge
        for pointer in offset..self.regions.len() {
            if let Some(Declaration::Local(local)) = self.regions[pointer].declaration() {
                if let Some(name) = &local.declared_name {
                    let name = name.clone();
                    let references = self.regions[pointer]
                        .declaration()
                        .map(|d| d.references().to_vec())
                        .unwrap_or_default();
                    self.declarations.insert(
                        name,
                        DeclarationEntry {
                            pointer,
                            references,
                        },
                    );
                }
            }
        }
        for pointer in offset..self.regions.len() {
            if !matches!(self.regions[pointer].kind, RegionKind::Reference) {
                continue;
            }
            let stripped = match self.regions[pointer].reference_target() {
                Some(RegionRef::OriginalModule(original_pointer)) => original_pointer,
                _ => continue,
            };
            let declared_name = module.desc.regions[stripped]
                .declaration()
                .and_then(|d| d.declared_name())
                .ok_or_else(|| {
                    IrError::bug(format!(
                        "reference region {} in module {} does not resolve to a stripped \
                         declaration",
                        pointer, module.url
                    ))
                })?;
            let assigned = state
                .name_assignments
                .get(&module.url)
                .and_then(|names| names.get(declared_name))
                .ok_or_else(|| {
                    IrError::bug(format!(
                        "could not find assigned name for '{}' in {}",
                        declared_name, module.url
                    ))
                })?;
            let entry = self.declarations.get_mut(assigned).ok_or_else(|| {
                IrError::bug(format!(
                    "could not find declaration region for the assigned name '{}'",
                    assigned
                ))
            })?;
            entry.references.push(pointer);
            self.regions[pointer].depends_on = vec![RegionRef::Local(entry.pointer)];
        }

        self.wire_statement(module_document);
        Ok(())
    }

    fn build_exports(&mut self, bundle: &Url, exports: &IndexMap<String, String>) -> Result<()> {
        if exports.is_empty() {
            return Ok(());
        }
        let start = self.begin_statement();
        let specs: Vec<String> = exports
            .iter()
            .map(|(outside, inside)| {
                if outside == inside {
                    outside.clone()
                } else {
                    format!("{} as {}", inside, outside)
                }
            })
            .collect();
        self.code
            .push_str(&format!("export {{ {} }};", specs.join(", ")));

        let statement = self.regions.len();
        self.regions.push(CodeRegion {
            position: 0,
            start,
            end: " };".len(),
            first_child: None,
            next_sibling: None,
            depends_on: Vec::new(),
            kind: RegionKind::General,
            original: None,
        });
        let mut previous: Option<RegionPointer> = None;
        for (index, (outside, inside)) in exports.iter().enumerate() {
            let entry_pointer = self
                .declarations
                .get(inside)
                .map(|e| e.pointer)
                .ok_or_else(|| {
                    IrError::bug(format!(
                        "cannot find declaration region when building export for '{}' in \
                         bundle {}",
                        inside, bundle
                    ))
                })?;
            let specifier = self.regions.len();
            let reference = specifier + 1;
            self.regions.push(CodeRegion {
                position: 0,
                start: if index == 0 {
                    "export { ".len()
                } else {
                    ", ".len()
                },
                end: if outside == inside {
                    0
                } else {
                    " as ".len() + outside.len()
                },
                first_child: Some(reference),
                next_sibling: None,
                depends_on: vec![RegionRef::Local(reference)],
                kind: RegionKind::General,
                original: None,
            });
            self.regions.push(CodeRegion {
                position: 0,
                start: 0,
                end: inside.len(),
                first_child: None,
                next_sibling: None,
                depends_on: vec![RegionRef::Local(entry_pointer)],
                kind: RegionKind::Reference,
                original: None,
            });
            if let Some(entry) = self.declarations.get_mut(inside) {
                entry.references.push(reference);
            }
            match previous {
                Some(p) => self.regions[p].next_sibling = Some(specifier),
                None => self.regions[statement].first_child = Some(specifier),
            }
            previous = Some(specifier);
            self.export_regions
                .insert(outside.clone(), (inside.clone(), specifier));
        }
        self.wire_statement(statement);
        Ok(())
    }
}

fn prefix_for(outside: &str, inside: &str) -> String {
    if outside == inside {
        String::new()
    } else {
        format!("{}: ", outside)
    }
}
