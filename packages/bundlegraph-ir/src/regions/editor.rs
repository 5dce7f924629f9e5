//! Region editor
//!
//! A `RegionEditor` is a mutable overlay on one module's immutable region
//! arena. It records a disposition per region (kept, removed, unwrapped,
//! replaced), pending renames, and knows how to serialize the surviving
//! subset back into source text together with a re-derived region array.
//!
//! Several editors may exist for one module when its regions are split
//! across different output positions; adjacent editors merge with
//! [`RegionEditor::merge_with`].

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::errors::{IrError, Result};
use crate::module_graph::ModuleResolution;
use crate::regions::describe::{ExportDescription, ExportKey};
use crate::regions::region::{
    assign_region_positions, region_extents, CodeRegion, Declaration, RegionExtent, RegionKind,
    RegionPointer, RegionRef, DOCUMENT_POINTER,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Kept,
    Removed,
    /// The region's own cushions are dropped but its children survive; the
    /// first emitted child's leading cushion is replaced by `replacement`.
    /// This is how `export const x` sheds its `export ` keyword and how an
    /// anonymous `export default` gains a `const <name> = ` header.
    Unwrapped { replacement: Option<String> },
    /// The region (and everything under it) is replaced by literal text.
    Replaced(String),
}

/// Result of serializing an editor: output text, the region array describing
/// that text, and the mapping from source pointers to output pointers.
#[derive(Debug)]
pub struct SerializedModule {
    pub code: String,
    pub regions: Vec<CodeRegion>,
    pub pointer_map: FxHashMap<RegionPointer, RegionPointer>,
}

pub struct RegionEditor {
    module: Arc<ModuleResolution>,
    dispositions: Vec<Disposition>,
    /// declaration pointer -> assigned name
    renames: FxHashMap<RegionPointer, String>,
    parents: Vec<Option<RegionPointer>>,
}

impl std::fmt::Debug for RegionEditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionEditor")
            .field("module", &self.module.url.as_str())
            .field("kept", &self.included_regions().count())
            .finish()
    }
}

impl RegionEditor {
    /// An editor that starts with every region removed; the region walker
    /// marks the surviving set with [`keep_region`](Self::keep_region).
    pub fn new(module: Arc<ModuleResolution>) -> Self {
        let mut dispositions = vec![Disposition::Removed; module.desc.regions.len()];
        dispositions[DOCUMENT_POINTER] = Disposition::Kept;
        let parents = compute_parents(&module.desc.regions);
        RegionEditor {
            module,
            dispositions,
            renames: FxHashMap::default(),
            parents,
        }
    }

    /// An editor that starts with every region kept.
    pub fn keeping_all(module: Arc<ModuleResolution>) -> Self {
        let dispositions = vec![Disposition::Kept; module.desc.regions.len()];
        let parents = compute_parents(&module.desc.regions);
        RegionEditor {
            module,
            dispositions,
            renames: FxHashMap::default(),
            parents,
        }
    }

    pub fn module(&self) -> &Arc<ModuleResolution> {
        &self.module
    }

    pub fn disposition(&self, pointer: RegionPointer) -> &Disposition {
        &self.dispositions[pointer]
    }

    /// Mark one region (and implicitly nothing else) as retained. Dependency
    /// regions must be separately kept by the walker. The document region is
    /// inherently retained.
    pub fn keep_region(&mut self, pointer: RegionPointer) {
        if pointer == DOCUMENT_POINTER {
            return;
        }
        if self.dispositions[pointer] == Disposition::Removed {
            self.dispositions[pointer] = Disposition::Kept;
        }
    }

    pub fn remove_region(&mut self, pointer: RegionPointer) {
        if pointer == DOCUMENT_POINTER {
            return;
        }
        self.dispositions[pointer] = Disposition::Removed;
    }

    pub fn remove_region_and_children(&mut self, pointer: RegionPointer) {
        self.remove_region(pointer);
        let mut child = self.module.desc.regions[pointer].first_child;
        while let Some(c) = child {
            self.remove_region_and_children(c);
            child = self.module.desc.regions[c].next_sibling;
        }
    }

    /// Strip a statement wrapper while keeping its inner declaration.
    pub fn unwrap_region(&mut self, pointer: RegionPointer, replacement: Option<String>) {
        if pointer == DOCUMENT_POINTER {
            return;
        }
        self.dispositions[pointer] = Disposition::Unwrapped { replacement };
    }

    /// Replace a region (dynamic import specifiers) with literal text.
    pub fn replace(&mut self, pointer: RegionPointer, text: impl Into<String>) {
        self.dispositions[pointer] = Disposition::Replaced(text.into());
    }

    /// Rename a module-scope binding and all of its recorded reference
    /// occurrences.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        let pointer = self
            .module
            .desc
            .declaration_pointer(old_name)
            .ok_or_else(|| {
                IrError::bug(format!(
                    "cannot rename '{}': module {} has no such binding",
                    old_name, self.module.url
                ))
            })?;
        self.renames.insert(pointer, new_name.to_string());
        Ok(())
    }

    /// The assigned name for a declaration, when one was set.
    pub fn renamed(&self, declaration: RegionPointer) -> Option<&str> {
        self.renames.get(&declaration).map(|s| s.as_str())
    }

    /// Remove the whole statement that declares `name`.
    pub fn remove_declaration(&mut self, name: &str) -> Result<()> {
        let pointer = self.module.desc.declaration_pointer(name).ok_or_else(|| {
            IrError::bug(format!(
                "cannot remove declaration '{}': module {} has no such binding",
                name, self.module.url
            ))
        })?;
        let statement = self.statement_of(pointer);
        self.remove_region_and_children(statement);
        Ok(())
    }

    /// The outermost ancestor of `pointer` below the document region.
    pub fn statement_of(&self, pointer: RegionPointer) -> RegionPointer {
        let mut current = pointer;
        while let Some(parent) = self.parents[current] {
            if parent == DOCUMENT_POINTER {
                break;
            }
            current = parent;
        }
        current
    }

    /// Strip export syntax, leaving the declarations it wraps. `default_name`
    /// gives an anonymous `export default` a binding. Import statements need
    /// no handling here: their regions survive only as cross-bundle signals,
    /// which the bundle-finishing step consumes and removes before
    /// serialization.
    pub fn remove_imports_and_exports(&mut self, default_name: &str) -> Result<()> {
        let exports: Vec<(ExportKey, ExportDescription)> = self
            .module
            .desc
            .exports
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (_key, desc) in exports {
            match desc {
                ExportDescription::Local {
                    name,
                    export_region,
                } => {
                    let declaration = self.module.desc.declaration_pointer(&name);
                    match declaration {
                        Some(pointer) if self.is_ancestor(export_region, pointer) => {
                            // declaration-style export: shed the keyword
                            let anonymous = self.module.desc.regions[pointer]
                                .declaration()
                                .map(|d| d.declared_name().is_none())
                                .unwrap_or(false);
                            let replacement =
                                anonymous.then(|| format!("const {} = ", default_name));
                            self.unwrap_region(export_region, replacement);
                        }
                        _ => {
                            // specifier-style export of an existing binding
                            self.remove_region_and_children(export_region);
                        }
                    }
                }
                ExportDescription::Reexport { export_region, .. }
                | ExportDescription::ExportAll { export_region, .. } => {
                    if self.dispositions[export_region] == Disposition::Removed {
                        self.remove_region_and_children(export_region);
                    }
                }
            }
        }
        Ok(())
    }

    fn is_ancestor(&self, ancestor: RegionPointer, pointer: RegionPointer) -> bool {
        let mut current = Some(pointer);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.parents[c];
        }
        false
    }

    /// Pointers still marked as surviving, in arena order.
    pub fn included_regions(&self) -> impl Iterator<Item = RegionPointer> + '_ {
        self.dispositions
            .iter()
            .enumerate()
            .filter(|(_, d)| !matches!(d, Disposition::Removed))
            .map(|(pointer, _)| pointer)
    }

    /// True when only document regions survive; such editors are no-ops.
    pub fn is_noop(&self) -> bool {
        self.included_regions()
            .all(|p| self.module.desc.regions[p].is_document())
    }

    /// Adopt the surviving regions and renames of other editors for the same
    /// module.
    pub fn merge_with(&mut self, others: impl IntoIterator<Item = RegionEditor>) {
        for other in others {
            debug_assert_eq!(other.module.url, self.module.url);
            for (pointer, disposition) in other.dispositions.into_iter().enumerate() {
                if disposition == Disposition::Removed {
                    continue;
                }
                if self.dispositions[pointer] == Disposition::Removed
                    || self.dispositions[pointer] == Disposition::Kept
                {
                    self.dispositions[pointer] = disposition;
                }
            }
            self.renames.extend(other.renames);
        }
    }

    /// Serialize the surviving regions back to source text.
    ///
    /// The output region array mirrors the emitted text: pointers are
    /// remapped, dropped references pruned, and dependencies on stripped
    /// declarations become `RegionRef::OriginalModule` sentinels for the
    /// caller to re-wire. Positions are reassigned over the new array.
    pub fn serialize(&self) -> Result<SerializedModule> {
        let regions = &self.module.desc.regions;
        let extents = region_extents(regions);
        let will_emit = self.compute_will_emit();

        let mut ctx = EmitContext {
            code: String::new(),
            regions: Vec::new(),
            map: FxHashMap::default(),
        };

        // the document region is the root of the output array
        let doc = &regions[DOCUMENT_POINTER];
        ctx.regions.push(CodeRegion {
            position: 0,
            start: 0,
            end: 0,
            first_child: None,
            next_sibling: None,
            depends_on: doc.depends_on.clone(),
            kind: RegionKind::Document,
            original: doc.original.clone(),
        });
        ctx.map.insert(DOCUMENT_POINTER, DOCUMENT_POINTER);

        let children = children_of(regions, DOCUMENT_POINTER);
        let emitted = self.emit_list(&children, &extents, &will_emit, &mut ctx, None)?;
        wire_children(&mut ctx.regions, DOCUMENT_POINTER, &emitted);
        // trailing document cushion
        if let Some(last) = children.last() {
            let tail_start = extents[*last].outer_end;
            let tail_end = extents[DOCUMENT_POINTER].outer_end;
            if self.subtree_emits(&will_emit, &children) {
                ctx.code.push_str(&self.module.source[tail_start..tail_end]);
                ctx.regions[DOCUMENT_POINTER].end = tail_end - tail_start;
            }
        } else {
            ctx.code.push_str(
                &self.module.source
                    [extents[DOCUMENT_POINTER].content_start..extents[DOCUMENT_POINTER].outer_end],
            );
            ctx.regions[DOCUMENT_POINTER].end =
                extents[DOCUMENT_POINTER].outer_end - extents[DOCUMENT_POINTER].content_start;
        }

        let mut regions_out = ctx.regions;
        remap_pointers(&mut regions_out, &ctx.map)?;
        assign_region_positions(&mut regions_out);
        Ok(SerializedModule {
            code: ctx.code,
            regions: regions_out,
            pointer_map: ctx.map,
        })
    }

    fn subtree_emits(&self, will_emit: &[bool], pointers: &[RegionPointer]) -> bool {
        pointers.iter().any(|p| will_emit[*p])
    }

    fn compute_will_emit(&self) -> Vec<bool> {
        let regions = &self.module.desc.regions;
        let mut will_emit = vec![false; regions.len()];
        // bottom-up: higher pointers never parent lower ones is not
        // guaranteed, so walk the tree from the document instead
        fn visit(
            editor: &RegionEditor,
            regions: &[CodeRegion],
            pointer: RegionPointer,
            will_emit: &mut [bool],
        ) -> bool {
            let children = children_of(regions, pointer);
            let mut any_child = false;
            for child in &children {
                any_child |= visit(editor, regions, *child, will_emit);
            }
            let emits = match &editor.dispositions[pointer] {
                Disposition::Removed => false,
                Disposition::Replaced(_) => true,
                Disposition::Unwrapped { .. } => any_child,
                Disposition::Kept => {
                    if children.is_empty() {
                        true
                    } else {
                        any_child
                    }
                }
            };
            will_emit[pointer] = emits;
            emits
        }
        visit(self, regions, DOCUMENT_POINTER, &mut will_emit);
        will_emit[DOCUMENT_POINTER] = true;
        will_emit
    }

    /// Emit a sibling list. Leading removed siblings donate their cushion to
    /// the first emitted one (so `const a = 1, b = 2;` minus `a` keeps its
    /// `const `); `first_cushion_override` substitutes the first emitted
    /// region's cushion when a wrapper was unwrapped with replacement text.
    fn emit_list(
        &self,
        pointers: &[RegionPointer],
        extents: &[RegionExtent],
        will_emit: &[bool],
        ctx: &mut EmitContext,
        mut first_cushion_override: Option<String>,
    ) -> Result<Vec<RegionPointer>> {
        let source = &self.module.source;
        let mut emitted: Vec<RegionPointer> = Vec::new();
        let mut donated_cushion: Option<(usize, usize)> = None;
        for &pointer in pointers {
            if !will_emit[pointer] {
                if emitted.is_empty() && donated_cushion.is_none() {
                    donated_cushion =
                        Some((extents[pointer].outer_start, extents[pointer].content_start));
                }
                continue;
            }
            match &self.dispositions[pointer] {
                Disposition::Removed => unreachable!("will_emit is false for removed regions"),
                Disposition::Unwrapped { replacement } => {
                    // wrapper cushion survives; its children splice in here
                    if emitted.is_empty() {
                        if let Some(text) = first_cushion_override.take() {
                            ctx.code.push_str(&text);
                        } else if let Some((from, to)) = donated_cushion.take() {
                            ctx.code.push_str(&source[from..to]);
                        } else {
                            ctx.code.push_str(
                                &source
                                    [extents[pointer].outer_start..extents[pointer].content_start],
                            );
                        }
                    } else {
                        ctx.code.push_str(
                            &source[extents[pointer].outer_start..extents[pointer].content_start],
                        );
                    }
                    let children = children_of(&self.module.desc.regions, pointer);
                    let inner = self.emit_list(
                        &children,
                        extents,
                        will_emit,
                        ctx,
                        replacement.clone().or(Some(String::new())),
                    )?;
                    emitted.extend(inner);
                }
                Disposition::Kept | Disposition::Replaced(_) => {
                    let cushion = if !emitted.is_empty() {
                        CushionSpec::Own
                    } else if let Some(text) = first_cushion_override.take() {
                        CushionSpec::Text(text)
                    } else if let Some((from, to)) = donated_cushion.take() {
                        CushionSpec::Slice(from, to)
                    } else {
                        CushionSpec::Own
                    };
                    let new_pointer =
                        self.emit_one(pointer, cushion, extents, will_emit, ctx)?;
                    emitted.push(new_pointer);
                }
            }
        }
        Ok(emitted)
    }

    fn emit_one(
        &self,
        pointer: RegionPointer,
        cushion: CushionSpec,
        extents: &[RegionExtent],
        will_emit: &[bool],
        ctx: &mut EmitContext,
    ) -> Result<RegionPointer> {
        let source = &self.module.source;
        let region = &self.module.desc.regions[pointer];
        let extent = extents[pointer];

        let cushion_text = match cushion {
            CushionSpec::Own => source[extent.outer_start..extent.content_start].to_string(),
            CushionSpec::Slice(from, to) => source[from..to].to_string(),
            CushionSpec::Text(text) => text,
        };
        ctx.code.push_str(&cushion_text);

        let new_pointer = ctx.regions.len();
        ctx.map.insert(pointer, new_pointer);
        let mut kind = region.kind.clone();
        if let RegionKind::Declaration(declaration) = &mut kind {
            // the output description carries assigned names
            if let Some(renamed) = self.renames.get(&pointer) {
                match declaration {
                    Declaration::Local(local) => local.declared_name = Some(renamed.clone()),
                    Declaration::Import(import) => import.declared_name = renamed.clone(),
                }
            }
        }
        ctx.regions.push(CodeRegion {
            position: 0,
            start: cushion_text.len(),
            end: 0,
            first_child: None,
            next_sibling: None,
            depends_on: region.depends_on.clone(),
            kind,
            original: region.original.clone(),
        });

        if let Disposition::Replaced(text) = &self.dispositions[pointer] {
            ctx.code.push_str(text);
            ctx.regions[new_pointer].end = text.len();
            ctx.regions[new_pointer].kind = RegionKind::General;
            ctx.regions[new_pointer].depends_on = Vec::new();
            return Ok(new_pointer);
        }

        let children = children_of(&self.module.desc.regions, pointer);
        if children.is_empty() {
            let text = self.leaf_text(pointer, extent)?;
            ctx.code.push_str(&text);
            ctx.regions[new_pointer].end = text.len();
        } else {
            let emitted = self.emit_list(&children, extents, will_emit, ctx, None)?;
            wire_children(&mut ctx.regions, new_pointer, &emitted);
            let tail_start = extents[*children.last().unwrap()].outer_end;
            let tail = &source[tail_start..extent.outer_end];
            ctx.code.push_str(tail);
            ctx.regions[new_pointer].end = tail.len();
        }
        Ok(new_pointer)
    }

    /// The emitted text of a leaf, honoring renames. A reference whose
    /// declaration was removed without a rename is a dangling dependency.
    fn leaf_text(&self, pointer: RegionPointer, extent: RegionExtent) -> Result<String> {
        let region = &self.module.desc.regions[pointer];
        let original = &self.module.source[extent.content_start..extent.outer_end];
        if let RegionKind::Reference = region.kind {
            match region.reference_target() {
                Some(RegionRef::Local(declaration)) => {
                    if let Some(renamed) = self.renames.get(&declaration) {
                        return Ok(renamed.clone());
                    }
                    // import declarations are legitimately stripped when the
                    // merge collapses them to direct references; any other
                    // removed declaration is a dangling dependency
                    if matches!(self.dispositions[declaration], Disposition::Removed)
                        && matches!(
                            self.module.desc.regions[declaration].declaration(),
                            Some(Declaration::Local(_))
                        )
                    {
                        return Err(IrError::bug(format!(
                            "serialized a reference to the removed declaration at region {} in module {}",
                            declaration, self.module.url
                        )));
                    }
                }
                Some(RegionRef::OriginalModule(_)) => {}
                None => {
                    return Err(IrError::bug(format!(
                        "reference region {} in module {} does not depend on its declaration",
                        pointer, self.module.url
                    )));
                }
            }
        }
        Ok(original.to_string())
    }
}

enum CushionSpec {
    /// The region's own cushion slice.
    Own,
    /// A donated slice from a leading removed sibling.
    Slice(usize, usize),
    /// Literal replacement text.
    Text(String),
}

struct EmitContext {
    code: String,
    regions: Vec<CodeRegion>,
    map: FxHashMap<RegionPointer, RegionPointer>,
}

fn children_of(regions: &[CodeRegion], pointer: RegionPointer) -> Vec<RegionPointer> {
    let mut children = Vec::new();
    let mut child = regions[pointer].first_child;
    while let Some(c) = child {
        children.push(c);
        child = regions[c].next_sibling;
    }
    children
}

fn wire_children(
    regions: &mut [CodeRegion],
    parent: RegionPointer,
    children: &[RegionPointer],
) {
    regions[parent].first_child = children.first().copied();
    for pair in children.windows(2) {
        regions[pair[0]].next_sibling = Some(pair[1]);
    }
    if let Some(last) = children.last() {
        regions[*last].next_sibling = None;
    }
}

/// Rewrite old-arena pointers in the emitted regions. Dependencies on
/// regions that did not survive become `OriginalModule` sentinels; dropped
/// reference-list entries are pruned.
fn remap_pointers(
    regions: &mut [CodeRegion],
    map: &FxHashMap<RegionPointer, RegionPointer>,
) -> Result<()> {
    for region in regions.iter_mut() {
        region.depends_on = region
            .depends_on
            .iter()
            .map(|r| match r {
                RegionRef::Local(old) => match map.get(old) {
                    Some(new) => RegionRef::Local(*new),
                    None => RegionRef::OriginalModule(*old),
                },
                RegionRef::OriginalModule(old) => RegionRef::OriginalModule(*old),
            })
            .collect();
        if let Some(declaration) = region.declaration_mut() {
            let references = declaration.references_mut();
            *references = references
                .iter()
                .filter_map(|r| map.get(r).copied())
                .collect();
            if let Declaration::Local(local) = declaration {
                local.declarator_of = local.declarator_of.and_then(|d| map.get(&d).copied());
            }
        }
    }
    Ok(())
}

fn compute_parents(regions: &[CodeRegion]) -> Vec<Option<RegionPointer>> {
    let mut parents = vec![None; regions.len()];
    for (pointer, region) in regions.iter().enumerate() {
        let mut child = region.first_child;
        while let Some(c) = child {
            parents[c] = Some(pointer);
            child = regions[c].next_sibling;
        }
    }
    parents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_graph::ModuleResolution;
    use crate::testing::ModuleBuilder;
    use pretty_assertions::assert_eq;
    use url::Url;

    fn module_from(builder: ModuleBuilder) -> Arc<ModuleResolution> {
        let (source, desc) = builder.build();
        Arc::new(ModuleResolution {
            url: Url::parse("https://local/test.js").unwrap(),
            source,
            desc,
            resolved_imports: vec![],
        })
    }

    #[test]
    fn test_serialize_is_idempotent_with_nothing_removed() {
        let module = module_from(
            ModuleBuilder::new()
                .const_decl("x", "1", &[], false)
                .const_decl("y", "x + 1", &["x"], false)
                .side_effect("console.log(y);", &["y"]),
        );
        let editor = RegionEditor::keeping_all(module.clone());
        let serialized = editor.serialize().unwrap();
        assert_eq!(serialized.code, module.source);
    }

    #[test]
    fn test_removed_statement_is_dropped() {
        let module = module_from(
            ModuleBuilder::new()
                .const_decl("x", "1", &[], false)
                .const_decl("y", "2", &[], false),
        );
        let mut editor = RegionEditor::keeping_all(module.clone());
        editor.remove_declaration("y").unwrap();
        let serialized = editor.serialize().unwrap();
        assert_eq!(serialized.code.trim_end(), "const x = 1;");
        assert!(!serialized.code.contains('y'));
    }

    #[test]
    fn test_rename_rewrites_declaration_and_references() {
        let module = module_from(
            ModuleBuilder::new()
                .const_decl("x", "1", &[], false)
                .const_decl("y", "x + x", &["x", "x"], false),
        );
        let mut editor = RegionEditor::keeping_all(module);
        editor.rename("x", "x0").unwrap();
        let serialized = editor.serialize().unwrap();
        assert_eq!(serialized.code, "const x0 = 1;\nconst y = x0 + x0;");
    }

    #[test]
    fn test_unwrap_sheds_export_keyword() {
        let module = module_from(ModuleBuilder::new().const_decl("x", "1", &[], true));
        let mut editor = RegionEditor::keeping_all(module.clone());
        editor.remove_imports_and_exports("_default").unwrap();
        let serialized = editor.serialize().unwrap();
        assert_eq!(serialized.code, "const x = 1;");
    }

    #[test]
    fn test_anonymous_default_gets_a_binding() {
        let module = module_from(ModuleBuilder::new().export_default("42"));
        let mut editor = RegionEditor::keeping_all(module);
        editor.remove_imports_and_exports("_default").unwrap();
        let serialized = editor.serialize().unwrap();
        assert_eq!(serialized.code, "const _default = 42;");
    }

    #[test]
    fn test_selective_editor_emits_only_kept_regions() {
        let module = module_from(
            ModuleBuilder::new()
                .const_decl("a", "1", &[], false)
                .const_decl("b", "2", &[], false),
        );
        let mut editor = RegionEditor::new(module.clone());
        let (_, pointer) = module.desc.declaration("a").unwrap();
        // keep the declaration, its statement, and its declarator reference
        let statement = editor.statement_of(pointer);
        editor.keep_region(statement);
        editor.keep_region(pointer);
        let reference = module.desc.regions[pointer].declaration().unwrap().references()[0];
        editor.keep_region(reference);
        let serialized = editor.serialize().unwrap();
        assert_eq!(serialized.code.trim_end(), "const a = 1;");
    }

    #[test]
    fn test_dangling_reference_is_a_bug() {
        let module = module_from(
            ModuleBuilder::new()
                .const_decl("x", "1", &[], false)
                .const_decl("y", "x + 1", &["x"], false),
        );
        let mut editor = RegionEditor::keeping_all(module.clone());
        // remove the declaration region itself but leave y's reference alone
        let (_, pointer) = module.desc.declaration("x").unwrap();
        let statement = editor.statement_of(pointer);
        editor.remove_region_and_children(statement);
        let err = editor.serialize().unwrap_err();
        assert!(err.to_string().starts_with("bug:"));
    }

    #[test]
    fn test_replace_rewrites_dynamic_specifier() {
        let module = module_from(ModuleBuilder::new().dynamic_import("./lazy.js"));
        let mut editor = RegionEditor::keeping_all(module.clone());
        let specifier = module.desc.imports[0].specifier_region.unwrap();
        editor.replace(specifier, "\"https://local/lazy-bundle.js\"");
        let serialized = editor.serialize().unwrap();
        assert_eq!(
            serialized.code,
            "import(\"https://local/lazy-bundle.js\");"
        );
    }

    proptest::proptest! {
        #[test]
        fn prop_serialize_round_trips_untouched_modules(
            names in proptest::collection::vec("[a-z][a-z0-9]{0,5}", 1..6),
        ) {
            let mut seen = std::collections::HashSet::new();
            let names: Vec<String> = names
                .into_iter()
                .filter(|n| seen.insert(n.clone()))
                .collect();
            let mut builder = ModuleBuilder::new();
            for (index, name) in names.iter().enumerate() {
                builder = builder.const_decl(name, &index.to_string(), &[], index % 2 == 0);
            }
            let (source, desc) = builder.build();
            let module = Arc::new(ModuleResolution {
                url: Url::parse("https://local/prop.js").unwrap(),
                source: source.clone(),
                desc,
                resolved_imports: vec![],
            });
            let serialized = RegionEditor::keeping_all(module).serialize().unwrap();
            proptest::prop_assert_eq!(serialized.code, source);
        }
    }

    #[test]
    fn test_serialized_regions_track_output_text() {
        let module = module_from(
            ModuleBuilder::new()
                .const_decl("x", "1", &[], false)
                .const_decl("y", "2", &[], false),
        );
        let mut editor = RegionEditor::keeping_all(module);
        editor.remove_declaration("x").unwrap();
        let serialized = editor.serialize().unwrap();
        // document plus the surviving statement subtree
        assert!(serialized.regions.len() >= 3);
        let names: Vec<_> = serialized
            .regions
            .iter()
            .filter_map(|r| r.declaration())
            .filter_map(|d| d.declared_name())
            .collect();
        assert_eq!(names, vec!["y"]);
    }
}
