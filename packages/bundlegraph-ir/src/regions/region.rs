//! Code region model
//!
//! A module's syntax is described as a flat arena of `CodeRegion`s wired into
//! a tree via `first_child`/`next_sibling` indices, with explicit dependency
//! edges between regions (a reference depends on its declaration, a
//! declaration depends on the regions its initializer consumes, the document
//! region depends on the module's side-effectful statements).
//!
//! Region pointers are stable indices into the owning module's region array.
//! A `RegionRef::OriginalModule` marks a dependency on a declaration that was
//! structurally removed during serialization and must be resolved against the
//! pre-edit region array of the module it came from.

use serde::{Deserialize, Serialize};
use url::Url;

/// Index of a region within its module's region arena.
pub type RegionPointer = usize;

/// The document region is always the first region of a module.
pub const DOCUMENT_POINTER: RegionPointer = 0;

/// A dependency edge target.
///
/// `Local` points into the same region array the edge lives in.
/// `OriginalModule` points into the pre-edit region array of the module the
/// containing code was serialized from; it appears only in serializer output
/// where an import declaration was collapsed into a direct reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionRef {
    Local(RegionPointer),
    OriginalModule(RegionPointer),
}

impl RegionRef {
    pub fn local(self) -> Option<RegionPointer> {
        match self {
            RegionRef::Local(p) => Some(p),
            RegionRef::OriginalModule(_) => None,
        }
    }
}

/// A named binding imported from another module, or the module's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImportedName {
    Named(String),
    Namespace,
}

impl ImportedName {
    pub fn named(name: impl Into<String>) -> Self {
        ImportedName::Named(name.into())
    }

    pub fn is_namespace(&self) -> bool {
        matches!(self, ImportedName::Namespace)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ImportedName::Named(s) => Some(s),
            ImportedName::Namespace => None,
        }
    }
}

impl std::fmt::Display for ImportedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportedName::Named(s) => write!(f, "{}", s),
            ImportedName::Namespace => write!(f, "*"),
        }
    }
}

/// Provenance of a binding (or side-effect region) that was rolled up from a
/// package bundle by a previous build. The semver `range` is the consumption
/// range the binding was originally declared against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalBinding {
    pub bundle_href: Url,
    pub module_href: Url,
    pub imported_as: ImportedName,
    pub range: String,
}

/// Provenance of a side-effect region that came from a package bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionProvenance {
    pub bundle_href: Url,
    pub range: String,
}

/// A binding declared in module scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Declaration {
    Local(LocalDeclaration),
    Import(ImportDeclaration),
}

impl Declaration {
    pub fn declared_name(&self) -> Option<&str> {
        match self {
            Declaration::Local(l) => l.declared_name.as_deref(),
            Declaration::Import(i) => Some(&i.declared_name),
        }
    }

    pub fn references(&self) -> &[RegionPointer] {
        match self {
            Declaration::Local(l) => &l.references,
            Declaration::Import(i) => &i.references,
        }
    }

    pub fn references_mut(&mut self) -> &mut Vec<RegionPointer> {
        match self {
            Declaration::Local(l) => &mut l.references,
            Declaration::Import(i) => &mut i.references,
        }
    }
}

/// A declaration whose right-hand side lives in this module.
///
/// `declared_name` is `None` for an anonymous `export default`; the rewriter
/// synthesizes a bundle-unique name for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDeclaration {
    pub declared_name: Option<String>,
    /// Reference regions for this binding, including its own declarator
    /// identifier.
    pub references: Vec<RegionPointer>,
    /// Set when this region is one declarator of a multi-declarator
    /// statement; points at the enclosing declaration region.
    pub declarator_of: Option<RegionPointer>,
    pub original: Option<OriginalBinding>,
}

/// A declaration introduced by an import statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportDeclaration {
    pub declared_name: String,
    pub references: Vec<RegionPointer>,
    pub imported_name: ImportedName,
    pub import_index: usize,
}

/// Statement-level role of an `Import` region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportType {
    Reexport,
    ExportAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegionKind {
    Document,
    Declaration(Declaration),
    Reference,
    Import {
        import_index: usize,
        is_dynamic: bool,
        export_type: Option<ExportType>,
    },
    General,
}

/// One syntactic span of a module.
///
/// `start` and `end` are cushions of literal text measured relative to the
/// enclosing context: `start` counts the characters between the previous
/// sibling (or the parent's content start) and this region's own content.
/// For a leaf region `end` is the length of the region's own text; for an
/// interior region it is the trailing literal text after its last child.
/// `position` is the absolute content offset, assigned by
/// [`assign_region_positions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRegion {
    pub position: usize,
    pub start: usize,
    pub end: usize,
    pub first_child: Option<RegionPointer>,
    pub next_sibling: Option<RegionPointer>,
    pub depends_on: Vec<RegionRef>,
    pub kind: RegionKind,
    pub original: Option<RegionProvenance>,
}

impl CodeRegion {
    pub fn is_document(&self) -> bool {
        matches!(self.kind, RegionKind::Document)
    }

    pub fn declaration(&self) -> Option<&Declaration> {
        match &self.kind {
            RegionKind::Declaration(d) => Some(d),
            _ => None,
        }
    }

    pub fn declaration_mut(&mut self) -> Option<&mut Declaration> {
        match &mut self.kind {
            RegionKind::Declaration(d) => Some(d),
            _ => None,
        }
    }

    /// The sole dependency of a reference region: its declaration.
    pub fn reference_target(&self) -> Option<RegionRef> {
        match self.kind {
            RegionKind::Reference => self.depends_on.first().copied(),
            _ => None,
        }
    }
}

/// Absolute extent of a region within its module source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionExtent {
    /// Where the start cushion begins.
    pub outer_start: usize,
    /// Where the region's own content begins (`outer_start + start`).
    pub content_start: usize,
    /// One past the last character covered by this region.
    pub outer_end: usize,
}

/// Compute absolute extents for every region by walking the document tree.
///
/// Sibling extents are contiguous: a region's `outer_start` is its previous
/// sibling's `outer_end`, and the first child starts at its parent's content
/// start.
pub fn region_extents(regions: &[CodeRegion]) -> Vec<RegionExtent> {
    let mut extents = vec![
        RegionExtent {
            outer_start: 0,
            content_start: 0,
            outer_end: 0,
        };
        regions.len()
    ];
    if !regions.is_empty() {
        walk_extent(regions, DOCUMENT_POINTER, 0, &mut extents);
    }
    extents
}

fn walk_extent(
    regions: &[CodeRegion],
    pointer: RegionPointer,
    outer_start: usize,
    extents: &mut [RegionExtent],
) -> usize {
    let region = &regions[pointer];
    let content_start = outer_start + region.start;
    let mut cursor = content_start;
    if let Some(first) = region.first_child {
        let mut child = Some(first);
        while let Some(c) = child {
            cursor = walk_extent(regions, c, cursor, extents);
            child = regions[c].next_sibling;
        }
    }
    let outer_end = if region.first_child.is_some() {
        cursor + region.end
    } else {
        content_start + region.end
    };
    extents[pointer] = RegionExtent {
        outer_start,
        content_start,
        outer_end,
    };
    outer_end
}

/// Assign the `position` field of every region from its computed extent.
/// Called on serializer output after the merged region array is built.
pub fn assign_region_positions(regions: &mut [CodeRegion]) {
    let extents = region_extents(regions);
    for (region, extent) in regions.iter_mut().zip(extents.iter()) {
        region.position = extent.content_start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(start: usize, end: usize, next: Option<RegionPointer>) -> CodeRegion {
        CodeRegion {
            position: 0,
            start,
            end,
            first_child: None,
            next_sibling: next,
            depends_on: Vec::new(),
            kind: RegionKind::General,
            original: None,
        }
    }

    #[test]
    fn test_extents_single_statement() {
        // source: "const x = 1;"
        //   document -> declaration("const x = 1;") -> reference("x")
        let regions = vec![
            CodeRegion {
                position: 0,
                start: 0,
                end: 0,
                first_child: Some(1),
                next_sibling: None,
                depends_on: Vec::new(),
                kind: RegionKind::Document,
                original: None,
            },
            CodeRegion {
                position: 0,
                start: 0,
                end: 6, // " = 1;"  + trailing after reference
                first_child: Some(2),
                next_sibling: None,
                depends_on: Vec::new(),
                kind: RegionKind::General,
                original: None,
            },
            leaf(6, 1, None), // "const " then "x"
        ];
        let extents = region_extents(&regions);
        assert_eq!(extents[2].content_start, 6);
        assert_eq!(extents[2].outer_end, 7);
        assert_eq!(extents[1].outer_end, 13);
        assert_eq!(extents[0].outer_end, 13);
    }

    #[test]
    fn test_extents_siblings_are_contiguous() {
        let regions = vec![
            CodeRegion {
                position: 0,
                start: 0,
                end: 0,
                first_child: Some(1),
                next_sibling: None,
                depends_on: Vec::new(),
                kind: RegionKind::Document,
                original: None,
            },
            leaf(0, 5, Some(2)),
            leaf(1, 5, None),
        ];
        let extents = region_extents(&regions);
        assert_eq!(extents[1].outer_end, 5);
        assert_eq!(extents[2].outer_start, 5);
        assert_eq!(extents[2].content_start, 6);
        assert_eq!(extents[2].outer_end, 11);
    }

    #[test]
    fn test_assign_positions() {
        let mut regions = vec![
            CodeRegion {
                position: 0,
                start: 0,
                end: 0,
                first_child: Some(1),
                next_sibling: None,
                depends_on: Vec::new(),
                kind: RegionKind::Document,
                original: None,
            },
            leaf(3, 4, None),
        ];
        assign_region_positions(&mut regions);
        assert_eq!(regions[1].position, 3);
        assert_eq!(regions[0].position, 0);
    }
}
