//! bundlegraph-ir
//!
//! The module-combination engine of the bundler: given a set of resolved ES
//! modules assigned to output bundles, it decides which code regions survive
//! (tree-shaking), which package version wins at each consumption point,
//! renames bindings so merged module scopes cannot collide, and serializes
//! the surviving regions back into a single module per bundle.
//!
//! Layout:
//! - `regions/`      : region arena model, module descriptions, the editor
//! - `module_graph`  : URL-keyed arena of resolved modules + bundle assignments
//! - `semver_range`  : range parsing, satisfaction, intersection
//! - `resolution`    : per-bundle package-version resolution
//! - `walker`        : reachability walk + editor assignment
//! - `rewrite`       : scope merging, name assignment, bundle serialization

pub mod errors;
pub mod module_graph;
pub mod regions;
pub mod resolution;
pub mod semver_range;
pub mod walker;

pub mod rewrite;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use errors::{IrError, Result};
pub use module_graph::{
    assignment_for_module, own_assignments, resolve_declaration, BundleAssignment,
    DeclarationSource, ImportTarget, ModuleGraph, ModuleResolution,
};
pub use regions::{
    CodeRegion, Declaration, ImportedName, ModuleDescription, RegionEditor, RegionPointer,
    RegionRef, DOCUMENT_POINTER,
};
pub use resolution::{
    CatalogUrlIndex, ConsumedDependency, Dependencies, Dependency, DependencyResolver, LockFile,
    PackageCatalog, PkgInfo, ResolvedDependency,
};
pub use rewrite::{
    combine_modules, finish_bundle, maybe_relative_url, BundleSource, HeadState, ModuleRewriter,
};
pub use walker::{exposed_regions, ExposedRegionInfo, RegionWalker};
