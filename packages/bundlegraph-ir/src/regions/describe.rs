//! Module descriptions
//!
//! A `ModuleDescription` is the parse-time summary of one ES module: its
//! region arena plus indexes over module-scope bindings, exports, and import
//! statements. Descriptions are produced once by the describe pass and are
//! never mutated afterwards; all editing happens on a copy-on-write overlay
//! (the `RegionEditor`).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::region::{CodeRegion, Declaration, ImportedName, RegionKind, RegionPointer};

/// A module-scope binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NameDescription {
    /// Declared locally; `pointer` is the declaration region.
    Local { pointer: RegionPointer },
    /// Introduced by an import statement.
    Import {
        pointer: RegionPointer,
        import_index: usize,
        imported_name: ImportedName,
    },
}

impl NameDescription {
    pub fn pointer(&self) -> RegionPointer {
        match self {
            NameDescription::Local { pointer } => *pointer,
            NameDescription::Import { pointer, .. } => *pointer,
        }
    }
}

/// Key of one export entry.
///
/// `AllFrom` keys an `export * from "..."` statement by its specifier; all
/// other exports are keyed by their exported name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExportKey {
    Named(String),
    AllFrom(String),
}

impl ExportKey {
    pub fn named(name: impl Into<String>) -> Self {
        ExportKey::Named(name.into())
    }

    pub fn as_named(&self) -> Option<&str> {
        match self {
            ExportKey::Named(n) => Some(n),
            ExportKey::AllFrom(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExportDescription {
    /// Exports a binding declared in this module. `export_region` is the
    /// statement (or specifier) region that carries the `export` syntax.
    Local {
        name: String,
        export_region: RegionPointer,
    },
    /// Re-exports a binding of another module without binding it locally.
    Reexport {
        import_index: usize,
        name: ImportedName,
        export_region: RegionPointer,
    },
    /// `export * from "..."`.
    ExportAll {
        import_index: usize,
        export_region: RegionPointer,
    },
}

impl ExportDescription {
    pub fn export_region(&self) -> RegionPointer {
        match self {
            ExportDescription::Local { export_region, .. }
            | ExportDescription::Reexport { export_region, .. }
            | ExportDescription::ExportAll { export_region, .. } => *export_region,
        }
    }
}

/// One import statement of the module, in source order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportDescription {
    pub specifier: String,
    pub is_dynamic: bool,
    /// The statement region (kind `Import`).
    pub region: RegionPointer,
    /// The string-literal region of the specifier, rewritten for dynamic
    /// imports.
    pub specifier_region: Option<RegionPointer>,
}

/// Immutable parse-time description of one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescription {
    pub regions: Vec<CodeRegion>,
    /// Module-scope bindings in declaration order.
    pub names: IndexMap<String, NameDescription>,
    /// Exports in statement order.
    pub exports: IndexMap<ExportKey, ExportDescription>,
    /// Import statements in source order; `import_index` fields index here.
    pub imports: Vec<ImportDescription>,
}

impl ModuleDescription {
    /// Description of a module with no regions beyond its document.
    pub fn empty() -> Self {
        ModuleDescription {
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
            names: IndexMap::new(),
            exports: IndexMap::new(),
            imports: Vec::new(),
        }
    }

    /// The declaration region for a module-scope binding.
    pub fn declaration_pointer(&self, name: &str) -> Option<RegionPointer> {
        self.names.get(name).map(|n| n.pointer())
    }

    pub fn declaration(&self, name: &str) -> Option<(&Declaration, RegionPointer)> {
        let pointer = self.declaration_pointer(name)?;
        self.regions[pointer].declaration().map(|d| (d, pointer))
    }

    /// The export entry whose local binding is `name`.
    pub fn export_of_local(&self, name: &str) -> Option<(&ExportKey, &ExportDescription)> {
        self.exports.iter().find(|(_, desc)| {
            matches!(desc, ExportDescription::Local { name: local, .. } if local == name)
        })
    }

    /// Iterate declaration regions, with pointers.
    pub fn declarations(&self) -> impl Iterator<Item = (RegionPointer, &Declaration)> {
        self.regions
            .iter()
            .enumerate()
            .filter_map(|(pointer, region)| region.declaration().map(|d| (pointer, d)))
    }
}

/// Rebuild the name index from a region array. Used when deriving the
/// description of serializer output.
pub fn names_from_regions(regions: &[CodeRegion]) -> IndexMap<String, NameDescription> {
    let mut names = IndexMap::new();
    for (pointer, region) in regions.iter().enumerate() {
        match region.declaration() {
            Some(Declaration::Local(local)) => {
                if let Some(name) = &local.declared_name {
                    names.insert(name.clone(), NameDescription::Local { pointer });
                }
            }
            Some(Declaration::Import(import)) => {
                names.insert(
                    import.declared_name.clone(),
                    NameDescription::Import {
                        pointer,
                        import_index: import.import_index,
                        imported_name: import.imported_name.clone(),
                    },
                );
            }
            None => {}
        }
    }
    names
}
