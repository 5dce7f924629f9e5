//! Module fixtures for tests
//!
//! The source-to-region describe pass lives outside this crate, so tests
//! assemble `(source, ModuleDescription)` pairs through `ModuleBuilder`. The
//! builder writes the source text and its region tree together, which keeps
//! cushions consistent by construction; `build()` asserts that the region
//! extents cover the text exactly.

use indexmap::IndexMap;

use crate::regions::describe::{
    ExportDescription, ExportKey, ImportDescription, ModuleDescription, NameDescription,
};
use crate::regions::region::{
    assign_region_positions, region_extents, CodeRegion, Declaration, ExportType,
    ImportDeclaration, ImportedName, LocalDeclaration, RegionKind, RegionPointer, RegionRef,
    DOCUMENT_POINTER,
};

#[derive(Default)]
pub struct ModuleBuilder {
    source: String,
    regions: Vec<CodeRegion>,
    names: IndexMap<String, NameDescription>,
    exports: IndexMap<ExportKey, ExportDescription>,
    imports: Vec<ImportDescription>,
    doc_children: Vec<RegionPointer>,
    doc_deps: Vec<RegionRef>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        let mut builder = ModuleBuilder::default();
        builder.regions.push(CodeRegion {
            position: 0,
            start: 0,
            end: 0,
            first_child: None,
            next_sibling: None,
            depends_on: Vec::new(),
            kind: RegionKind::Document,
            original: None,
        });
        builder
    }

    fn gap(&mut self) -> usize {
        if self.doc_children.is_empty() {
            0
        } else {
            self.source.push('\n');
            1
        }
    }

    fn push(&mut self, region: CodeRegion) -> RegionPointer {
        self.regions.push(region);
        self.regions.len() - 1
    }

    fn blank(kind: RegionKind, start: usize) -> CodeRegion {
        CodeRegion {
            position: 0,
            start,
            end: 0,
            first_child: None,
            next_sibling: None,
            depends_on: Vec::new(),
            kind,
            original: None,
        }
    }

    fn link_children(&mut self, parent: RegionPointer, children: &[RegionPointer]) {
        self.regions[parent].first_child = children.first().copied();
        for pair in children.windows(2) {
            self.regions[pair[0]].next_sibling = Some(pair[1]);
        }
    }

    /// A reference region for `name`, wired both ways to its declaration.
    fn reference(&mut self, name: &str, start: usize) -> RegionPointer {
        let declaration = self
            .names
            .get(name)
            .unwrap_or_else(|| panic!("fixture references undeclared binding '{}'", name))
            .pointer();
        let reference = self.push(CodeRegion {
            end: name.len(),
            depends_on: vec![RegionRef::Local(declaration)],
            ..Self::blank(RegionKind::Reference, start)
        });
        self.regions[declaration]
            .declaration_mut()
            .expect("names point at declaration regions")
            .references_mut()
            .push(reference);
        reference
    }

    /// Split `code` into cushion/reference segments for the given occurrence
    /// order of `refs`.
    fn scan(code: &str, refs: &[&str]) -> (Vec<(usize, String)>, String) {
        let mut segments = Vec::new();
        let mut cursor = 0usize;
        for name in refs {
            let found = code[cursor..]
                .find(name)
                .unwrap_or_else(|| panic!("'{}' not found in '{}'", name, code));
            segments.push((found, (*name).to_string()));
            cursor += found + name.len();
        }
        (segments, code[cursor..].to_string())
    }

    /// `const <name> = <init>;`, optionally wrapped in `export `.
    /// `refs` lists bindings the initializer consumes, in occurrence order.
    pub fn const_decl(mut self, name: &str, init: &str, refs: &[&str], exported: bool) -> Self {
        let gap = self.gap();
        if exported {
            self.source.push_str("export ");
        }
        self.source
            .push_str(&format!("const {} = {};", name, init));

        let statement = self.push(Self::blank(RegionKind::General, gap));
        let mut parent = statement;
        if exported {
            let inner = self.push(CodeRegion {
                depends_on: vec![RegionRef::Local(statement)],
                ..Self::blank(RegionKind::General, "export ".len())
            });
            self.link_children(statement, &[inner]);
            parent = inner;
        }

        let declaration = self.push(Self::blank(
            RegionKind::Declaration(Declaration::Local(LocalDeclaration {
                declared_name: Some(name.to_string()),
                references: Vec::new(),
                declarator_of: None,
                original: None,
            })),
            "const ".len(),
        ));
        self.regions[declaration]
            .depends_on
            .push(RegionRef::Local(parent));
        self.link_children(parent, &[declaration]);
        self.names
            .insert(name.to_string(), NameDescription::Local {
                pointer: declaration,
            });

        let mut children = Vec::new();
        let identifier = self.reference(name, 0);
        children.push(identifier);

        let (segments, tail) = Self::scan(init, refs);
        for (index, (cushion, ref_name)) in segments.into_iter().enumerate() {
            let start = if index == 0 {
                " = ".len() + cushion
            } else {
                cushion
            };
            let reference = self.reference(&ref_name, start);
            children.push(reference);
        }
        let trailing = if refs.is_empty() {
            format!(" = {};", init)
        } else {
            format!("{};", tail)
        };
        self.regions[declaration].end = trailing.len();
        let reference_deps: Vec<RegionRef> =
            children.iter().map(|p| RegionRef::Local(*p)).collect();
        self.regions[declaration].depends_on.extend(reference_deps);
        self.link_children(declaration, &children);

        if exported {
            self.exports.insert(
                ExportKey::named(name),
                ExportDescription::Local {
                    name: name.to_string(),
                    export_region: statement,
                },
            );
        }
        self.doc_children.push(statement);
        self
    }

    /// `export default <expr>;` with an anonymous binding registered under
    /// the name `default`.
    pub fn export_default(mut self, expr: &str) -> Self {
        let gap = self.gap();
        self.source.push_str(&format!("export default {};", expr));
        let statement = self.push(Self::blank(RegionKind::General, gap));
        let declaration = self.push(CodeRegion {
            end: expr.len() + 1,
            depends_on: vec![RegionRef::Local(statement)],
            ..Self::blank(
                RegionKind::Declaration(Declaration::Local(LocalDeclaration {
                    declared_name: None,
                    references: Vec::new(),
                    declarator_of: None,
                    original: None,
                })),
                "export default ".len(),
            )
        });
        self.link_children(statement, &[declaration]);
        self.names.insert(
            "default".to_string(),
            NameDescription::Local {
                pointer: declaration,
            },
        );
        self.exports.insert(
            ExportKey::named("default"),
            ExportDescription::Local {
                name: "default".to_string(),
                export_region: statement,
            },
        );
        self.doc_children.push(statement);
        self
    }

    /// `import { a, b as c } from "<specifier>";`
    pub fn import(mut self, specifier: &str, named: &[(&str, &str)]) -> Self {
        let gap = self.gap();
        let import_index = self.imports.len();
        let specs: Vec<String> = named
            .iter()
            .map(|(imported, local)| {
                if imported == local {
                    (*imported).to_string()
                } else {
                    format!("{} as {}", imported, local)
                }
            })
            .collect();
        self.source.push_str(&format!(
            "import {{ {} }} from \"{}\";",
            specs.join(", "),
            specifier
        ));

        let statement = self.push(CodeRegion {
            end: format!(" }} from \"{}\";", specifier).len(),
            ..Self::blank(
                RegionKind::Import {
                    import_index,
                    is_dynamic: false,
                    export_type: None,
                },
                gap,
            )
        });
        let mut children = Vec::new();
        for (index, (imported, local)) in named.iter().enumerate() {
            let declaration = self.push(Self::blank(
                RegionKind::Declaration(Declaration::Import(ImportDeclaration {
                    declared_name: (*local).to_string(),
                    references: Vec::new(),
                    imported_name: ImportedName::named(*imported),
                    import_index,
                })),
                if index == 0 { "import { ".len() } else { ", ".len() },
            ));
            self.names.insert(
                (*local).to_string(),
                NameDescription::Import {
                    pointer: declaration,
                    import_index,
                    imported_name: ImportedName::named(*imported),
                },
            );
            let reference = self.reference(
                local,
                if imported == local {
                    0
                } else {
                    imported.len() + " as ".len()
                },
            );
            self.regions[declaration]
                .depends_on
                .push(RegionRef::Local(reference));
            self.link_children(declaration, &[reference]);
            children.push(declaration);
        }
        self.link_children(statement, &children);
        self.imports.push(ImportDescription {
            specifier: specifier.to_string(),
            is_dynamic: false,
            region: statement,
            specifier_region: None,
        });
        self.doc_children.push(statement);
        self
    }

    /// `import * as <local> from "<specifier>";`
    pub fn import_namespace(mut self, specifier: &str, local: &str) -> Self {
        let gap = self.gap();
        let import_index = self.imports.len();
        self.source
            .push_str(&format!("import * as {} from \"{}\";", local, specifier));
        let statement = self.push(CodeRegion {
            end: format!(" from \"{}\";", specifier).len(),
            ..Self::blank(
                RegionKind::Import {
                    import_index,
                    is_dynamic: false,
                    export_type: None,
                },
                gap,
            )
        });
        let declaration = self.push(Self::blank(
            RegionKind::Declaration(Declaration::Import(ImportDeclaration {
                declared_name: local.to_string(),
                references: Vec::new(),
                imported_name: ImportedName::Namespace,
                import_index,
            })),
            "import ".len(),
        ));
        self.names.insert(
            local.to_string(),
            NameDescription::Import {
                pointer: declaration,
                import_index,
                imported_name: ImportedName::Namespace,
            },
        );
        let reference = self.reference(local, "* as ".len());
        self.regions[declaration]
            .depends_on
            .push(RegionRef::Local(reference));
        self.link_children(declaration, &[reference]);
        self.link_children(statement, &[declaration]);
        self.imports.push(ImportDescription {
            specifier: specifier.to_string(),
            is_dynamic: false,
            region: statement,
            specifier_region: None,
        });
        self.doc_children.push(statement);
        self
    }

    /// `import "<specifier>";` — a side-effect-only import the document
    /// depends on.
    pub fn import_side_effect(mut self, specifier: &str) -> Self {
        let gap = self.gap();
        let import_index = self.imports.len();
        let text = format!("import \"{}\";", specifier);
        self.source.push_str(&text);
        let statement = self.push(CodeRegion {
            end: text.len(),
            ..Self::blank(
                RegionKind::Import {
                    import_index,
                    is_dynamic: false,
                    export_type: None,
                },
                gap,
            )
        });
        self.imports.push(ImportDescription {
            specifier: specifier.to_string(),
            is_dynamic: false,
            region: statement,
            specifier_region: None,
        });
        self.doc_deps.push(RegionRef::Local(statement));
        self.doc_children.push(statement);
        self
    }

    /// `import("<specifier>");` — a dynamic import whose specifier region
    /// gets rewritten to the resolved bundle.
    pub fn dynamic_import(mut self, specifier: &str) -> Self {
        let gap = self.gap();
        let import_index = self.imports.len();
        self.source.push_str(&format!("import(\"{}\");", specifier));
        let statement = self.push(CodeRegion {
            end: ");".len(),
            ..Self::blank(
                RegionKind::Import {
                    import_index,
                    is_dynamic: true,
                    export_type: None,
                },
                gap,
            )
        });
        let specifier_region = self.push(CodeRegion {
            end: specifier.len() + 2,
            ..Self::blank(RegionKind::General, "import(".len())
        });
        self.regions[statement]
            .depends_on
            .push(RegionRef::Local(specifier_region));
        self.link_children(statement, &[specifier_region]);
        self.imports.push(ImportDescription {
            specifier: specifier.to_string(),
            is_dynamic: true,
            region: statement,
            specifier_region: Some(specifier_region),
        });
        self.doc_deps.push(RegionRef::Local(statement));
        self.doc_children.push(statement);
        self
    }

    /// `export { a as b } from "<specifier>";`
    pub fn reexport(mut self, specifier: &str, names: &[(&str, &str)]) -> Self {
        let gap = self.gap();
        let import_index = self.imports.len();
        let specs: Vec<String> = names
            .iter()
            .map(|(remote, exported)| {
                if remote == exported {
                    (*remote).to_string()
                } else {
                    format!("{} as {}", remote, exported)
                }
            })
            .collect();
        let text = format!(
            "export {{ {} }} from \"{}\";",
            specs.join(", "),
            specifier
        );
        self.source.push_str(&text);
        let statement = self.push(CodeRegion {
            end: text.len(),
            ..Self::blank(
                RegionKind::Import {
                    import_index,
                    is_dynamic: false,
                    export_type: Some(ExportType::Reexport),
                },
                gap,
            )
        });
        for (remote, exported) in names {
            self.exports.insert(
                ExportKey::named(*exported),
                ExportDescription::Reexport {
                    import_index,
                    name: ImportedName::named(*remote),
                    export_region: statement,
                },
            );
        }
        self.imports.push(ImportDescription {
            specifier: specifier.to_string(),
            is_dynamic: false,
            region: statement,
            specifier_region: None,
        });
        self.doc_children.push(statement);
        self
    }

    /// `export * from "<specifier>";`
    pub fn export_all(mut self, specifier: &str) -> Self {
        let gap = self.gap();
        let import_index = self.imports.len();
        let text = format!("export * from \"{}\";", specifier);
        self.source.push_str(&text);
        let statement = self.push(CodeRegion {
            end: text.len(),
            ..Self::blank(
                RegionKind::Import {
                    import_index,
                    is_dynamic: false,
                    export_type: Some(ExportType::ExportAll),
                },
                gap,
            )
        });
        self.exports.insert(
            ExportKey::AllFrom(specifier.to_string()),
            ExportDescription::ExportAll {
                import_index,
                export_region: statement,
            },
        );
        self.imports.push(ImportDescription {
            specifier: specifier.to_string(),
            is_dynamic: false,
            region: statement,
            specifier_region: None,
        });
        self.doc_children.push(statement);
        self
    }

    /// `export {};` — the bare ES-module marker, declaring nothing.
    pub fn export_empty(mut self) -> Self {
        let gap = self.gap();
        let text = "export {};";
        self.source.push_str(text);
        let statement = self.push(CodeRegion {
            end: text.len(),
            ..Self::blank(RegionKind::General, gap)
        });
        self.doc_children.push(statement);
        self
    }

    /// `export { x as y };` for bindings declared elsewhere in the module.
    pub fn export_named(mut self, names: &[(&str, &str)]) -> Self {
        let gap = self.gap();
        let specs: Vec<String> = names
            .iter()
            .map(|(local, exported)| {
                if local == exported {
                    (*local).to_string()
                } else {
                    format!("{} as {}", local, exported)
                }
            })
            .collect();
        let text = format!("export {{ {} }};", specs.join(", "));
        self.source.push_str(&text);
        let statement = self.push(CodeRegion {
            end: text.len(),
            ..Self::blank(RegionKind::General, gap)
        });
        for (local, exported) in names {
            self.exports.insert(
                ExportKey::named(*exported),
                ExportDescription::Local {
                    name: (*local).to_string(),
                    export_region: statement,
                },
            );
        }
        self.doc_children.push(statement);
        self
    }

    /// A side-effectful statement the document depends on; `refs` lists the
    /// bindings it consumes, in occurrence order.
    pub fn side_effect(mut self, code: &str, refs: &[&str]) -> Self {
        let gap = self.gap();
        self.source.push_str(code);
        let statement = self.push(Self::blank(RegionKind::General, gap));
        let (segments, tail) = Self::scan(code, refs);
        let mut children = Vec::new();
        for (cushion, name) in segments {
            let reference = self.reference(&name, cushion);
            children.push(reference);
        }
        self.regions[statement].end = if refs.is_empty() { code.len() } else { tail.len() };
        let deps: Vec<RegionRef> = children.iter().map(|p| RegionRef::Local(*p)).collect();
        self.regions[statement].depends_on = deps;
        self.link_children(statement, &children);
        self.doc_deps.push(RegionRef::Local(statement));
        self.doc_children.push(statement);
        self
    }

    /// `const a = 1, b = 2;` — one statement, several declarators.
    pub fn multi_const(mut self, declarators: &[(&str, &str)]) -> Self {
        let gap = self.gap();
        let parts: Vec<String> = declarators
            .iter()
            .map(|(name, init)| format!("{} = {}", name, init))
            .collect();
        self.source
            .push_str(&format!("const {};", parts.join(", ")));
        let statement = self.push(CodeRegion {
            end: ";".len(),
            ..Self::blank(RegionKind::General, gap)
        });
        let mut children = Vec::new();
        for (index, (name, init)) in declarators.iter().enumerate() {
            let declaration = self.push(CodeRegion {
                end: format!(" = {}", init).len(),
                depends_on: vec![RegionRef::Local(statement)],
                ..Self::blank(
                    RegionKind::Declaration(Declaration::Local(LocalDeclaration {
                        declared_name: Some((*name).to_string()),
                        references: Vec::new(),
                        declarator_of: Some(statement),
                        original: None,
                    })),
                    if index == 0 { "const ".len() } else { ", ".len() },
                )
            });
            self.names.insert(
                (*name).to_string(),
                NameDescription::Local {
                    pointer: declaration,
                },
            );
            let reference = self.reference(name, 0);
            self.regions[declaration]
                .depends_on
                .push(RegionRef::Local(reference));
            self.link_children(declaration, &[reference]);
            children.push(declaration);
        }
        self.link_children(statement, &children);
        self.doc_children.push(statement);
        self
    }

    pub fn build(mut self) -> (String, ModuleDescription) {
        let doc_children = std::mem::take(&mut self.doc_children);
        self.link_children(DOCUMENT_POINTER, &doc_children);
        self.regions[DOCUMENT_POINTER].depends_on = std::mem::take(&mut self.doc_deps);
        if doc_children.is_empty() {
            self.regions[DOCUMENT_POINTER].end = self.source.len();
        }
        assign_region_positions(&mut self.regions);
        let extents = region_extents(&self.regions);
        assert_eq!(
            extents[DOCUMENT_POINTER].outer_end,
            self.source.len(),
            "fixture cushions must cover the source text exactly"
        );
        (
            self.source,
            ModuleDescription {
                regions: self.regions,
                names: self.names,
                exports: self.exports,
                imports: self.imports,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_decl_round_trip() {
        let (source, desc) = ModuleBuilder::new()
            .const_decl("x", "1", &[], false)
            .const_decl("y", "x + 1", &["x"], true)
            .build();
        assert_eq!(source, "const x = 1;\nexport const y = x + 1;");
        assert_eq!(desc.names.len(), 2);
        assert!(desc.exports.contains_key(&ExportKey::named("y")));
    }

    #[test]
    fn test_references_are_recorded_on_declarations() {
        let (_, desc) = ModuleBuilder::new()
            .const_decl("x", "1", &[], false)
            .const_decl("y", "x + x", &["x", "x"], false)
            .build();
        let (_, declaration) = desc.declaration("x").unwrap();
        let references = desc.regions[declaration]
            .declaration()
            .unwrap()
            .references();
        // its own identifier plus the two uses in y's initializer
        assert_eq!(references.len(), 3);
    }

    #[test]
    fn test_import_fixture_shape() {
        let (source, desc) = ModuleBuilder::new()
            .import("./a.js", &[("x", "x"), ("y", "z")])
            .build();
        assert_eq!(source, "import { x, y as z } from \"./a.js\";");
        assert_eq!(desc.imports.len(), 1);
        assert!(matches!(
            desc.names.get("z"),
            Some(NameDescription::Import { .. })
        ));
    }

    #[test]
    fn test_side_effect_depends_on_document() {
        let (_, desc) = ModuleBuilder::new()
            .const_decl("x", "1", &[], false)
            .side_effect("console.log(x);", &["x"])
            .build();
        assert_eq!(desc.regions[DOCUMENT_POINTER].depends_on.len(), 1);
    }

    #[test]
    fn test_empty_module() {
        let (source, desc) = ModuleBuilder::new().build();
        assert!(source.is_empty());
        assert_eq!(desc.regions.len(), 1);
    }
}
