//! Package-version resolution
//!
//! A bundle may consume the same package from several declaration sites,
//! each annotated with its own semver range. The resolver picks one
//! "winning" version per consumption cluster: candidates are ranked by how
//! many consumption ranges they satisfy (ties broken by highest version) and
//! selected greedily until every consumption point is accounted for.
//!
//! The greedy selection will not look past local maxima when optimizing for
//! reuse; that behavior is documented and preserved, since consumers depend
//! on its specific choices.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;
use url::Url;

use crate::errors::{IrError, Result};
use crate::module_graph::{
    resolve_declaration, BundleAssignment, DeclarationSource, ModuleGraph,
};
use crate::regions::describe::NameDescription;
use crate::regions::region::{Declaration, ImportedName, RegionKind, RegionPointer};
use crate::semver_range::{coerce_version, intersect_ranges, is_valid_range, range_satisfies};

/// The logical package identity behind a concrete bundle URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgInfo {
    pub pkg_url: Url,
    pub version: String,
}

/// Maps a concrete bundle URL back to its package identity and version.
pub trait PackageCatalog: Send + Sync {
    fn pkg_info(&self, bundle_url: &Url) -> Option<PkgInfo>;
}

/// Catalog layout: `https://host/pkgs/<registry>/<name>/<version>/<hash>/...`
/// with `@scope/name` occupying two path segments.
#[derive(Debug, Default)]
pub struct CatalogUrlIndex;

impl PackageCatalog for CatalogUrlIndex {
    fn pkg_info(&self, bundle_url: &Url) -> Option<PkgInfo> {
        let segments: Vec<&str> = bundle_url.path_segments()?.collect();
        let pkgs = segments.iter().position(|s| *s == "pkgs")?;
        segments.get(pkgs + 1)?; // registry segment must exist
        let mut name_end = pkgs + 2;
        let first = segments.get(name_end)?;
        if first.starts_with('@') {
            name_end += 1;
        }
        let version = segments.get(name_end + 1)?;
        if coerce_version(version).is_none() {
            return None;
        }
        let mut pkg_url = bundle_url.clone();
        pkg_url.set_path(&format!("/{}/", segments[pkgs..=name_end].join("/")));
        Some(PkgInfo {
            pkg_url,
            version: (*version).to_string(),
        })
    }
}

/// One direct dependency of the project, from its entrypoints configuration.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub url: Url,
    pub range: String,
}

/// pkg name -> declared dependency
pub type Dependencies = IndexMap<String, Dependency>;

/// specifier -> resolved bundle href
pub type LockFile = IndexMap<String, String>;

/// The declaration the consumption point actually imports, when it resolved
/// to a concrete site inside the bundle's module set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedSource {
    pub pointer: RegionPointer,
    pub declared_in: Url,
}

/// One site that consumes some version of a package.
#[derive(Debug, Clone)]
pub struct ConsumedDependency {
    pub imported_source: Option<ImportedSource>,
    pub imported_as: ImportedName,
    pub consumed_by: Url,
    pub consumed_by_pointer: RegionPointer,
    pub bundle_href: Url,
    pub range: String,
}

/// A consumption point collapsed into a winning group it did not itself win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObviatedDependency {
    pub module_href: Url,
    pub pointer: RegionPointer,
}

/// The winning version for one consumption cluster.
#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub imported_source: Option<ImportedSource>,
    pub imported_as: ImportedName,
    pub consumed_by: Url,
    pub consumed_by_pointer: RegionPointer,
    pub bundle_href: Url,
    /// Intersection of every satisfied range, or the verbatim non-semver
    /// specifier.
    pub range: String,
    pub obviated: Vec<ObviatedDependency>,
}

impl ResolvedDependency {
    /// Does this resolution cover the given consumption region, either as
    /// the winner or as one of its obviated sites?
    pub fn covers(&self, module: &Url, pointer: RegionPointer) -> bool {
        (&self.consumed_by == module && self.consumed_by_pointer == pointer)
            || self
                .obviated
                .iter()
                .any(|o| &o.module_href == module && o.pointer == pointer)
    }
}

/// Result of resolving a declaration with package-version redirects applied.
#[derive(Debug, Clone)]
pub struct ResolverSource {
    pub source: DeclarationSource,
    /// The package resolution that redirected (or confirmed) the site, when
    /// one applied.
    pub resolution: Option<ResolvedDependency>,
}

pub struct DependencyResolver {
    graph: Arc<ModuleGraph>,
    catalog: Arc<dyn PackageCatalog>,
    assignments: Arc<Vec<BundleAssignment>>,
    bundle: Url,
    /// pkg href -> consumption points
    consumed: IndexMap<String, Vec<ConsumedDependency>>,
    cache: IndexMap<String, Vec<ResolvedDependency>>,
}

impl DependencyResolver {
    pub fn new(
        dependencies: &Dependencies,
        lock_file: Option<&LockFile>,
        assignments: Arc<Vec<BundleAssignment>>,
        bundle: Url,
        graph: Arc<ModuleGraph>,
        catalog: Arc<dyn PackageCatalog>,
    ) -> Result<Self> {
        let consumed = gather_dependencies(
            dependencies,
            lock_file,
            &assignments,
            &bundle,
            &graph,
            catalog.as_ref(),
        )?;
        Ok(DependencyResolver {
            graph,
            catalog,
            assignments,
            bundle,
            consumed,
            cache: IndexMap::new(),
        })
    }

    pub fn graph(&self) -> &Arc<ModuleGraph> {
        &self.graph
    }

    pub fn catalog(&self) -> &Arc<dyn PackageCatalog> {
        &self.catalog
    }

    /// The winning resolutions for one package, memoized per bundle build.
    pub fn resolutions_for_pkg(&mut self, pkg_href: &str) -> Result<Vec<ResolvedDependency>> {
        if let Some(cached) = self.cache.get(pkg_href) {
            return Ok(cached.clone());
        }
        let resolutions = match self.consumed.get(pkg_href) {
            Some(r) if !r.is_empty() => r.clone(),
            _ => return Ok(Vec::new()),
        };

        // bundle href -> consumption indices whose range the version behind
        // that href satisfies; a version always satisfies its own range
        let mut satisfactions: IndexMap<Url, BTreeSet<usize>> = IndexMap::new();
        for (version_index, consumption) in resolutions.iter().enumerate() {
            let info = self
                .catalog
                .pkg_info(&consumption.bundle_href)
                .ok_or_else(|| {
                    IrError::resolution(format!(
                        "cannot derive pkg info from bundle URL {} while processing bundle {}",
                        consumption.bundle_href, self.bundle
                    ))
                })?;
            let version = coerce_version(&info.version).ok_or_else(|| {
                IrError::resolution(format!(
                    "the version {} for the bundle {} is not a valid version, while processing bundle {}",
                    info.version, consumption.bundle_href, self.bundle
                ))
            })?;
            let indices = satisfactions
                .entry(consumption.bundle_href.clone())
                .or_default();
            for (range_index, other) in resolutions.iter().enumerate() {
                if range_index == version_index {
                    indices.insert(range_index);
                    continue;
                }
                // npm allows non-semver specifiers; they only self-satisfy
                if !is_valid_range(&other.range) {
                    continue;
                }
                if range_satisfies(&other.range, &version) {
                    indices.insert(range_index);
                }
            }
        }

        let mut candidates: Vec<(Url, BTreeSet<usize>)> = satisfactions.into_iter().collect();
        candidates.sort_by(|(href_a, a), (href_b, b)| {
            b.len().cmp(&a.len()).then_with(|| {
                let version_a = self
                    .catalog
                    .pkg_info(href_a)
                    .and_then(|i| coerce_version(&i.version));
                let version_b = self
                    .catalog
                    .pkg_info(href_b)
                    .and_then(|i| coerce_version(&i.version));
                version_b.cmp(&version_a)
            })
        });

        let mut results: Vec<ResolvedDependency> = Vec::new();
        let mut unsatisfied: BTreeSet<usize> = (0..resolutions.len()).collect();
        let mut candidates = candidates.into_iter();
        while !unsatisfied.is_empty() {
            let (selected_href, indices) = candidates.next().ok_or_else(|| {
                IrError::resolution(format!(
                    "unable to determine bundle to satisfy consumption ranges: {}",
                    unsatisfied
                        .iter()
                        .map(|i| resolutions[*i].range.clone())
                        .collect::<Vec<_>>()
                        .join(",")
                ))
            })?;
            let selected_index = resolutions
                .iter()
                .position(|r| r.bundle_href == selected_href)
                .expect("candidate hrefs come from the resolutions list");
            let selected = &resolutions[selected_index];

            let non_semver = indices
                .iter()
                .find(|i| !is_valid_range(&resolutions[**i].range))
                .map(|i| resolutions[*i].range.clone());
            let (range, obviated) = match non_semver {
                Some(range) => {
                    if indices.len() > 1 {
                        return Err(IrError::resolution(format!(
                            "a non semver range '{}' satisfied more than one pkg version--this \
                             should be impossible. the satisfied packages are: {}",
                            range,
                            indices
                                .iter()
                                .map(|i| resolutions[*i].bundle_href.to_string())
                                .collect::<Vec<_>>()
                                .join(", ")
                        )));
                    }
                    (range, Vec::new())
                }
                None => {
                    let ranges: Vec<&str> =
                        indices.iter().map(|i| resolutions[*i].range.as_str()).collect();
                    let obviated = indices
                        .iter()
                        .filter(|i| **i != selected_index)
                        .map(|i| ObviatedDependency {
                            module_href: resolutions[*i].consumed_by.clone(),
                            pointer: resolutions[*i].consumed_by_pointer,
                        })
                        .collect();
                    (intersect_ranges(&ranges)?, obviated)
                }
            };

            let first = *indices.iter().next().expect("non-empty satisfaction set");
            results.push(ResolvedDependency {
                imported_source: selected.imported_source.clone(),
                imported_as: resolutions[first].imported_as.clone(),
                consumed_by: selected.consumed_by.clone(),
                consumed_by_pointer: selected.consumed_by_pointer,
                bundle_href: selected.bundle_href.clone(),
                range,
                obviated,
            });
            unsatisfied.retain(|i| !indices.contains(i));
        }

        debug!(
            pkg = pkg_href,
            groups = results.len(),
            "resolved package versions"
        );
        self.cache.insert(pkg_href.to_string(), results.clone());
        Ok(results)
    }

    /// The resolution (if any) that covers a specific consumption region.
    pub fn resolution_by_consumption_region(
        &mut self,
        module: &Url,
        pointer: RegionPointer,
        pkg_url: &Url,
    ) -> Result<Option<ResolvedDependency>> {
        Ok(self
            .resolutions_for_pkg(pkg_url.as_str())?
            .into_iter()
            .find(|r| r.covers(module, pointer)))
    }

    /// The resolution covering the declaration of `binding_name` in
    /// `module`, when that binding is backed by a package dependency.
    pub fn resolution_for_pkg_dep_declaration(
        &mut self,
        module: &Url,
        binding_name: &str,
    ) -> Result<Option<ResolvedDependency>> {
        let graph = self.graph.clone();
        let resolution = graph.module(module)?;
        let (declaration, pointer) = match resolution.desc.declaration(binding_name) {
            Some(found) => found,
            None => return Ok(None),
        };
        let pkg_url = match declaration {
            Declaration::Local(local) => local
                .original
                .as_ref()
                .and_then(|o| self.catalog.pkg_info(&o.bundle_href))
                .map(|i| i.pkg_url),
            Declaration::Import(import) => {
                let target = graph.import_target(resolution, import.import_index)?;
                self.catalog.pkg_info(target.url()).map(|i| i.pkg_url)
            }
        };
        match pkg_url {
            Some(pkg_url) => self.resolution_by_consumption_region(module, pointer, &pkg_url),
            None => Ok(None),
        }
    }

    /// Resolve a declaration the way the plain module-graph resolver does,
    /// then apply winning-version redirection: a consumption point that lost
    /// its version resolution is redirected to the winner's site.
    pub fn resolve_declaration(
        &mut self,
        imported_name: &ImportedName,
        imported_from: &Url,
        consuming_module: &Url,
        own: &[&BundleAssignment],
    ) -> Result<ResolverSource> {
        let graph = self.graph.clone();
        let source =
            resolve_declaration(imported_name, imported_from, consuming_module, own, &graph)?;
        let (module, pointer, declared_name) = match &source {
            DeclarationSource::Resolved {
                module,
                pointer,
                declared_name,
            } => (module.clone(), *pointer, declared_name.clone()),
            DeclarationSource::Unresolved { .. } => {
                return Ok(ResolverSource {
                    source,
                    resolution: None,
                })
            }
        };
        let resolution = self.resolution_for_pkg_dep_declaration(&module, &declared_name)?;
        let resolution = match resolution {
            Some(r) => r,
            None => {
                return Ok(ResolverSource {
                    source,
                    resolution: None,
                })
            }
        };
        if resolution.consumed_by == module && resolution.consumed_by_pointer == pointer {
            // this site is the winner
            return Ok(ResolverSource {
                source,
                resolution: Some(resolution),
            });
        }
        // the site lost; redirect to the winning declaration
        let redirected = match &resolution.imported_source {
            Some(imported_source) => DeclarationSource::Resolved {
                module: imported_source.declared_in.clone(),
                pointer: imported_source.pointer,
                declared_name,
            },
            None => DeclarationSource::Resolved {
                module: resolution.consumed_by.clone(),
                pointer: resolution.consumed_by_pointer,
                declared_name,
            },
        };
        Ok(ResolverSource {
            source: redirected,
            resolution: Some(resolution),
        })
    }
}

/// Collect every consumption point of every package feeding this bundle:
/// direct dependencies from the lock file married to their import regions,
/// then embedded package bindings via their `original` provenance.
fn gather_dependencies(
    dependencies: &Dependencies,
    lock_file: Option<&LockFile>,
    assignments: &[BundleAssignment],
    bundle: &Url,
    graph: &ModuleGraph,
    catalog: &dyn PackageCatalog,
) -> Result<IndexMap<String, Vec<ConsumedDependency>>> {
    let mut consumed: IndexMap<String, Vec<ConsumedDependency>> = IndexMap::new();
    let own: Vec<&BundleAssignment> = assignments
        .iter()
        .filter(|a| &a.bundle_url == bundle)
        .collect();

    if let Some(lock_file) = lock_file {
        for (specifier, bundle_href) in lock_file {
            if bundle_href.is_empty() {
                return Err(IrError::resolution(format!(
                    "unable to determine resolution for {} in bundle {} from lock file",
                    specifier, bundle
                )));
            }
            let mut parts = specifier.split('/');
            let mut pkg_name = parts.next().unwrap_or_default().to_string();
            if pkg_name.starts_with('@') {
                if let Some(scoped) = parts.next() {
                    pkg_name = format!("{}/{}", pkg_name, scoped);
                }
            }
            let bundle_href = Url::parse(bundle_href).map_err(|_| {
                IrError::resolution(format!(
                    "lock file resolution '{}' for {} is not a URL",
                    bundle_href, specifier
                ))
            })?;
            if assignments.iter().all(|a| a.module != bundle_href) {
                continue;
            }
            let dependency = dependencies.get(&pkg_name).ok_or_else(|| {
                IrError::resolution(format!(
                    "unable to determine dependency from the specifier {} with resolution {} \
                     in bundle {}. Are you missing a dependency for '{}'?",
                    specifier, bundle_href, bundle, pkg_name
                ))
            })?;
            let pkg_url = catalog
                .pkg_info(&bundle_href)
                .map(|i| i.pkg_url)
                .ok_or_else(|| {
                    IrError::resolution(format!(
                        "cannot derive pkgURL from bundle URL {} (resolved from '{}') when \
                         building bundle {}",
                        bundle_href, specifier, bundle
                    ))
                })?;

            for assignment in &own {
                let module = graph.module(&assignment.module)?;
                for (pointer, region) in module.desc.regions.iter().enumerate() {
                    let import = match &region.kind {
                        RegionKind::Declaration(Declaration::Import(import)) => import,
                        _ => continue,
                    };
                    if module.resolved_imports[import.import_index].url() != &bundle_href {
                        continue;
                    }
                    let source = resolve_declaration(
                        &import.imported_name,
                        module.resolved_imports[import.import_index].url(),
                        &module.url,
                        &own,
                        graph,
                    )?;
                    if let DeclarationSource::Resolved {
                        module: declared_in,
                        pointer: source_pointer,
                        ..
                    } = source
                    {
                        consumed
                            .entry(pkg_url.as_str().to_string())
                            .or_default()
                            .push(ConsumedDependency {
                                imported_source: Some(ImportedSource {
                                    pointer: source_pointer,
                                    declared_in,
                                }),
                                imported_as: import.imported_name.clone(),
                                consumed_by: module.url.clone(),
                                consumed_by_pointer: pointer,
                                bundle_href: bundle_href.clone(),
                                range: dependency.range.clone(),
                            });
                    }
                }
            }
        }
    }

    // embedded package bindings carried into previously-built bundles
    for assignment in assignments {
        if &assignment.bundle_url != bundle {
            continue;
        }
        let module = graph.module(&assignment.module)?;
        for (pointer, declaration) in module.desc.declarations() {
            let original = match declaration {
                Declaration::Local(local) => match &local.original {
                    Some(original) => original,
                    None => continue,
                },
                Declaration::Import(_) => continue,
            };
            let pkg_url = catalog
                .pkg_info(&original.bundle_href)
                .map(|i| i.pkg_url)
                .ok_or_else(|| {
                    IrError::resolution(format!(
                        "cannot derive pkgURL from bundle URL {} when building bundle {}",
                        original.bundle_href, bundle
                    ))
                })?;
            consumed
                .entry(pkg_url.as_str().to_string())
                .or_default()
                .push(ConsumedDependency {
                    imported_source: None,
                    imported_as: original.imported_as.clone(),
                    consumed_by: module.url.clone(),
                    consumed_by_pointer: pointer,
                    bundle_href: original.bundle_href.clone(),
                    range: original.range.clone(),
                });
        }
    }
    Ok(consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn resolver_with(consumed: IndexMap<String, Vec<ConsumedDependency>>) -> DependencyResolver {
        DependencyResolver {
            graph: Arc::new(ModuleGraph::new()),
            catalog: Arc::new(CatalogUrlIndex),
            assignments: Arc::new(Vec::new()),
            bundle: url("https://local/out.js"),
            consumed,
            cache: IndexMap::new(),
        }
    }

    fn consumption(site: &str, version: &str, range: &str) -> ConsumedDependency {
        ConsumedDependency {
            imported_source: None,
            imported_as: ImportedName::named("lib"),
            consumed_by: url(site),
            consumed_by_pointer: 1,
            bundle_href: url(&format!(
                "https://cdn.example.com/pkgs/npm/lib/{}/h/index.js",
                version
            )),
            range: range.to_string(),
        }
    }

    #[test]
    fn test_catalog_url_index() {
        let info = CatalogUrlIndex
            .pkg_info(&url("https://cdn.example.com/pkgs/npm/lodash/4.17.19/h/index.js"))
            .unwrap();
        assert_eq!(info.version, "4.17.19");
        assert_eq!(
            info.pkg_url.as_str(),
            "https://cdn.example.com/pkgs/npm/lodash/"
        );

        let scoped = CatalogUrlIndex
            .pkg_info(&url(
                "https://cdn.example.com/pkgs/npm/@scope/pkg/1.0.0/h/index.js",
            ))
            .unwrap();
        assert_eq!(
            scoped.pkg_url.as_str(),
            "https://cdn.example.com/pkgs/npm/@scope/pkg/"
        );

        assert!(CatalogUrlIndex
            .pkg_info(&url("https://local/src/index.js"))
            .is_none());
    }

    #[test]
    fn test_greedy_resolution_groups_overlapping_ranges() {
        let mut consumed = IndexMap::new();
        consumed.insert(
            "https://cdn.example.com/pkgs/npm/lib/".to_string(),
            vec![
                consumption("https://local/a.js", "1.2.0", "^1.0.0"),
                consumption("https://local/b.js", "1.2.0", "^1.2.0"),
                consumption("https://local/c.js", "2.0.0", "^2.0.0"),
            ],
        );
        let mut resolver = resolver_with(consumed);
        let resolutions = resolver
            .resolutions_for_pkg("https://cdn.example.com/pkgs/npm/lib/")
            .unwrap();

        assert_eq!(resolutions.len(), 2);
        let group_12 = resolutions
            .iter()
            .find(|r| r.bundle_href.as_str().contains("/1.2.0/"))
            .unwrap();
        assert_eq!(group_12.range, "^1.2.0");
        assert_eq!(group_12.obviated.len(), 1);
        let group_2 = resolutions
            .iter()
            .find(|r| r.bundle_href.as_str().contains("/2.0.0/"))
            .unwrap();
        assert_eq!(group_2.range, "^2.0.0");
        assert!(group_2.obviated.is_empty());
    }

    #[test]
    fn test_ties_break_toward_higher_version() {
        let mut consumed = IndexMap::new();
        consumed.insert(
            "https://cdn.example.com/pkgs/npm/lib/".to_string(),
            vec![
                consumption("https://local/a.js", "1.0.0", "1.0.0"),
                consumption("https://local/b.js", "1.4.0", "1.4.0"),
            ],
        );
        let mut resolver = resolver_with(consumed);
        let resolutions = resolver
            .resolutions_for_pkg("https://cdn.example.com/pkgs/npm/lib/")
            .unwrap();
        // each version satisfies only itself; the higher version is chosen
        // first but both groups survive
        assert_eq!(resolutions.len(), 2);
        assert!(resolutions[0].bundle_href.as_str().contains("/1.4.0/"));
    }

    #[test]
    fn test_non_semver_specifier_only_self_satisfies() {
        let mut consumed = IndexMap::new();
        consumed.insert(
            "https://cdn.example.com/pkgs/npm/lib/".to_string(),
            vec![
                consumption(
                    "https://local/a.js",
                    "1.2.0",
                    "git+https://example.com/lib.git",
                ),
                consumption("https://local/b.js", "1.3.0", "^1.0.0"),
            ],
        );
        let mut resolver = resolver_with(consumed);
        let resolutions = resolver
            .resolutions_for_pkg("https://cdn.example.com/pkgs/npm/lib/")
            .unwrap();
        assert_eq!(resolutions.len(), 2);
        let git_group = resolutions
            .iter()
            .find(|r| r.bundle_href.as_str().contains("/1.2.0/"))
            .unwrap();
        assert_eq!(git_group.range, "git+https://example.com/lib.git");
        assert!(git_group.obviated.is_empty());
    }

    #[test]
    fn test_unknown_pkg_resolves_to_nothing() {
        let mut resolver = resolver_with(IndexMap::new());
        assert!(resolver
            .resolutions_for_pkg("https://cdn.example.com/pkgs/npm/none/")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_resolution_is_memoized() {
        let mut consumed = IndexMap::new();
        consumed.insert(
            "https://cdn.example.com/pkgs/npm/lib/".to_string(),
            vec![consumption("https://local/a.js", "1.2.0", "^1.0.0")],
        );
        let mut resolver = resolver_with(consumed);
        let first = resolver
            .resolutions_for_pkg("https://cdn.example.com/pkgs/npm/lib/")
            .unwrap();
        resolver.consumed.clear(); // memoized result must not re-gather
        let second = resolver
            .resolutions_for_pkg("https://cdn.example.com/pkgs/npm/lib/")
            .unwrap();
        assert_eq!(first.len(), second.len());
        assert!(!second.is_empty());
    }
}
