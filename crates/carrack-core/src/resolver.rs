//! Dependency resolver contract and the built-in default.
//!
//! The framework consumes resolution through [`Resolver`]; a production
//! deployment may plug a full constraint solver. [`BasicResolver`] wires
//! each import to an existing exporter, preferring providers that are
//! already resolved — which is what keeps dependents pinned to an old
//! revision after an update until a refresh rebuilds them.

use crate::module::{ModuleGraph, ModuleId, Wire};
use carrack_manifest::{PackageName, SymbolicName};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unresolved constraint in module {module}: missing package '{package}'")]
    UnresolvedImport { module: String, package: PackageName },
    #[error("unresolved constraint in module {module}: missing required bundle '{bundle}'")]
    UnresolvedRequirement {
        module: String,
        bundle: SymbolicName,
    },
    #[error("unknown module {0:?}")]
    UnknownModule(ModuleId),
    #[error("{0}")]
    Other(String),
}

/// Outcome of resolving one module.
#[derive(Debug, Default)]
pub struct Resolution {
    pub wires: Vec<Wire>,
    pub required: Vec<ModuleId>,
}

pub trait Resolver: Send + Sync {
    fn resolve(&self, graph: &ModuleGraph, module: ModuleId) -> Result<Resolution, ResolveError>;
}

#[derive(Debug, Default)]
pub struct BasicResolver;

impl BasicResolver {
    pub fn new() -> Self {
        Self
    }

    fn pick_exporter(
        graph: &ModuleGraph,
        target: ModuleId,
        package: &PackageName,
    ) -> Option<ModuleId> {
        let candidates = graph.exporters_of(package);
        // A module may satisfy its own import.
        candidates
            .iter()
            .copied()
            .filter(|&m| graph.node(m).map(|n| n.resolved).unwrap_or(false) || m == target)
            .min()
            .or_else(|| candidates.into_iter().min())
    }

    fn pick_bundle(
        graph: &ModuleGraph,
        name: &SymbolicName,
    ) -> Option<ModuleId> {
        let mut candidates: Vec<ModuleId> = graph
            .iter()
            .filter(|(_, node)| !node.stale && node.definition.symbolic_name == *name)
            .map(|(id, _)| id)
            .collect();
        candidates.sort();
        // Prefer a resolved provider; fall back to the newest module.
        candidates
            .iter()
            .copied()
            .filter(|&m| graph.node(m).map(|n| n.resolved).unwrap_or(false))
            .max()
            .or_else(|| candidates.into_iter().max())
    }
}

impl Resolver for BasicResolver {
    fn resolve(&self, graph: &ModuleGraph, module: ModuleId) -> Result<Resolution, ResolveError> {
        let node = graph.node(module).ok_or(ResolveError::UnknownModule(module))?;

        let mut wires = Vec::with_capacity(node.definition.imports.len());
        for package in &node.definition.imports {
            let provider = Self::pick_exporter(graph, module, package).ok_or_else(|| {
                ResolveError::UnresolvedImport {
                    module: node.key.clone(),
                    package: package.clone(),
                }
            })?;
            wires.push(Wire {
                package: package.clone(),
                provider,
            });
        }

        let mut required = Vec::with_capacity(node.definition.required_bundles.len());
        for name in &node.definition.required_bundles {
            let provider = Self::pick_bundle(graph, name).ok_or_else(|| {
                ResolveError::UnresolvedRequirement {
                    module: node.key.clone(),
                    bundle: name.clone(),
                }
            })?;
            required.push(provider);
        }

        Ok(Resolution { wires, required })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleDefinition;
    use carrack_manifest::Version;

    fn definition(
        bundle_id: u64,
        name: &str,
        exports: &[&str],
        imports: &[&str],
        requires: &[&str],
    ) -> ModuleDefinition {
        ModuleDefinition {
            bundle_id,
            symbolic_name: SymbolicName::new(name),
            version: Version::new(1, 0, 0),
            exports: exports.iter().map(|&p| PackageName::new(p)).collect(),
            imports: imports.iter().map(|&p| PackageName::new(p)).collect(),
            dynamic_imports: Vec::new(),
            required_bundles: requires.iter().map(|&b| SymbolicName::new(b)).collect(),
            native_libraries: Vec::new(),
        }
    }

    #[test]
    fn wires_import_to_exporter() {
        let mut graph = ModuleGraph::new();
        let exporter = graph.add_module(0, definition(1, "exp", &["p"], &[], &[]));
        graph.set_wires(exporter, Vec::new(), Vec::new());
        let importer = graph.add_module(0, definition(2, "imp", &[], &["p"], &[]));

        let resolution = BasicResolver::new().resolve(&graph, importer).unwrap();
        assert_eq!(resolution.wires.len(), 1);
        assert_eq!(resolution.wires[0].provider, exporter);
    }

    #[test]
    fn missing_import_fails() {
        let mut graph = ModuleGraph::new();
        let importer = graph.add_module(0, definition(2, "imp", &[], &["ghost"], &[]));
        let result = BasicResolver::new().resolve(&graph, importer);
        assert!(matches!(
            result,
            Err(ResolveError::UnresolvedImport { .. })
        ));
    }

    #[test]
    fn prefers_resolved_provider_over_newer_unresolved() {
        let mut graph = ModuleGraph::new();
        let old = graph.add_module(0, definition(1, "exp", &["p"], &[], &[]));
        graph.set_wires(old, Vec::new(), Vec::new());
        // Updated revision of the same bundle: newer but unresolved.
        let _new = graph.add_module(1, definition(1, "exp", &["p"], &[], &[]));
        let importer = graph.add_module(0, definition(2, "imp", &[], &["p"], &[]));

        let resolution = BasicResolver::new().resolve(&graph, importer).unwrap();
        assert_eq!(resolution.wires[0].provider, old);
    }

    #[test]
    fn self_import_allowed() {
        let mut graph = ModuleGraph::new();
        let m = graph.add_module(0, definition(1, "selfish", &["p"], &["p"], &[]));
        let resolution = BasicResolver::new().resolve(&graph, m).unwrap();
        assert_eq!(resolution.wires[0].provider, m);
    }

    #[test]
    fn required_bundle_wired_to_newest() {
        let mut graph = ModuleGraph::new();
        let _old = graph.add_module(0, definition(1, "base", &[], &[], &[]));
        let new = graph.add_module(1, definition(1, "base", &[], &[], &[]));
        let requirer = graph.add_module(0, definition(2, "ontop", &[], &[], &["base"]));

        let resolution = BasicResolver::new().resolve(&graph, requirer).unwrap();
        assert_eq!(resolution.required, vec![new]);
    }

    #[test]
    fn missing_required_bundle_fails() {
        let mut graph = ModuleGraph::new();
        let requirer = graph.add_module(0, definition(2, "ontop", &[], &[], &["ghost"]));
        assert!(matches!(
            BasicResolver::new().resolve(&graph, requirer),
            Err(ResolveError::UnresolvedRequirement { .. })
        ));
    }

    #[test]
    fn stale_exporters_ignored() {
        let mut graph = ModuleGraph::new();
        let exporter = graph.add_module(0, definition(1, "exp", &["p"], &[], &[]));
        graph.set_wires(exporter, Vec::new(), Vec::new());
        graph.mark_stale(1);
        let importer = graph.add_module(0, definition(2, "imp", &[], &["p"], &[]));
        assert!(BasicResolver::new().resolve(&graph, importer).is_err());
    }
}
