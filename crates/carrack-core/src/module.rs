//! The module graph: one node per bundle revision, wired by the resolver.
//!
//! Nodes live in an arena addressed by indices, so walks over a graph that
//! may contain cycles (through require-bundle) never recurse on node
//! references. Removing a node leaves a tombstone and detaches it from its
//! providers' dependent lists.

use crate::BundleId;
use carrack_manifest::{NativeLibrary, PackageName, SymbolicName, Version};
use std::collections::BTreeSet;

/// Index of a module node inside the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub usize);

/// A resolved import: this module consumes `package` from `provider`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wire {
    pub package: PackageName,
    pub provider: ModuleId,
}

/// The resolver's view of one bundle revision.
#[derive(Debug, Clone)]
pub struct ModuleDefinition {
    pub bundle_id: BundleId,
    pub symbolic_name: SymbolicName,
    pub version: Version,
    pub exports: Vec<PackageName>,
    pub imports: Vec<PackageName>,
    pub dynamic_imports: Vec<String>,
    pub required_bundles: Vec<SymbolicName>,
    pub native_libraries: Vec<NativeLibrary>,
}

#[derive(Debug)]
pub struct ModuleNode {
    /// `"<bundle_id>.<revision_index>"`.
    pub key: String,
    pub definition: ModuleDefinition,
    /// Resolved package imports.
    pub wires: Vec<Wire>,
    /// Providers wired through require-bundle.
    pub required: Vec<ModuleId>,
    /// Dependents importing packages from this module.
    pub importers: Vec<ModuleId>,
    /// Dependents requiring this module's bundle.
    pub requirers: Vec<ModuleId>,
    pub resolved: bool,
    pub stale: bool,
}

/// An exported package as seen from the framework surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedPackage {
    pub package: PackageName,
    pub version: Version,
    pub exporter: BundleId,
    pub module: ModuleId,
}

#[derive(Debug, Default)]
pub struct ModuleGraph {
    nodes: Vec<Option<ModuleNode>>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module(&mut self, revision_index: usize, definition: ModuleDefinition) -> ModuleId {
        let key = format!("{}.{}", definition.bundle_id, revision_index);
        let node = ModuleNode {
            key,
            definition,
            wires: Vec::new(),
            required: Vec::new(),
            importers: Vec::new(),
            requirers: Vec::new(),
            resolved: false,
            stale: false,
        };
        self.nodes.push(Some(node));
        ModuleId(self.nodes.len() - 1)
    }

    pub fn node(&self, id: ModuleId) -> Option<&ModuleNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: ModuleId) -> Option<&mut ModuleNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Apply a resolution: record the wires and register this module in the
    /// dependent lists of every provider.
    pub fn set_wires(&mut self, id: ModuleId, wires: Vec<Wire>, required: Vec<ModuleId>) {
        for wire in &wires {
            if wire.provider != id {
                if let Some(provider) = self.node_mut(wire.provider) {
                    if !provider.importers.contains(&id) {
                        provider.importers.push(id);
                    }
                }
            }
        }
        for &provider_id in &required {
            if provider_id != id {
                if let Some(provider) = self.node_mut(provider_id) {
                    if !provider.requirers.contains(&id) {
                        provider.requirers.push(id);
                    }
                }
            }
        }
        if let Some(node) = self.node_mut(id) {
            node.wires = wires;
            node.required = required;
            node.resolved = true;
        }
    }

    /// Tombstone a node and detach it from its providers' dependent lists.
    /// Dependents of the removed node keep their wires; refresh removes the
    /// whole closure together.
    pub fn remove_module(&mut self, id: ModuleId) {
        let Some(node) = self.nodes.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        let mut providers: BTreeSet<ModuleId> =
            node.wires.iter().map(|w| w.provider).collect();
        providers.extend(node.required.iter().copied());
        for provider_id in providers {
            if let Some(provider) = self.node_mut(provider_id) {
                provider.importers.retain(|&m| m != id);
                provider.requirers.retain(|&m| m != id);
            }
        }
    }

    /// Live modules belonging to a bundle, oldest first.
    pub fn modules_of(&self, bundle_id: BundleId) -> Vec<ModuleId> {
        self.iter()
            .filter(|(_, node)| node.definition.bundle_id == bundle_id)
            .map(|(id, _)| id)
            .collect()
    }

    /// Bundles with a module wired to any module of `bundle_id`, excluding
    /// the bundle itself.
    pub fn dependent_bundles(&self, bundle_id: BundleId) -> Vec<BundleId> {
        let mut out = BTreeSet::new();
        for (_, node) in self.iter() {
            if node.definition.bundle_id != bundle_id {
                continue;
            }
            for &dep in node.importers.iter().chain(node.requirers.iter()) {
                if let Some(dep_node) = self.node(dep) {
                    if dep_node.definition.bundle_id != bundle_id {
                        out.insert(dep_node.definition.bundle_id);
                    }
                }
            }
        }
        out.into_iter().collect()
    }

    /// Whether any foreign module is wired to one of this bundle's modules.
    pub fn has_foreign_dependents(&self, bundle_id: BundleId) -> bool {
        !self.dependent_bundles(bundle_id).is_empty()
    }

    /// Non-stale modules exporting the package, in arena order.
    pub fn exporters_of(&self, package: &PackageName) -> Vec<ModuleId> {
        self.iter()
            .filter(|(_, node)| !node.stale && node.definition.exports.contains(package))
            .map(|(id, _)| id)
            .collect()
    }

    /// Every resolved export in the graph, optionally restricted to one
    /// bundle or one package.
    pub fn exported_packages(
        &self,
        bundle: Option<BundleId>,
        package: Option<&PackageName>,
    ) -> Vec<ExportedPackage> {
        let mut out = Vec::new();
        for (id, node) in self.iter() {
            if !node.resolved || node.stale {
                continue;
            }
            if bundle.is_some_and(|b| node.definition.bundle_id != b) {
                continue;
            }
            for export in &node.definition.exports {
                if package.is_some_and(|p| p != export) {
                    continue;
                }
                out.push(ExportedPackage {
                    package: export.clone(),
                    version: node.definition.version.clone(),
                    exporter: node.definition.bundle_id,
                    module: id,
                });
            }
        }
        out
    }

    /// Bundles importing the given export, through wires on its module.
    pub fn importers_of_export(&self, export: &ExportedPackage) -> Vec<BundleId> {
        let Some(node) = self.node(export.module) else {
            return Vec::new();
        };
        let mut out = BTreeSet::new();
        for &importer in &node.importers {
            if let Some(importer_node) = self.node(importer) {
                let uses_package = importer_node
                    .wires
                    .iter()
                    .any(|w| w.provider == export.module && w.package == export.package);
                if uses_package {
                    out.insert(importer_node.definition.bundle_id);
                }
            }
        }
        out.into_iter().collect()
    }

    pub fn mark_stale(&mut self, bundle_id: BundleId) {
        for node in self.nodes.iter_mut().flatten() {
            if node.definition.bundle_id == bundle_id {
                node.stale = true;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &ModuleNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|node| (ModuleId(i), node)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
