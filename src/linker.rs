use std::collections::HashMap;

use anyhow::{Context as _, Result, bail};
use tracing::{instrument, warn};

use crate::name_map::FNameTable;
use crate::object_graph::{CLASS_CLASS_NAME, ObjectFlags, ObjectGraph, ObjectId, PackageFlags};
use crate::package_file::{FObjectExport, FObjectImport, FPackageFileSummary};
use crate::package_index::FPackageIndex;
use crate::sorting::SortedTable;
use crate::tagging::{ObjectMarks, ObjectTags};

pub const NAME_NONE: &str = "None";

#[derive(Debug, Clone)]
pub struct ImportEntry {
    /// `None` for a placeholder kept to preserve the indices of a conformed package.
    pub object: Option<ObjectId>,
    pub import: FObjectImport,
}

#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub object: Option<ObjectId>,
    pub export: FObjectExport,
}

/// Table arena of the package being saved. Everything refers to entries through [`FPackageIndex`],
/// so the tables stay valid however the sorters ordered them.
#[derive(Debug)]
pub struct SaveLinker {
    pub package: ObjectId,
    pub summary: FPackageFileSummary,
    pub names: FNameTable,
    pub imports: Vec<ImportEntry>,
    pub exports: Vec<ExportEntry>,
    /// Per export, the table entries its fields reference.
    pub depends_map: Vec<Vec<FPackageIndex>>,
    pub preload_dependencies: Vec<FPackageIndex>,
    pub soft_package_references: Vec<String>,
    pub searchable_names: Vec<(FPackageIndex, Vec<String>)>,
    object_indices: HashMap<ObjectId, FPackageIndex>,
    duplicate_redirects: HashMap<ObjectId, ObjectId>,
}
impl SaveLinker {
    pub fn new(
        package: ObjectId,
        names: FNameTable,
        imports: &SortedTable,
        exports: &SortedTable,
        duplicate_redirects: HashMap<ObjectId, ObjectId>,
    ) -> Self {
        let mut object_indices = HashMap::with_capacity(imports.entries.len() + exports.entries.len());
        for (i, object) in imports.entries.iter().enumerate() {
            if let Some(object) = object {
                object_indices.insert(*object, FPackageIndex::create_import(i));
            }
        }
        for (i, object) in exports.entries.iter().enumerate() {
            if let Some(object) = object {
                object_indices.insert(*object, FPackageIndex::create_export(i));
            }
        }
        Self {
            package,
            summary: FPackageFileSummary::default(),
            names,
            imports: imports
                .entries
                .iter()
                .map(|&object| ImportEntry { object, import: FObjectImport::default() })
                .collect(),
            exports: exports
                .entries
                .iter()
                .map(|&object| ExportEntry {
                    object,
                    export: FObjectExport { first_export_dependency: -1, ..Default::default() },
                })
                .collect(),
            depends_map: vec![],
            preload_dependencies: vec![],
            soft_package_references: vec![],
            searchable_names: vec![],
            object_indices,
            duplicate_redirects,
        }
    }

    /// Table index of `object`, following duplicate export redirects. Null when the object is in
    /// neither table.
    pub fn map_object(&self, object: ObjectId) -> FPackageIndex {
        if let Some(index) = self.object_indices.get(&object) {
            return *index;
        }
        self.duplicate_redirects
            .get(&object)
            .and_then(|target| self.object_indices.get(target))
            .copied()
            .unwrap_or_default()
    }
    pub fn map_optional(&self, object: Option<ObjectId>) -> FPackageIndex {
        object.map(|o| self.map_object(o)).unwrap_or_default()
    }

    /// Object behind a table index.
    pub fn object_at(&self, index: FPackageIndex) -> Option<ObjectId> {
        if let Some(i) = index.import() {
            self.imports.get(i).and_then(|e| e.object)
        } else if let Some(i) = index.export() {
            self.exports.get(i).and_then(|e| e.object)
        } else {
            None
        }
    }

    /// Whether a table contains placeholders, which are written with the name `None`.
    pub fn has_placeholders(&self) -> bool {
        self.imports.iter().any(|e| e.object.is_none()) || self.exports.iter().any(|e| e.object.is_none())
    }

    #[instrument(skip_all, name = "build_import_map")]
    pub fn build_import_map<G: ObjectGraph + ?Sized>(&mut self, graph: &G) -> Result<()> {
        for i in 0..self.imports.len() {
            let import = match self.imports[i].object {
                None => {
                    let none = self.names.resolve(NAME_NONE)?;
                    FObjectImport {
                        class_package: none,
                        class_name: none,
                        outer_index: FPackageIndex::create_null(),
                        object_name: none,
                    }
                }
                Some(object) => {
                    let outer_index = self.map_optional(graph.get_outer(object));
                    if graph.get_outer(object).is_some() && !outer_index.is_import() {
                        bail!("outer of import {} is not an import ({outer_index})", graph.get_full_name(object));
                    }
                    FObjectImport {
                        class_package: self.names.resolve(graph.get_class_package_name(object))?,
                        class_name: self.names.resolve(graph.get_class_name(object))?,
                        outer_index,
                        object_name: self.names.resolve(graph.get_name(object))?,
                    }
                }
            };
            self.imports[i].import = import;
        }
        Ok(())
    }

    /// Fills every export field that is known before the payloads are written.
    #[instrument(skip_all, name = "build_export_map")]
    pub fn build_export_map<G: ObjectGraph + ?Sized>(&mut self, graph: &G, tags: &ObjectTags) -> Result<()> {
        for i in 0..self.exports.len() {
            let Some(object) = self.exports[i].object else {
                self.exports[i].export.object_name = self.names.resolve(NAME_NONE)?;
                continue;
            };
            let full_name = || graph.get_full_name(object);

            let class_index = if graph.get_class_name(object) == CLASS_CLASS_NAME {
                FPackageIndex::create_null()
            } else {
                let index = self.map_optional(graph.get_class(object));
                if index.is_null() {
                    bail!("class of export {} is not in the package tables", full_name());
                }
                index
            };

            let mut super_index = FPackageIndex::create_null();
            if graph.get_kind(object).is_struct()
                && let Some(super_struct) = graph.get_super_struct(object)
            {
                super_index = self.map_object(super_struct);
                if super_index.is_null() {
                    bail!("super struct of export {} is not in the package tables", full_name());
                }
            }

            let outer = graph.get_outer(object).context("export without an outer")?;
            let outer_index =
                if outer == self.package { FPackageIndex::create_null() } else { self.map_object(outer) };
            if outer_index.is_import() {
                bail!("outer of export {} is an import", full_name());
            }

            let mut export = FObjectExport {
                class_index,
                super_index,
                template_index: self.map_optional(graph.get_archetype(object)),
                outer_index,
                object_name: self.names.resolve(graph.get_name(object))?,
                object_flags: graph.get_flags(object) & ObjectFlags::LOAD_MASK,
                not_for_client: tags.has_any(object, ObjectMarks::NOT_FOR_CLIENT),
                not_for_server: tags.has_any(object, ObjectMarks::NOT_FOR_SERVER),
                not_always_loaded_for_editor_game: tags
                    .has_any(object, ObjectMarks::NOT_ALWAYS_LOADED_FOR_EDITOR_GAME),
                is_asset: graph.is_asset(object),
                first_export_dependency: -1,
                ..Default::default()
            };
            if graph.is_package(object) {
                let package_flags = graph.get_package_flags(object);
                export.package_flags = package_flags.bits();
                if !package_flags.contains(PackageFlags::SERVER_SIDE_ONLY) {
                    export.package_guid = graph.get_package_guid(object).unwrap_or_default();
                }
            }
            self.exports[i].export = export;
        }
        Ok(())
    }

    /// Resolves the per export dependency lists collected during tagging.
    #[instrument(skip_all, name = "build_depends_map")]
    pub fn build_depends_map<G: ObjectGraph + ?Sized>(
        &mut self,
        graph: &G,
        dependencies: &HashMap<ObjectId, Vec<ObjectId>>,
    ) -> Result<()> {
        let mut depends_map = Vec::with_capacity(self.exports.len());
        for entry in &self.exports {
            let Some(object) = entry.object else {
                warn!("writing empty dependencies for a placeholder export");
                depends_map.push(vec![]);
                continue;
            };
            let mut indices = vec![];
            for &dependency in dependencies.get(&object).map(Vec::as_slice).unwrap_or_default() {
                let index = self.map_object(dependency);
                if index.is_null() {
                    bail!(
                        "failed to find dependency index for {} ({})",
                        graph.get_full_name(dependency),
                        graph.get_full_name(object)
                    );
                }
                indices.push(index);
            }
            depends_map.push(indices);
        }
        self.depends_map = depends_map;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::object_graph::{MemoryGraph, MemoryObject, ObjectKind};
    use pretty_assertions::assert_eq;

    struct Fixture {
        graph: MemoryGraph,
        package: ObjectId,
        class: ObjectId,
        mesh: ObjectId,
        section: ObjectId,
        engine: ObjectId,
    }

    fn fixture() -> Fixture {
        let mut graph = MemoryGraph::new();
        let engine = graph.add(MemoryObject::new("/Script/Engine", ObjectKind::Plain));
        let class = graph.add(MemoryObject::new("StaticMesh", ObjectKind::Class).with_outer(engine));
        let package = graph.add(MemoryObject::new("/Game/Cube", ObjectKind::Plain));
        let mesh = graph.add(
            MemoryObject::new("Cube", ObjectKind::Plain)
                .with_class(class)
                .with_outer(package)
                .with_flags(ObjectFlags::PUBLIC | ObjectFlags::STANDALONE | ObjectFlags::TRANSIENT),
        );
        let section = graph.add(MemoryObject::new("Section_0", ObjectKind::Plain).with_class(class).with_outer(mesh));
        Fixture { graph, package, class, mesh, section, engine }
    }

    fn names(graph: &MemoryGraph, objects: &[ObjectId]) -> FNameTable {
        let mut names = FNameTable::new();
        names.mark_name_referenced(NAME_NONE);
        names.mark_name_referenced("Package");
        names.mark_name_referenced("Class");
        names.mark_name_referenced("/Script/CoreUObject");
        for &o in objects {
            names.mark_name_referenced(graph.get_name(o));
        }
        names
    }

    #[test]
    fn test_tables() -> Result<()> {
        let Fixture { graph, package, class, mesh, section, engine } = fixture();
        let imports = SortedTable { entries: vec![Some(class), None, Some(engine)], conformed: 2 };
        let exports = SortedTable { entries: vec![Some(mesh), Some(section)], conformed: 0 };
        let names = names(&graph, &[class, mesh, section, engine]);
        let mut linker = SaveLinker::new(package, names, &imports, &exports, HashMap::new());

        assert_eq!(linker.map_object(class), FPackageIndex::create_import(0));
        assert_eq!(linker.map_object(section), FPackageIndex::create_export(1));
        assert_eq!(linker.map_object(package), FPackageIndex::create_null());
        assert_eq!(linker.object_at(FPackageIndex::create_import(2)), Some(engine));
        assert!(linker.has_placeholders());

        linker.build_import_map(&graph)?;
        assert_eq!(linker.imports[0].import.outer_index, FPackageIndex::create_import(2));
        assert_eq!(linker.names.get(linker.imports[0].import.class_name)?, "Class");
        assert_eq!(linker.names.get(linker.imports[1].import.object_name)?, "None");
        assert_eq!(linker.names.get(linker.imports[2].import.class_name)?, "Package");

        let tags = ObjectTags::default();
        linker.build_export_map(&graph, &tags)?;
        let cube = &linker.exports[0].export;
        assert_eq!(cube.class_index, FPackageIndex::create_import(0));
        assert_eq!(cube.outer_index, FPackageIndex::create_null());
        assert_eq!(cube.object_flags, ObjectFlags::PUBLIC | ObjectFlags::STANDALONE);
        assert_eq!(cube.first_export_dependency, -1);
        assert_eq!(linker.exports[1].export.outer_index, FPackageIndex::create_export(0));
        Ok(())
    }

    #[test]
    fn test_duplicate_redirect_and_missing_dependency() -> Result<()> {
        let Fixture { graph, package, class, mesh, section, engine } = fixture();
        let imports = SortedTable { entries: vec![Some(class), Some(engine)], conformed: 0 };
        let exports = SortedTable { entries: vec![Some(mesh)], conformed: 0 };
        let names = names(&graph, &[class, mesh, engine]);
        let mut linker = SaveLinker::new(package, names, &imports, &exports, HashMap::from([(section, mesh)]));
        assert_eq!(linker.map_object(section), FPackageIndex::create_export(0));

        let mut dependencies = HashMap::from([(mesh, vec![class, section])]);
        linker.build_depends_map(&graph, &dependencies)?;
        assert_eq!(linker.depends_map, vec![vec![FPackageIndex::create_import(0), FPackageIndex::create_export(0)]]);

        dependencies.insert(mesh, vec![package]);
        let err = linker.build_depends_map(&graph, &dependencies).unwrap_err();
        assert!(err.to_string().starts_with("failed to find dependency index for Package /Game/Cube"));
        Ok(())
    }
}
