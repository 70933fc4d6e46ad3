use std::collections::{HashMap, HashSet};

use anyhow::{Result, bail};
use indexmap::{IndexMap, IndexSet};
use strum::Display;
use tracing::{debug, error, instrument, warn};

use crate::linker::SaveLinker;
use crate::object_graph::{CORE_UOBJECT_PACKAGE_NAME, ObjectFlags, ObjectGraph, ObjectId, ObjectKind, PackageFlags};
use crate::package_index::FPackageIndex;
use crate::save::SaveError;
use crate::tagging::{ObjectMarks, ObjectTags, is_editor_only_object, objects_in_package};

/// Load phase of an export in the event driven loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum LoadPhase {
    Create,
    Serialize,
}

fn node_name(phase: LoadPhase, full_name: &str) -> String {
    format!("{phase}:{full_name}")
}

/// Load ordering graph of every export saved so far. Nodes are `(phase, object)` pairs and each
/// node lists the nodes that must be reached before it.
#[derive(Debug, Default)]
pub struct DependencyCycleChecker {
    exports: IndexSet<String>,
    prerequisites: IndexMap<String, IndexSet<String>>,
}
impl DependencyCycleChecker {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add_export(&mut self, full_name: &str) {
        self.exports.insert(full_name.to_string());
        // an object is always created before it is serialized
        self.add_arc(LoadPhase::Create, full_name, LoadPhase::Serialize, full_name);
    }
    /// Records that `export` cannot reach `export_phase` before `dependency` reached `dependency_phase`.
    pub fn add_arc(&mut self, dependency_phase: LoadPhase, dependency: &str, export_phase: LoadPhase, export: &str) {
        self.prerequisites
            .entry(node_name(export_phase, export))
            .or_default()
            .insert(node_name(dependency_phase, dependency));
    }
    pub fn node_count(&self) -> usize {
        self.prerequisites.len()
    }

    /// Depth first search from the serialize node of every export. A cycle is fatal.
    #[instrument(skip_all, name = "check_for_cycles")]
    pub fn check_for_cycles(&self) -> Result<()> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        for export in &self.exports {
            let start = node_name(LoadPhase::Serialize, export);
            let Some((start, _)) = self.prerequisites.get_key_value(start.as_str()) else {
                continue;
            };
            if !visited.insert(start.as_str()) {
                continue;
            }
            on_stack.insert(start.as_str());
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            loop {
                let Some(&(node, next)) = stack.last() else {
                    break;
                };
                let prerequisite = self.prerequisites.get(node).and_then(|p| p.get_index(next));
                let Some(prerequisite) = prerequisite else {
                    on_stack.remove(node);
                    stack.pop();
                    continue;
                };
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                if on_stack.contains(prerequisite.as_str()) {
                    let path: Vec<String> = stack.iter().map(|(n, _)| n.to_string()).collect();
                    error!("dependency cycle at {prerequisite}: {}", path.join(" -> "));
                    return Err(SaveError::DependencyCycle { node: prerequisite.clone(), path }.into());
                }
                if visited.insert(prerequisite.as_str()) {
                    on_stack.insert(prerequisite.as_str());
                    stack.push((prerequisite.as_str(), 0));
                }
            }
        }
        Ok(())
    }
}

/// The four preload dependency buckets of one export, in storage order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExportDependencies {
    pub serialization_before_serialization: IndexSet<FPackageIndex>,
    pub create_before_serialization: IndexSet<FPackageIndex>,
    pub serialization_before_create: IndexSet<FPackageIndex>,
    pub create_before_create: IndexSet<FPackageIndex>,
}
impl ExportDependencies {
    /// Drops entries already implied by a stronger bucket.
    fn remove_redundant(&mut self) {
        let stronger_than_serialize = |i: &FPackageIndex| {
            self.serialization_before_create.contains(i) || self.create_before_create.contains(i)
        };
        let serialization_before_serialization: IndexSet<_> =
            self.serialization_before_serialization.iter().copied().filter(|i| !stronger_than_serialize(i)).collect();
        let create_before_serialization: IndexSet<_> = self
            .create_before_serialization
            .iter()
            .copied()
            .filter(|i| !stronger_than_serialize(i) && !serialization_before_serialization.contains(i))
            .collect();
        self.serialization_before_serialization = serialization_before_serialization;
        self.create_before_serialization = create_before_serialization;
    }
}

struct DependencyCollector<'a, G: ObjectGraph + ?Sized> {
    graph: &'a G,
    linker: &'a SaveLinker,
    tags: &'a ObjectTags,
    excluded: ObjectMarks,
    filter_editor_only: bool,
}
impl<G: ObjectGraph + ?Sized> DependencyCollector<'_, G> {
    // nothing in the core package loads assets while being constructed
    fn in_core_package(&self, object: ObjectId) -> bool {
        self.graph.get_name(self.graph.get_outermost(object)) == CORE_UOBJECT_PACKAGE_NAME
    }

    fn include_object(
        &self,
        callsite: u32,
        bucket: &mut IndexSet<FPackageIndex>,
        object: ObjectId,
        for_object: ObjectId,
        mandatory: bool,
        only_if_in_tables: bool,
    ) -> Result<()> {
        let graph = self.graph;
        if self.in_core_package(object) {
            return Ok(());
        }
        let index = self.linker.map_object(object);
        if index.is_null() && only_if_in_tables {
            return Ok(());
        }
        let describe = || format!("{} of {} ({callsite})", graph.get_full_name(object), graph.get_full_name(for_object));
        if !index.is_null() {
            let flags = graph.get_flags(object);
            if flags.contains(ObjectFlags::TRANSIENT) && !graph.is_native(object) {
                warn!("dependency {} is in the package tables, but is transient; keeping it", describe());
            }
            if flags.contains(ObjectFlags::PENDING_KILL) {
                warn!("dependency {} is in the package tables, but is pending kill; keeping it", describe());
            }
        }
        let mut not_filtered = !self.tags.has_any(object, self.excluded)
            && (!self.filter_editor_only || !is_editor_only_object(graph, object));
        if mandatory && !not_filtered {
            warn!("dependency {} was filtered, but is mandatory; keeping it", describe());
            not_filtered = true;
        }
        if !not_filtered {
            return Ok(());
        }
        if !index.is_null() {
            bucket.insert(index);
        } else if graph.get_package_flags(graph.get_outermost(object)).contains(PackageFlags::COMPILED_IN) {
            debug!("compiled in dependency {} is not in the package tables and is ignored", describe());
        } else {
            bail!("dependency {} is not in the package tables", describe());
        }
        Ok(())
    }

    fn include_index(&self, bucket: &mut IndexSet<FPackageIndex>, index: FPackageIndex) {
        if let Some(object) = self.linker.object_at(index)
            && !self.in_core_package(object)
        {
            bucket.insert(index);
        }
    }

    /// Follows transient subobject templates to the template actually used at runtime.
    fn runtime_template(&self, mut subobject: ObjectId) -> ObjectId {
        let graph = self.graph;
        while graph.has_any_flags(subobject, ObjectFlags::TRANSIENT) {
            let Some(archetype) = graph.get_archetype(subobject) else {
                break;
            };
            if graph.get_class(archetype).is_some_and(|c| graph.is_native(c)) {
                break;
            }
            subobject = archetype;
        }
        subobject
    }

    fn subobject_templates(&self, outer: ObjectId) -> Vec<ObjectId> {
        let graph = self.graph;
        objects_in_package(graph, outer)
            .into_iter()
            .filter(|&s| graph.has_any_flags(s, ObjectFlags::DEFAULT_SUB_OBJECT | ObjectFlags::ARCHETYPE_OBJECT))
            .collect()
    }

    fn collect(
        &self,
        export_index: usize,
        object: ObjectId,
        native_dependencies: &HashMap<ObjectId, Vec<ObjectId>>,
    ) -> Result<ExportDependencies> {
        let graph = self.graph;
        let export = &self.linker.exports[export_index].export;
        let mut deps = ExportDependencies::default();

        self.include_index(&mut deps.serialization_before_create, export.class_index);
        if let Some(archetype) = graph.get_archetype(object) {
            self.include_object(1, &mut deps.serialization_before_create, archetype, object, true, false)?;
            for subobject in self.subobject_templates(archetype) {
                let template = self.runtime_template(subobject);
                if !graph.has_any_flags(template, ObjectFlags::PENDING_KILL) {
                    self.include_object(2, &mut deps.serialization_before_create, template, object, false, false)?;
                }
            }
        }

        let mut preload = vec![];
        graph.get_preload_dependencies(object, &mut preload);
        for dependency in preload {
            self.include_object(3, &mut deps.serialization_before_serialization, dependency, object, false, true)?;
        }
        if graph.has_any_flags(object, ObjectFlags::ARCHETYPE_OBJECT | ObjectFlags::CLASS_DEFAULT_OBJECT)
            && let Some(outer) = graph.get_outer(object)
            && !graph.is_package(outer)
        {
            self.include_object(4, &mut deps.serialization_before_serialization, outer, object, true, false)?;
        }
        let class_default_object =
            if graph.get_kind(object) == ObjectKind::Class { graph.get_class_default_object(object) } else { None };
        if let Some(cdo) = class_default_object {
            // archetypes of the CDO's subobjects load before the class
            for subobject in self.subobject_templates(cdo) {
                let Some(archetype) = graph.get_archetype(subobject) else {
                    continue;
                };
                let template = self.runtime_template(archetype);
                if !graph.has_any_flags(template, ObjectFlags::PENDING_KILL) {
                    self.include_object(5, &mut deps.serialization_before_serialization, template, object, false, false)?;
                }
            }
        }

        let cdo_index = class_default_object.map(|cdo| self.linker.map_object(cdo));
        for &index in &self.linker.depends_map[export_index] {
            if Some(index) != cdo_index {
                self.include_index(&mut deps.create_before_serialization, index);
            }
        }
        for &dependency in native_dependencies.get(&object).map(Vec::as_slice).unwrap_or_default() {
            if Some(dependency) != class_default_object {
                self.include_object(6, &mut deps.create_before_serialization, dependency, object, false, true)?;
            }
        }

        self.include_index(&mut deps.create_before_create, export.outer_index);
        self.include_index(&mut deps.create_before_create, export.super_index);

        deps.remove_redundant();
        Ok(deps)
    }
}

/// Fills the preload dependency list and the per export dependency ranges, and records every
/// arc in `checker`.
#[instrument(skip_all, name = "build_preload_dependencies")]
pub fn build_preload_dependencies<G: ObjectGraph + ?Sized>(
    graph: &G,
    linker: &mut SaveLinker,
    tags: &ObjectTags,
    native_dependencies: &HashMap<ObjectId, Vec<ObjectId>>,
    excluded: ObjectMarks,
    filter_editor_only: bool,
    checker: &mut DependencyCycleChecker,
) -> Result<()> {
    let mut per_export = Vec::with_capacity(linker.exports.len());
    {
        let collector = DependencyCollector { graph, linker, tags, excluded, filter_editor_only };
        for (i, entry) in linker.exports.iter().enumerate() {
            match entry.object {
                Some(object) => per_export.push(Some(collector.collect(i, object, native_dependencies)?)),
                None => per_export.push(None),
            }
        }
    }

    let mut preload_dependencies = vec![];
    for (i, deps) in per_export.into_iter().enumerate() {
        let Some(deps) = deps else {
            continue;
        };
        let object_full_name = linker.exports[i].object.map(|o| graph.get_full_name(o)).unwrap_or_default();
        checker.add_export(&object_full_name);
        let buckets = [
            (&deps.serialization_before_serialization, LoadPhase::Serialize, LoadPhase::Serialize),
            (&deps.create_before_serialization, LoadPhase::Create, LoadPhase::Serialize),
            (&deps.serialization_before_create, LoadPhase::Serialize, LoadPhase::Create),
            (&deps.create_before_create, LoadPhase::Create, LoadPhase::Create),
        ];
        let first = preload_dependencies.len() as i32;
        for (bucket, dependency_phase, export_phase) in buckets {
            for &index in bucket {
                if let Some(dependency) = linker.object_at(index) {
                    checker.add_arc(dependency_phase, &graph.get_full_name(dependency), export_phase, &object_full_name);
                }
                preload_dependencies.push(index);
            }
        }

        let export = &mut linker.exports[i].export;
        export.serialization_before_serialization_dependencies = deps.serialization_before_serialization.len() as i32;
        export.create_before_serialization_dependencies = deps.create_before_serialization.len() as i32;
        export.serialization_before_create_dependencies = deps.serialization_before_create.len() as i32;
        export.create_before_create_dependencies = deps.create_before_create.len() as i32;
        export.first_export_dependency = if preload_dependencies.len() as i32 > first { first } else { -1 };
    }
    linker.preload_dependencies = preload_dependencies;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::name_map::FNameTable;
    use crate::object_graph::{MemoryGraph, MemoryObject};
    use crate::sorting::SortedTable;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cycle_checker_reports_path() {
        let mut checker = DependencyCycleChecker::new();
        checker.add_export("A");
        checker.add_export("B");
        checker.add_arc(LoadPhase::Serialize, "B", LoadPhase::Serialize, "A");
        assert!(checker.check_for_cycles().is_ok());

        checker.add_arc(LoadPhase::Serialize, "A", LoadPhase::Serialize, "B");
        let err = checker.check_for_cycles().unwrap_err();
        let Some(SaveError::DependencyCycle { node, path }) = err.downcast_ref::<SaveError>() else {
            panic!("unexpected error {err:#}");
        };
        assert_eq!(node, "Serialize:A");
        assert_eq!(path, &vec!["Serialize:A".to_string(), "Serialize:B".to_string()]);
    }

    #[test]
    fn test_create_before_serialize_of_self_is_not_a_cycle() {
        let mut checker = DependencyCycleChecker::new();
        checker.add_export("A");
        checker.add_export("B");
        checker.add_arc(LoadPhase::Create, "A", LoadPhase::Create, "B");
        checker.add_arc(LoadPhase::Create, "B", LoadPhase::Serialize, "A");
        assert!(checker.check_for_cycles().is_ok());
        assert_eq!(checker.node_count(), 3);
    }

    struct Fixture {
        graph: MemoryGraph,
        package: ObjectId,
        class: ObjectId,
        cdo: ObjectId,
        instance: ObjectId,
        component: ObjectId,
    }

    fn fixture() -> Fixture {
        let mut graph = MemoryGraph::new();
        let package = graph.add(MemoryObject::new("/Game/Blueprint", ObjectKind::Plain));
        let class = graph.add(MemoryObject::new("Thing_C", ObjectKind::Class).with_outer(package));
        let cdo = graph.add(
            MemoryObject::new("Default__Thing_C", ObjectKind::Plain)
                .with_class(class)
                .with_outer(package)
                .with_flags(ObjectFlags::CLASS_DEFAULT_OBJECT | ObjectFlags::PUBLIC),
        );
        graph.object_mut(class).class_default_object = Some(cdo);
        let component = graph.add(
            MemoryObject::new("Mesh", ObjectKind::Plain)
                .with_class(class)
                .with_outer(cdo)
                .with_flags(ObjectFlags::DEFAULT_SUB_OBJECT | ObjectFlags::ARCHETYPE_OBJECT),
        );
        let instance = graph.add(
            MemoryObject::new("Thing", ObjectKind::Plain)
                .with_class(class)
                .with_outer(package)
                .with_archetype(cdo),
        );
        Fixture { graph, package, class, cdo, instance, component }
    }

    fn linker(fixture: &Fixture, exports: Vec<ObjectId>) -> SaveLinker {
        let mut names = FNameTable::new();
        for &o in &exports {
            names.mark_name_referenced(fixture.graph.get_name(o));
        }
        let exports = SortedTable { entries: exports.into_iter().map(Some).collect(), conformed: 0 };
        SaveLinker::new(fixture.package, names, &SortedTable::default(), &exports, HashMap::new())
    }

    #[test]
    fn test_buckets() -> Result<()> {
        let fixture = fixture();
        let Fixture { graph, class, cdo, instance, component, .. } = &fixture;
        let mut linker = linker(&fixture, vec![*class, *cdo, *component, *instance]);
        linker.build_export_map(graph, &ObjectTags::default())?;
        linker.depends_map = vec![vec![FPackageIndex::create_export(1)], vec![], vec![], vec![FPackageIndex::create_export(0)]];

        let mut checker = DependencyCycleChecker::new();
        build_preload_dependencies(graph, &mut linker, &ObjectTags::default(), &HashMap::new(), ObjectMarks::empty(), false, &mut checker)?;

        let class_export = &linker.exports[0].export;
        assert_eq!(class_export.first_export_dependency, -1);

        // the instance's class is a stronger dependency than its field reference
        let thing = &linker.exports[3].export;
        assert_eq!(thing.serialization_before_serialization_dependencies, 0);
        assert_eq!(thing.create_before_serialization_dependencies, 0);
        assert_eq!(thing.serialization_before_create_dependencies, 3);
        let buckets = [
            FPackageIndex::create_export(0),
            FPackageIndex::create_export(1),
            FPackageIndex::create_export(2),
        ];
        let start = thing.first_export_dependency as usize;
        assert_eq!(&linker.preload_dependencies[start..start + 3], &buckets);

        // the outer of the component template lands in create-before-create only
        let mesh = &linker.exports[2].export;
        let start = mesh.first_export_dependency as usize;
        assert_eq!(mesh.serialization_before_serialization_dependencies, 0);
        assert_eq!(mesh.serialization_before_create_dependencies, 1);
        assert_eq!(mesh.create_before_create_dependencies, 1);
        assert_eq!(start, 1);
        assert_eq!(&linker.preload_dependencies[start..start + 2], &[FPackageIndex::create_export(0), FPackageIndex::create_export(1)]);

        checker.check_for_cycles()?;
        Ok(())
    }

    #[test]
    fn test_preload_cycle_is_fatal() -> Result<()> {
        let mut fixture = fixture();
        let Fixture { package, class, cdo, instance, component, .. } = fixture;
        let other = fixture.graph.add(MemoryObject::new("Other", ObjectKind::Plain).with_class(class).with_outer(package));
        fixture.graph.object_mut(instance).preload_dependencies = vec![other];
        fixture.graph.object_mut(other).preload_dependencies = vec![instance];
        let mut linker = linker(&fixture, vec![class, cdo, component, instance, other]);
        linker.build_export_map(&fixture.graph, &ObjectTags::default())?;
        linker.depends_map = vec![vec![]; 5];

        let mut checker = DependencyCycleChecker::new();
        build_preload_dependencies(
            &fixture.graph,
            &mut linker,
            &ObjectTags::default(),
            &HashMap::new(),
            ObjectMarks::empty(),
            false,
            &mut checker,
        )?;
        let err = checker.check_for_cycles().unwrap_err();
        assert!(matches!(err.downcast_ref::<SaveError>(), Some(SaveError::DependencyCycle { .. })));
        Ok(())
    }

    #[test]
    fn test_missing_mandatory_dependency_is_fatal() -> Result<()> {
        let fixture = fixture();
        let (class, instance) = (fixture.class, fixture.instance);
        // the archetype is neither exported nor imported
        let mut linker = linker(&fixture, vec![class, instance]);
        linker.build_export_map(&fixture.graph, &ObjectTags::default())?;
        linker.depends_map = vec![vec![]; 2];
        let mut checker = DependencyCycleChecker::new();
        let err = build_preload_dependencies(
            &fixture.graph,
            &mut linker,
            &ObjectTags::default(),
            &HashMap::new(),
            ObjectMarks::empty(),
            false,
            &mut checker,
        )
        .unwrap_err();
        assert!(err.to_string().contains("is not in the package tables"));
        Ok(())
    }
}
