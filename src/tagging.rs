use std::collections::{HashMap, HashSet};

use anyhow::Result;
use bitflags::bitflags;
use indexmap::{IndexMap, IndexSet};
use tracing::{instrument, warn};

use crate::name_map::FNameTable;
use crate::object_graph::{
    CORE_UOBJECT_PACKAGE_NAME, FieldVisitor, ObjectFlags, ObjectGraph, ObjectId, ObjectKind, PackageFlags,
};
use crate::save::{SaveError, SaveTarget};

pub const PERSISTENT_LEVEL_NAME: &str = "PersistentLevel";
pub const WORLD_CLASS_NAME: &str = "World";

bitflags! {
    /// Per-object marks owned by a single save.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ObjectMarks: u8 {
        const TAG_EXP = 0x1;
        const TAG_IMP = 0x2;
        const EDITOR_ONLY = 0x4;
        const NOT_FOR_CLIENT = 0x8;
        const NOT_FOR_SERVER = 0x10;
        const NOT_ALWAYS_LOADED_FOR_EDITOR_GAME = 0x20;
        /// Target exclusion marks have been computed.
        const EXCLUSION_COMPUTED = 0x40;
    }
}
impl ObjectMarks {
    pub const EXCLUSION: Self = Self::EDITOR_ONLY.union(Self::NOT_FOR_CLIENT).union(Self::NOT_FOR_SERVER);

    /// Marks that keep an object out of a package saved for `target`.
    pub fn excluded_for(target: SaveTarget, filter_editor_only: bool) -> Self {
        let mut marks = match target {
            SaveTarget::Editor => Self::empty(),
            SaveTarget::Game => Self::EDITOR_ONLY,
            SaveTarget::Client => Self::EDITOR_ONLY | Self::NOT_FOR_CLIENT,
            SaveTarget::Server => Self::EDITOR_ONLY | Self::NOT_FOR_SERVER,
        };
        if filter_editor_only {
            marks |= Self::EDITOR_ONLY;
        }
        marks
    }
}

/// Mark storage for one save session.
#[derive(Debug, Default)]
pub struct ObjectTags {
    marks: HashMap<ObjectId, ObjectMarks>,
}
impl ObjectTags {
    pub fn get(&self, object: ObjectId) -> ObjectMarks {
        self.marks.get(&object).copied().unwrap_or_default()
    }
    pub fn has_any(&self, object: ObjectId, marks: ObjectMarks) -> bool {
        self.get(object).intersects(marks)
    }
    pub fn mark(&mut self, object: ObjectId, marks: ObjectMarks) {
        *self.marks.entry(object).or_default() |= marks;
    }
    pub fn unmark(&mut self, object: ObjectId, marks: ObjectMarks) {
        if let Some(m) = self.marks.get_mut(&object) {
            m.remove(marks);
        }
    }
    pub fn is_export(&self, object: ObjectId) -> bool {
        self.has_any(object, ObjectMarks::TAG_EXP)
    }
    pub fn is_import(&self, object: ObjectId) -> bool {
        self.has_any(object, ObjectMarks::TAG_IMP)
    }
    /// All objects carrying any of `marks`, in id order.
    pub fn objects_with_any(&self, marks: ObjectMarks) -> Vec<ObjectId> {
        let mut objects: Vec<ObjectId> = self.marks.iter().filter(|(_, m)| m.intersects(marks)).map(|(o, _)| *o).collect();
        objects.sort();
        objects
    }
    pub fn clear(&mut self) {
        self.marks.clear();
    }
}

pub(crate) fn is_editor_only_object<G: ObjectGraph + ?Sized>(graph: &G, object: ObjectId) -> bool {
    graph.is_editor_only(object)
        || graph
            .get_package_flags(graph.get_outermost(object))
            .contains(PackageFlags::EDITOR_ONLY)
}

/// Transient itself, or inside something that cannot be saved.
pub fn is_effectively_transient<G: ObjectGraph + ?Sized>(graph: &G, object: ObjectId) -> bool {
    let flags = graph.get_flags(object);
    if flags.contains(ObjectFlags::CLASS_DEFAULT_OBJECT) {
        return false;
    }
    if flags.contains(ObjectFlags::TRANSIENT) {
        return true;
    }
    let mut current = Some(object);
    while let Some(o) = current {
        let flags = graph.get_flags(o);
        if flags.contains(ObjectFlags::PENDING_KILL) || flags.contains(ObjectFlags::TRANSIENT) && !graph.is_native(o) {
            return true;
        }
        current = graph.get_outer(o);
    }
    false
}

fn exclusion_parents<G: ObjectGraph + ?Sized>(graph: &G, object: ObjectId) -> Vec<ObjectId> {
    let mut parents = vec![];
    parents.extend(graph.get_class(object));
    parents.extend(graph.get_outer(object));
    if graph.get_kind(object).is_struct() {
        parents.extend(graph.get_super_struct(object));
    }
    parents.extend(graph.get_archetype(object));
    parents
}

/// Computes the target exclusion marks of `root` and everything it inherits them from.
///
/// Marks are inherited from class, outer, super struct and archetype. The inheritance graph may
/// contain cycles (a class is its own class's instance); a node being visited contributes nothing.
pub fn compute_exclusion_marks<G: ObjectGraph + ?Sized>(graph: &G, tags: &mut ObjectTags, root: ObjectId) {
    if tags.has_any(root, ObjectMarks::EXCLUSION_COMPUTED) {
        return;
    }
    let mut visiting = HashSet::new();
    let mut stack = vec![(root, false)];
    while let Some((object, expanded)) = stack.pop() {
        if tags.has_any(object, ObjectMarks::EXCLUSION_COMPUTED) {
            continue;
        }
        if graph.get_name(graph.get_outermost(object)) == CORE_UOBJECT_PACKAGE_NAME {
            // nothing in the core package can be excluded
            tags.mark(object, ObjectMarks::EXCLUSION_COMPUTED);
            continue;
        }
        if !expanded {
            if !visiting.insert(object) {
                continue;
            }
            stack.push((object, true));
            for parent in exclusion_parents(graph, object) {
                if !tags.has_any(parent, ObjectMarks::EXCLUSION_COMPUTED) && !visiting.contains(&parent) {
                    stack.push((parent, false));
                }
            }
            continue;
        }

        let inherited = exclusion_parents(graph, object)
            .into_iter()
            .fold(ObjectMarks::empty(), |acc, p| acc | (tags.get(p) & ObjectMarks::EXCLUSION));
        let mut marks = inherited;
        if !graph.has_any_flags(object, ObjectFlags::CLASS_DEFAULT_OBJECT) {
            // a CDO must be kept whenever its class is, so it only takes inherited marks
            if is_editor_only_object(graph, object) {
                marks |= ObjectMarks::EDITOR_ONLY;
            }
            if !graph.needs_load_for_client(object) {
                marks |= ObjectMarks::NOT_FOR_CLIENT;
            }
            if !graph.needs_load_for_server(object) {
                marks |= ObjectMarks::NOT_FOR_SERVER;
            }
        }
        if marks.contains(ObjectMarks::NOT_FOR_CLIENT | ObjectMarks::NOT_FOR_SERVER) {
            marks |= ObjectMarks::EDITOR_ONLY;
        }
        tags.mark(object, marks | ObjectMarks::EXCLUSION_COMPUTED);
        visiting.remove(&object);
    }
}

/// Everything later stages need from tagging.
#[derive(Debug, Default)]
pub struct TagResult {
    pub tags: ObjectTags,
    pub names: FNameTable,
    /// Per export, the objects it references (exports included), in first-reference order.
    pub dependencies: HashMap<ObjectId, Vec<ObjectId>>,
    pub native_dependencies: HashMap<ObjectId, Vec<ObjectId>>,
    pub dependencies_referenced_by_non_redirectors: HashSet<ObjectId>,
    pub soft_package_references: IndexSet<String>,
    pub searchable_names: IndexMap<ObjectId, Vec<String>>,
    /// Duplicate exports mapped to the export that replaces them.
    pub duplicate_redirects: HashMap<ObjectId, ObjectId>,
}
impl TagResult {
    pub fn exports(&self) -> Vec<ObjectId> {
        self.tags.objects_with_any(ObjectMarks::TAG_EXP)
    }
    pub fn imports(&self) -> Vec<ObjectId> {
        self.tags.objects_with_any(ObjectMarks::TAG_IMP)
    }
}

/// Objects that make a package unsaveable, found while classifying imports.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IllegalImports {
    pub private_objects: Vec<ObjectId>,
    pub objects_in_other_maps: Vec<ObjectId>,
}

/// Discovers exports and imports of one package and collects the names they use.
pub struct PackageTagger<'g, G: ObjectGraph + ?Sized> {
    graph: &'g G,
    package: ObjectId,
    excluded: ObjectMarks,
    result: TagResult,
}
impl<'g, G: ObjectGraph + ?Sized> PackageTagger<'g, G> {
    pub fn new(graph: &'g G, package: ObjectId, excluded: ObjectMarks) -> Self {
        Self { graph, package, excluded, result: TagResult::default() }
    }
    pub fn result(&self) -> &TagResult {
        &self.result
    }
    pub fn finish(self) -> TagResult {
        self.result
    }

    /// Tags `base` and every object inside the package carrying any of `top_level_flags`, plus
    /// everything they reach inside the package.
    #[instrument(skip_all, name = "tag_exports")]
    pub fn tag_exports(&mut self, base: Option<ObjectId>, top_level_flags: ObjectFlags) -> Result<()> {
        let mut tagger = ExportTagger {
            graph: self.graph,
            package: self.package,
            excluded: self.excluded,
            tags: &mut self.result.tags,
            tagged: vec![],
            referencer: None,
            current_class: None,
        };
        if let Some(base) = base {
            tagger.process_base_object(base)?;
        }
        for object in objects_in_package(self.graph, self.package) {
            if self.graph.has_any_flags(object, top_level_flags) {
                tagger.process_base_object(object)?;
            }
        }
        Ok(())
    }

    /// Drops exports that carry a mark excluded for the target. Returns how many were dropped.
    pub fn untag_excluded_exports(&mut self) -> usize {
        let mut count = 0;
        for export in self.result.exports() {
            if self.result.tags.has_any(export, self.excluded) {
                warn!("object {} is marked for export, but has an excluded mark", self.graph.get_path_name(export));
                self.result.tags.unmark(export, ObjectMarks::TAG_EXP);
                count += 1;
            }
        }
        count
    }

    /// Runs the import tagger over every export, recording imports, dependencies and names.
    #[instrument(skip_all, name = "tag_imports")]
    pub fn tag_imports(&mut self) -> Result<()> {
        let graph = self.graph;
        for export in self.result.exports() {
            let mut tagger = ImportTagger {
                graph,
                excluded: self.excluded,
                transient_package: graph.get_transient_package(),
                result: &mut self.result,
                dependencies: vec![],
                native_dependencies: vec![],
                other_imports: vec![],
                ignore_dependencies: false,
                referencer: export,
            };
            graph.serialize_fields(export, &mut tagger)?;
            for (type_object, value) in graph.get_searchable_names(export) {
                tagger.mark_searchable_name(type_object, value)?;
            }
            if let Some(class) = graph.get_class(export) {
                tagger.visit(class)?;
            }
            if let Some(archetype) = graph.get_archetype(export) {
                tagger.visit(archetype)?;
            }
            let mut preload = vec![];
            graph.get_preload_dependencies(export, &mut preload);
            for dep in preload {
                // nothing in the core package loads assets while being constructed
                if graph.get_name(graph.get_outermost(dep)) != CORE_UOBJECT_PACKAGE_NAME {
                    tagger.ignore_dependencies = true;
                    tagger.visit(dep)?;
                    tagger.ignore_dependencies = false;
                }
            }

            let ImportTagger { dependencies, native_dependencies, .. } = tagger;
            if graph.get_kind(export) != ObjectKind::Redirector {
                self.result.dependencies_referenced_by_non_redirectors.extend(dependencies.iter().copied());
            }
            self.result.dependencies.insert(export, dependencies);
            self.result.native_dependencies.insert(export, native_dependencies);
        }
        Ok(())
    }

    /// Untags exports with the same name, class and outer as an earlier one.
    pub fn unmark_duplicate_exports(&mut self) {
        let graph = self.graph;
        let mut exports = self.result.exports();
        let outer_name = |o: ObjectId| graph.get_outer(o).map(|outer| graph.get_name(outer));
        exports.sort_by(|&a, &b| {
            graph
                .get_name(a)
                .cmp(graph.get_name(b))
                .then_with(|| graph.get_class_name(a).cmp(graph.get_class_name(b)))
                .then_with(|| outer_name(a).cmp(&outer_name(b)))
        });
        let mut last_unique = 0;
        for current in 1..exports.len() {
            let (unique, object) = (exports[last_unique], exports[current]);
            let duplicate = graph.get_outer(unique) == graph.get_outer(object)
                && graph.get_class(unique) == graph.get_class(object)
                && graph.get_name(unique) == graph.get_name(object);
            if duplicate {
                warn!("duplicate export {} replaced by {unique}", graph.get_path_name(object));
                self.result.tags.unmark(object, ObjectMarks::TAG_EXP);
                self.result.duplicate_redirects.insert(object, unique);
            } else {
                last_unique = current;
            }
        }
    }

    /// Marks the names every table entry needs and classifies imports that cannot be saved.
    pub fn mark_table_names(&mut self) -> IllegalImports {
        let graph = self.graph;
        let mut illegal = IllegalImports::default();
        let mut level_objects = vec![];
        for object in self.result.tags.objects_with_any(ObjectMarks::TAG_EXP | ObjectMarks::TAG_IMP) {
            let names = &mut self.result.names;
            names.mark_name_referenced(graph.get_name(object));
            if let Some(outer) = graph.get_outer(object)
                && outer != self.package
            {
                names.mark_name_referenced(graph.get_name(outer));
            }
            if !self.result.tags.is_import(object) {
                continue;
            }
            names.mark_name_referenced(graph.get_class_name(object));
            names.mark_name_referenced(graph.get_class_package_name(object));

            // packages are always public
            if !graph.is_package(object) && !graph.has_any_flags(object, ObjectFlags::PUBLIC | ObjectFlags::TRANSIENT) {
                illegal.private_objects.push(object);
            }
            let object_package = graph.get_outermost(object);
            if graph.get_package_flags(object_package).contains(PackageFlags::CONTAINS_MAP) {
                if object_package != object
                    && graph.get_name(object) != PERSISTENT_LEVEL_NAME
                    && graph.get_class_name(object) != WORLD_CLASS_NAME
                {
                    if self.result.dependencies_referenced_by_non_redirectors.contains(&object) {
                        warn!("object in another map: {}", graph.get_full_name(object));
                    }
                    illegal.objects_in_other_maps.push(object);
                } else {
                    level_objects.push(object);
                }
            }
        }
        if illegal.objects_in_other_maps.is_empty() {
            illegal.objects_in_other_maps = level_objects;
        }
        // redirectors may point into other maps
        let referenced = &self.result.dependencies_referenced_by_non_redirectors;
        illegal.objects_in_other_maps.retain(|o| referenced.contains(o));
        illegal
    }
}

/// Every object whose outer chain reaches `package`.
pub fn objects_in_package<G: ObjectGraph + ?Sized>(graph: &G, package: ObjectId) -> Vec<ObjectId> {
    let mut objects = vec![];
    let mut next = graph.get_objects_with_outer(package);
    while !next.is_empty() {
        let current = std::mem::take(&mut next);
        for object in current {
            next.extend(graph.get_objects_with_outer(object));
            objects.push(object);
        }
    }
    objects
}

struct ExportTagger<'a, G: ObjectGraph + ?Sized> {
    graph: &'a G,
    package: ObjectId,
    excluded: ObjectMarks,
    tags: &'a mut ObjectTags,
    /// Newly tagged objects whose fields have not been walked yet.
    tagged: Vec<ObjectId>,
    /// Object whose fields are being walked, for error reporting.
    referencer: Option<ObjectId>,
    /// Struct whose fields are being walked. Its own field chain is tagged along with it.
    current_class: Option<ObjectId>,
}
impl<G: ObjectGraph + ?Sized> ExportTagger<'_, G> {
    fn process_base_object(&mut self, base: ObjectId) -> Result<()> {
        self.referencer = None;
        self.visit(base)?;
        self.process_tagged_objects()
    }

    /// Walks the fields of tagged objects batch by batch until no new objects get tagged.
    fn process_tagged_objects(&mut self) -> Result<()> {
        let graph = self.graph;
        while !self.tagged.is_empty() {
            let batch = std::mem::take(&mut self.tagged);
            for object in batch {
                self.referencer = Some(object);
                self.current_class = graph.get_kind(object).is_struct().then_some(object);
                graph.serialize_fields(object, self)?;
            }
        }
        self.current_class = None;
        Ok(())
    }

    fn check_valid(&self, object: ObjectId) -> Result<()> {
        if !self.graph.is_valid(object) {
            let referencer = self.referencer.map(|r| self.graph.get_full_name(r)).unwrap_or_else(|| "<root>".into());
            return Err(SaveError::CorruptObject {
                object: format!("{} ({object})", self.graph.get_name(object)),
                referencer,
            }
            .into());
        }
        Ok(())
    }

    fn visit(&mut self, root: ObjectId) -> Result<()> {
        let graph = self.graph;
        let mut stack = vec![root];
        while let Some(object) = stack.pop() {
            self.check_valid(object)?;
            compute_exclusion_marks(graph, self.tags, object);

            if !graph.is_in(object, self.package)
                || is_effectively_transient(graph, object)
                || self.tags.has_any(object, ObjectMarks::TAG_EXP | self.excluded)
            {
                continue;
            }
            self.tags.mark(object, ObjectMarks::TAG_EXP);

            // not-for-editor-game is inherited by everything inside an object
            let mut needs_load_for_editor_game = false;
            let mut current = Some(object);
            while let Some(o) = current {
                if graph.needs_load_for_editor_game(o) {
                    needs_load_for_editor_game = true;
                    break;
                }
                current = graph.get_outer(o);
            }
            if !needs_load_for_editor_game
                && graph.has_any_flags(object, ObjectFlags::CLASS_DEFAULT_OBJECT)
                && let Some(class) = graph.get_class(object)
            {
                needs_load_for_editor_game = graph.needs_load_for_editor_game(class);
            }
            if !needs_load_for_editor_game {
                self.tags.mark(object, ObjectMarks::NOT_ALWAYS_LOADED_FOR_EDITOR_GAME);
            }

            // popped in reverse: archetype, CDO subobjects, class, outer, fields
            if graph.get_kind(object).is_struct() {
                stack.extend(field_chain(graph, object).into_iter().rev());
            }
            stack.extend(graph.get_outer(object));
            stack.extend(graph.get_class(object));
            if graph.has_any_flags(object, ObjectFlags::CLASS_DEFAULT_OBJECT) {
                stack.extend(graph.get_cdo_subobjects(object).into_iter().rev());
            }
            stack.extend(graph.get_archetype(object));

            self.tagged.push(object);
        }
        Ok(())
    }
}
impl<G: ObjectGraph + ?Sized> FieldVisitor for ExportTagger<'_, G> {
    fn object(&mut self, object: Option<ObjectId>) -> Result<()> {
        match object {
            Some(object)
                if self.current_class.is_some()
                    && self.graph.get_kind(object) == ObjectKind::Field
                    && self.graph.get_outer(object) == self.current_class =>
            {
                Ok(())
            }
            Some(object) => self.visit(object),
            None => Ok(()),
        }
    }
}

/// Fields of a struct in declaration order: the first child, then each `next` sibling.
fn field_chain<G: ObjectGraph + ?Sized>(graph: &G, owner: ObjectId) -> Vec<ObjectId> {
    let mut fields = vec![];
    let mut current = graph.get_children(owner);
    while let Some(field) = current {
        if fields.contains(&field) {
            break;
        }
        fields.push(field);
        current = graph.get_next(field);
    }
    fields
}

struct ImportTagger<'a, G: ObjectGraph + ?Sized> {
    graph: &'a G,
    excluded: ObjectMarks,
    transient_package: Option<ObjectId>,
    result: &'a mut TagResult,
    dependencies: Vec<ObjectId>,
    native_dependencies: Vec<ObjectId>,
    other_imports: Vec<ObjectId>,
    ignore_dependencies: bool,
    /// Export being walked.
    referencer: ObjectId,
}
impl<G: ObjectGraph + ?Sized> ImportTagger<'_, G> {
    fn visit(&mut self, root: ObjectId) -> Result<()> {
        let graph = self.graph;
        let mut stack = vec![(root, self.ignore_dependencies)];
        while let Some((object, ignore_dependencies)) = stack.pop() {
            if !graph.is_valid(object) {
                return Err(SaveError::CorruptObject {
                    object: format!("{} ({object})", graph.get_name(object)),
                    referencer: graph.get_full_name(self.referencer),
                }
                .into());
            }
            compute_exclusion_marks(graph, &mut self.result.tags, object);
            if self.result.tags.has_any(object, self.excluded) {
                continue;
            }
            if is_effectively_transient(graph, object) && !graph.is_native(object) {
                continue;
            }
            if let Some(transient) = self.transient_package
                && (object == transient || graph.is_in(object, transient))
            {
                return Err(SaveError::CorruptObject {
                    object: format!("transient object imported: {}", graph.get_full_name(object)),
                    referencer: graph.get_full_name(self.referencer),
                }
                .into());
            }

            let is_native = graph.is_native_in_chain(object);
            let is_top_level_package = graph.is_package(object);

            // exports are recorded as dependencies too
            if !is_top_level_package && !ignore_dependencies {
                let list = if is_native { &mut self.native_dependencies } else { &mut self.dependencies };
                if list.contains(&object) {
                    continue;
                }
                list.push(object);
            }

            if self.result.tags.is_export(object) {
                continue;
            }
            if is_top_level_package || ignore_dependencies {
                if self.other_imports.contains(&object) {
                    continue;
                }
                self.other_imports.push(object);
            }
            self.result.tags.mark(object, ObjectMarks::TAG_IMP);

            if let Some(outer) = graph.get_outer(object) {
                stack.push((outer, ignore_dependencies));
            }
            // a class import brings its CDO and default subobjects along, without becoming a dependency
            if !is_native
                && !ignore_dependencies
                && graph.get_kind(object) == ObjectKind::Class
                && let Some(cdo) = graph.get_class_default_object(object)
            {
                let mut templates = vec![cdo];
                templates.extend(graph.get_cdo_subobjects(cdo));
                stack.extend(templates.into_iter().rev().map(|t| (t, true)));
            }
        }
        Ok(())
    }

    fn mark_searchable_name(&mut self, type_object: ObjectId, value: String) -> Result<()> {
        if !self.dependencies.contains(&type_object) {
            self.visit(type_object)?;
        }
        self.result.names.mark_name_referenced(&value);
        let values = self.result.searchable_names.entry(type_object).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
        Ok(())
    }
}
impl<G: ObjectGraph + ?Sized> FieldVisitor for ImportTagger<'_, G> {
    fn object(&mut self, object: Option<ObjectId>) -> Result<()> {
        match object {
            Some(object) => self.visit(object),
            None => Ok(()),
        }
    }
    fn name(&mut self, name: &str) -> Result<()> {
        self.result.names.mark_name_referenced(name);
        Ok(())
    }
    fn soft_object_path(&mut self, path: &str) -> Result<()> {
        if !path.is_empty() {
            let package_name = path.split_once('.').map_or(path, |(package, _)| package);
            self.result.names.mark_name_referenced(package_name);
            self.result.soft_package_references.insert(package_name.to_string());
        }
        Ok(())
    }
}
