use std::collections::{HashMap, HashSet};

use anyhow::{Context as _, Result};
use indexmap::IndexSet;
use tracing::{instrument, warn};

use crate::object_graph::{ObjectFlags, ObjectGraph, ObjectId, ObjectKind, collect_references};
use crate::sorting::SortedTable;

/// Unit of work of [`ExportReferenceSorter`]. The sorter replaces call-stack recursion with an
/// explicit stack; steps that ran after a recursive call in a recursive formulation are pushed as
/// continuation tasks.
#[derive(Debug, Clone, Copy)]
enum Task {
    /// A reference found while walking an object's fields.
    Reference(ObjectId),
    /// `object` is required before whatever is being inserted at the current insert position.
    HandleDependency { object: ObjectId, process_object: bool },
    /// Advances the insert position past everything a dependency added.
    FinishDependency { previous_count: usize, previous_insert: usize },
    ProcessObject(ObjectId),
    ProcessStruct(ObjectId),
    StructBody(ObjectId),
    Insert(ObjectId),
    InsertAfter { object: ObjectId, anchor: ObjectId },
    Serialize(ObjectId),
    PushIgnoreFields(bool),
    PopIgnoreFields,
    SetIgnoreFields(bool),
    SetCurrentClass(Option<ObjectId>),
    PlaceClassDefaultObject(ObjectId),
    EndTopLevel,
}

/// Orders the exports of a package so a loader creating them in table order never has to seek
/// backwards: classes before their instances, class default objects right after their class,
/// struct fields right before the struct that owns them.
pub struct ExportReferenceSorter<'g, G: ObjectGraph + ?Sized> {
    graph: &'g G,
    package: ObjectId,
    /// Insert position while a top level object is being processed.
    current_insert: Option<usize>,
    core_references: usize,
    core_classes: Vec<ObjectId>,
    processed: IndexSet<ObjectId>,
    serialized: HashSet<ObjectId>,
    referenced: Vec<ObjectId>,
    ignore_field_references: bool,
    ignore_stack: Vec<bool>,
    /// Class whose fields are being walked; its other fields must not be pulled in early.
    current_class: Option<ObjectId>,
    tasks: Vec<Task>,
}

impl<'g, G: ObjectGraph + ?Sized> ExportReferenceSorter<'g, G> {
    pub fn new(graph: &'g G, package: ObjectId) -> Self {
        let mut sorter = Self {
            graph,
            package,
            current_insert: None,
            core_references: 0,
            core_classes: vec![],
            processed: IndexSet::new(),
            serialized: HashSet::new(),
            referenced: vec![],
            ignore_field_references: false,
            ignore_stack: vec![],
            current_class: None,
            tasks: vec![],
        };
        sorter.initialize_core_classes();
        sorter
    }

    /// The intrinsic classes and their CDOs are treated as already placed so nothing re-triggers them.
    fn initialize_core_classes(&mut self) {
        for class in self.graph.core_classes() {
            if self.core_classes.contains(&class) {
                continue;
            }
            self.core_classes.push(class);
            self.add_referenced(class, self.referenced.len());
            self.processed.insert(class);
            self.serialized.insert(class);
            if let Some(cdo) = self.graph.get_class_default_object(class) {
                self.add_referenced(cdo, self.referenced.len());
                self.processed.insert(cdo);
                self.serialized.insert(cdo);
            }
        }
        self.core_references = self.referenced.len();
    }

    fn add_referenced(&mut self, object: ObjectId, index: usize) {
        if !self.referenced.contains(&object) {
            self.referenced.insert(index.min(self.referenced.len()), object);
        }
    }

    fn is_in_package(&self, object: ObjectId) -> bool {
        self.graph.get_outermost(object) == self.package
    }

    fn clear(&mut self) {
        self.referenced.truncate(self.core_references);
    }

    fn take_export_list(&mut self, out: &mut Vec<ObjectId>) {
        out.extend_from_slice(&self.referenced[self.core_references..]);
        self.clear();
    }

    pub fn process_struct(&mut self, object: ObjectId) -> Result<()> {
        self.run(Task::ProcessStruct(object))
    }
    pub fn process_object(&mut self, object: ObjectId) -> Result<()> {
        self.run(Task::ProcessObject(object))
    }

    fn run(&mut self, task: Task) -> Result<()> {
        self.tasks.push(task);
        while let Some(task) = self.tasks.pop() {
            self.step(task)?;
        }
        Ok(())
    }

    /// Queues `tasks` so they execute in the given order.
    fn schedule(&mut self, tasks: impl IntoIterator<Item = Task, IntoIter: DoubleEndedIterator>) {
        self.tasks.extend(tasks.into_iter().rev());
    }

    /// A reference met while walking fields. Fields are placed directly at the insert position,
    /// other objects only need what creating them force-loads.
    fn handle_reference(&mut self, object: ObjectId) -> Result<()> {
        let graph = self.graph;
        if graph.has_any_flags(object, ObjectFlags::CLASS_DEFAULT_OBJECT)
            || self.processed.contains(&object)
            || !self.is_in_package(object)
        {
            return Ok(());
        }
        let kind = graph.get_kind(object);
        if !kind.is_field() {
            self.schedule([Task::HandleDependency { object, process_object: false }]);
            return Ok(());
        }
        if self.ignore_field_references || kind == ObjectKind::Class {
            return Ok(());
        }
        if self.current_class.is_some() && graph.get_outer(object) == self.current_class {
            return Ok(());
        }
        if kind.is_struct() {
            self.schedule([Task::ProcessStruct(object)]);
        } else {
            self.processed.insert(object);
            let index = self.current_insert.context("field reference outside of a top level object")?;
            self.add_referenced(object, index);
            self.schedule([Task::Serialize(object)]);
        }
        Ok(())
    }

    fn begin_top_level(&mut self) -> bool {
        let recursive = self.current_insert.is_some();
        if !recursive {
            self.current_insert = Some(self.referenced.len());
        }
        recursive
    }

    fn step(&mut self, task: Task) -> Result<()> {
        let graph = self.graph;
        match task {
            Task::Reference(object) => self.handle_reference(object),
            Task::HandleDependency { object, process_object } => {
                let previous_insert = self.current_insert.context("dependency handled outside of a top level object")?;
                let previous_count = self.referenced.len();
                let mut tasks = vec![];
                if self.is_in_package(object) {
                    if graph.get_kind(object).is_struct() {
                        tasks.push(Task::ProcessStruct(object));
                    } else if process_object {
                        tasks.push(Task::ProcessObject(object));
                    } else {
                        // creating an object only force-loads its class and archetype
                        if let Some(outer) = graph.get_outer(object)
                            && !self.processed.contains(&outer)
                        {
                            tasks.push(Task::HandleDependency { object: outer, process_object: false });
                        }
                        tasks.extend(graph.get_archetype(object).map(Task::ProcessObject));
                        tasks.extend(graph.get_class(object).map(Task::ProcessStruct));
                    }
                }
                tasks.push(Task::FinishDependency { previous_count, previous_insert });
                self.schedule(tasks);
                Ok(())
            }
            Task::FinishDependency { previous_count, previous_insert } => {
                let current = self.current_insert.context("dependency finished outside of a top level object")?;
                let insert_offset = current as i64 - previous_insert as i64;
                let advance = (self.referenced.len() as i64 - previous_count as i64) - insert_offset;
                if advance > 0 {
                    self.current_insert = Some(current + advance as usize);
                }
                Ok(())
            }
            Task::ProcessObject(object) => {
                if graph.has_any_flags(object, ObjectFlags::CLASS_DEFAULT_OBJECT) || !self.processed.insert(object) {
                    return Ok(());
                }
                let recursive = self.begin_top_level();
                let mut tasks = vec![];
                tasks.extend(graph.get_class(object).map(|o| Task::HandleDependency { object: o, process_object: true }));
                tasks.extend(graph.get_outer(object).map(|o| Task::HandleDependency { object: o, process_object: false }));
                tasks.extend(graph.get_archetype(object).map(|o| Task::HandleDependency { object: o, process_object: true }));
                if graph.get_kind(object) == ObjectKind::Redirector
                    && let Some(destination) = graph.get_redirector_destination(object)
                {
                    tasks.push(Task::HandleDependency { object: destination, process_object: false });
                }
                tasks.push(Task::Insert(object));
                tasks.push(Task::Serialize(object));
                if !recursive {
                    tasks.push(Task::EndTopLevel);
                }
                self.schedule(tasks);
                Ok(())
            }
            Task::ProcessStruct(object) => {
                if !self.processed.insert(object) {
                    return Ok(());
                }
                let recursive = self.begin_top_level();
                let mut tasks = vec![];
                tasks.extend(graph.get_super_struct(object).map(|o| Task::HandleDependency { object: o, process_object: false }));
                tasks.push(Task::Insert(object));
                tasks.push(Task::StructBody(object));
                if graph.get_kind(object) == ObjectKind::Class {
                    tasks.push(Task::PlaceClassDefaultObject(object));
                }
                if !recursive {
                    tasks.push(Task::EndTopLevel);
                }
                self.schedule(tasks);
                Ok(())
            }
            Task::StructBody(object) => {
                if self.serialized.contains(&object) {
                    return Ok(());
                }
                let is_class = graph.get_kind(object) == ObjectKind::Class;
                // references of the struct itself first, then its fields just ahead of it
                let mut tasks = vec![Task::PushIgnoreFields(true), Task::Serialize(object), Task::SetIgnoreFields(false)];
                if !is_class {
                    tasks.push(Task::SetCurrentClass(graph.get_owner_class(object)));
                }
                tasks.extend(graph.get_children(object).map(Task::Reference));
                tasks.push(Task::SetCurrentClass(None));
                tasks.extend(graph.get_next(object).map(Task::Reference));
                tasks.push(Task::PopIgnoreFields);
                self.schedule(tasks);
                Ok(())
            }
            Task::Insert(object) => {
                let index = self.current_insert.context("insert outside of a top level object")?;
                self.add_referenced(object, index);
                Ok(())
            }
            Task::Serialize(object) => {
                if !self.serialized.insert(object) {
                    return Ok(());
                }
                let mut references = vec![];
                if graph.get_kind(object).is_field() {
                    references.extend(graph.get_next(object));
                }
                if graph.get_kind(object).is_struct() {
                    references.extend(graph.get_super_struct(object));
                    references.extend(graph.get_children(object));
                }
                references.extend(collect_references(graph, object)?);
                self.schedule(references.into_iter().map(Task::Reference).collect::<Vec<_>>());
                Ok(())
            }
            Task::PushIgnoreFields(ignore) => {
                self.ignore_stack.push(self.ignore_field_references);
                self.ignore_field_references = ignore;
                Ok(())
            }
            Task::PopIgnoreFields => {
                self.ignore_field_references = self.ignore_stack.pop().context("unbalanced field reference scope")?;
                Ok(())
            }
            Task::SetIgnoreFields(ignore) => {
                self.ignore_field_references = ignore;
                Ok(())
            }
            Task::SetCurrentClass(class) => {
                self.current_class = class;
                Ok(())
            }
            Task::PlaceClassDefaultObject(class) => {
                let Some(cdo) = graph.get_class_default_object(class) else {
                    warn!("class {} has no class default object", graph.get_path_name(class));
                    return Ok(());
                };
                if !self.processed.insert(cdo) {
                    return Ok(());
                }
                // the CDO's own references go before the class, the CDO itself directly after it
                self.schedule([Task::Serialize(cdo), Task::InsertAfter { object: cdo, anchor: class }]);
                Ok(())
            }
            Task::InsertAfter { object, anchor } => {
                let anchor_index = self
                    .referenced
                    .iter()
                    .position(|&o| o == anchor)
                    .with_context(|| format!("{} was not placed before its dependent", graph.get_path_name(anchor)))?;
                self.add_referenced(object, anchor_index + 1);
                Ok(())
            }
            Task::EndTopLevel => {
                self.current_insert = None;
                Ok(())
            }
        }
    }
}

/// Problems found by [`verify_export_order`]: an export whose class or archetype comes after it.
pub fn verify_export_order<G: ObjectGraph + ?Sized>(graph: &G, package: ObjectId, exports: &[Option<ObjectId>]) -> Vec<String> {
    let positions: HashMap<ObjectId, usize> = exports.iter().enumerate().filter_map(|(i, e)| e.map(|e| (e, i))).collect();
    let mut errors = vec![];
    for (index, &export) in exports.iter().enumerate() {
        let Some(export) = export else { continue };
        let mut required = vec![];
        required.extend(graph.get_class(export).map(|o| ("Class", o)));
        required.extend(graph.get_archetype(export).map(|o| ("Archetype", o)));
        if graph.get_kind(export) == ObjectKind::Redirector
            && let Some(destination) = graph.get_redirector_destination(export)
        {
            required.extend(graph.get_class(destination).map(|o| ("Redirector destination class", o)));
            required.extend(graph.get_archetype(destination).map(|o| ("Redirector destination archetype", o)));
        }
        for (what, object) in required {
            if graph.get_outermost(object) != package {
                continue;
            }
            if let Some(&other) = positions.get(&object)
                && other >= index
            {
                errors.push(format!(
                    "sorting error detected ({what} appears later in the export list): {index}) {} => {other}) {}",
                    graph.get_full_name(export),
                    graph.get_full_name(object)
                ));
            }
        }
    }
    errors
}

/// Reorders the non-conformed part of an export table into load order. Classes and everything
/// they force-load come first, then all other exports.
#[instrument(skip_all, name = "sort_exports_seek_free")]
pub fn sort_exports_seek_free<G: ObjectGraph + ?Sized>(graph: &G, package: ObjectId, table: &SortedTable) -> Result<SortedTable> {
    let sortable: Vec<ObjectId> = table.entries[table.conformed..].iter().flatten().copied().collect();
    let mut sorter = ExportReferenceSorter::new(graph, package);
    let mut sorted = vec![];
    for &export in &sortable {
        if graph.get_kind(export) == ObjectKind::Class {
            sorter.clear();
            sorter.process_struct(export)?;
            sorter.take_export_list(&mut sorted);
        }
    }
    for &export in &sortable {
        sorter.clear();
        sorter.process_object(export)?;
        sorter.take_export_list(&mut sorted);
    }

    let sortable_set: HashSet<ObjectId> = sortable.iter().copied().collect();
    let mut placed = HashSet::new();
    let mut entries = table.entries[..table.conformed].to_vec();
    for object in sorted {
        if sortable_set.contains(&object) && placed.insert(object) {
            entries.push(Some(object));
        }
    }
    for &export in &sortable {
        if placed.insert(export) {
            warn!("export {} was not reached while sorting, appending it", graph.get_full_name(export));
            entries.push(Some(export));
        }
    }
    for error in verify_export_order(graph, package, &entries) {
        warn!("{error}");
    }
    Ok(SortedTable { entries, conformed: table.conformed })
}
