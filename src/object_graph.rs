use anyhow::{Result, bail};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::fmt::{Display, Formatter};
use strum::Display;

use crate::package_file::FGuid;

pub const CORE_UOBJECT_PACKAGE_NAME: &str = "/Script/CoreUObject";
pub const PACKAGE_CLASS_NAME: &str = "Package";
pub const CLASS_CLASS_NAME: &str = "Class";
pub const SUBOBJECT_DELIMITER: char = ':';

/// Handle of an object in an [`ObjectGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u32);
impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an object is, decided once by the graph instead of re-derived by downcasting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum ObjectKind {
    #[default]
    Plain,
    /// Non-struct member of a struct (a property).
    Field,
    Struct,
    Class,
    Redirector,
}
impl ObjectKind {
    pub fn is_struct(self) -> bool {
        matches!(self, Self::Struct | Self::Class)
    }
    pub fn is_field(self) -> bool {
        matches!(self, Self::Field | Self::Struct | Self::Class)
    }
}

bitflags! {
    /// Object flags. The values match what is stored in the export table.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ObjectFlags: u32 {
        const PUBLIC = 0x1;
        const STANDALONE = 0x2;
        const TRANSACTIONAL = 0x8;
        const CLASS_DEFAULT_OBJECT = 0x10;
        const ARCHETYPE_OBJECT = 0x20;
        const TRANSIENT = 0x40;
        const DEFAULT_SUB_OBJECT = 0x4_0000;
        const PENDING_KILL = 0x2000_0000;
    }
}
impl ObjectFlags {
    /// Flags persisted in the export table.
    pub const LOAD_MASK: Self = Self::PUBLIC
        .union(Self::STANDALONE)
        .union(Self::TRANSACTIONAL)
        .union(Self::CLASS_DEFAULT_OBJECT)
        .union(Self::ARCHETYPE_OBJECT)
        .union(Self::DEFAULT_SUB_OBJECT);
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PackageFlags: u32 {
        const NEWLY_CREATED = 0x1;
        const SERVER_SIDE_ONLY = 0x4;
        const COMPILED_IN = 0x10;
        const EDITOR_ONLY = 0x40;
        const CONTAINS_MAP = 0x2_0000;
        const REQUIRES_LOCALIZATION_GATHER = 0x4_0000;
        const FILTER_EDITOR_ONLY = 0x8000_0000;
    }
}

bitflags! {
    /// Properties the reflection layer reports about an object that are not stored as object flags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ObjectTraits: u32 {
        const NATIVE = 0x1;
        const EDITOR_ONLY = 0x2;
        const NOT_FOR_CLIENT = 0x4;
        const NOT_FOR_SERVER = 0x8;
        const NOT_FOR_EDITOR_GAME = 0x10;
        const ASSET = 0x20;
        const CORRUPT = 0x40;
        const PARTIALLY_LOADED = 0x80;
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkData {
    pub flags: u32,
    pub element_count: i32,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub data: Vec<u8>,
}

/// One serialized field value of an object.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Object(Option<ObjectId>),
    Name(String),
    SoftObjectPath(String),
    Bytes(#[serde_as(as = "serde_with::hex::Hex")] Vec<u8>),
    BulkData(BulkData),
}
impl FieldValue {
    pub fn visit(&self, visitor: &mut dyn FieldVisitor) -> Result<()> {
        match self {
            FieldValue::Object(object) => visitor.object(*object),
            FieldValue::Name(name) => visitor.name(name),
            FieldValue::SoftObjectPath(path) => visitor.soft_object_path(path),
            FieldValue::Bytes(data) => visitor.bytes(data),
            FieldValue::BulkData(bulk) => visitor.bulk_data(bulk),
        }
    }
}

/// Receives an object's field values in serialization order.
pub trait FieldVisitor {
    fn object(&mut self, object: Option<ObjectId>) -> Result<()>;
    fn name(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }
    fn soft_object_path(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }
    fn bytes(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
    fn bulk_data(&mut self, _bulk: &BulkData) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct ReferenceCollector {
    references: Vec<ObjectId>,
}
impl FieldVisitor for ReferenceCollector {
    fn object(&mut self, object: Option<ObjectId>) -> Result<()> {
        self.references.extend(object);
        Ok(())
    }
}

/// Hard object references of `object` in serialization order.
pub fn collect_references<G: ObjectGraph + ?Sized>(graph: &G, object: ObjectId) -> Result<Vec<ObjectId>> {
    let mut collector = ReferenceCollector::default();
    graph.serialize_fields(object, &mut collector)?;
    Ok(collector.references)
}

/// Capability interface the save pipeline needs from the reflection layer.
///
/// An object without an outer is a package. An object without a class uses the intrinsic
/// `Package` class when it is a package and the intrinsic `Class` class otherwise.
pub trait ObjectGraph {
    fn get_name(&self, object: ObjectId) -> &str;
    fn get_kind(&self, object: ObjectId) -> ObjectKind;
    fn get_flags(&self, object: ObjectId) -> ObjectFlags;
    fn get_class(&self, object: ObjectId) -> Option<ObjectId>;
    fn get_outer(&self, object: ObjectId) -> Option<ObjectId>;
    fn get_archetype(&self, object: ObjectId) -> Option<ObjectId>;
    fn get_super_struct(&self, object: ObjectId) -> Option<ObjectId>;
    /// First field of a struct.
    fn get_children(&self, object: ObjectId) -> Option<ObjectId>;
    /// Next field in the owning struct's field chain.
    fn get_next(&self, object: ObjectId) -> Option<ObjectId>;
    fn get_class_default_object(&self, class: ObjectId) -> Option<ObjectId>;
    fn get_redirector_destination(&self, object: ObjectId) -> Option<ObjectId>;
    fn get_objects_with_outer(&self, outer: ObjectId) -> Vec<ObjectId>;
    fn serialize_fields(&self, object: ObjectId, visitor: &mut dyn FieldVisitor) -> Result<()>;
    fn get_preload_dependencies(&self, object: ObjectId, out: &mut Vec<ObjectId>);

    fn get_searchable_names(&self, _object: ObjectId) -> Vec<(ObjectId, String)> {
        vec![]
    }
    fn is_valid(&self, _object: ObjectId) -> bool {
        true
    }
    fn is_native(&self, _object: ObjectId) -> bool {
        false
    }
    fn is_editor_only(&self, _object: ObjectId) -> bool {
        false
    }
    fn needs_load_for_client(&self, _object: ObjectId) -> bool {
        true
    }
    fn needs_load_for_server(&self, _object: ObjectId) -> bool {
        true
    }
    fn needs_load_for_editor_game(&self, _object: ObjectId) -> bool {
        true
    }
    fn is_asset(&self, _object: ObjectId) -> bool {
        false
    }
    fn get_package_flags(&self, _package: ObjectId) -> PackageFlags {
        PackageFlags::empty()
    }
    fn get_package_guid(&self, _package: ObjectId) -> Option<FGuid> {
        None
    }
    fn is_fully_loaded(&self, _package: ObjectId) -> bool {
        true
    }
    fn get_transient_package(&self) -> Option<ObjectId> {
        None
    }
    /// Intrinsic classes every package may reference; the seek-free sorter never reorders them.
    fn core_classes(&self) -> Vec<ObjectId> {
        vec![]
    }

    fn is_package(&self, object: ObjectId) -> bool {
        self.get_outer(object).is_none()
    }
    fn get_outermost(&self, object: ObjectId) -> ObjectId {
        let mut current = object;
        while let Some(outer) = self.get_outer(current) {
            current = outer;
        }
        current
    }
    /// Whether `outer` is somewhere in the outer chain of `object`.
    fn is_in(&self, object: ObjectId, outer: ObjectId) -> bool {
        let mut current = self.get_outer(object);
        while let Some(o) = current {
            if o == outer {
                return true;
            }
            current = self.get_outer(o);
        }
        false
    }
    fn has_any_flags(&self, object: ObjectId, flags: ObjectFlags) -> bool {
        self.get_flags(object).intersects(flags)
    }
    fn get_class_name(&self, object: ObjectId) -> &str {
        match self.get_class(object) {
            Some(class) => self.get_name(class),
            None if self.is_package(object) => PACKAGE_CLASS_NAME,
            None => CLASS_CLASS_NAME,
        }
    }
    /// Name of the package the object's class lives in.
    fn get_class_package_name(&self, object: ObjectId) -> &str {
        match self.get_class(object) {
            Some(class) => self.get_name(self.get_outermost(class)),
            None => CORE_UOBJECT_PACKAGE_NAME,
        }
    }
    fn get_path_name(&self, object: ObjectId) -> String {
        let mut chain = vec![object];
        while let Some(outer) = self.get_outer(chain[chain.len() - 1]) {
            chain.push(outer);
        }
        let mut path = String::new();
        for (i, &o) in chain.iter().enumerate().rev() {
            if let Some(&outer) = chain.get(i + 1) {
                let outer_is_top_level = self.get_outer(outer).is_some_and(|oo| self.is_package(oo));
                path.push(if outer_is_top_level { SUBOBJECT_DELIMITER } else { '.' });
            }
            path.push_str(self.get_name(o));
        }
        path
    }
    fn get_full_name(&self, object: ObjectId) -> String {
        format!("{} {}", self.get_class_name(object), self.get_path_name(object))
    }
    /// Closest class in the outer chain, starting with the object itself.
    fn get_owner_class(&self, object: ObjectId) -> Option<ObjectId> {
        let mut current = Some(object);
        while let Some(o) = current {
            if self.get_kind(o) == ObjectKind::Class {
                return Some(o);
            }
            current = self.get_outer(o);
        }
        None
    }
    /// Native itself, or nested inside a native class.
    fn is_native_in_chain(&self, object: ObjectId) -> bool {
        if self.is_native(object) {
            return true;
        }
        let mut current = self.get_outer(object);
        while let Some(o) = current {
            if self.get_kind(o) == ObjectKind::Class && self.is_native(o) {
                return true;
            }
            current = self.get_outer(o);
        }
        false
    }
    /// Default subobject templates nested inside a CDO or its class.
    fn get_cdo_subobjects(&self, cdo: ObjectId) -> Vec<ObjectId> {
        let mut subobjects = vec![];
        let mut next: Vec<ObjectId> = vec![];
        if let Some(class) = self.get_class(cdo) {
            next.extend(self.get_objects_with_outer(class));
        }
        next.extend(self.get_objects_with_outer(cdo));
        while !next.is_empty() {
            let current = std::mem::take(&mut next);
            for sub in current {
                if self.has_any_flags(sub, ObjectFlags::DEFAULT_SUB_OBJECT | ObjectFlags::ARCHETYPE_OBJECT) {
                    subobjects.push(sub);
                    next.extend(self.get_objects_with_outer(sub));
                }
            }
        }
        subobjects
    }
}

/// Object description used by [`MemoryGraph`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryObject {
    pub name: String,
    pub kind: ObjectKind,
    pub class: Option<ObjectId>,
    pub outer: Option<ObjectId>,
    pub archetype: Option<ObjectId>,
    pub super_struct: Option<ObjectId>,
    /// Fields of a struct in declaration order.
    pub children: Vec<ObjectId>,
    pub class_default_object: Option<ObjectId>,
    pub redirector_destination: Option<ObjectId>,
    pub flags: ObjectFlags,
    pub traits: ObjectTraits,
    pub package_flags: PackageFlags,
    pub package_guid: Option<FGuid>,
    pub fields: Vec<FieldValue>,
    pub preload_dependencies: Vec<ObjectId>,
    pub searchable_names: Vec<(ObjectId, String)>,
}
impl MemoryObject {
    pub fn new(name: impl Into<String>, kind: ObjectKind) -> Self {
        Self { name: name.into(), kind, ..Default::default() }
    }
    pub fn with_class(mut self, class: ObjectId) -> Self {
        self.class = Some(class);
        self
    }
    pub fn with_outer(mut self, outer: ObjectId) -> Self {
        self.outer = Some(outer);
        self
    }
    pub fn with_archetype(mut self, archetype: ObjectId) -> Self {
        self.archetype = Some(archetype);
        self
    }
    pub fn with_flags(mut self, flags: ObjectFlags) -> Self {
        self.flags |= flags;
        self
    }
    pub fn with_traits(mut self, traits: ObjectTraits) -> Self {
        self.traits |= traits;
        self
    }
    pub fn with_fields(mut self, fields: Vec<FieldValue>) -> Self {
        self.fields = fields;
        self
    }
}

/// Complete in-memory object graph, loadable from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryGraph {
    objects: Vec<MemoryObject>,
    #[serde(default)]
    transient_package: Option<ObjectId>,
    #[serde(default)]
    core_classes: Vec<ObjectId>,
}
impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn from_json(json: &str) -> Result<Self> {
        let graph: Self = serde_json::from_str(json)?;
        graph.validate()?;
        Ok(graph)
    }
    pub fn add(&mut self, object: MemoryObject) -> ObjectId {
        self.objects.push(object);
        ObjectId(self.objects.len() as u32 - 1)
    }
    pub fn object(&self, id: ObjectId) -> &MemoryObject {
        &self.objects[id.0 as usize]
    }
    pub fn object_mut(&mut self, id: ObjectId) -> &mut MemoryObject {
        &mut self.objects[id.0 as usize]
    }
    pub fn len(&self) -> usize {
        self.objects.len()
    }
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
    pub fn set_transient_package(&mut self, package: ObjectId) {
        self.transient_package = Some(package);
    }
    pub fn add_core_class(&mut self, class: ObjectId) {
        self.core_classes.push(class);
    }
    /// Looks an object up by path name.
    pub fn find(&self, path: &str) -> Option<ObjectId> {
        (0..self.objects.len() as u32).map(ObjectId).find(|&id| self.get_path_name(id) == path)
    }

    /// Checks that every object reference points at an existing object and that outer chains terminate.
    pub fn validate(&self) -> Result<()> {
        let count = self.objects.len() as u32;
        let check = |id: ObjectId, owner: usize, what: &str| -> Result<()> {
            if id.0 >= count {
                bail!("object {owner} ({:?}) has {what} {id} out of range", self.objects[owner].name);
            }
            Ok(())
        };
        for (i, object) in self.objects.iter().enumerate() {
            let single = [
                (object.class, "class"),
                (object.outer, "outer"),
                (object.archetype, "archetype"),
                (object.super_struct, "super struct"),
                (object.class_default_object, "class default object"),
                (object.redirector_destination, "redirector destination"),
            ];
            for (id, what) in single {
                if let Some(id) = id {
                    check(id, i, what)?;
                }
            }
            for &id in &object.children {
                check(id, i, "child")?;
            }
            for &id in &object.preload_dependencies {
                check(id, i, "preload dependency")?;
            }
            for (id, _) in &object.searchable_names {
                check(*id, i, "searchable name type")?;
            }
            for field in &object.fields {
                if let FieldValue::Object(Some(id)) = field {
                    check(*id, i, "field reference")?;
                }
            }
        }
        for (i, _) in self.objects.iter().enumerate() {
            let mut depth = 0;
            let mut current = self.objects[i].outer;
            while let Some(o) = current {
                depth += 1;
                if depth > self.objects.len() {
                    bail!("outer chain of object {i} ({:?}) is cyclic", self.objects[i].name);
                }
                current = self.objects[o.0 as usize].outer;
            }
        }
        for id in self.transient_package.iter().chain(&self.core_classes) {
            if id.0 >= count {
                bail!("graph root {id} out of range");
            }
        }
        Ok(())
    }
}

impl ObjectGraph for MemoryGraph {
    fn get_name(&self, object: ObjectId) -> &str {
        &self.object(object).name
    }
    fn get_kind(&self, object: ObjectId) -> ObjectKind {
        self.object(object).kind
    }
    fn get_flags(&self, object: ObjectId) -> ObjectFlags {
        self.object(object).flags
    }
    fn get_class(&self, object: ObjectId) -> Option<ObjectId> {
        self.object(object).class
    }
    fn get_outer(&self, object: ObjectId) -> Option<ObjectId> {
        self.object(object).outer
    }
    fn get_archetype(&self, object: ObjectId) -> Option<ObjectId> {
        self.object(object).archetype
    }
    fn get_super_struct(&self, object: ObjectId) -> Option<ObjectId> {
        self.object(object).super_struct
    }
    fn get_children(&self, object: ObjectId) -> Option<ObjectId> {
        self.object(object).children.first().copied()
    }
    fn get_next(&self, object: ObjectId) -> Option<ObjectId> {
        let owner = self.object(object).outer?;
        let siblings = &self.object(owner).children;
        let position = siblings.iter().position(|&c| c == object)?;
        siblings.get(position + 1).copied()
    }
    fn get_class_default_object(&self, class: ObjectId) -> Option<ObjectId> {
        self.object(class).class_default_object
    }
    fn get_redirector_destination(&self, object: ObjectId) -> Option<ObjectId> {
        self.object(object).redirector_destination
    }
    fn get_objects_with_outer(&self, outer: ObjectId) -> Vec<ObjectId> {
        (0..self.objects.len() as u32)
            .map(ObjectId)
            .filter(|&id| self.object(id).outer == Some(outer))
            .collect()
    }
    fn serialize_fields(&self, object: ObjectId, visitor: &mut dyn FieldVisitor) -> Result<()> {
        for field in &self.object(object).fields {
            field.visit(visitor)?;
        }
        Ok(())
    }
    fn get_preload_dependencies(&self, object: ObjectId, out: &mut Vec<ObjectId>) {
        out.extend(&self.object(object).preload_dependencies);
    }
    fn get_searchable_names(&self, object: ObjectId) -> Vec<(ObjectId, String)> {
        self.object(object).searchable_names.clone()
    }
    fn is_valid(&self, object: ObjectId) -> bool {
        !self.object(object).traits.contains(ObjectTraits::CORRUPT)
    }
    fn is_native(&self, object: ObjectId) -> bool {
        self.object(object).traits.contains(ObjectTraits::NATIVE)
    }
    fn is_editor_only(&self, object: ObjectId) -> bool {
        self.object(object).traits.contains(ObjectTraits::EDITOR_ONLY)
    }
    fn needs_load_for_client(&self, object: ObjectId) -> bool {
        !self.object(object).traits.contains(ObjectTraits::NOT_FOR_CLIENT)
    }
    fn needs_load_for_server(&self, object: ObjectId) -> bool {
        !self.object(object).traits.contains(ObjectTraits::NOT_FOR_SERVER)
    }
    fn needs_load_for_editor_game(&self, object: ObjectId) -> bool {
        !self.object(object).traits.contains(ObjectTraits::NOT_FOR_EDITOR_GAME)
    }
    fn is_asset(&self, object: ObjectId) -> bool {
        self.object(object).traits.contains(ObjectTraits::ASSET)
    }
    fn get_package_flags(&self, package: ObjectId) -> PackageFlags {
        self.object(package).package_flags
    }
    fn get_package_guid(&self, package: ObjectId) -> Option<FGuid> {
        self.object(package).package_guid
    }
    fn is_fully_loaded(&self, package: ObjectId) -> bool {
        !self.object(package).traits.contains(ObjectTraits::PARTIALLY_LOADED)
    }
    fn get_transient_package(&self) -> Option<ObjectId> {
        self.transient_package
    }
    fn core_classes(&self) -> Vec<ObjectId> {
        self.core_classes.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> (MemoryGraph, ObjectId, ObjectId, ObjectId) {
        let mut graph = MemoryGraph::new();
        let script = graph.add(MemoryObject::new("/Script/Engine", ObjectKind::Plain));
        let class = graph.add(MemoryObject::new("StaticMesh", ObjectKind::Class).with_outer(script).with_traits(ObjectTraits::NATIVE));
        let package = graph.add(MemoryObject::new("/Game/Meshes/Cube", ObjectKind::Plain));
        let mesh = graph.add(MemoryObject::new("Cube", ObjectKind::Plain).with_class(class).with_outer(package));
        let section = graph.add(MemoryObject::new("Section_0", ObjectKind::Plain).with_class(class).with_outer(mesh));
        (graph, package, mesh, section)
    }

    #[test]
    fn test_path_names() {
        let (graph, package, mesh, section) = sample();
        assert_eq!(graph.get_path_name(package), "/Game/Meshes/Cube");
        assert_eq!(graph.get_path_name(mesh), "/Game/Meshes/Cube.Cube");
        assert_eq!(graph.get_path_name(section), "/Game/Meshes/Cube.Cube:Section_0");
        assert_eq!(graph.get_full_name(section), "StaticMesh /Game/Meshes/Cube.Cube:Section_0");
        assert_eq!(graph.get_full_name(package), "Package /Game/Meshes/Cube");
        assert_eq!(graph.get_class_package_name(mesh), "/Script/Engine");
        assert_eq!(graph.find("/Game/Meshes/Cube.Cube"), Some(mesh));
    }

    #[test]
    fn test_outer_queries() {
        let (graph, package, mesh, section) = sample();
        assert!(graph.is_in(section, package));
        assert!(graph.is_in(section, mesh));
        assert!(!graph.is_in(package, package));
        assert_eq!(graph.get_outermost(section), package);
        assert_eq!(graph.get_objects_with_outer(mesh), vec![section]);
    }

    #[test]
    fn test_native_in_chain() {
        let (mut graph, _, _, _) = sample();
        let class = ObjectId(1);
        let property = graph.add(MemoryObject::new("Materials", ObjectKind::Field).with_outer(class));
        graph.object_mut(class).children = vec![property];
        assert!(graph.is_native_in_chain(property));
        assert_eq!(graph.get_children(class), Some(property));
        assert_eq!(graph.get_next(property), None);
        assert_eq!(graph.get_owner_class(property), Some(class));
    }

    #[test]
    fn test_json_validation() {
        let json = r#"{"objects": [{"name": "/Game/A"}, {"name": "A", "outer": 0, "class": 7}]}"#;
        assert!(MemoryGraph::from_json(json).is_err());

        let json = r#"{"objects": [
            {"name": "/Game/A"},
            {"name": "A", "outer": 0, "flags": "PUBLIC | STANDALONE", "fields": [{"Bytes": "0a0b"}, {"Object": 0}]}
        ]}"#;
        let graph = MemoryGraph::from_json(json).unwrap();
        let a = ObjectId(1);
        assert_eq!(graph.get_flags(a), ObjectFlags::PUBLIC | ObjectFlags::STANDALONE);
        assert_eq!(graph.object(a).fields[0], FieldValue::Bytes(vec![10, 11]));
        assert_eq!(collect_references(&graph, a).unwrap(), vec![ObjectId(0)]);
    }
}
