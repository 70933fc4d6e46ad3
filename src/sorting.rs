use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::object_graph::{CLASS_CLASS_NAME, ObjectGraph, ObjectId};
use crate::package_file::PackageFile;
use crate::package_index::FPackageIndex;

fn compare_ignore_case(a: &str, b: &str) -> Ordering {
    a.bytes().map(|c| c.to_ascii_lowercase()).cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

/// Full name of a previously saved import, as the graph would spell it.
fn previous_import_full_name(previous: &PackageFile, index: usize) -> Result<String> {
    let import = &previous.imports[index];
    let class_name = previous.name(import.class_name)?;
    let path = previous.object_path(FPackageIndex::create_import(index), None)?;
    Ok(format!("{class_name} {path}"))
}

/// Full name of a previously saved export, rooted at `package_name`.
fn previous_export_full_name(previous: &PackageFile, index: usize, package_name: &str) -> Result<String> {
    let export = &previous.exports[index];
    let class_name = if export.class_index.is_null() {
        CLASS_CLASS_NAME.to_string()
    } else {
        previous.object_name(export.class_index)?
    };
    let path = previous.object_path(FPackageIndex::create_export(index), Some(package_name))?;
    Ok(format!("{class_name} {path}"))
}

/// Places every object whose full name matches an entry of the previous table at that entry's
/// position. Previous entries without a match become `None`. Returns the conformed prefix and the
/// objects that did not exist before.
fn conform_table<F>(objects: Vec<(ObjectId, String)>, previous_count: usize, mut previous_full_name: F) -> Result<(Vec<Option<ObjectId>>, Vec<ObjectId>)>
where
    F: FnMut(usize) -> Result<String>,
{
    let mut by_full_name: HashMap<String, ObjectId> = HashMap::with_capacity(objects.len());
    for (object, full_name) in &objects {
        by_full_name.entry(full_name.clone()).or_insert(*object);
    }
    let mut conformed = Vec::with_capacity(previous_count);
    for i in 0..previous_count {
        let full_name = previous_full_name(i)?;
        match by_full_name.remove(&full_name) {
            Some(object) => conformed.push(Some(object)),
            None => {
                debug!("no matching entry found in new package for original entry {i}: {full_name}");
                conformed.push(None);
            }
        }
    }
    let remaining = objects.into_iter().filter(|(o, f)| by_full_name.get(f) == Some(o)).map(|(o, _)| o).collect();
    Ok((conformed, remaining))
}

/// Import table order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SortedTable {
    /// Final table; `None` entries are placeholders for entries of the conformed package that no longer exist.
    pub entries: Vec<Option<ObjectId>>,
    /// Number of leading entries fixed by conforming.
    pub conformed: usize,
}

/// Sorts imports case-insensitively by full name. When conforming, previous imports keep their
/// index and new ones are sorted after them.
#[instrument(skip_all, name = "sort_imports")]
pub fn sort_imports<G: ObjectGraph + ?Sized>(graph: &G, imports: &[ObjectId], conform: Option<&PackageFile>) -> Result<SortedTable> {
    let with_names: Vec<(ObjectId, String)> = imports.iter().map(|&i| (i, graph.get_full_name(i))).collect();
    let (entries, mut remaining) = match conform {
        Some(previous) => {
            let (entries, remaining) =
                conform_table(with_names, previous.imports.len(), |i| previous_import_full_name(previous, i))?;
            (entries, remaining.into_iter().map(|o| (o, graph.get_full_name(o))).collect())
        }
        None => (vec![], with_names),
    };
    remaining.sort_by(|(_, a), (_, b)| compare_ignore_case(a, b));
    let conformed = entries.len();
    let mut entries = entries;
    entries.extend(remaining.into_iter().map(|(o, _)| Some(o)));
    Ok(SortedTable { entries, conformed })
}

/// Structured sort key: class name, then the path components below the package.
#[derive(Debug)]
struct StructuredFullName<'a> {
    class_name: &'a str,
    path: Vec<&'a str>,
}
impl<'a> StructuredFullName<'a> {
    fn new<G: ObjectGraph + ?Sized>(graph: &'a G, object: ObjectId, package: ObjectId) -> Self {
        let mut path = vec![];
        let mut current = Some(object);
        while let Some(o) = current
            && o != package
        {
            path.push(graph.get_name(o));
            current = graph.get_outer(o);
        }
        path.reverse();
        Self { class_name: graph.get_class_name(object), path }
    }
    fn compare(&self, other: &Self) -> Ordering {
        if self.class_name != other.class_name {
            return compare_ignore_case(self.class_name, other.class_name);
        }
        for (a, b) in self.path.iter().zip(&other.path) {
            if a != b {
                return compare_ignore_case(a, b);
            }
        }
        self.path.len().cmp(&other.path.len())
    }
}

/// Sorts exports alphabetically by full name, or by [`StructuredFullName`] when `structured` is
/// set. When conforming, previous exports keep their index and new ones are sorted after them.
#[instrument(skip_all, name = "sort_exports")]
pub fn sort_exports<G: ObjectGraph + ?Sized>(
    graph: &G,
    package: ObjectId,
    exports: &[ObjectId],
    conform: Option<&PackageFile>,
    structured: bool,
) -> Result<SortedTable> {
    let (mut entries, mut remaining) = match conform {
        Some(previous) => {
            let package_name = graph.get_name(package);
            let with_names = exports.iter().map(|&e| (e, graph.get_full_name(e))).collect();
            conform_table(with_names, previous.exports.len(), |i| previous_export_full_name(previous, i, package_name))?
        }
        None => (vec![], exports.to_vec()),
    };
    if structured {
        let keys: HashMap<ObjectId, StructuredFullName> =
            remaining.iter().map(|&e| (e, StructuredFullName::new(graph, e, package))).collect();
        remaining.sort_by(|a, b| keys[a].compare(&keys[b]));
    } else {
        let keys: HashMap<ObjectId, String> = remaining.iter().map(|&e| (e, graph.get_full_name(e))).collect();
        remaining.sort_by(|a, b| compare_ignore_case(&keys[a], &keys[b]));
    }
    let conformed = entries.len();
    entries.extend(remaining.into_iter().map(Some));
    Ok(SortedTable { entries, conformed })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::object_graph::{MemoryGraph, MemoryObject, ObjectKind};
    use pretty_assertions::assert_eq;

    fn graph() -> (MemoryGraph, ObjectId, Vec<ObjectId>) {
        let mut graph = MemoryGraph::new();
        let engine = graph.add(MemoryObject::new("/Script/Engine", ObjectKind::Plain));
        let mesh = graph.add(MemoryObject::new("StaticMesh", ObjectKind::Class).with_outer(engine));
        let actor = graph.add(MemoryObject::new("actor", ObjectKind::Class).with_outer(engine));
        let package = graph.add(MemoryObject::new("/Game/Level", ObjectKind::Plain));
        let b = graph.add(MemoryObject::new("b", ObjectKind::Plain).with_class(mesh).with_outer(package));
        let a = graph.add(MemoryObject::new("A", ObjectKind::Plain).with_class(mesh).with_outer(package));
        let c = graph.add(MemoryObject::new("C", ObjectKind::Plain).with_class(actor).with_outer(package));
        let sub = graph.add(MemoryObject::new("Sub", ObjectKind::Plain).with_class(mesh).with_outer(a));
        (graph, package, vec![b, a, c, sub])
    }

    #[test]
    fn test_sort_exports_alphabetically() -> Result<()> {
        let (graph, package, exports) = graph();
        let [b, a, c, sub] = exports[..] else { unreachable!() };
        let sorted = sort_exports(&graph, package, &exports, None, false)?;
        assert_eq!(sorted.entries, vec![Some(c), Some(a), Some(sub), Some(b)]);
        assert_eq!(sorted.conformed, 0);

        let structured = sort_exports(&graph, package, &exports, None, true)?;
        assert_eq!(structured.entries, sorted.entries);
        Ok(())
    }

    #[test]
    fn test_sort_imports() -> Result<()> {
        let (graph, _, _) = graph();
        let imports = [ObjectId(1), ObjectId(0), ObjectId(2)];
        let sorted = sort_imports(&graph, &imports, None)?;
        // "Class /Script/Engine.actor" < "Class /Script/Engine.StaticMesh" < "Package /Script/Engine"
        assert_eq!(sorted.entries, vec![Some(ObjectId(2)), Some(ObjectId(1)), Some(ObjectId(0))]);
        Ok(())
    }
}
