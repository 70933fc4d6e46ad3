use std::cell::Cell;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use fs_err as fs;
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use tracing::{error, instrument, warn};

use crate::dependencies::{DependencyCycleChecker, build_preload_dependencies};
use crate::file_writer::{FinishedPackage, PackageSink, move_into_place, write_package_file_async};
use crate::linker::{NAME_NONE, SaveLinker};
use crate::logging::{Log, debug, log, verbose};
use crate::object_graph::{ObjectFlags, ObjectGraph, ObjectId, PackageFlags};
use crate::package_file::{FEngineVersion, FGenerationInfo, FGuid, ObjectThumbnails, PackageFile, SCHEMA_VERSION_KEY};
use crate::package_writer::{PackageWriter, SaveStage, WriteResult, collect_metadata, map_searchable_names};
use crate::seek_free::sort_exports_seek_free;
use crate::sorting::{sort_exports, sort_imports};
use crate::tagging::{ObjectMarks, PackageTagger, TagResult};

/// Which kind of build the package is saved for. Anything but `Editor` is a cooking target.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum, strum::Display,
)]
pub enum SaveTarget {
    #[default]
    Editor,
    Game,
    Client,
    Server,
}
impl SaveTarget {
    pub fn is_cooking(self) -> bool {
        self != Self::Editor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum SavePackageResult {
    Success,
    Canceled,
    Error,
    ContainsEditorOnlyData,
    ReferencedOnlyByEditorOnlyData,
}

/// Result of [`save_package`]. `async_write` is set when the final write was handed to a
/// background thread.
#[derive(Debug)]
pub struct SaveOutcome {
    pub result: SavePackageResult,
    pub errors: Vec<String>,
    pub package_size: u64,
    pub async_write: Option<JoinHandle<Result<()>>>,
}
impl SaveOutcome {
    fn aborted(log: &Log, result: SavePackageResult, errors: Vec<String>) -> Self {
        for error in &errors {
            log!(log, "{error}");
        }
        Self { result, errors, package_size: 0, async_write: None }
    }
    pub fn is_success(&self) -> bool {
        self.result == SavePackageResult::Success
    }
}

/// Fatal save conditions. Returned wrapped in [`anyhow::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveError {
    CorruptObject { object: String, referencer: String },
    DependencyCycle { node: String, path: Vec<String> },
    ShortWrite { path: PathBuf, expected: u64, written: u64 },
    MoveFailed { from: PathBuf, to: PathBuf, reason: String },
}
impl Display for SaveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CorruptObject { object, referencer } => {
                write!(f, "corrupt object {object} referenced by {referencer}")
            }
            Self::DependencyCycle { node, path } => {
                write!(f, "dependency cycle detected at {node}: {}", path.join(" -> "))
            }
            Self::ShortWrite { path, expected, written } => {
                write!(f, "short write to {}: expected {expected} bytes, wrote {written}", path.display())
            }
            Self::MoveFailed { from, to, reason } => {
                write!(f, "failed to move {} to {}: {reason}", from.display(), to.display())
            }
        }
    }
}
impl std::error::Error for SaveError {}

#[derive(Debug, Clone)]
pub struct SaveOptions {
    pub target: SaveTarget,
    /// Objects in the package with any of these flags are saved along with the base object.
    pub top_level_flags: ObjectFlags,
    pub filter_editor_only: bool,
    pub use_seek_free_sort: bool,
    pub use_full_name_sort: bool,
    pub write_preload_dependencies: bool,
    pub save_async: bool,
    pub keep_guid: bool,
    pub warn_of_long_filename: bool,
    pub max_filename_len: usize,
    /// Previously saved version of the package whose table order is kept.
    pub conform: Option<PackageFile>,
    pub schema_hash: u32,
    pub engine_version: FEngineVersion,
}
impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            target: SaveTarget::Editor,
            top_level_flags: ObjectFlags::STANDALONE,
            filter_editor_only: false,
            use_seek_free_sort: false,
            use_full_name_sort: false,
            write_preload_dependencies: true,
            save_async: false,
            keep_guid: false,
            warn_of_long_filename: true,
            max_filename_len: 255,
            conform: None,
            schema_hash: 0,
            engine_version: FEngineVersion::default(),
        }
    }
}

/// Callbacks into the host while a package is saved.
pub trait SaveHooks {
    fn is_ok_to_save(&self, _package: ObjectId) -> bool {
        true
    }
    /// Polled after every completed stage; `true` abandons the save.
    fn should_cancel(&self, _stage: SaveStage) -> bool {
        false
    }
    fn gather_text(&self, _package: ObjectId) -> Vec<String> {
        vec![]
    }
    /// Thumbnails keyed by object full name.
    fn thumbnails(&self, _package: ObjectId) -> ObjectThumbnails {
        ObjectThumbnails::new()
    }
    fn asset_registry_tags(&self, _object: ObjectId) -> Vec<(String, String)> {
        vec![]
    }
    fn world_level_info(&self, _package: ObjectId) -> Option<Vec<u8>> {
        None
    }
}

pub struct DefaultHooks;
impl SaveHooks for DefaultHooks {}

thread_local! {
    static SAVE_IN_PROGRESS: Cell<bool> = const { Cell::new(false) };
}

struct SaveGuard;
impl SaveGuard {
    fn acquire() -> Option<Self> {
        SAVE_IN_PROGRESS.with(|flag| (!flag.replace(true)).then_some(Self))
    }
}
impl Drop for SaveGuard {
    fn drop(&mut self) {
        SAVE_IN_PROGRESS.with(|flag| flag.set(false));
    }
}

pub fn is_save_in_progress() -> bool {
    SAVE_IN_PROGRESS.with(Cell::get)
}

const fn str_crc_table() -> [u32; 256] {
    let mut table = [0; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ 0x04C1_1DB7 } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}
static STR_CRC_TABLE: [u32; 256] = str_crc_table();

/// The engine's legacy string CRC: MSB-first CRC-32 over both bytes of each UTF-16 code unit.
pub fn legacy_str_crc(s: &str) -> u32 {
    let mut crc = !0u32;
    for unit in s.encode_utf16() {
        for byte in [unit & 0xFF, unit >> 8] {
            crc = (crc << 8) ^ STR_CRC_TABLE[((crc >> 24) ^ byte as u32) as usize];
        }
    }
    !crc
}

fn base_filename(destination: &Path) -> String {
    destination.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

fn check_filename_length(destination: &Path, max_len: usize) {
    let base = base_filename(destination);
    let clean = base.find("_LOC_").map_or(base.as_str(), |pos| &base[..pos]);
    if clean.len() > max_len {
        warn!(
            "filename '{clean}' is too long ({} characters); this may interfere with cooking for consoles, the limit is {max_len}",
            clean.len()
        );
    }
}

fn new_package_guid(package_name: &str, destination: &Path) -> FGuid {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or_default();
    let mut hasher = blake3::Hasher::new();
    hasher.update(package_name.as_bytes());
    hasher.update(destination.to_string_lossy().as_bytes());
    hasher.update(&nanos.to_le_bytes());
    FGuid::from_hash(hasher.finalize().as_bytes())
}

const MAX_LISTED_OBJECTS: usize = 5;

fn list_objects<G: ObjectGraph + ?Sized>(graph: &G, objects: &[ObjectId]) -> String {
    let mut list = objects.iter().take(MAX_LISTED_OBJECTS).map(|&o| graph.get_full_name(o)).join("\n");
    list.push('\n');
    if objects.len() > MAX_LISTED_OBJECTS {
        list.push_str("...\n");
    }
    list
}

/// First export referencing any of `objects`, described as "export (object)".
fn find_most_likely_culprit<G: ObjectGraph + ?Sized>(graph: &G, tag: &TagResult, objects: &[ObjectId]) -> String {
    for &object in objects {
        for export in tag.exports() {
            let references = |map: &std::collections::HashMap<ObjectId, Vec<ObjectId>>| {
                map.get(&export).is_some_and(|deps| deps.contains(&object))
            };
            if references(&tag.dependencies) || references(&tag.native_dependencies) {
                return format!("{} ({})", graph.get_full_name(export), graph.get_full_name(object));
            }
        }
    }
    objects.first().map(|&o| graph.get_full_name(o)).unwrap_or_else(|| "Unknown".into())
}

fn is_map_object<G: ObjectGraph + ?Sized>(graph: &G, object: ObjectId) -> bool {
    matches!(graph.get_class_name(object), "World" | "Level")
}

/// Saves `package` to `destination`.
///
/// `base` is saved along with every object in the package carrying one of
/// [`SaveOptions::top_level_flags`]. Conditions that stop the save without corrupting anything
/// are reported through [`SaveOutcome::result`]; fatal ones are returned as errors, mostly
/// wrapping a [`SaveError`].
#[instrument(skip_all, name = "save_package", fields(destination = %destination.display()))]
pub fn save_package<G: ObjectGraph + ?Sized>(
    graph: &G,
    package: ObjectId,
    base: Option<ObjectId>,
    destination: &Path,
    options: &SaveOptions,
    hooks: &dyn SaveHooks,
    log: &Log,
) -> Result<SaveOutcome> {
    use SavePackageResult::*;

    let Some(_guard) = SaveGuard::acquire() else {
        error!("a package save was started while another save is in progress");
        return Ok(SaveOutcome::aborted(log, Error, vec!["a package save is already in progress".into()]));
    };

    let package_name = graph.get_name(package).to_string();
    let file = destination.display().to_string();
    let package_flags = graph.get_package_flags(package);
    let is_map = package_flags.contains(PackageFlags::CONTAINS_MAP);

    if options.target.is_cooking() && package_flags.contains(PackageFlags::EDITOR_ONLY) {
        verbose!(log, "Skipping editor only package {package_name}");
        return Ok(SaveOutcome::aborted(log, ReferencedOnlyByEditorOnlyData, vec![]));
    }
    if !graph.is_fully_loaded(package) {
        let kind = if is_map { "Map" } else { "Asset" };
        return Ok(SaveOutcome::aborted(
            log,
            Error,
            vec![format!("{kind} '{package_name}' cannot be saved as it has only been partially loaded")],
        ));
    }
    let conform = options.conform.as_ref();
    if let Some(previous) = conform
        && previous.summary.custom_version(SCHEMA_VERSION_KEY).is_some_and(|hash| hash != options.schema_hash as i32)
    {
        return Ok(SaveOutcome::aborted(
            log,
            Error,
            vec![format!("Conformed asset '{package_name}' cannot be saved as it is incompatible with the original")],
        ));
    }
    if !hooks.is_ok_to_save(package) {
        return Ok(SaveOutcome::aborted(log, Error, vec![format!("Package '{package_name}' was not allowed to be saved")]));
    }
    if options.warn_of_long_filename {
        check_filename_length(destination, options.max_filename_len);
    }

    verbose!(log, "Saving {package_name} to {file}");

    // tagging
    let excluded = ObjectMarks::excluded_for(options.target, options.filter_editor_only);
    let mut tagger = PackageTagger::new(graph, package, excluded);
    tagger.tag_exports(base, options.top_level_flags)?;
    tagger.untag_excluded_exports();
    if tagger.result().exports().is_empty() {
        verbose!(log, "No exports left in {package_name} for {}", options.target);
        return Ok(SaveOutcome::aborted(log, ContainsEditorOnlyData, vec![]));
    }
    tagger.tag_imports()?;
    tagger.unmark_duplicate_exports();
    let illegal = tagger.mark_table_names();
    let mut tag = tagger.finish();

    let mut errors = vec![];
    if !illegal.objects_in_other_maps.is_empty() {
        let culprit = find_most_likely_culprit(graph, &tag, &illegal.objects_in_other_maps);
        error!("Can't save {file}: Graph is linked to object {culprit} in external map");
        errors.push(format!("Can't save {file}: Graph is linked to object(s) in external map.\nExternal Object(s):\n{}",
            list_objects(graph, &illegal.objects_in_other_maps)));
    }
    if !illegal.private_objects.is_empty() {
        let culprit = find_most_likely_culprit(graph, &tag, &illegal.private_objects);
        error!("Can't save {file}: Graph is linked to external private object {culprit}");
        errors.push(format!("Can't save {file}: Graph is linked to external private object(s).\nPrivate Object(s):\n{}",
            list_objects(graph, &illegal.private_objects)));
    }
    if !errors.is_empty() {
        return Ok(SaveOutcome::aborted(log, Error, errors));
    }
    if is_map && !tag.exports().into_iter().any(|e| is_map_object(graph, e)) {
        let message = format!("Attempting to save a map asset '{file}' that does not contain a map object");
        error!("{message}");
        return Ok(SaveOutcome::aborted(log, Error, vec![message]));
    }

    // tables
    let imports = sort_imports(graph, &tag.imports(), conform)?;
    let mut exports = sort_exports(graph, package, &tag.exports(), conform, !options.use_full_name_sort)?;
    if options.use_seek_free_sort {
        exports = sort_exports_seek_free(graph, package, &exports)?;
    }

    debug!(log, "{package_name}: {} imports, {} exports", imports.entries.len(), exports.entries.len());

    let mut names = std::mem::take(&mut tag.names);
    if imports.entries.contains(&None) || exports.entries.contains(&None) {
        names.mark_name_referenced(NAME_NONE);
    }
    if let Some(previous) = conform {
        names.conform_to(previous.names.names());
    }

    let mut linker = SaveLinker::new(package, names, &imports, &exports, std::mem::take(&mut tag.duplicate_redirects));
    linker.build_import_map(graph)?;
    linker.build_export_map(graph, &tag.tags)?;
    linker.build_depends_map(graph, &tag.dependencies)?;
    linker.soft_package_references = tag.soft_package_references.iter().cloned().collect();
    linker.searchable_names = map_searchable_names(&linker, std::mem::take(&mut tag.searchable_names));

    if options.write_preload_dependencies {
        let mut checker = DependencyCycleChecker::new();
        build_preload_dependencies(
            graph,
            &mut linker,
            &tag.tags,
            &tag.native_dependencies,
            excluded,
            options.filter_editor_only,
            &mut checker,
        )?;
        checker.check_for_cycles()?;
    }

    // summary
    let summary = &mut linker.summary;
    match conform {
        Some(previous) => {
            summary.guid = previous.summary.guid;
            summary.generations = previous.summary.generations.clone();
        }
        None => {
            summary.guid = match graph.get_package_guid(package) {
                Some(guid) if options.keep_guid && guid.is_valid() => guid,
                _ => new_package_guid(&package_name, destination),
            };
        }
    }
    summary.generations.push(FGenerationInfo::default());
    summary.set_custom_version(SCHEMA_VERSION_KEY, options.schema_hash as i32);
    summary.saved_by_engine_version = options.engine_version.clone();
    summary.compatible_with_engine_version = options.engine_version.clone();
    summary.package_source = legacy_str_crc(&base_filename(destination).to_uppercase());
    let mut flags = package_flags.difference(PackageFlags::NEWLY_CREATED);
    if options.filter_editor_only {
        flags |= PackageFlags::FILTER_EDITOR_ONLY;
    }
    summary.package_flags = flags;

    let metadata = collect_metadata(graph, &linker, hooks, options.filter_editor_only);
    if !metadata.gatherable_text.is_empty() {
        linker.summary.package_flags |= PackageFlags::REQUIRES_LOCALIZATION_GATHER;
    }

    // write
    let sink = if options.save_async { PackageSink::memory() } else { PackageSink::create_temp_file(destination)? };
    let temp = sink.temp_path().map(Path::to_path_buf);
    let written = PackageWriter::new(graph, &mut linker, &metadata, sink).write(|stage| hooks.should_cancel(stage));
    let (sink, size) = match written {
        Ok(WriteResult::Complete { sink, size }) => (sink, size),
        Ok(WriteResult::Canceled { sink, stage }) => {
            verbose!(log, "Save of {package_name} canceled after {stage}");
            sink.discard()?;
            return Ok(SaveOutcome::aborted(log, Canceled, vec![]));
        }
        Err(err) => {
            error!("failed to write {file}: {err:#}");
            if let Some(temp) = temp.filter(|t| t.exists()) {
                fs::remove_file(&temp)?;
            }
            return Err(err);
        }
    };

    let async_write = match sink.finish()? {
        FinishedPackage::TempFile(temp) => {
            move_into_place(&temp, destination, size)?;
            None
        }
        FinishedPackage::Memory(bytes) => Some(write_package_file_async(bytes, destination.to_path_buf())),
    };
    verbose!(log, "Saved {package_name} ({size} bytes)");

    Ok(SaveOutcome { result: Success, errors: vec![], package_size: size, async_write })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::file_writer::wait_for_async_file_writes;
    use crate::object_graph::{FieldValue, MemoryGraph, MemoryObject, ObjectKind, ObjectTraits};
    use crate::package_file::SerializedField;
    use crate::package_index::FPackageIndex;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    struct Fixture {
        graph: MemoryGraph,
        package: ObjectId,
        cube: ObjectId,
    }

    fn fixture() -> Fixture {
        let mut graph = MemoryGraph::new();
        let engine = graph.add(MemoryObject::new("/Script/Engine", ObjectKind::Plain));
        let class = graph.add(
            MemoryObject::new("StaticMesh", ObjectKind::Class)
                .with_outer(engine)
                .with_flags(ObjectFlags::PUBLIC)
                .with_traits(ObjectTraits::NATIVE),
        );
        let mut package = MemoryObject::new("/Game/Cube", ObjectKind::Plain);
        package.package_flags = PackageFlags::NEWLY_CREATED;
        let package = graph.add(package);
        let cube = graph.add(
            MemoryObject::new("Cube", ObjectKind::Plain)
                .with_class(class)
                .with_outer(package)
                .with_flags(ObjectFlags::PUBLIC | ObjectFlags::STANDALONE)
                .with_traits(ObjectTraits::ASSET)
                .with_fields(vec![FieldValue::Name("Cube".into()), FieldValue::Bytes(vec![1, 2, 3])]),
        );
        Fixture { graph, package, cube }
    }

    fn temp_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = vec![];
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "tmp") {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn save(fixture: &Fixture, destination: &Path, options: &SaveOptions, hooks: &dyn SaveHooks) -> Result<SaveOutcome> {
        save_package(&fixture.graph, fixture.package, None, destination, options, hooks, &Log::new(false, false))
    }

    #[test]
    fn test_legacy_str_crc() {
        assert_eq!(legacy_str_crc(""), 0);
        assert_eq!(legacy_str_crc("CUBE"), 0x6EC7_5012);
    }

    #[test]
    fn test_save_simple_object() -> Result<()> {
        let fixture = fixture();
        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("Cube.uasset");
        let outcome = save(&fixture, &destination, &SaveOptions::default(), &DefaultHooks)?;
        assert_eq!(outcome.result, SavePackageResult::Success);
        assert!(outcome.errors.is_empty());
        assert_eq!(temp_files(dir.path())?, Vec::<PathBuf>::new());
        assert_eq!(fs::metadata(&destination)?.len(), outcome.package_size);

        let saved = PackageFile::open(&destination)?;
        assert_eq!(saved.exports.len(), 1);
        assert_eq!(saved.imports.len(), 2);
        assert!(saved.names.contains("Cube"));
        assert!(saved.names.contains("StaticMesh"));
        assert!(saved.names.contains("/Script/Engine"));
        assert_eq!(saved.summary.package_source, legacy_str_crc("CUBE"));
        assert_eq!(saved.summary.package_flags, PackageFlags::empty());
        assert_eq!(saved.summary.custom_version(SCHEMA_VERSION_KEY), Some(0));
        assert_eq!(saved.summary.generations, vec![FGenerationInfo { export_count: 1, name_count: saved.names.len() as i32 }]);
        assert!(saved.summary.guid.is_valid());
        assert_eq!(saved.payloads, vec![vec![SerializedField::Name("Cube".into()), SerializedField::Bytes(vec![1, 2, 3])]]);
        Ok(())
    }

    #[test]
    fn test_cross_package_import() -> Result<()> {
        let mut fixture = fixture();
        let engine = fixture.graph.find("/Script/Engine").unwrap();
        let material_class = fixture.graph.add(
            MemoryObject::new("MaterialInterface", ObjectKind::Class)
                .with_outer(engine)
                .with_flags(ObjectFlags::PUBLIC)
                .with_traits(ObjectTraits::NATIVE),
        );
        let other = fixture.graph.add(MemoryObject::new("/Game/Material", ObjectKind::Plain));
        let material = fixture.graph.add(
            MemoryObject::new("Material", ObjectKind::Plain)
                .with_class(material_class)
                .with_outer(other)
                .with_flags(ObjectFlags::PUBLIC | ObjectFlags::STANDALONE),
        );
        fixture.graph.object_mut(fixture.cube).fields.push(FieldValue::Object(Some(material)));

        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("Cube.uasset");
        let outcome = save(&fixture, &destination, &SaveOptions::default(), &DefaultHooks)?;
        assert_eq!(outcome.result, SavePackageResult::Success);

        let saved = PackageFile::open(&destination)?;
        assert_eq!(saved.imports.len(), 4);
        assert!(saved.names.contains("/Game/Material"));
        assert!(saved.names.contains("Material"));
        let material = saved
            .imports
            .iter()
            .position(|i| saved.name(i.object_name).unwrap() == "Material")
            .unwrap();
        let import = &saved.imports[material];
        assert_eq!(saved.name(import.class_name)?, "MaterialInterface");
        assert_eq!(saved.name(import.class_package)?, "/Script/Engine");
        assert_eq!(saved.object_name(import.outer_index)?, "/Game/Material");
        assert_eq!(saved.object_path(FPackageIndex::create_import(material), None)?, "/Game/Material.Material");
        assert_eq!(saved.depends_map.len(), 1);
        // the native class is tracked separately from the depends map
        assert_eq!(saved.depends_map[0].len(), 1);
        Ok(())
    }

    #[test]
    fn test_preload_cycle_fails_save() -> Result<()> {
        let mut fixture = fixture();
        let class = fixture.graph.get_class(fixture.cube).unwrap();
        let other = fixture.graph.add(
            MemoryObject::new("Other", ObjectKind::Plain)
                .with_class(class)
                .with_outer(fixture.package)
                .with_flags(ObjectFlags::PUBLIC | ObjectFlags::STANDALONE),
        );
        fixture.graph.object_mut(fixture.cube).preload_dependencies = vec![other];
        fixture.graph.object_mut(other).preload_dependencies = vec![fixture.cube];

        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("Cube.uasset");
        let err = save(&fixture, &destination, &SaveOptions::default(), &DefaultHooks).unwrap_err();
        let Some(SaveError::DependencyCycle { node, path }) = err.downcast_ref::<SaveError>() else {
            panic!("unexpected error {err:#}");
        };
        assert!(node.ends_with("/Game/Cube.Cube") || node.ends_with("/Game/Cube.Other"));
        assert!(!path.is_empty());
        assert!(!destination.exists());
        assert_eq!(temp_files(dir.path())?, Vec::<PathBuf>::new());
        assert!(!is_save_in_progress());
        Ok(())
    }

    #[test]
    fn test_private_import_rejected() -> Result<()> {
        let mut fixture = fixture();
        let other = fixture.graph.add(MemoryObject::new("/Game/Secret", ObjectKind::Plain));
        let secret = fixture.graph.add(MemoryObject::new("Secret", ObjectKind::Plain).with_outer(other));
        fixture.graph.object_mut(fixture.cube).fields.push(FieldValue::Object(Some(secret)));

        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("Cube.uasset");
        let outcome = save(&fixture, &destination, &SaveOptions::default(), &DefaultHooks)?;
        assert_eq!(outcome.result, SavePackageResult::Error);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("external private object"));
        assert!(outcome.errors[0].contains("/Game/Secret.Secret"));
        assert!(!destination.exists());
        assert_eq!(temp_files(dir.path())?, Vec::<PathBuf>::new());
        Ok(())
    }

    #[test]
    fn test_pre_checks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("Cube.uasset");

        let mut fixture = fixture();
        fixture.graph.object_mut(fixture.package).package_flags |= PackageFlags::EDITOR_ONLY;
        let options = SaveOptions { target: SaveTarget::Game, ..Default::default() };
        let outcome = save(&fixture, &destination, &options, &DefaultHooks)?;
        assert_eq!(outcome.result, SavePackageResult::ReferencedOnlyByEditorOnlyData);

        let mut fixture = self::fixture();
        fixture.graph.object_mut(fixture.package).traits |= ObjectTraits::PARTIALLY_LOADED;
        let outcome = save(&fixture, &destination, &SaveOptions::default(), &DefaultHooks)?;
        assert_eq!(outcome.result, SavePackageResult::Error);
        assert_eq!(outcome.errors, vec!["Asset '/Game/Cube' cannot be saved as it has only been partially loaded"]);

        struct Veto;
        impl SaveHooks for Veto {
            fn is_ok_to_save(&self, _package: ObjectId) -> bool {
                false
            }
        }
        let outcome = save(&self::fixture(), &destination, &SaveOptions::default(), &Veto)?;
        assert_eq!(outcome.result, SavePackageResult::Error);

        let mut fixture = self::fixture();
        fixture.graph.object_mut(fixture.cube).traits |= ObjectTraits::EDITOR_ONLY;
        let outcome = save(&fixture, &destination, &options, &DefaultHooks)?;
        assert_eq!(outcome.result, SavePackageResult::ContainsEditorOnlyData);

        let mut fixture = self::fixture();
        fixture.graph.object_mut(fixture.package).package_flags |= PackageFlags::CONTAINS_MAP;
        let outcome = save(&fixture, &destination, &SaveOptions::default(), &DefaultHooks)?;
        assert_eq!(outcome.result, SavePackageResult::Error);
        assert!(outcome.errors[0].contains("does not contain a map object"));

        assert!(!destination.exists());
        Ok(())
    }

    #[test]
    fn test_cancel_at_every_stage() -> Result<()> {
        struct CancelAt(SaveStage);
        impl SaveHooks for CancelAt {
            fn should_cancel(&self, stage: SaveStage) -> bool {
                stage == self.0
            }
        }
        let fixture = fixture();
        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("Cube.uasset");
        for stage in <SaveStage as strum::IntoEnumIterator>::iter() {
            let outcome = save(&fixture, &destination, &SaveOptions::default(), &CancelAt(stage))?;
            assert_eq!(outcome.result, SavePackageResult::Canceled, "{stage}");
            assert!(!destination.exists(), "{stage}");
            assert_eq!(temp_files(dir.path())?, Vec::<PathBuf>::new(), "{stage}");
        }
        Ok(())
    }

    #[test]
    fn test_conform_keeps_table_order() -> Result<()> {
        let fixture = fixture();
        let dir = tempfile::tempdir()?;
        let first = dir.path().join("Cube.uasset");
        let options = SaveOptions { schema_hash: 7, ..Default::default() };
        save(&fixture, &first, &options, &DefaultHooks)?;
        let previous = PackageFile::open(&first)?;

        let mut fixture = fixture;
        let extra = fixture.graph.add(
            MemoryObject::new("Cube_Lod1", ObjectKind::Plain)
                .with_class(fixture.graph.find("/Script/Engine.StaticMesh").unwrap())
                .with_outer(fixture.package)
                .with_flags(ObjectFlags::PUBLIC | ObjectFlags::STANDALONE),
        );
        let second = dir.path().join("Cube2.uasset");
        let options = SaveOptions { schema_hash: 7, conform: Some(previous.clone()), ..Default::default() };
        let outcome = save(&fixture, &second, &options, &DefaultHooks)?;
        assert_eq!(outcome.result, SavePackageResult::Success);

        let saved = PackageFile::open(&second)?;
        assert_eq!(saved.summary.guid, previous.summary.guid);
        assert_eq!(saved.summary.generations.len(), 2);
        assert_eq!(&saved.names.names()[..previous.names.len()], previous.names.names());
        assert_eq!(saved.exports[0].object_name, previous.exports[0].object_name);
        assert_eq!(saved.names.get(saved.exports[1].object_name)?, fixture.graph.get_name(extra));

        let options = SaveOptions { schema_hash: 8, conform: Some(previous), ..Default::default() };
        let outcome = save(&fixture, &second, &options, &DefaultHooks)?;
        assert_eq!(outcome.result, SavePackageResult::Error);
        assert!(outcome.errors[0].contains("incompatible with the original"));
        Ok(())
    }

    #[test]
    fn test_async_save() -> Result<()> {
        let fixture = fixture();
        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("nested").join("Cube.uasset");
        let options = SaveOptions { save_async: true, use_seek_free_sort: true, ..Default::default() };
        let outcome = save(&fixture, &destination, &options, &DefaultHooks)?;
        assert_eq!(outcome.result, SavePackageResult::Success);
        let handle = outcome.async_write.ok_or_else(|| anyhow::anyhow!("expected an async write"))?;
        wait_for_async_file_writes();
        handle.join().map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
        assert_eq!(fs::metadata(&destination)?.len(), outcome.package_size);
        assert_eq!(PackageFile::open(&destination)?.exports.len(), 1);
        Ok(())
    }

    #[test]
    fn test_reentrant_save_rejected() -> Result<()> {
        struct Reentrant<'a> {
            fixture: &'a Fixture,
            destination: PathBuf,
            inner: RefCell<Option<SavePackageResult>>,
        }
        impl SaveHooks for Reentrant<'_> {
            fn is_ok_to_save(&self, _package: ObjectId) -> bool {
                assert!(is_save_in_progress());
                let outcome = save(self.fixture, &self.destination, &SaveOptions::default(), &DefaultHooks);
                *self.inner.borrow_mut() = outcome.ok().map(|o| o.result);
                true
            }
        }
        let fixture = fixture();
        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("Cube.uasset");
        let hooks = Reentrant { fixture: &fixture, destination: dir.path().join("Inner.uasset"), inner: RefCell::new(None) };
        let outcome = save(&fixture, &destination, &SaveOptions::default(), &hooks)?;
        assert_eq!(outcome.result, SavePackageResult::Success);
        assert_eq!(*hooks.inner.borrow(), Some(SavePackageResult::Error));
        assert!(!is_save_in_progress());
        Ok(())
    }
}
