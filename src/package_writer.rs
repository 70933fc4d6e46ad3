use std::io::{Cursor, Seek, Write};

use anyhow::{Context as _, Result};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator as _};
use tracing::{debug, instrument};

use crate::linker::SaveLinker;
use crate::object_graph::{BulkData, FieldVisitor, ObjectGraph, ObjectId, PackageFlags};
use crate::package_file::{
    AssetRegistryEntry, FGenerationInfo, FieldTag, ObjectThumbnails, PACKAGE_FILE_TAG, ThumbnailEntry,
};
use crate::package_index::FPackageIndex;
use crate::save::SaveHooks;
use crate::ser::*;

/// Binary writer stages in the order they complete. Cancellation is polled after each one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, EnumCount)]
pub enum SaveStage {
    Init,
    NameTableWritten,
    GatherableTextWritten,
    ImportTableReserved,
    ExportTableReserved,
    DependsMapWritten,
    SoftReferencesWritten,
    ThumbnailsWritten,
    AssetRegistryWritten,
    PreloadDependenciesWritten,
    ExportPayloadsWritten,
    BulkDataWritten,
    ImportTablePatched,
    ExportTablePatched,
    SummaryPatched,
    Finalized,
}

/// flags u32, element count i32, size on disk i32, offset in file i64
const BULK_DATA_HEADER_SIZE: u64 = 20;

/// Package level data supplied by [`SaveHooks`] collaborators.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackageMetadata {
    pub gatherable_text: Vec<String>,
    pub thumbnails: Vec<ThumbnailEntry>,
    pub asset_registry: Vec<AssetRegistryEntry>,
    pub world_level_info: Option<Vec<u8>>,
}

/// Strips the package name from an object path.
fn path_without_package(path: &str) -> &str {
    path.split_once('.').map_or(path, |(_, rest)| rest)
}

fn find_thumbnail<G: ObjectGraph + ?Sized>(
    graph: &G,
    thumbnails: &ObjectThumbnails,
    object: ObjectId,
) -> Option<ThumbnailEntry> {
    let full_name = graph.get_full_name(object);
    let path = graph.get_path_name(object);
    // packages saved without class information key thumbnails by path only
    let thumbnail = thumbnails.get(&full_name).or_else(|| thumbnails.get(&format!("??? {path}")))?;
    Some(ThumbnailEntry {
        class_name: graph.get_class_name(object).to_string(),
        object_path: path_without_package(&path).to_string(),
        thumbnail: thumbnail.clone(),
    })
}

/// Calls the metadata collaborators. Editor data (text, thumbnails, asset registry tags) is skipped
/// when editor-only data is filtered.
#[instrument(skip_all, name = "collect_metadata")]
pub fn collect_metadata<G: ObjectGraph + ?Sized>(
    graph: &G,
    linker: &SaveLinker,
    hooks: &dyn SaveHooks,
    filter_editor_only: bool,
) -> PackageMetadata {
    let package = linker.package;
    let mut metadata = PackageMetadata { world_level_info: hooks.world_level_info(package), ..Default::default() };
    if filter_editor_only {
        return metadata;
    }
    metadata.gatherable_text = hooks.gather_text(package);

    let thumbnails = hooks.thumbnails(package);
    if !thumbnails.is_empty() {
        let exports = linker.exports.iter().filter_map(|e| e.object);
        metadata.thumbnails = exports
            .chain(std::iter::once(package))
            .filter_map(|o| find_thumbnail(graph, &thumbnails, o))
            .collect();
    }

    for object in linker.exports.iter().filter_map(|e| e.object) {
        if graph.is_asset(object) {
            metadata.asset_registry.push(AssetRegistryEntry {
                object_path: path_without_package(&graph.get_path_name(object)).to_string(),
                class_name: graph.get_class_name(object).to_string(),
                tags: hooks.asset_registry_tags(object),
            });
        }
    }
    metadata
}

struct PendingBulkData {
    header: PatchToken,
    bulk: BulkData,
}

/// Writes export fields as a tagged value stream, resolving objects and names through the linker.
struct PayloadWriter<'a, W: Write + Seek> {
    linker: &'a SaveLinker,
    writer: &'a mut PatchWriter<W>,
    pending_bulk_data: &'a mut Vec<PendingBulkData>,
}
impl<W: Write + Seek> PayloadWriter<'_, W> {
    fn tag(&mut self, tag: FieldTag) -> Result<()> {
        self.writer.ser(&(tag as u8))
    }
}
impl<W: Write + Seek> FieldVisitor for PayloadWriter<'_, W> {
    fn object(&mut self, object: Option<ObjectId>) -> Result<()> {
        self.tag(FieldTag::Object)?;
        // references to objects that were not saved become null
        let index = self.linker.map_optional(object);
        self.writer.ser(&index)
    }
    fn name(&mut self, name: &str) -> Result<()> {
        self.tag(FieldTag::Name)?;
        let name = self.linker.names.resolve(name)?;
        self.writer.ser(&name)
    }
    fn soft_object_path(&mut self, path: &str) -> Result<()> {
        self.tag(FieldTag::SoftObjectPath)?;
        self.writer.ser(&path)
    }
    fn bytes(&mut self, data: &[u8]) -> Result<()> {
        self.tag(FieldTag::Bytes)?;
        self.writer.ser(&(data.len() as u32))?;
        self.writer.write_all(data)?;
        Ok(())
    }
    fn bulk_data(&mut self, bulk: &BulkData) -> Result<()> {
        self.tag(FieldTag::BulkData)?;
        let header = self.writer.reserve(BULK_DATA_HEADER_SIZE)?;
        self.pending_bulk_data.push(PendingBulkData { header, bulk: bulk.clone() });
        Ok(())
    }
}

pub enum WriteResult<W> {
    Complete { sink: W, size: u64 },
    Canceled { sink: W, stage: SaveStage },
}

/// Streams a package through the [`SaveStage`]s: every table is laid out first with placeholders
/// and patched in place once the payload offsets are known.
pub struct PackageWriter<'a, G: ObjectGraph + ?Sized, W: Write + Seek> {
    graph: &'a G,
    linker: &'a mut SaveLinker,
    metadata: &'a PackageMetadata,
    writer: PatchWriter<W>,
    summary: Option<PatchToken>,
    import_table: Option<PatchToken>,
    export_table: Option<PatchToken>,
    pending_bulk_data: Vec<PendingBulkData>,
}
impl<'a, G: ObjectGraph + ?Sized, W: Write + Seek> PackageWriter<'a, G, W> {
    pub fn new(graph: &'a G, linker: &'a mut SaveLinker, metadata: &'a PackageMetadata, sink: W) -> Self {
        Self {
            graph,
            linker,
            metadata,
            writer: PatchWriter::new(sink),
            summary: None,
            import_table: None,
            export_table: None,
            pending_bulk_data: vec![],
        }
    }

    /// Runs every stage, stopping early when `should_cancel` returns true for the stage just completed.
    #[instrument(skip_all, name = "write_package")]
    pub fn write(mut self, mut should_cancel: impl FnMut(SaveStage) -> bool) -> Result<WriteResult<W>> {
        for stage in SaveStage::iter() {
            self.write_stage(stage).with_context(|| format!("failed to reach stage {stage}"))?;
            debug!("reached {stage} at offset {}", self.writer.tell()?);
            if should_cancel(stage) {
                return Ok(WriteResult::Canceled { sink: self.writer.into_inner(), stage });
            }
        }
        let size = self.writer.tell()?;
        Ok(WriteResult::Complete { sink: self.writer.into_inner(), size })
    }

    fn filter_editor_only(&self) -> bool {
        self.linker.summary.package_flags.contains(PackageFlags::FILTER_EDITOR_ONLY)
    }
    fn offset(&mut self) -> Result<i32> {
        Ok(i32::try_from(self.writer.tell()?).context("package header exceeds 2 GiB")?)
    }

    fn write_stage(&mut self, stage: SaveStage) -> Result<()> {
        match stage {
            SaveStage::Init => {
                self.summary = Some(self.writer.reserve_for(&self.linker.summary)?);
            }
            SaveStage::NameTableWritten => {
                self.linker.summary.name_offset = self.offset()?;
                self.linker.summary.name_count = self.linker.names.len() as i32;
                self.linker.names.serialize(&mut self.writer)?;
            }
            SaveStage::GatherableTextWritten => {
                let metadata = self.metadata;
                let text = &metadata.gatherable_text;
                self.linker.summary.gatherable_text_data_count = text.len() as i32;
                self.linker.summary.gatherable_text_data_offset = if text.is_empty() { 0 } else { self.offset()? };
                self.writer.ser_no_length(text)?;
            }
            SaveStage::ImportTableReserved => {
                self.linker.summary.import_offset = self.offset()?;
                self.linker.summary.import_count = self.linker.imports.len() as i32;
                let placeholder = self.import_table_bytes()?;
                self.import_table = Some(self.writer.reserve(placeholder.len() as u64)?);
            }
            SaveStage::ExportTableReserved => {
                self.linker.summary.export_offset = self.offset()?;
                self.linker.summary.export_count = self.linker.exports.len() as i32;
                let placeholder = self.export_table_bytes()?;
                self.export_table = Some(self.writer.reserve(placeholder.len() as u64)?);
            }
            SaveStage::DependsMapWritten => {
                self.linker.summary.depends_offset = self.offset()?;
                for dependencies in &self.linker.depends_map {
                    self.writer.ser(dependencies)?;
                }
            }
            SaveStage::SoftReferencesWritten => self.write_soft_references()?,
            SaveStage::ThumbnailsWritten => self.write_thumbnails()?,
            SaveStage::AssetRegistryWritten => self.write_asset_registry()?,
            SaveStage::PreloadDependenciesWritten => {
                self.linker.summary.preload_dependency_offset = self.offset()?;
                self.linker.summary.preload_dependency_count = self.linker.preload_dependencies.len() as i32;
                self.writer.ser_no_length(&self.linker.preload_dependencies)?;
                self.linker.summary.total_header_size = self.offset()?;
            }
            SaveStage::ExportPayloadsWritten => self.write_export_payloads()?,
            SaveStage::BulkDataWritten => {
                self.write_bulk_data()?;
                self.writer.ser(&PACKAGE_FILE_TAG)?;
            }
            SaveStage::ImportTablePatched => {
                let token = self.import_table.context("import table was never reserved")?;
                let bytes = self.import_table_bytes()?;
                self.writer.patch(token, &bytes)?;
            }
            SaveStage::ExportTablePatched => {
                let token = self.export_table.context("export table was never reserved")?;
                let bytes = self.export_table_bytes()?;
                self.writer.patch(token, &bytes)?;
            }
            SaveStage::SummaryPatched => {
                let summary = &mut self.linker.summary;
                if let Some(generation) = summary.generations.last_mut() {
                    *generation = FGenerationInfo { export_count: summary.export_count, name_count: summary.name_count };
                }
                let token = self.summary.context("summary was never reserved")?;
                let summary = &self.linker.summary;
                self.writer.patch_with(token, |buf| buf.ser(summary))?;
            }
            SaveStage::Finalized => {
                self.writer.flush()?;
            }
        }
        Ok(())
    }

    fn import_table_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(vec![]);
        for entry in &self.linker.imports {
            buf.ser(&entry.import)?;
        }
        Ok(buf.into_inner())
    }
    fn export_table_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(vec![]);
        for entry in &self.linker.exports {
            buf.ser(&entry.export)?;
        }
        Ok(buf.into_inner())
    }

    fn write_soft_references(&mut self) -> Result<()> {
        let summary = &mut self.linker.summary;
        summary.soft_package_references_count = 0;
        summary.soft_package_references_offset = 0;
        summary.searchable_names_offset = 0;
        if self.filter_editor_only() {
            return Ok(());
        }

        self.linker.summary.soft_package_references_offset = self.offset()?;
        self.linker.summary.soft_package_references_count = self.linker.soft_package_references.len() as i32;
        for package_name in &self.linker.soft_package_references {
            self.writer.ser(&self.linker.names.resolve(package_name)?)?;
        }

        self.linker.summary.searchable_names_offset = self.offset()?;
        self.writer.ser(&(self.linker.searchable_names.len() as i32))?;
        for (index, values) in &self.linker.searchable_names {
            self.writer.ser(index)?;
            let names = values.iter().map(|v| self.linker.names.resolve(v)).collect::<Result<Vec<_>>>()?;
            self.writer.ser(&names)?;
        }
        Ok(())
    }

    fn write_thumbnails(&mut self) -> Result<()> {
        self.linker.summary.thumbnail_table_offset = 0;
        let metadata = self.metadata;
        let thumbnails = &metadata.thumbnails;
        if self.filter_editor_only() || thumbnails.is_empty() {
            return Ok(());
        }
        let mut offsets = Vec::with_capacity(thumbnails.len());
        for entry in thumbnails {
            offsets.push(self.offset()?);
            self.writer.ser(&entry.thumbnail)?;
        }
        self.linker.summary.thumbnail_table_offset = self.offset()?;
        self.writer.ser(&(thumbnails.len() as i32))?;
        for (entry, offset) in thumbnails.iter().zip(offsets) {
            self.writer.ser(&entry.class_name)?;
            self.writer.ser(&entry.object_path)?;
            self.writer.ser(&offset)?;
        }
        Ok(())
    }

    fn write_asset_registry(&mut self) -> Result<()> {
        self.linker.summary.asset_registry_data_offset = self.offset()?;
        let metadata = self.metadata;
        let assets: &[AssetRegistryEntry] = if self.filter_editor_only() { &[] } else { &metadata.asset_registry };
        self.writer.ser(&(assets.len() as i32))?;
        self.writer.ser_no_length(&assets)?;

        self.linker.summary.world_tile_info_data_offset = 0;
        if let Some(info) = &metadata.world_level_info {
            self.linker.summary.world_tile_info_data_offset = self.offset()?;
            self.writer.ser(info)?;
        }
        Ok(())
    }

    fn write_export_payloads(&mut self) -> Result<()> {
        let mut ranges = Vec::with_capacity(self.linker.exports.len());
        {
            let linker: &SaveLinker = &*self.linker;
            let mut payload = PayloadWriter {
                linker,
                writer: &mut self.writer,
                pending_bulk_data: &mut self.pending_bulk_data,
            };
            for entry in &linker.exports {
                let Some(object) = entry.object else {
                    ranges.push(None);
                    continue;
                };
                let start = payload.writer.tell()?;
                self.graph
                    .serialize_fields(object, &mut payload)
                    .with_context(|| format!("failed to serialize {}", self.graph.get_full_name(object)))?;
                payload.tag(FieldTag::End)?;
                ranges.push(Some((start, payload.writer.tell()? - start)));
            }
        }
        for (entry, range) in self.linker.exports.iter_mut().zip(ranges) {
            if let Some((offset, size)) = range {
                entry.export.serial_offset = offset as i64;
                entry.export.serial_size = size as i64;
            }
        }
        Ok(())
    }

    fn write_bulk_data(&mut self) -> Result<()> {
        let start = self.writer.tell()?;
        self.linker.summary.bulk_data_start_offset = start as i64;
        for pending in std::mem::take(&mut self.pending_bulk_data) {
            let offset = self.writer.tell()? - start;
            self.writer.write_all(&pending.bulk.data)?;
            let size = i32::try_from(pending.bulk.data.len()).context("bulk data exceeds 2 GiB")?;
            self.writer.patch_with(pending.header, |buf| {
                buf.ser(&pending.bulk.flags)?;
                buf.ser(&pending.bulk.element_count)?;
                buf.ser(&size)?;
                buf.ser(&(offset as i64))
            })?;
        }
        Ok(())
    }
}

/// Resolves the searchable names collected during tagging to table indices.
pub fn map_searchable_names(
    linker: &SaveLinker,
    searchable_names: impl IntoIterator<Item = (ObjectId, Vec<String>)>,
) -> Vec<(FPackageIndex, Vec<String>)> {
    let mut mapped: Vec<_> = searchable_names
        .into_iter()
        .map(|(object, values)| (linker.map_object(object), values))
        .filter(|(index, _)| !index.is_null())
        .collect();
    mapped.sort_by_key(|(index, _)| *index);
    mapped
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::name_map::FNameTable;
    use crate::object_graph::{FieldValue, MemoryGraph, MemoryObject, ObjectFlags, ObjectKind, ObjectTraits};
    use crate::package_file::{FObjectThumbnail, PackageFile, SerializedField};
    use crate::save::DefaultHooks;
    use crate::sorting::SortedTable;
    use crate::tagging::ObjectTags;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct Fixture {
        graph: MemoryGraph,
        linker: SaveLinker,
    }

    fn fixture() -> Result<Fixture> {
        let mut graph = MemoryGraph::new();
        let engine = graph.add(MemoryObject::new("/Script/Engine", ObjectKind::Plain));
        let class = graph.add(MemoryObject::new("Texture2D", ObjectKind::Class).with_outer(engine));
        let package = graph.add(MemoryObject::new("/Game/Rock", ObjectKind::Plain));
        let texture = graph.add(
            MemoryObject::new("Rock", ObjectKind::Plain)
                .with_class(class)
                .with_outer(package)
                .with_flags(ObjectFlags::PUBLIC | ObjectFlags::STANDALONE)
                .with_traits(ObjectTraits::ASSET)
                .with_fields(vec![
                    FieldValue::Name("Rock".into()),
                    FieldValue::BulkData(BulkData { flags: 0x40, element_count: 4, data: vec![1, 2, 3, 4] }),
                    FieldValue::Object(Some(class)),
                    FieldValue::BulkData(BulkData { flags: 0, element_count: 1, data: vec![9] }),
                    FieldValue::Bytes(vec![0xAA; 3]),
                    FieldValue::SoftObjectPath("/Game/Other.Other".into()),
                ]),
        );

        let mut names = FNameTable::new();
        for name in ["Rock", "Texture2D", "/Script/Engine", "/Script/CoreUObject", "Class", "Package", "/Game/Other"] {
            names.mark_name_referenced(name);
        }
        let imports = SortedTable { entries: vec![Some(engine), Some(class)], conformed: 0 };
        let exports = SortedTable { entries: vec![Some(texture)], conformed: 0 };
        let mut linker = SaveLinker::new(package, names, &imports, &exports, HashMap::new());
        linker.build_import_map(&graph)?;
        linker.build_export_map(&graph, &ObjectTags::default())?;
        linker.build_depends_map(&graph, &HashMap::from([(texture, vec![class])]))?;
        linker.soft_package_references = vec!["/Game/Other".into()];
        linker.summary.generations = vec![FGenerationInfo::default()];
        Ok(Fixture { graph, linker })
    }

    #[test]
    fn test_write_and_read_back() -> Result<()> {
        let Fixture { graph, mut linker } = fixture()?;
        let metadata = PackageMetadata {
            gatherable_text: vec!["Hello".into()],
            thumbnails: vec![ThumbnailEntry {
                class_name: "Texture2D".into(),
                object_path: "Rock".into(),
                thumbnail: FObjectThumbnail { width: 1, height: 1, data: vec![0xFF; 4] },
            }],
            asset_registry: vec![AssetRegistryEntry {
                object_path: "Rock".into(),
                class_name: "Texture2D".into(),
                tags: vec![("Width".into(), "512".into())],
            }],
            world_level_info: Some(vec![5, 6]),
        };
        let result = PackageWriter::new(&graph, &mut linker, &metadata, Cursor::new(vec![])).write(|_| false)?;
        let WriteResult::Complete { sink, size } = result else {
            panic!("write was canceled");
        };
        let bytes = sink.into_inner();
        assert_eq!(size, bytes.len() as u64);
        assert_eq!(&bytes[bytes.len() - 4..], &PACKAGE_FILE_TAG.to_le_bytes());

        let package = PackageFile::read(&mut Cursor::new(bytes))?;
        assert_eq!(package.summary, linker.summary);
        assert_eq!(package.summary.generations, vec![FGenerationInfo { export_count: 1, name_count: 7 }]);
        assert_eq!(package.gatherable_text, vec!["Hello".to_string()]);
        assert_eq!(package.imports.len(), 2);
        assert_eq!(package.exports[0].serial_offset, package.summary.total_header_size as i64);
        assert_eq!(package.depends_map, vec![vec![FPackageIndex::create_import(1)]]);
        assert_eq!(package.soft_package_references, vec!["/Game/Other".to_string()]);
        assert_eq!(package.thumbnails, metadata.thumbnails);
        assert_eq!(package.asset_registry, metadata.asset_registry);
        assert_eq!(package.world_level_info, Some(vec![5, 6]));
        assert_eq!(
            package.payloads[0],
            vec![
                SerializedField::Name("Rock".into()),
                SerializedField::BulkData(BulkData { flags: 0x40, element_count: 4, data: vec![1, 2, 3, 4] }),
                SerializedField::Object(FPackageIndex::create_import(1)),
                SerializedField::BulkData(BulkData { flags: 0, element_count: 1, data: vec![9] }),
                SerializedField::Bytes(vec![0xAA; 3]),
                SerializedField::SoftObjectPath("/Game/Other.Other".into()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_cancel_stops_after_stage() -> Result<()> {
        let Fixture { graph, mut linker } = fixture()?;
        let metadata = PackageMetadata::default();
        let result = PackageWriter::new(&graph, &mut linker, &metadata, Cursor::new(vec![]))
            .write(|stage| stage == SaveStage::DependsMapWritten)?;
        let WriteResult::Canceled { sink, stage } = result else {
            panic!("write was not canceled");
        };
        assert_eq!(stage, SaveStage::DependsMapWritten);
        // nothing past the depends map was written
        assert_eq!(sink.into_inner().len() as i32, linker.summary.depends_offset + 8);
        assert_eq!(SaveStage::COUNT, 16);
        Ok(())
    }

    #[test]
    fn test_editor_data_filtered() -> Result<()> {
        let Fixture { graph, mut linker } = fixture()?;
        linker.summary.package_flags |= PackageFlags::FILTER_EDITOR_ONLY;
        let metadata = collect_metadata(&graph, &linker, &DefaultHooks, true);
        assert_eq!(metadata, PackageMetadata::default());

        let result = PackageWriter::new(&graph, &mut linker, &metadata, Cursor::new(vec![])).write(|_| false)?;
        let WriteResult::Complete { sink, .. } = result else {
            panic!("write was canceled");
        };
        let package = PackageFile::read(&mut Cursor::new(sink.into_inner()))?;
        assert_eq!(package.summary.soft_package_references_offset, 0);
        assert_eq!(package.summary.searchable_names_offset, 0);
        assert_eq!(package.summary.thumbnail_table_offset, 0);
        assert!(package.soft_package_references.is_empty());
        assert!(package.asset_registry.is_empty());
        Ok(())
    }

    #[test]
    fn test_collect_metadata() -> Result<()> {
        struct Hooks;
        impl SaveHooks for Hooks {
            fn thumbnails(&self, _package: ObjectId) -> ObjectThumbnails {
                HashMap::from([
                    ("Texture2D /Game/Rock.Rock".to_string(), FObjectThumbnail { width: 2, height: 2, data: vec![] }),
                    ("??? /Game/Rock".to_string(), FObjectThumbnail::default()),
                    ("Texture2D /Game/Gone.Gone".to_string(), FObjectThumbnail::default()),
                ])
            }
            fn asset_registry_tags(&self, _object: ObjectId) -> Vec<(String, String)> {
                vec![("Format".into(), "DXT1".into())]
            }
        }
        let Fixture { graph, linker } = fixture()?;
        let metadata = collect_metadata(&graph, &linker, &Hooks, false);
        let thumbnail_paths: Vec<_> = metadata.thumbnails.iter().map(|t| t.object_path.as_str()).collect();
        assert_eq!(thumbnail_paths, vec!["Rock", "/Game/Rock"]);
        assert_eq!(metadata.thumbnails[1].class_name, "Package");
        assert_eq!(
            metadata.asset_registry,
            vec![AssetRegistryEntry {
                object_path: "Rock".into(),
                class_name: "Texture2D".into(),
                tags: vec![("Format".into(), "DXT1".into())],
            }]
        );
        Ok(())
    }
}
