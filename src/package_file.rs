use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use strum::FromRepr;
use tracing::{instrument, warn};

use crate::name_map::{FName, FNameTable};
use crate::object_graph::{BulkData, ObjectFlags, PackageFlags, SUBOBJECT_DELIMITER};
use crate::package_index::FPackageIndex;
use crate::save::SaveTarget;
use crate::ser::*;

pub const PACKAGE_FILE_TAG: u32 = 0x9E2A83C1;
pub const LEGACY_FILE_VERSION: i32 = -7;
pub const LEGACY_UE3_VERSION: i32 = 864;
pub const PACKAGE_FILE_UE4_VERSION: i32 = 522;

/// Custom version key under which the object schema hash is stamped.
pub const SCHEMA_VERSION_KEY: FGuid = FGuid { a: 0x5C2B0D6E, b: 0x0A394F45, c: 0x9B1C7A3E, d: 0x51D8E6F2 };

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FGuid {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
}
impl FGuid {
    pub fn is_valid(&self) -> bool {
        (self.a | self.b | self.c | self.d) != 0
    }
    /// Builds a GUID from the first 16 bytes of a hash.
    pub fn from_hash(hash: &[u8; 32]) -> Self {
        let word = |i: usize| u32::from_le_bytes([hash[i], hash[i + 1], hash[i + 2], hash[i + 3]]);
        Self { a: word(0), b: word(4), c: word(8), d: word(12) }
    }
}
impl Display for FGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}{:08X}", self.a, self.b, self.c, self.d)
    }
}
impl Readable for FGuid {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(Self {
            a: stream.de()?,
            b: stream.de()?,
            c: stream.de()?,
            d: stream.de()?,
        })
    }
}
impl Writeable for FGuid {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        stream.ser(&self.a)?;
        stream.ser(&self.b)?;
        stream.ser(&self.c)?;
        stream.ser(&self.d)?;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FCustomVersion {
    pub key: FGuid,
    pub version: i32,
}
impl Readable for FCustomVersion {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(Self { key: stream.de()?, version: stream.de()? })
    }
}
impl Writeable for FCustomVersion {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        stream.ser(&self.key)?;
        stream.ser(&self.version)?;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FGenerationInfo {
    pub export_count: i32,
    pub name_count: i32,
}
impl Readable for FGenerationInfo {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(Self { export_count: stream.de()?, name_count: stream.de()? })
    }
}
impl Writeable for FGenerationInfo {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        stream.ser(&self.export_count)?;
        stream.ser(&self.name_count)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FEngineVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub changelist: u32,
    pub branch: String,
}
impl Default for FEngineVersion {
    fn default() -> Self {
        Self { major: 4, minor: 27, patch: 0, changelist: 0, branch: String::new() }
    }
}
impl Readable for FEngineVersion {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(Self {
            major: stream.de()?,
            minor: stream.de()?,
            patch: stream.de()?,
            changelist: stream.de()?,
            branch: stream.de()?,
        })
    }
}
impl Writeable for FEngineVersion {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        stream.ser(&self.major)?;
        stream.ser(&self.minor)?;
        stream.ser(&self.patch)?;
        stream.ser(&self.changelist)?;
        stream.ser(&self.branch)?;
        Ok(())
    }
}

/// File header. Written once with placeholder offsets and rewritten in place at the end of a save,
/// so every variable length member must keep its length between the two writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FPackageFileSummary {
    pub tag: u32,
    pub legacy_file_version: i32,
    pub legacy_ue3_version: i32,
    pub file_version_ue4: i32,
    pub file_version_licensee_ue4: i32,
    pub custom_versions: Vec<FCustomVersion>,
    pub total_header_size: i32,
    pub folder_name: String,
    pub package_flags: PackageFlags,
    pub name_count: i32,
    pub name_offset: i32,
    pub gatherable_text_data_count: i32,
    pub gatherable_text_data_offset: i32,
    pub export_count: i32,
    pub export_offset: i32,
    pub import_count: i32,
    pub import_offset: i32,
    pub depends_offset: i32,
    pub soft_package_references_count: i32,
    pub soft_package_references_offset: i32,
    pub searchable_names_offset: i32,
    pub thumbnail_table_offset: i32,
    pub guid: FGuid,
    pub generations: Vec<FGenerationInfo>,
    pub saved_by_engine_version: FEngineVersion,
    pub compatible_with_engine_version: FEngineVersion,
    pub compression_flags: u32,
    pub package_source: u32,
    pub additional_packages_to_cook: Vec<String>,
    pub asset_registry_data_offset: i32,
    pub bulk_data_start_offset: i64,
    pub world_tile_info_data_offset: i32,
    pub chunk_ids: Vec<i32>,
    pub preload_dependency_count: i32,
    pub preload_dependency_offset: i32,
}
impl Default for FPackageFileSummary {
    fn default() -> Self {
        Self {
            tag: PACKAGE_FILE_TAG,
            legacy_file_version: LEGACY_FILE_VERSION,
            legacy_ue3_version: LEGACY_UE3_VERSION,
            file_version_ue4: PACKAGE_FILE_UE4_VERSION,
            file_version_licensee_ue4: 0,
            custom_versions: vec![],
            total_header_size: 0,
            folder_name: "None".into(),
            package_flags: PackageFlags::empty(),
            name_count: 0,
            name_offset: 0,
            gatherable_text_data_count: 0,
            gatherable_text_data_offset: 0,
            export_count: 0,
            export_offset: 0,
            import_count: 0,
            import_offset: 0,
            depends_offset: 0,
            soft_package_references_count: 0,
            soft_package_references_offset: 0,
            searchable_names_offset: 0,
            thumbnail_table_offset: 0,
            guid: FGuid::default(),
            generations: vec![],
            saved_by_engine_version: FEngineVersion::default(),
            compatible_with_engine_version: FEngineVersion::default(),
            compression_flags: 0,
            package_source: 0,
            additional_packages_to_cook: vec![],
            asset_registry_data_offset: 0,
            bulk_data_start_offset: 0,
            world_tile_info_data_offset: 0,
            chunk_ids: vec![],
            preload_dependency_count: 0,
            preload_dependency_offset: 0,
        }
    }
}
impl FPackageFileSummary {
    pub fn custom_version(&self, key: FGuid) -> Option<i32> {
        self.custom_versions.iter().find(|v| v.key == key).map(|v| v.version)
    }
    pub fn set_custom_version(&mut self, key: FGuid, version: i32) {
        match self.custom_versions.iter_mut().find(|v| v.key == key) {
            Some(existing) => existing.version = version,
            None => self.custom_versions.push(FCustomVersion { key, version }),
        }
    }
}
impl Readable for FPackageFileSummary {
    #[instrument(skip_all, name = "FPackageFileSummary")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        let tag: u32 = s.de()?;
        if tag != PACKAGE_FILE_TAG {
            bail!("invalid package file tag {tag:#X}");
        }
        let legacy_file_version: i32 = s.de()?;
        if legacy_file_version != LEGACY_FILE_VERSION {
            bail!("unsupported legacy file version {legacy_file_version}");
        }
        let legacy_ue3_version = s.de()?;
        let file_version_ue4 = s.de()?;
        let file_version_licensee_ue4 = s.de()?;
        let custom_versions = s.de()?;
        let total_header_size = s.de()?;
        let folder_name = s.de()?;
        let package_flags = PackageFlags::from_bits_retain(s.de()?);
        let name_count = s.de()?;
        let name_offset = s.de()?;
        let gatherable_text_data_count = s.de()?;
        let gatherable_text_data_offset = s.de()?;
        let export_count = s.de()?;
        let export_offset = s.de()?;
        let import_count = s.de()?;
        let import_offset = s.de()?;
        let depends_offset = s.de()?;
        let soft_package_references_count = s.de()?;
        let soft_package_references_offset = s.de()?;
        let searchable_names_offset = s.de()?;
        let thumbnail_table_offset = s.de()?;
        let guid = s.de()?;
        let generations = s.de()?;
        let saved_by_engine_version = s.de()?;
        let compatible_with_engine_version = s.de()?;
        let compression_flags = s.de()?;
        let compressed_chunk_count: i32 = s.de()?;
        if compressed_chunk_count != 0 {
            bail!("compressed packages are not supported ({compressed_chunk_count} chunks)");
        }
        Ok(Self {
            tag,
            legacy_file_version,
            legacy_ue3_version,
            file_version_ue4,
            file_version_licensee_ue4,
            custom_versions,
            total_header_size,
            folder_name,
            package_flags,
            name_count,
            name_offset,
            gatherable_text_data_count,
            gatherable_text_data_offset,
            export_count,
            export_offset,
            import_count,
            import_offset,
            depends_offset,
            soft_package_references_count,
            soft_package_references_offset,
            searchable_names_offset,
            thumbnail_table_offset,
            guid,
            generations,
            saved_by_engine_version,
            compatible_with_engine_version,
            compression_flags,
            package_source: s.de()?,
            additional_packages_to_cook: s.de()?,
            asset_registry_data_offset: s.de()?,
            bulk_data_start_offset: s.de()?,
            world_tile_info_data_offset: s.de()?,
            chunk_ids: s.de()?,
            preload_dependency_count: s.de()?,
            preload_dependency_offset: s.de()?,
        })
    }
}
impl Writeable for FPackageFileSummary {
    #[instrument(skip_all, name = "FPackageFileSummary")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.tag)?;
        s.ser(&self.legacy_file_version)?;
        s.ser(&self.legacy_ue3_version)?;
        s.ser(&self.file_version_ue4)?;
        s.ser(&self.file_version_licensee_ue4)?;
        s.ser(&self.custom_versions)?;
        s.ser(&self.total_header_size)?;
        s.ser(&self.folder_name)?;
        s.ser(&self.package_flags.bits())?;
        s.ser(&self.name_count)?;
        s.ser(&self.name_offset)?;
        s.ser(&self.gatherable_text_data_count)?;
        s.ser(&self.gatherable_text_data_offset)?;
        s.ser(&self.export_count)?;
        s.ser(&self.export_offset)?;
        s.ser(&self.import_count)?;
        s.ser(&self.import_offset)?;
        s.ser(&self.depends_offset)?;
        s.ser(&self.soft_package_references_count)?;
        s.ser(&self.soft_package_references_offset)?;
        s.ser(&self.searchable_names_offset)?;
        s.ser(&self.thumbnail_table_offset)?;
        s.ser(&self.guid)?;
        s.ser(&self.generations)?;
        s.ser(&self.saved_by_engine_version)?;
        s.ser(&self.compatible_with_engine_version)?;
        s.ser(&self.compression_flags)?;
        s.ser(&0i32)?; // compressed chunks
        s.ser(&self.package_source)?;
        s.ser(&self.additional_packages_to_cook)?;
        s.ser(&self.asset_registry_data_offset)?;
        s.ser(&self.bulk_data_start_offset)?;
        s.ser(&self.world_tile_info_data_offset)?;
        s.ser(&self.chunk_ids)?;
        s.ser(&self.preload_dependency_count)?;
        s.ser(&self.preload_dependency_offset)?;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FObjectImport {
    pub class_package: FName,
    pub class_name: FName,
    pub outer_index: FPackageIndex,
    pub object_name: FName,
}
impl Readable for FObjectImport {
    #[instrument(skip_all, name = "FObjectImport")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self {
            class_package: s.de()?,
            class_name: s.de()?,
            outer_index: s.de()?,
            object_name: s.de()?,
        })
    }
}
impl Writeable for FObjectImport {
    #[instrument(skip_all, name = "FObjectImport")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.class_package)?;
        s.ser(&self.class_name)?;
        s.ser(&self.outer_index)?;
        s.ser(&self.object_name)?;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FObjectExport {
    pub class_index: FPackageIndex,
    pub super_index: FPackageIndex,
    pub template_index: FPackageIndex,
    pub outer_index: FPackageIndex,
    pub object_name: FName,
    pub object_flags: ObjectFlags,
    pub serial_size: i64,
    pub serial_offset: i64,
    pub forced_export: bool,
    pub not_for_client: bool,
    pub not_for_server: bool,
    pub package_guid: FGuid,
    pub package_flags: u32,
    pub not_always_loaded_for_editor_game: bool,
    pub is_asset: bool,
    pub first_export_dependency: i32,
    pub serialization_before_serialization_dependencies: i32,
    pub create_before_serialization_dependencies: i32,
    pub serialization_before_create_dependencies: i32,
    pub create_before_create_dependencies: i32,

    /// The payload could not be decoded. Never persisted.
    #[serde(skip)]
    pub load_failed: bool,
    /// Excluded for the target the package was loaded for. Never persisted.
    #[serde(skip)]
    pub filtered: bool,
}
impl FObjectExport {
    /// Placeholder left in the table for an export that no longer exists.
    pub fn is_null(&self) -> bool {
        self.serial_offset == 0
    }
}
impl Readable for FObjectExport {
    #[instrument(skip_all, name = "FObjectExport")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self {
            class_index: s.de()?,
            super_index: s.de()?,
            template_index: s.de()?,
            outer_index: s.de()?,
            object_name: s.de()?,
            object_flags: ObjectFlags::from_bits_retain(s.de()?),
            serial_size: s.de()?,
            serial_offset: s.de()?,
            forced_export: s.de()?,
            not_for_client: s.de()?,
            not_for_server: s.de()?,
            package_guid: s.de()?,
            package_flags: s.de()?,
            not_always_loaded_for_editor_game: s.de()?,
            is_asset: s.de()?,
            first_export_dependency: s.de()?,
            serialization_before_serialization_dependencies: s.de()?,
            create_before_serialization_dependencies: s.de()?,
            serialization_before_create_dependencies: s.de()?,
            create_before_create_dependencies: s.de()?,
            load_failed: false,
            filtered: false,
        })
    }
}
impl Writeable for FObjectExport {
    #[instrument(skip_all, name = "FObjectExport")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.class_index)?;
        s.ser(&self.super_index)?;
        s.ser(&self.template_index)?;
        s.ser(&self.outer_index)?;
        s.ser(&self.object_name)?;
        s.ser(&self.object_flags.bits())?;
        s.ser(&self.serial_size)?;
        s.ser(&self.serial_offset)?;
        s.ser(&self.forced_export)?;
        s.ser(&self.not_for_client)?;
        s.ser(&self.not_for_server)?;
        s.ser(&self.package_guid)?;
        s.ser(&self.package_flags)?;
        s.ser(&self.not_always_loaded_for_editor_game)?;
        s.ser(&self.is_asset)?;
        s.ser(&self.first_export_dependency)?;
        s.ser(&self.serialization_before_serialization_dependencies)?;
        s.ser(&self.create_before_serialization_dependencies)?;
        s.ser(&self.serialization_before_create_dependencies)?;
        s.ser(&self.create_before_create_dependencies)?;
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FObjectThumbnail {
    pub width: i32,
    pub height: i32,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub data: Vec<u8>,
}
impl Readable for FObjectThumbnail {
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self { width: s.de()?, height: s.de()?, data: s.de()? })
    }
}
impl Writeable for FObjectThumbnail {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.width)?;
        s.ser(&self.height)?;
        s.ser(&self.data)?;
        Ok(())
    }
}

/// Thumbnails keyed by the full name of the object they belong to.
pub type ObjectThumbnails = HashMap<String, FObjectThumbnail>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailEntry {
    pub class_name: String,
    pub object_path: String,
    pub thumbnail: FObjectThumbnail,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRegistryEntry {
    pub object_path: String,
    pub class_name: String,
    pub tags: Vec<(String, String)>,
}
impl Readable for AssetRegistryEntry {
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        let object_path = s.de()?;
        let class_name = s.de()?;
        let tag_count: i32 = s.de()?;
        let tags = read_array(tag_count.max(0) as usize, s, |s| Ok((s.de()?, s.de()?)))?;
        Ok(Self { object_path, class_name, tags })
    }
}
impl Writeable for AssetRegistryEntry {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.object_path)?;
        s.ser(&self.class_name)?;
        s.ser(&(self.tags.len() as i32))?;
        for (key, value) in &self.tags {
            s.ser(key)?;
            s.ser(value)?;
        }
        Ok(())
    }
}

/// Tag byte preceding each value in an export payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub(crate) enum FieldTag {
    Object = 0,
    Name = 1,
    SoftObjectPath = 2,
    Bytes = 3,
    BulkData = 4,
    End = 0xFF,
}

/// Export payload value with object references resolved to table indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerializedField {
    Object(FPackageIndex),
    Name(String),
    SoftObjectPath(String),
    Bytes(Vec<u8>),
    BulkData(BulkData),
}

struct BulkDataHeader {
    flags: u32,
    element_count: i32,
    size_on_disk: i32,
    offset: i64,
}

fn decode_payload<S: Read + Seek>(
    payload: &[u8],
    names: &FNameTable,
    stream: &mut S,
    bulk_data_start: i64,
) -> Result<Vec<SerializedField>> {
    let mut cur = Cursor::new(payload);
    let mut fields = vec![];
    loop {
        let tag: u8 = cur.de()?;
        let field = match FieldTag::from_repr(tag).with_context(|| format!("unknown field tag {tag:#X}"))? {
            FieldTag::End => break,
            FieldTag::Object => SerializedField::Object(cur.de()?),
            FieldTag::Name => SerializedField::Name(names.get(cur.de()?)?),
            FieldTag::SoftObjectPath => SerializedField::SoftObjectPath(cur.de()?),
            FieldTag::Bytes => SerializedField::Bytes(cur.de()?),
            FieldTag::BulkData => {
                let header = BulkDataHeader {
                    flags: cur.de()?,
                    element_count: cur.de()?,
                    size_on_disk: cur.de()?,
                    offset: cur.de()?,
                };
                if header.size_on_disk < 0 || header.offset < 0 {
                    bail!("invalid bulk data header (size {}, offset {})", header.size_on_disk, header.offset);
                }
                stream.seek(SeekFrom::Start((bulk_data_start + header.offset) as u64))?;
                let data = stream.de_ctx(header.size_on_disk as usize)?;
                SerializedField::BulkData(BulkData {
                    flags: header.flags,
                    element_count: header.element_count,
                    data,
                })
            }
        };
        fields.push(field);
    }
    if cur.position() != payload.len() as u64 {
        bail!("{} trailing bytes after export payload", payload.len() as u64 - cur.position());
    }
    Ok(fields)
}

/// A saved package read back from disk.
#[derive(Debug, Clone, Serialize)]
pub struct PackageFile {
    pub summary: FPackageFileSummary,
    #[serde(serialize_with = "serialize_names")]
    pub names: FNameTable,
    pub gatherable_text: Vec<String>,
    pub imports: Vec<FObjectImport>,
    pub exports: Vec<FObjectExport>,
    pub depends_map: Vec<Vec<FPackageIndex>>,
    pub soft_package_references: Vec<String>,
    pub searchable_names: Vec<(FPackageIndex, Vec<String>)>,
    pub thumbnails: Vec<ThumbnailEntry>,
    pub asset_registry: Vec<AssetRegistryEntry>,
    pub world_level_info: Option<Vec<u8>>,
    pub preload_dependencies: Vec<FPackageIndex>,
    /// Decoded payload per export; empty for null exports and exports that failed to load.
    pub payloads: Vec<Vec<SerializedField>>,
}

fn serialize_names<S: serde::Serializer>(names: &FNameTable, s: S) -> std::result::Result<S::Ok, S::Error> {
    names.names().serialize(s)
}

impl PackageFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = std::io::BufReader::new(fs_err::File::open(path.as_ref())?);
        Self::read(&mut file).with_context(|| format!("failed to read package {}", path.as_ref().display()))
    }

    #[instrument(skip_all, name = "PackageFile")]
    pub fn read<S: Read + Seek>(s: &mut S) -> Result<Self> {
        let file_size = s.seek(SeekFrom::End(0))?;
        if file_size < 4 {
            bail!("package is truncated ({file_size} bytes)");
        }
        s.seek(SeekFrom::End(-4))?;
        let eof_tag: u32 = s.de()?;
        if eof_tag != PACKAGE_FILE_TAG {
            bail!("package is truncated: trailing tag is {eof_tag:#X}");
        }

        s.seek(SeekFrom::Start(0))?;
        let summary: FPackageFileSummary = s.de()?;
        let count = |c: i32, what: &str| -> Result<usize> { usize::try_from(c).with_context(|| format!("negative {what} count {c}")) };

        s.seek(SeekFrom::Start(summary.name_offset as u64))?;
        let names = FNameTable::deserialize(s, count(summary.name_count, "name")?)?;

        let mut gatherable_text = vec![];
        if summary.gatherable_text_data_offset != 0 {
            s.seek(SeekFrom::Start(summary.gatherable_text_data_offset as u64))?;
            gatherable_text = s.de_ctx(count(summary.gatherable_text_data_count, "gatherable text")?)?;
        }

        s.seek(SeekFrom::Start(summary.import_offset as u64))?;
        let imports: Vec<FObjectImport> = s.de_ctx(count(summary.import_count, "import")?)?;
        s.seek(SeekFrom::Start(summary.export_offset as u64))?;
        let mut exports: Vec<FObjectExport> = s.de_ctx(count(summary.export_count, "export")?)?;

        s.seek(SeekFrom::Start(summary.depends_offset as u64))?;
        let depends_map: Vec<Vec<FPackageIndex>> = s.de_ctx(exports.len())?;

        let mut soft_package_references = vec![];
        if summary.soft_package_references_offset != 0 {
            s.seek(SeekFrom::Start(summary.soft_package_references_offset as u64))?;
            let refs: Vec<FName> = s.de_ctx(count(summary.soft_package_references_count, "soft package reference")?)?;
            for name in refs {
                soft_package_references.push(names.get(name)?);
            }
        }

        let mut searchable_names = vec![];
        if summary.searchable_names_offset != 0 {
            s.seek(SeekFrom::Start(summary.searchable_names_offset as u64))?;
            let entries: i32 = s.de()?;
            for _ in 0..count(entries, "searchable name")? {
                let index: FPackageIndex = s.de()?;
                let values: Vec<FName> = s.de()?;
                let values = values.into_iter().map(|n| names.get(n)).collect::<Result<_>>()?;
                searchable_names.push((index, values));
            }
        }

        let mut thumbnails = vec![];
        if summary.thumbnail_table_offset != 0 {
            s.seek(SeekFrom::Start(summary.thumbnail_table_offset as u64))?;
            let entries: i32 = s.de()?;
            let mut table = vec![];
            for _ in 0..count(entries, "thumbnail")? {
                let class_name: String = s.de()?;
                let object_path: String = s.de()?;
                let offset: i32 = s.de()?;
                table.push((class_name, object_path, offset));
            }
            for (class_name, object_path, offset) in table {
                s.seek(SeekFrom::Start(offset as u64))?;
                thumbnails.push(ThumbnailEntry { class_name, object_path, thumbnail: s.de()? });
            }
        }

        s.seek(SeekFrom::Start(summary.asset_registry_data_offset as u64))?;
        let asset_count: i32 = s.de()?;
        let asset_registry = s.de_ctx(count(asset_count, "asset registry")?)?;

        let mut world_level_info = None;
        if summary.world_tile_info_data_offset != 0 {
            s.seek(SeekFrom::Start(summary.world_tile_info_data_offset as u64))?;
            world_level_info = Some(s.de()?);
        }

        s.seek(SeekFrom::Start(summary.preload_dependency_offset as u64))?;
        let preload_dependencies = s.de_ctx(count(summary.preload_dependency_count, "preload dependency")?)?;

        let mut payloads = vec![];
        for export in &mut exports {
            if export.is_null() {
                payloads.push(vec![]);
                continue;
            }
            s.seek(SeekFrom::Start(export.serial_offset as u64))?;
            let payload: Vec<u8> = s.de_ctx(usize::try_from(export.serial_size)?)?;
            match decode_payload(&payload, &names, s, summary.bulk_data_start_offset) {
                Ok(fields) => payloads.push(fields),
                Err(err) => {
                    warn!("failed to decode export {}: {err:#}", names.get(export.object_name)?);
                    export.load_failed = true;
                    payloads.push(vec![]);
                }
            }
        }

        Ok(Self {
            summary,
            names,
            gatherable_text,
            imports,
            exports,
            depends_map,
            soft_package_references,
            searchable_names,
            thumbnails,
            asset_registry,
            world_level_info,
            preload_dependencies,
            payloads,
        })
    }

    pub fn name(&self, name: FName) -> Result<String> {
        self.names.get(name)
    }

    /// Placeholder left in the import table for an import that no longer exists.
    pub fn is_null_import(&self, index: usize) -> bool {
        let import = &self.imports[index];
        import.outer_index.is_null() && self.names.get(import.object_name).is_ok_and(|n| n == "None")
    }

    pub fn object_name(&self, index: FPackageIndex) -> Result<String> {
        if let Some(i) = index.import() {
            let import = self.imports.get(i).with_context(|| format!("import {index} out of range"))?;
            self.names.get(import.object_name)
        } else if let Some(i) = index.export() {
            let export = self.exports.get(i).with_context(|| format!("export {index} out of range"))?;
            self.names.get(export.object_name)
        } else {
            bail!("null package index has no name")
        }
    }

    fn outer_of(&self, index: FPackageIndex) -> Result<FPackageIndex> {
        Ok(if let Some(i) = index.import() {
            self.imports.get(i).with_context(|| format!("import {index} out of range"))?.outer_index
        } else if let Some(i) = index.export() {
            self.exports.get(i).with_context(|| format!("export {index} out of range"))?.outer_index
        } else {
            FPackageIndex::create_null()
        })
    }

    /// Path of an entry. Imports resolve to their full path, exports to the path inside this
    /// package (prefixed with `package_name` when given).
    pub fn object_path(&self, index: FPackageIndex, package_name: Option<&str>) -> Result<String> {
        let mut chain = vec![];
        let mut current = index;
        while !current.is_null() {
            if chain.len() > self.imports.len() + self.exports.len() {
                bail!("outer chain of {index} is cyclic");
            }
            chain.push(self.object_name(current)?);
            current = self.outer_of(current)?;
        }
        if index.is_export()
            && let Some(package_name) = package_name
        {
            chain.push(package_name.to_string());
        }
        // subobjects of a top level object are separated with ':'
        let subobject_depth = if index.is_import() || package_name.is_some() { 2 } else { 1 };
        let mut path = String::new();
        for (depth, name) in chain.iter().rev().enumerate() {
            if depth > 0 {
                path.push(if depth == subobject_depth { SUBOBJECT_DELIMITER } else { '.' });
            }
            path.push_str(name);
        }
        Ok(path)
    }

    /// Marks exports the given target would not load.
    pub fn filter_for(&mut self, target: SaveTarget) {
        for export in &mut self.exports {
            export.filtered = match target {
                SaveTarget::Editor => false,
                SaveTarget::Game => export.not_for_client && export.not_for_server,
                SaveTarget::Client => export.not_for_client,
                SaveTarget::Server => export.not_for_server,
            };
        }
    }

    /// The four dependency buckets of an export, in storage order.
    pub fn export_dependencies(&self, export_index: usize) -> Result<[&[FPackageIndex]; 4]> {
        let export = self.exports.get(export_index).with_context(|| format!("export {export_index} out of range"))?;
        let counts = [
            export.serialization_before_serialization_dependencies,
            export.create_before_serialization_dependencies,
            export.serialization_before_create_dependencies,
            export.create_before_create_dependencies,
        ];
        let mut buckets: [&[FPackageIndex]; 4] = [&[]; 4];
        if export.first_export_dependency < 0 {
            if counts.iter().any(|&c| c != 0) {
                bail!("export {export_index} has dependency counts but no first dependency");
            }
            return Ok(buckets);
        }
        let mut start = export.first_export_dependency as usize;
        for (bucket, count) in buckets.iter_mut().zip(counts) {
            let end = start + count as usize;
            *bucket = self
                .preload_dependencies
                .get(start..end)
                .with_context(|| format!("dependencies of export {export_index} out of range"))?;
            start = end;
        }
        Ok(buckets)
    }
}
