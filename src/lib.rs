//! Serializes an in-memory object graph into a single package file: a header of name, import
//! and export tables followed by export payloads and a bulk data region.

pub mod dependencies;
pub mod file_writer;
pub mod linker;
pub mod logging;
pub mod name_map;
pub mod object_graph;
pub mod package_file;
pub mod package_index;
pub mod package_writer;
pub mod save;
pub mod seek_free;
pub mod ser;
pub mod sorting;
pub mod tagging;

pub use file_writer::wait_for_async_file_writes;
pub use logging::Log;
pub use object_graph::{MemoryGraph, MemoryObject, ObjectGraph, ObjectId};
pub use package_file::PackageFile;
pub use package_writer::SaveStage;
pub use save::{
    DefaultHooks, SaveError, SaveHooks, SaveOptions, SaveOutcome, SavePackageResult, SaveTarget, save_package,
};
