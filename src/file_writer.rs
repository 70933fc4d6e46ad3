use std::ffi::OsString;
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use fs_err as fs;
use tracing::{error, instrument};

use crate::save::SaveError;

/// Number of package writes handed to a background thread that have not finished yet.
pub static OUTSTANDING_ASYNC_WRITES: AtomicUsize = AtomicUsize::new(0);

pub fn outstanding_async_writes() -> usize {
    OUTSTANDING_ASYNC_WRITES.load(Ordering::SeqCst)
}

/// Blocks until every background package write has finished.
pub fn wait_for_async_file_writes() {
    while outstanding_async_writes() > 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Held by a background write for as long as it runs, including when it panics.
struct OutstandingWrite;
impl OutstandingWrite {
    fn begin() -> Self {
        OUTSTANDING_ASYNC_WRITES.fetch_add(1, Ordering::SeqCst);
        Self
    }
}
impl Drop for OutstandingWrite {
    fn drop(&mut self) {
        OUTSTANDING_ASYNC_WRITES.fetch_sub(1, Ordering::SeqCst);
    }
}

static TEMP_FILE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Path a package is written to before it is moved over `destination`. Every call returns a new
/// name, so concurrent writes to the same destination never share a temp file.
pub fn temp_path_for(destination: &Path) -> PathBuf {
    let mut name = destination.file_name().map(OsString::from).unwrap_or_default();
    let n = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{}-{n}.tmp", std::process::id()));
    destination.with_file_name(name)
}

/// Where the package writer streams to: a temp file next to the destination, or memory when the
/// final write happens on a background thread.
pub enum PackageSink {
    File { path: PathBuf, writer: BufWriter<fs::File> },
    Memory(Cursor<Vec<u8>>),
}

/// Output of a completed write, ready to be moved into place.
#[derive(Debug)]
pub enum FinishedPackage {
    TempFile(PathBuf),
    Memory(Vec<u8>),
}

impl PackageSink {
    pub fn create_temp_file(destination: &Path) -> Result<Self> {
        let path = temp_path_for(destination);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(fs::File::create(&path)?);
        Ok(Self::File { path, writer })
    }
    pub fn memory() -> Self {
        Self::Memory(Cursor::new(vec![]))
    }
    pub fn temp_path(&self) -> Option<&Path> {
        match self {
            Self::File { path, .. } => Some(path),
            Self::Memory(_) => None,
        }
    }

    pub fn finish(self) -> Result<FinishedPackage> {
        Ok(match self {
            Self::File { path, mut writer } => {
                writer.flush()?;
                drop(writer);
                FinishedPackage::TempFile(path)
            }
            Self::Memory(cursor) => FinishedPackage::Memory(cursor.into_inner()),
        })
    }

    /// Detaches the sink and deletes whatever was written so far.
    pub fn discard(self) -> Result<()> {
        if let Self::File { path, writer } = self {
            drop(writer);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
impl Write for PackageSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::File { writer, .. } => writer.write(buf),
            Self::Memory(cursor) => cursor.write(buf),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::File { writer, .. } => writer.flush(),
            Self::Memory(cursor) => cursor.flush(),
        }
    }
}
impl Seek for PackageSink {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            Self::File { writer, .. } => writer.seek(pos),
            Self::Memory(cursor) => cursor.seek(pos),
        }
    }
}

/// Checks the size of a finished temp file and moves it over `destination`. On failure the temp
/// file is removed and the destination is left untouched.
#[instrument(skip_all, name = "move_into_place")]
pub fn move_into_place(temp: &Path, destination: &Path, expected_size: u64) -> Result<()> {
    let written = fs::metadata(temp)?.len();
    if written != expected_size {
        error!("short write to {}: expected {expected_size} bytes, wrote {written}", temp.display());
        fs::remove_file(temp)?;
        return Err(SaveError::ShortWrite { path: temp.to_path_buf(), expected: expected_size, written }.into());
    }
    if let Err(err) = fs::rename(temp, destination) {
        error!("{err}");
        fs::remove_file(temp)?;
        return Err(SaveError::MoveFailed {
            from: temp.to_path_buf(),
            to: destination.to_path_buf(),
            reason: err.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Writes `bytes` to a temp file and moves it over `destination`.
pub fn write_package_file(bytes: &[u8], destination: &Path) -> Result<()> {
    let temp = temp_path_for(destination);
    if let Some(parent) = temp.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(&temp, bytes)?;
    move_into_place(&temp, destination, bytes.len() as u64)
}

/// Writes a package on a background thread. [`wait_for_async_file_writes`] blocks until it is done;
/// failures are logged by the thread and returned through the handle.
pub fn write_package_file_async(bytes: Vec<u8>, destination: PathBuf) -> JoinHandle<Result<()>> {
    let outstanding = OutstandingWrite::begin();
    std::thread::spawn(move || {
        let _outstanding = outstanding;
        let result = write_package_file(&bytes, &destination);
        if let Err(err) = &result {
            error!("async write of {} failed: {err:#}", destination.display());
        }
        result
    })
}
