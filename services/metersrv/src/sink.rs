//! Append-only reading log

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::OutputFormat;
use crate::error::StorageError;
use crate::record;
use crate::register_map::RegisterMap;

/// File name stem format (UTC)
pub const FILE_STEM_FORMAT: &str = "%Y%m%d-%H.%M.%S";

/// Durable destination for encoded readings
pub trait Sink: Send {
    fn append(&mut self, bytes: &[u8]) -> Result<(), StorageError>;

    /// Push buffered bytes to the OS
    fn flush(&mut self) -> Result<(), StorageError>;

    /// Force written bytes to stable storage
    fn sync(&mut self) -> Result<(), StorageError>;

    /// Flush, sync and close; later calls are no-ops
    fn close(&mut self) -> Result<(), StorageError>;
}

/// Log file opened once per process
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    /// Open `<dir>/<YYYYMMDD-HH.MM.SS>.<ext>` named after the current time
    pub fn create(dir: &Path, format: OutputFormat, map: &RegisterMap) -> Result<Self, StorageError> {
        Self::create_at(dir, format, map, Utc::now())
    }

    pub fn create_at(
        dir: &Path,
        format: OutputFormat,
        map: &RegisterMap,
        started: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        let path = dir.join(format!(
            "{}.{}",
            started.format(FILE_STEM_FORMAT),
            format.extension()
        ));
        let open_err = |source| StorageError::Open {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(dir).map_err(open_err)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(open_err)?;

        let mut sink = Self {
            writer: Some(BufWriter::new(file)),
            path,
        };
        if format == OutputFormat::Csv {
            sink.append(&record::csv_header(map)?)?;
            sink.flush()?;
        }
        info!("Logging readings to {}", sink.path.display());
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, StorageError> {
        self.writer.as_mut().ok_or(StorageError::Closed)
    }
}

impl Sink for FileSink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.writer()?.write_all(bytes).map_err(StorageError::Write)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.writer()?.flush().map_err(StorageError::Flush)
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.writer()?.get_ref().sync_all().map_err(StorageError::Sync)
    }

    fn close(&mut self) -> Result<(), StorageError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush().map_err(StorageError::Flush)?;
        writer.get_ref().sync_all().map_err(StorageError::Sync)?;
        debug!("Closed {}", self.path.display());
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close {}: {}", self.path.display(), e);
        }
    }
}

#[derive(Debug, Default)]
struct MemorySinkState {
    bytes: Vec<u8>,
    flushes: usize,
    syncs: usize,
    closed: bool,
    fail_writes: bool,
}

/// In-memory sink; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().bytes).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn syncs(&self) -> usize {
        self.state.lock().syncs
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Make every following append fail
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }
}

impl Sink for MemorySink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::Closed);
        }
        if state.fail_writes {
            return Err(StorageError::Write(std::io::Error::other("disk full")));
        }
        state.bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::Closed);
        }
        state.flushes += 1;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::Closed);
        }
        state.syncs += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.state.lock().closed = true;
        Ok(())
    }
}
