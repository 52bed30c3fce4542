//! Local sinks: a buffered file and a shared in-memory buffer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::SinkError;
use crate::traits::Sink;

/// Writes container bytes to a file through a `BufWriter`.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
    closed: bool,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            bytes_written: 0,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn open(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        if self.writer.is_some() {
            return Ok(());
        }
        let file = File::create(&self.path).map_err(|e| {
            SinkError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create output file {:?}: {}", self.path, e),
            ))
        })?;
        self.writer = Some(BufWriter::new(file));
        debug!(path = %self.path.display(), "File sink opened");
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::NotOpen)?;
        writer.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(
                path = %self.path.display(),
                bytes = self.bytes_written,
                "File sink closed"
            );
        }
        self.closed = true;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("open", &self.writer.is_some())
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

/// Appends container bytes to a shared `Vec<u8>`.
///
/// Cloning the sink shares the buffer, so a caller can keep a handle and
/// inspect the bytes after the muxer has consumed its copy.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
    open: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }
}

impl Sink for MemorySink {
    fn open(&mut self) -> Result<(), SinkError> {
        self.open = true;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if !self.open {
            return Err(SinkError::NotOpen);
        }
        self.buffer.lock().extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.open = false;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.buffer.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_shares_buffer() {
        let handle = MemorySink::new();
        let mut sink = handle.clone();
        sink.open().unwrap();
        sink.write(b"ftyp").unwrap();
        sink.close().unwrap();
        assert_eq!(handle.contents(), b"ftyp");
        assert_eq!(handle.bytes_written(), 4);
    }

    #[test]
    fn memory_sink_requires_open() {
        let mut sink = MemorySink::new();
        assert!(matches!(sink.write(b"x"), Err(SinkError::NotOpen)));
    }

    #[test]
    fn file_sink_writes_and_closes() {
        let path = std::env::temp_dir().join("ck_common_file_sink.bin");
        let mut sink = FileSink::new(&path);
        sink.open().unwrap();
        sink.write(&[1, 2, 3]).unwrap();
        sink.close().unwrap();
        assert_eq!(sink.bytes_written(), 3);
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert!(matches!(sink.open(), Err(SinkError::Closed)));
        std::fs::remove_file(&path).ok();
    }
}
