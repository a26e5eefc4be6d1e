//! File abstractions used by the table builder and reader.
//!
//! The builder only appends; the reader only issues positional reads and may
//! be shared across threads. [`MemFile`] implements both sides in memory.

use crate::coding::put_varint64;
use crate::error::Result;
use parking_lot::RwLock;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Append-only sink for a table being built.
pub trait WritableFile: Send {
    /// Appends `data` at the end of the file.
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Pushes buffered bytes to the operating system.
    fn flush(&mut self) -> Result<()>;

    /// Flushes and makes the contents durable.
    fn sync(&mut self) -> Result<()>;

    /// Stable identifier shared with readers of the same file, used to build
    /// block cache keys. `None` when the file has no such identity.
    fn unique_id(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Positional reads from an immutable table file.
pub trait RandomAccessFile: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning how many were
    /// read. A short count means end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Current file length.
    fn size(&self) -> Result<u64>;

    /// See [`WritableFile::unique_id`].
    fn unique_id(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Buffered writer over a file on disk.
pub struct FileWriter {
    writer: BufWriter<File>,
}

impl FileWriter {
    /// Create (or truncate) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self { writer: BufWriter::new(file) })
    }
}

impl WritableFile for FileWriter {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Shared positional reader over a file on disk.
///
/// A path can be rewritten in place while keeping its inode, so an on-disk
/// file carries no identity of its own; each reader draws fresh cache keys.
pub struct FileReader {
    #[cfg(unix)]
    file: File,
    #[cfg(not(unix))]
    file: parking_lot::Mutex<File>,
}

impl FileReader {
    /// Open the file at `path` for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        #[cfg(not(unix))]
        let file = parking_lot::Mutex::new(file);
        Ok(Self { file })
    }
}

impl RandomAccessFile for FileReader {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        let mut read = 0;
        while read < buf.len() {
            match self.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read)
    }

    #[cfg(not(unix))]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read)
    }

    fn size(&self) -> Result<u64> {
        #[cfg(unix)]
        let len = self.file.metadata()?.len();
        #[cfg(not(unix))]
        let len = self.file.lock().metadata()?.len();
        Ok(len)
    }
}

static NEXT_MEM_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// In-memory file. Clones share the same contents and identity, so a table
/// written through one clone can be read through another.
#[derive(Clone)]
pub struct MemFile {
    data: Arc<RwLock<Vec<u8>>>,
    id: u64,
}

impl Default for MemFile {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFile {
    /// Create an empty file.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(Vec::new())),
            id: NEXT_MEM_FILE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Create a file holding `data`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let file = Self::new();
        *file.data.write() = data;
        file
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Current length.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flips the bits of `mask` in the byte at `offset`.
    pub fn corrupt_byte(&self, offset: usize, mask: u8) {
        if let Some(byte) = self.data.write().get_mut(offset) {
            *byte ^= mask;
        }
    }

    /// Drops everything past `len`.
    pub fn truncate(&self, len: usize) {
        self.data.write().truncate(len);
    }
}

impl WritableFile for MemFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.data.write().extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn unique_id(&self) -> Option<Vec<u8>> {
        let mut id = Vec::with_capacity(10);
        put_varint64(&mut id, self.id);
        Some(id)
    }
}

impl RandomAccessFile for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.read();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    fn unique_id(&self) -> Option<Vec<u8>> {
        WritableFile::unique_id(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_mem_file_shared_contents() {
        let mut writer = MemFile::new();
        let reader = writer.clone();
        writer.append(b"hello ").unwrap();
        writer.append(b"world").unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(reader.read_at(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(reader.size().unwrap(), 11);
        assert_eq!(RandomAccessFile::unique_id(&reader), WritableFile::unique_id(&writer));
    }

    #[test]
    fn test_mem_file_short_read() {
        let file = MemFile::from_vec(b"abc".to_vec());
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(1, &mut buf).unwrap(), 2);
        assert_eq!(file.read_at(10, &mut buf).unwrap(), 0);
        assert_ne!(RandomAccessFile::unique_id(&file), RandomAccessFile::unique_id(&MemFile::new()));
    }

    #[test]
    fn test_file_writer_reader() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut writer = FileWriter::create(temp_file.path()).unwrap();
        writer.append(b"0123456789").unwrap();
        writer.sync().unwrap();

        let reader = FileReader::open(temp_file.path()).unwrap();
        assert_eq!(reader.size().unwrap(), 10);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read_at(3, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"3456");
        assert!(WritableFile::unique_id(&writer).is_none());
        assert!(reader.unique_id().is_none());
    }
}
