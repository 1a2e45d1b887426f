//! Memory-mapped file handles and the LRU cache that bounds them.

use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use memmap2::MmapMut;
use tracing::trace;

use spindrift_types::SyncError;

/// A writable memory-mapped file.
pub struct MappedFile {
    path: PathBuf,
    file: std::fs::File,
    map: MmapMut,
    len: u64,
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl MappedFile {
    /// Open `path` read-write, creating it if needed, sized to `len` bytes.
    /// Existing content within the size is preserved so partial pulls can
    /// resume. Zero-length files are never mapped.
    pub fn open(path: &Path, len: u64) -> Result<Self, SyncError> {
        if len == 0 {
            return Err(SyncError::io(
                format!("mapping zero-length file {}", path.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty mapping"),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| SyncError::io(format!("opening {}", path.display()), e))?;
        let meta = file
            .metadata()
            .map_err(|e| SyncError::io(format!("stat {}", path.display()), e))?;
        if meta.len() != len {
            file.set_len(len)
                .map_err(|e| SyncError::io(format!("sizing {}", path.display()), e))?;
        }
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| SyncError::io(format!("mapping {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            len,
        })
    }

    /// The mapped path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The mapped length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the mapping covers zero bytes; always false by construction.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write `data` at `offset` within the mapping.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), SyncError> {
        let end = offset + data.len() as u64;
        if end > self.len {
            return Err(SyncError::io(
                format!(
                    "write of {} bytes at {} beyond mapped length {} in {}",
                    data.len(),
                    offset,
                    self.len,
                    self.path.display()
                ),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "out of bounds"),
            ));
        }
        self.map[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Read `len` bytes at `offset` from the mapping.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<&[u8], SyncError> {
        let end = offset + len as u64;
        if end > self.len {
            return Err(SyncError::io(
                format!("read beyond mapped length in {}", self.path.display()),
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "out of bounds"),
            ));
        }
        Ok(&self.map[offset as usize..end as usize])
    }

    /// Flush dirty pages to disk.
    pub fn flush(&self) -> Result<(), SyncError> {
        self.map
            .flush()
            .map_err(|e| SyncError::io(format!("flushing {}", self.path.display()), e))?;
        self.file
            .sync_all()
            .map_err(|e| SyncError::io(format!("syncing {}", self.path.display()), e))
    }
}

/// LRU of open mappings, keyed by path. Evicting flushes first.
pub struct FileCache {
    cache: LruCache<PathBuf, MappedFile>,
}

impl FileCache {
    /// A cache holding at most `capacity` open mappings.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Get the mapping for `path`, opening (and possibly evicting) if absent.
    pub fn open(&mut self, path: &Path, len: u64) -> Result<&mut MappedFile, SyncError> {
        if !self.cache.contains(path) {
            let mapped = MappedFile::open(path, len)?;
            if let Some((evicted_path, evicted)) = self.cache.push(path.to_path_buf(), mapped) {
                if evicted_path != path {
                    trace!(path = %evicted_path.display(), "evicting mapping");
                    evicted.flush()?;
                }
            }
        }
        Ok(self.cache.get_mut(path).expect("just inserted"))
    }

    /// Drop the mapping for `path`, returning it for a final flush.
    pub fn remove(&mut self, path: &Path) -> Option<MappedFile> {
        self.cache.pop(path)
    }

    /// Flush every open mapping; used at shutdown.
    pub fn flush_all(&mut self) -> Result<(), SyncError> {
        for (_, mapped) in self.cache.iter() {
            mapped.flush()?;
        }
        Ok(())
    }

    /// Number of open mappings.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether no mappings are open.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
