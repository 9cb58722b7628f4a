//! Reader pool
//!
//! Concurrent reads never touch the writer's file handle. Each reader in
//! the pool owns its own handle and, in high-performance mode, a memory
//! map of the file. Readers are checked out for the duration of one read
//! and returned afterwards.
//!
//! A reader's view can go stale in two ways: the file grew past its map
//! (appends), or the file was atomically replaced (compaction). The pool
//! carries a generation counter bumped on replacement; a checked-out
//! reader refreshes itself lazily when its generation lags or its map is
//! too short for the requested range.

use entitydb_core::{Error, Result};
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

struct FileReader {
    file: File,
    map: Option<Mmap>,
    generation: u64,
}

impl FileReader {
    fn open(path: &Path, use_mmap: bool, generation: u64) -> Result<Self> {
        let file = File::open(path)?;
        let map = if use_mmap {
            // Safety: the file is append-only and atomically replaced;
            // mapped ranges are never rewritten in place.
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };
        Ok(FileReader {
            file,
            map,
            generation,
        })
    }

    fn remap(&mut self) -> Result<()> {
        if self.map.is_some() {
            self.map = Some(unsafe { Mmap::map(&self.file)? });
        }
        Ok(())
    }

    fn read(&mut self, offset: u64, len: usize, buf: &mut Vec<u8>) -> Result<()> {
        buf.clear();
        if let Some(map) = &self.map {
            let start = offset as usize;
            let end = start
                .checked_add(len)
                .ok_or_else(|| out_of_range(offset, len, map.len() as u64))?;
            if end > map.len() {
                return Err(out_of_range(offset, len, map.len() as u64));
            }
            buf.extend_from_slice(&map[start..end]);
            return Ok(());
        }

        let file_len = self.file.metadata()?.len();
        if offset + len as u64 > file_len {
            return Err(out_of_range(offset, len, file_len));
        }
        buf.resize(len, 0);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }
}

fn out_of_range(offset: u64, len: usize, file_size: u64) -> Error {
    Error::IndexOutOfRange {
        offset,
        len: len as u64,
        file_size,
    }
}

/// Pool of reusable file readers
pub struct ReaderPool {
    path: PathBuf,
    use_mmap: bool,
    generation: AtomicU64,
    readers: Mutex<Vec<FileReader>>,
}

impl ReaderPool {
    /// Create a pool over the unified file at `path`
    pub fn new(path: impl Into<PathBuf>, use_mmap: bool) -> Self {
        ReaderPool {
            path: path.into(),
            use_mmap,
            generation: AtomicU64::new(1),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Invalidate every pooled reader (after compaction swaps the file)
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.readers.lock().clear();
        debug!(target: "entitydb::storage", "reader pool invalidated");
    }

    /// Read `len` bytes at `offset` into a fresh buffer
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len);
        self.read_into(offset, len, &mut buf)?;
        Ok(buf)
    }

    /// Read `len` bytes at `offset` into a caller-supplied (pooled) buffer
    pub fn read_into(&self, offset: u64, len: usize, buf: &mut Vec<u8>) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut reader = self.checkout(generation)?;

        let result = match reader.read(offset, len, buf) {
            // The map may simply predate an append; refresh once and retry.
            Err(Error::IndexOutOfRange { .. }) if reader.map.is_some() => {
                reader.remap()?;
                reader.read(offset, len, buf)
            }
            other => other,
        };

        if result.is_ok() {
            self.readers.lock().push(reader);
        }
        result
    }

    fn checkout(&self, generation: u64) -> Result<FileReader> {
        let mut readers = self.readers.lock();
        while let Some(reader) = readers.pop() {
            if reader.generation == generation {
                return Ok(reader);
            }
            // Stale generation: the file behind this handle is gone.
        }
        drop(readers);
        FileReader::open(&self.path, self.use_mmap, generation)
    }

    /// Readers currently idle in the pool
    pub fn idle(&self) -> usize {
        self.readers.lock().len()
    }
}
