//! The unified database file
//!
//! [`UnifiedFile`] owns the write handle and the authoritative copy of the
//! header. All mutation goes through it, on the engine's single writer
//! thread; concurrent reads use [`crate::reader::ReaderPool`] with their
//! own handles.
//!
//! # Durable append contract
//!
//! [`UnifiedFile::append_record`] returns only after the record bytes are
//! written, synced to the device, re-read, and CRC-verified. A mutation is
//! applied to the in-memory index and tag shards strictly after its record
//! has passed this gate.

use crate::format::dictionary::TagDict;
use crate::format::header::FileHeader;
use crate::format::index::EntityIndex;
use crate::format::{HEADER_REGION_SIZE, HEADER_SLOT_SIZE};
use crate::wal::record::{WalOp, WalRecord, WAL_PAYLOAD_OFFSET};
use entitydb_core::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where a durable append landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendInfo {
    /// LSN assigned to the record
    pub lsn: u64,
    /// Offset of the record frame
    pub record_offset: u64,
    /// Offset of the payload; entity blocks are addressed here
    pub payload_offset: u64,
    /// Payload length
    pub payload_len: u32,
}

/// Writer-side handle on the unified file
#[derive(Debug)]
pub struct UnifiedFile {
    path: PathBuf,
    file: File,
    header: FileHeader,
    physical_end: u64,
    next_lsn: u64,
    wal_bytes: u64,
}

impl UnifiedFile {
    /// Create a fresh database file
    ///
    /// Fails if the file already exists. The new file holds both header
    /// slots plus framed images of an empty dictionary and an empty
    /// index, so the data region is frame-parseable from its first byte.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(HEADER_REGION_SIZE as u64)?;

        let mut unified = UnifiedFile {
            path,
            file,
            header: FileHeader::empty(),
            physical_end: HEADER_REGION_SIZE as u64,
            next_lsn: 1,
            wal_bytes: 0,
        };

        let dict_bytes = TagDict::new().encode();
        let index_bytes = EntityIndex::new().encode();
        let dict_info = unified.append_record(WalOp::DictSegment, dict_bytes)?;
        let index_info = unified.append_record(WalOp::IndexSegment, index_bytes)?;

        let header = FileHeader {
            file_size: unified.physical_end,
            dict_offset: dict_info.payload_offset,
            dict_size: dict_info.payload_len as u64,
            index_offset: index_info.payload_offset,
            index_size: index_info.payload_len as u64,
            entity_count: 0,
            ..FileHeader::empty()
        };

        let slot = header.encode_slot();
        unified.file.seek(SeekFrom::Start(0))?;
        unified.file.write_all(&slot)?;
        unified.file.write_all(&slot)?;
        unified.file.sync_all()?;

        unified.header = header;
        unified.wal_bytes = 0;

        info!(
            target: "entitydb::storage",
            path = %unified.path.display(),
            "created database file"
        );

        Ok(unified)
    }

    /// Open an existing database file
    ///
    /// Reads the primary header slot, falling back to the prior-header
    /// copy if the primary fails its CRC. The WAL region past
    /// `header.file_size` is left untouched for the recovery scan.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let physical_end = file.seek(SeekFrom::End(0))?;

        let mut region = [0u8; HEADER_REGION_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut region)?;

        let header = match FileHeader::decode_slot(&region[..HEADER_SLOT_SIZE]) {
            Ok(header) => header,
            Err(primary) => match FileHeader::decode_slot(&region[HEADER_SLOT_SIZE..]) {
                Ok(fallback) => {
                    warn!(
                        target: "entitydb::storage",
                        error = %primary,
                        "primary header slot invalid, using prior copy"
                    );
                    fallback
                }
                Err(_) => return Err(primary.into()),
            },
        };

        if header.file_size > physical_end {
            return Err(Error::CorruptHeader {
                reason: format!(
                    "header extent {} exceeds physical size {}",
                    header.file_size, physical_end
                ),
            });
        }
        for (offset, size, what) in [
            (header.dict_offset, header.dict_size, "dictionary"),
            (header.index_offset, header.index_size, "index"),
        ] {
            if offset + size > header.file_size {
                return Err(Error::CorruptHeader {
                    reason: format!("{} segment extends past the durable extent", what),
                });
            }
        }

        debug!(
            target: "entitydb::storage",
            path = %path.display(),
            entities = header.entity_count,
            wal_region = physical_end - header.file_size,
            "opened database file"
        );

        Ok(UnifiedFile {
            path,
            file,
            header,
            physical_end,
            next_lsn: 1,
            wal_bytes: physical_end - header.file_size,
        })
    }

    /// The file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current header
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Physical end of the file (end of the WAL region)
    pub fn physical_size(&self) -> u64 {
        self.physical_end
    }

    /// WAL bytes accumulated since the last checkpoint
    pub fn wal_bytes(&self) -> u64 {
        self.wal_bytes
    }

    /// Next LSN to be assigned
    pub fn next_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Set the LSN counter after a recovery scan
    pub fn set_next_lsn(&mut self, lsn: u64) {
        self.next_lsn = lsn;
    }

    /// Borrow the handle for the recovery scan
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Load the tag dictionary from its segment
    pub fn load_dict(&mut self) -> Result<TagDict> {
        let bytes = self.read_at(self.header.dict_offset, self.header.dict_size as usize)?;
        Ok(TagDict::decode(&bytes)?)
    }

    /// Load the entity index from its segment
    pub fn load_index(&mut self) -> Result<EntityIndex> {
        let bytes = self.read_at(self.header.index_offset, self.header.index_size as usize)?;
        Ok(EntityIndex::decode(&bytes)?)
    }

    /// Read `len` bytes at `offset`, bounds-checked against the file
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.physical_end {
            return Err(Error::IndexOutOfRange {
                offset,
                len: len as u64,
                file_size: self.physical_end,
            });
        }
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Durably append one WAL record
    ///
    /// Write, sync, re-read, verify. Returns where the record and its
    /// payload landed.
    pub fn append_record(&mut self, op: WalOp, payload: Vec<u8>) -> Result<AppendInfo> {
        let payload_len = payload.len() as u32;
        let record = WalRecord::new(self.next_lsn, op, payload);
        let frame = record.encode();
        let record_offset = self.physical_end;

        self.file.seek(SeekFrom::Start(record_offset))?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;

        // Verify the bytes that actually hit the device.
        let mut readback = vec![0u8; frame.len()];
        self.file.seek(SeekFrom::Start(record_offset))?;
        self.file.read_exact(&mut readback)?;
        if WalRecord::decode(&readback).is_err() {
            return Err(Error::checksum_mismatch(
                format!("wal record at {}", record_offset),
                hex::encode(crc32c::crc32c(&frame[4..frame.len() - 4]).to_le_bytes()),
                "unreadable after sync".to_owned(),
            ));
        }

        self.physical_end += frame.len() as u64;
        self.wal_bytes += frame.len() as u64;
        let lsn = self.next_lsn;
        self.next_lsn += 1;

        debug!(
            target: "entitydb::wal",
            lsn,
            op = ?op,
            offset = record_offset,
            bytes = frame.len(),
            "appended wal record"
        );

        Ok(AppendInfo {
            lsn,
            record_offset,
            payload_offset: record_offset + WAL_PAYLOAD_OFFSET,
            payload_len,
        })
    }

    /// Swap in a new header
    ///
    /// The current header is first copied to the fallback slot, so a torn
    /// primary write leaves a consistent prior header behind.
    pub fn write_header(&mut self, new: FileHeader) -> Result<()> {
        let prior = self.header.encode_slot();
        self.file.seek(SeekFrom::Start(HEADER_SLOT_SIZE as u64))?;
        self.file.write_all(&prior)?;
        self.file.sync_data()?;

        let slot = new.encode_slot();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&slot)?;
        self.file.sync_data()?;

        self.header = new;
        Ok(())
    }

    /// Drop a torn WAL tail
    pub fn truncate_to(&mut self, offset: u64) -> Result<()> {
        self.file.set_len(offset)?;
        self.file.sync_data()?;
        self.physical_end = offset;
        self.wal_bytes = offset.saturating_sub(self.header.file_size);
        Ok(())
    }

    /// Reset the WAL pressure counter after a checkpoint
    pub fn reset_wal_bytes(&mut self) {
        self.wal_bytes = 0;
    }

    /// Flush everything to the device
    pub fn sync_all(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Atomically rename this file over `target` (compaction swap)
    ///
    /// The open handle stays valid across the rename; only the path
    /// changes.
    pub fn rename_to(&mut self, target: impl AsRef<Path>) -> Result<()> {
        let target = target.as_ref().to_path_buf();
        std::fs::rename(&self.path, &target)?;
        self.path = target;
        Ok(())
    }
}
