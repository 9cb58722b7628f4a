//! WAL recovery scan
//!
//! Reads the WAL region (everything past the checkpointed extent) and
//! parses records forward. The scan stops at the first structural failure
//! and reports where the valid prefix ends so the caller can truncate the
//! torn tail. Applying records against the index is the engine's job;
//! this layer only parses and frames.

use super::record::{WalRecord, WalRecordError, WAL_PAYLOAD_OFFSET};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use tracing::{debug, warn};

/// One parsed record plus where it lives in the file
#[derive(Debug, Clone)]
pub struct ScannedRecord {
    /// The parsed record
    pub record: WalRecord,
    /// Offset of the record frame
    pub record_offset: u64,
    /// Offset of the payload; entity blocks are addressed here
    pub payload_offset: u64,
}

/// Result of a forward scan
#[derive(Debug)]
pub struct WalScan {
    /// Records in log order
    pub records: Vec<ScannedRecord>,
    /// End of the last intact record; the truncation point for a torn tail
    pub valid_end: u64,
    /// Bytes past `valid_end` that failed to parse
    pub torn_bytes: u64,
}

impl WalScan {
    /// True if the region ended mid-record
    pub fn is_torn(&self) -> bool {
        self.torn_bytes > 0
    }

    /// Highest LSN seen, if any records parsed
    pub fn last_lsn(&self) -> Option<u64> {
        self.records.last().map(|r| r.record.lsn)
    }
}

/// Scan the WAL region starting at `start`
pub fn scan_wal(file: &mut File, start: u64) -> io::Result<WalScan> {
    let end = file.seek(SeekFrom::End(0))?;
    if start >= end {
        return Ok(WalScan {
            records: Vec::new(),
            valid_end: start,
            torn_bytes: 0,
        });
    }

    // The region is bounded by the checkpoint threshold, so reading it
    // whole is fine.
    let mut buf = vec![0u8; (end - start) as usize];
    file.seek(SeekFrom::Start(start))?;
    file.read_exact(&mut buf)?;

    let mut records = Vec::new();
    let mut pos = 0usize;
    loop {
        if pos == buf.len() {
            break;
        }
        match WalRecord::decode(&buf[pos..]) {
            Ok((record, consumed)) => {
                let record_offset = start + pos as u64;
                debug!(
                    target: "entitydb::wal",
                    lsn = record.lsn,
                    op = ?record.op,
                    offset = record_offset,
                    "scanned wal record"
                );
                records.push(ScannedRecord {
                    record,
                    record_offset,
                    payload_offset: record_offset + WAL_PAYLOAD_OFFSET,
                });
                pos += consumed;
            }
            Err(e) => {
                let torn = (buf.len() - pos) as u64;
                match e {
                    WalRecordError::Truncated | WalRecordError::BadLength(_) => {
                        warn!(
                            target: "entitydb::wal",
                            at = start + pos as u64,
                            bytes = torn,
                            "torn wal tail"
                        );
                    }
                    WalRecordError::CrcMismatch { .. } | WalRecordError::BadOp(_) => {
                        warn!(
                            target: "entitydb::wal",
                            at = start + pos as u64,
                            bytes = torn,
                            error = %e,
                            "invalid wal record, treating as torn tail"
                        );
                    }
                }
                return Ok(WalScan {
                    records,
                    valid_end: start + pos as u64,
                    torn_bytes: torn,
                });
            }
        }
    }

    Ok(WalScan {
        records,
        valid_end: end,
        torn_bytes: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::WalOp;
    use std::io::Write;
    use tempfile::tempfile;

    fn write_records(file: &mut File, records: &[WalRecord]) {
        for record in records {
            file.write_all(&record.encode()).unwrap();
        }
        file.flush().unwrap();
    }

    #[test]
    fn test_scan_empty_region() {
        let mut file = tempfile().unwrap();
        let scan = scan_wal(&mut file, 0).unwrap();
        assert!(scan.records.is_empty());
        assert!(!scan.is_torn());
        assert_eq!(scan.valid_end, 0);
    }

    #[test]
    fn test_scan_intact_records() {
        let mut file = tempfile().unwrap();
        let records = vec![
            WalRecord::new(1, WalOp::PutEntity, vec![1, 2, 3]),
            WalRecord::new(2, WalOp::DeleteEntity, b"e1".to_vec()),
            WalRecord::new(3, WalOp::PutChunk, vec![0; 100]),
        ];
        write_records(&mut file, &records);

        let scan = scan_wal(&mut file, 0).unwrap();
        assert_eq!(scan.records.len(), 3);
        assert!(!scan.is_torn());
        assert_eq!(scan.last_lsn(), Some(3));

        // Payload offsets point at the actual payload bytes.
        let first = &scan.records[0];
        assert_eq!(first.record_offset, 0);
        assert_eq!(first.payload_offset, WAL_PAYLOAD_OFFSET);
    }

    #[test]
    fn test_scan_stops_at_torn_record() {
        let mut file = tempfile().unwrap();
        let a = WalRecord::new(1, WalOp::PutEntity, vec![1, 2, 3]);
        let b = WalRecord::new(2, WalOp::PutEntity, vec![4, 5, 6]);
        write_records(&mut file, &[a.clone()]);
        let torn = &b.encode()[..10];
        file.write_all(torn).unwrap();

        let scan = scan_wal(&mut file, 0).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert!(scan.is_torn());
        assert_eq!(scan.valid_end, a.encoded_len() as u64);
        assert_eq!(scan.torn_bytes, 10);
    }

    #[test]
    fn test_scan_stops_at_crc_failure() {
        let mut file = tempfile().unwrap();
        let a = WalRecord::new(1, WalOp::PutEntity, vec![1, 2, 3]);
        let b = WalRecord::new(2, WalOp::PutEntity, vec![4, 5, 6]);
        let mut bytes = a.encode();
        let mut corrupt = b.encode();
        let mid = corrupt.len() / 2;
        corrupt[mid] ^= 0xFF;
        bytes.extend_from_slice(&corrupt);
        file.write_all(&bytes).unwrap();

        let scan = scan_wal(&mut file, 0).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert!(scan.is_torn());
        assert_eq!(scan.valid_end, a.encoded_len() as u64);
    }

    #[test]
    fn test_scan_garbage_only() {
        let mut file = tempfile().unwrap();
        file.write_all(&[0xFF; 64]).unwrap();
        let scan = scan_wal(&mut file, 0).unwrap();
        assert!(scan.records.is_empty());
        assert_eq!(scan.valid_end, 0);
        assert_eq!(scan.torn_bytes, 64);
    }

    #[test]
    fn test_scan_from_offset() {
        let mut file = tempfile().unwrap();
        file.write_all(&[0xAA; 128]).unwrap(); // pre-WAL data region
        let record = WalRecord::new(9, WalOp::PutEntity, vec![7]);
        file.write_all(&record.encode()).unwrap();

        let scan = scan_wal(&mut file, 128).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.records[0].record_offset, 128);
        assert_eq!(scan.records[0].payload_offset, 128 + WAL_PAYLOAD_OFFSET);
    }
}
