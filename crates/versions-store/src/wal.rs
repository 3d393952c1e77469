//! Append-only write-ahead log backing the snapshot graph.
//!
//! Framing: each record is a 4-byte little-endian length followed by a
//! bincode payload. A record is only meaningful inside a
//! `BeginTx .. CommitTx` bracket, except `Header` and `DeclareAttribute`
//! which take effect as soon as they are durable.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::{EntityId, EntityKind, ScalarValue, ValueKind};

pub const WAL_FORMAT_V1: &str = "versions_graph_wal_v1";

const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    Header {
        format: String,
        session_id: Uuid,
        created_at: i64,
    },
    DeclareAttribute {
        kind: EntityKind,
        name: String,
        value_kind: ValueKind,
    },
    BeginTx {
        tx_id: u64,
        timestamp: i64,
    },
    CreateEntity {
        tx_id: u64,
        id: EntityId,
        kind: EntityKind,
    },
    SetAttribute {
        tx_id: u64,
        id: EntityId,
        name: String,
        value: ScalarValue,
    },
    AddMember {
        tx_id: u64,
        owner: EntityId,
        member: EntityId,
    },
    CommitTx {
        tx_id: u64,
    },
}

impl WalRecord {
    pub fn tx_id(&self) -> Option<u64> {
        match self {
            WalRecord::BeginTx { tx_id, .. }
            | WalRecord::CreateEntity { tx_id, .. }
            | WalRecord::SetAttribute { tx_id, .. }
            | WalRecord::AddMember { tx_id, .. }
            | WalRecord::CommitTx { tx_id } => Some(*tx_id),
            WalRecord::Header { .. } | WalRecord::DeclareAttribute { .. } => None,
        }
    }
}

pub struct WriteAheadLog {
    file: Mutex<File>,
    path: PathBuf,
    writable: bool,
    poisoned: AtomicBool,
    #[cfg(test)]
    faults: Mutex<Faults>,
}

/// Failures injected into the next append.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Faults {
    /// Write this many bytes of the next append, then fail.
    pub(crate) write_after: Option<usize>,
    /// Fail the rollback of a failed append.
    pub(crate) rollback: bool,
}

impl WriteAheadLog {
    /// Open for appending, creating the file if needed. Readers may open the
    /// same path concurrently with [`WriteAheadLog::open_read_only`].
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            writable: true,
            poisoned: AtomicBool::new(false),
            #[cfg(test)]
            faults: Mutex::new(Faults::default()),
        })
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            writable: false,
            poisoned: AtomicBool::new(false),
            #[cfg(test)]
            faults: Mutex::new(Faults::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// True once an append failed and could not be rolled back.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> Result<u64> {
        let file = self.file.lock();
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| StoreError::io(&self.path, e))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn append(&self, record: &WalRecord) -> Result<u64> {
        self.append_all(std::slice::from_ref(record))
    }

    /// Append `records` with a single write followed by `sync_data`.
    ///
    /// On failure the file is cut back to its previous length so no partial
    /// frame survives in this process. If that cut fails too, the log is
    /// poisoned and this and every later append return
    /// [`StoreError::Poisoned`]. Returns the new log length.
    pub fn append_all(&self, records: &[WalRecord]) -> Result<u64> {
        if !self.writable {
            return Err(StoreError::ReadOnly(self.path.clone()));
        }
        if self.is_poisoned() {
            return Err(StoreError::Poisoned(self.path.clone()));
        }

        let mut buf = Vec::new();
        for record in records {
            let data = bincode::serialize(record)?;
            let len = u32::try_from(data.len()).map_err(|_| StoreError::Format {
                path: self.path.clone(),
                message: format!("record of {} bytes exceeds frame limit", data.len()),
            })?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&data);
        }

        let mut file = self.file.lock();
        let before = file
            .metadata()
            .map_err(|e| StoreError::io(&self.path, e))?
            .len();

        if let Err(e) = self.write_synced(&mut file, &buf) {
            if let Err(trunc) = self.roll_back(&file, before) {
                self.poisoned.store(true, Ordering::SeqCst);
                error!(
                    path = %self.path.display(),
                    write_error = %e,
                    error = %trunc,
                    "failed to roll back torn WAL append"
                );
                return Err(StoreError::Poisoned(self.path.clone()));
            }
            return Err(StoreError::io(&self.path, e));
        }

        Ok(before + buf.len() as u64)
    }

    fn write_synced(&self, file: &mut File, buf: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(n) = self.faults.lock().write_after.take() {
            file.write_all(&buf[..n.min(buf.len())])?;
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        file.write_all(buf)?;
        file.sync_data()
    }

    fn roll_back(&self, file: &File, len: u64) -> io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.faults.lock().rollback) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected rollback failure"));
        }
        file.set_len(len)?;
        file.sync_data()
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, faults: Faults) {
        *self.faults.lock() = faults;
    }

    /// Cut the log back to `len` bytes. Used when reopening a log whose tail
    /// holds an unfinished transaction or a torn frame.
    pub fn truncate_to(&self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(StoreError::ReadOnly(self.path.clone()));
        }
        let mut file = self.file.lock();
        file.set_len(len)
            .and_then(|_| file.sync_data())
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.seek(SeekFrom::End(0))
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }

    /// Decode every complete record starting at byte `offset`.
    ///
    /// Returns `(frame offset, record)` pairs and the offset just past the
    /// last complete frame. A partial frame at the tail (a writer mid-append
    /// or a crash) is left for the next call.
    pub fn read_from(&self, offset: u64) -> Result<(Vec<(u64, WalRecord)>, u64)> {
        let mut buf = Vec::new();
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| StoreError::io(&self.path, e))?;
            file.read_to_end(&mut buf)
                .map_err(|e| StoreError::io(&self.path, e))?;
        }

        let mut records = Vec::new();
        let mut pos = 0usize;
        while buf.len() - pos >= LEN_PREFIX {
            let mut len_bytes = [0u8; LEN_PREFIX];
            len_bytes.copy_from_slice(&buf[pos..pos + LEN_PREFIX]);
            let len = u32::from_le_bytes(len_bytes) as usize;

            let start = pos + LEN_PREFIX;
            if buf.len() - start < len {
                break;
            }
            let record: WalRecord =
                bincode::deserialize(&buf[start..start + len]).map_err(|e| StoreError::Format {
                    path: self.path.clone(),
                    message: format!("undecodable record at byte {}: {e}", offset + pos as u64),
                })?;
            records.push((offset + pos as u64, record));
            pos = start + len;
        }

        Ok((records, offset + pos as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn begin(tx_id: u64) -> WalRecord {
        WalRecord::BeginTx {
            tx_id,
            timestamp: 0,
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.wal");
        let wal = WriteAheadLog::open(&path).unwrap();

        let end = wal
            .append_all(&[begin(1), WalRecord::CommitTx { tx_id: 1 }])
            .unwrap();
        assert_eq!(end, wal.len().unwrap());

        let (frames, offset) = wal.read_from(0).unwrap();
        let records: Vec<_> = frames.into_iter().map(|(_, r)| r).collect();
        assert_eq!(records, vec![begin(1), WalRecord::CommitTx { tx_id: 1 }]);
        assert_eq!(offset, end);
    }

    #[test]
    fn test_incremental_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.wal");
        let wal = WriteAheadLog::open(&path).unwrap();
        let reader = WriteAheadLog::open_read_only(&path).unwrap();

        let first_end = wal.append(&begin(1)).unwrap();
        let (first, offset) = reader.read_from(0).unwrap();
        assert_eq!(first, vec![(0, begin(1))]);
        assert_eq!(offset, first_end);

        wal.append(&WalRecord::CommitTx { tx_id: 1 }).unwrap();
        let (second, _) = reader.read_from(offset).unwrap();
        assert_eq!(second, vec![(first_end, WalRecord::CommitTx { tx_id: 1 })]);
    }

    #[test]
    fn test_torn_tail_is_not_decoded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.wal");
        let wal = WriteAheadLog::open(&path).unwrap();
        let good_end = wal.append(&begin(7)).unwrap();

        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&200u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }

        let (frames, offset) = wal.read_from(0).unwrap();
        assert_eq!(frames, vec![(0, begin(7))]);
        assert_eq!(offset, good_end);
    }

    #[test]
    fn test_read_only_rejects_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.wal");
        WriteAheadLog::open(&path).unwrap();
        let reader = WriteAheadLog::open_read_only(&path).unwrap();
        assert!(matches!(
            reader.append(&begin(1)),
            Err(StoreError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.wal");
        let wal = WriteAheadLog::open(&path).unwrap();
        let committed = wal.append_all(&[begin(1), WalRecord::CommitTx { tx_id: 1 }]).unwrap();

        wal.inject(Faults {
            write_after: Some(6),
            ..Faults::default()
        });
        let err = wal
            .append_all(&[begin(2), WalRecord::CommitTx { tx_id: 2 }])
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(!err.is_fatal());
        assert_eq!(wal.len().unwrap(), committed);
        assert!(!wal.is_poisoned());

        let end = wal.append(&begin(3)).unwrap();
        let (frames, offset) = wal.read_from(0).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], (committed, begin(3)));
        assert_eq!(offset, end);
    }

    #[test]
    fn test_failed_rollback_poisons_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.wal");
        let wal = WriteAheadLog::open(&path).unwrap();
        let committed = wal.append(&WalRecord::CommitTx { tx_id: 1 }).unwrap();

        wal.inject(Faults {
            write_after: Some(6),
            rollback: true,
        });
        let err = wal.append(&begin(2)).unwrap_err();
        assert!(matches!(err, StoreError::Poisoned(_)));
        assert!(err.is_fatal());
        assert!(wal.is_poisoned());
        assert_eq!(wal.len().unwrap(), committed + 6);

        // Nothing more lands after the torn frame.
        assert!(matches!(
            wal.append(&begin(3)),
            Err(StoreError::Poisoned(_))
        ));
        assert_eq!(wal.len().unwrap(), committed + 6);

        let (frames, offset) = wal.read_from(0).unwrap();
        assert_eq!(frames, vec![(0, WalRecord::CommitTx { tx_id: 1 })]);
        assert_eq!(offset, committed);
    }

    #[test]
    fn test_read_only_missing_file() {
        let dir = tempdir().unwrap();
        let err = WriteAheadLog::open_read_only(&dir.path().join("absent.wal"))
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
