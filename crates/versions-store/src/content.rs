//! Content-addressed blob store.
//!
//! Every blob lives at `<root>/<sha256 hex>`. Writes are write-if-absent:
//! a blob that already exists is never rewritten, so concurrent writers of
//! identical content converge on one file.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::error::{Result, StoreError};

const TMP_PREFIX: &str = ".tmp-";

/// Lowercase hex SHA-256 digest of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = String::with_capacity(64);
        for b in digest.iter() {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        Self(out)
    }

    /// Accept only canonical digests so a hash can never name a path outside
    /// the store.
    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.len() == 64
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(StoreError::InvalidHash(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    /// Store `bytes` unless a blob with the same digest already exists.
    ///
    /// New blobs are written to a temp file in the same directory and renamed
    /// into place, so a reader never observes a partial blob under its final
    /// name. An existing blob whose length differs from `bytes` is reported
    /// as corruption rather than silently accepted.
    pub fn put(&self, bytes: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(bytes);
        let path = self.blob_path(&hash);

        match fs::metadata(&path) {
            Ok(meta) => {
                if !meta.is_file() || meta.len() != bytes.len() as u64 {
                    return Err(StoreError::ContentCorrupted {
                        hash: hash.to_string(),
                        expected_len: bytes.len() as u64,
                        found_len: meta.len(),
                    });
                }
                trace!(hash = %hash, "blob already stored");
                return Ok(hash);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }

        let tmp = self.root.join(format!(
            "{TMP_PREFIX}{}-{}",
            hash.as_str(),
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = write_synced(&tmp, bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(&tmp, e));
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(&path, e));
        }

        debug!(hash = %hash, bytes = bytes.len(), "stored blob");
        Ok(hash)
    }

    pub fn exists(&self, hash: &ContentHash) -> bool {
        self.blob_path(hash).is_file()
    }

    /// Read a blob back. `Ok(None)` when the store has no such blob.
    pub fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(hash);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Number of committed blobs (temp files excluded).
    pub fn blob_count(&self) -> Result<usize> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut count = 0;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(TMP_PREFIX) && ContentHash::parse(&name).is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_data()
}
