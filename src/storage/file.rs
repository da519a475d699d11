use crate::core::error::{Error, Result};
use crate::storage::backend::{MemBackend, StorageBackend, Tables};
use chrono::{DateTime, Utc};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: u32 = 0x5344_4d31; // "SDM1"
const VERSION: u32 = 1;

/// Snapshot image written on commit.
#[derive(Serialize, Deserialize)]
struct FileImage {
    created_at: DateTime<Utc>,
    tables: Tables,
}

/// File-backed backend: the whole table set is held in memory and
/// persisted as a checksummed, lz4-compressed bincode snapshot on
/// commit. Rollback reloads the last committed snapshot.
pub struct FileBackend {
    path: PathBuf,
    inner: MemBackend,
}

impl FileBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = MemBackend::new();
        if path.exists() {
            inner.import(Self::load(&path)?);
        }
        Ok(FileBackend { path, inner })
    }

    fn load(path: &Path) -> Result<Tables> {
        let mut file = File::open(path)?;
        let mut header = [0u8; 12];
        file.read_exact(&mut header)?;
        if u32::from_le_bytes(header[0..4].try_into().unwrap()) != MAGIC {
            return Err(Error::corrupt("bad snapshot magic"));
        }
        if u32::from_le_bytes(header[4..8].try_into().unwrap()) != VERSION {
            return Err(Error::corrupt("unsupported snapshot version"));
        }
        let expected_crc = u32::from_le_bytes(header[8..12].try_into().unwrap());

        let mut payload = Vec::new();
        file.read_to_end(&mut payload)?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            return Err(Error::corrupt("snapshot checksum mismatch"));
        }

        let raw = lz4_flex::decompress_size_prepended(&payload)
            .map_err(|e| Error::corrupt(&format!("snapshot decompression failed: {}", e)))?;
        let image: FileImage = bincode::deserialize(&raw)?;
        Ok(image.tables)
    }

    fn persist(&self) -> Result<()> {
        let image = FileImage {
            created_at: Utc::now(),
            tables: self.inner.export(),
        };
        let raw = bincode::serialize(&image)?;
        let payload = lz4_flex::compress_prepend_size(&raw);

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&MAGIC.to_le_bytes())?;
            file.write_all(&VERSION.to_le_bytes())?;
            file.write_all(&crc.to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn data_read(&self, id: i64) -> Result<Option<Vec<u8>>> {
        self.inner.data_read(id)
    }

    fn data_write(&self, id: i64, block: &[u8]) -> Result<()> {
        self.inner.data_write(id, block)
    }

    fn data_delete(&self, id: i64) -> Result<()> {
        self.inner.data_delete(id)
    }

    fn data_delete_range(&self, first: i64, last: i64) -> Result<()> {
        self.inner.data_delete_range(first, last)
    }

    fn idx_write(&self, segid: u16, term: &[u8], pgno: i64) -> Result<()> {
        self.inner.idx_write(segid, term, pgno)
    }

    fn idx_seek(&self, segid: u16, term: &[u8]) -> Result<Option<(Vec<u8>, i64)>> {
        self.inner.idx_seek(segid, term)
    }

    fn idx_scan(&self, segid: u16) -> Result<Vec<(Vec<u8>, i64)>> {
        self.inner.idx_scan(segid)
    }

    fn idx_delete_segment(&self, segid: u16) -> Result<()> {
        self.inner.idx_delete_segment(segid)
    }

    fn idx_delete_upto(&self, segid: u16, pgno: u32) -> Result<()> {
        self.inner.idx_delete_upto(segid, pgno)
    }

    fn docsize_read(&self, rowid: i64) -> Result<Option<Vec<u8>>> {
        self.inner.docsize_read(rowid)
    }

    fn docsize_write(&self, rowid: i64, sz: &[u8]) -> Result<()> {
        self.inner.docsize_write(rowid, sz)
    }

    fn docsize_delete(&self, rowid: i64) -> Result<()> {
        self.inner.docsize_delete(rowid)
    }

    fn docsize_scan(&self) -> Result<Vec<(i64, Vec<u8>)>> {
        self.inner.docsize_scan()
    }

    fn content_read(&self, rowid: i64) -> Result<Option<Vec<u8>>> {
        self.inner.content_read(rowid)
    }

    fn content_write(&self, rowid: i64, row: &[u8]) -> Result<()> {
        self.inner.content_write(rowid, row)
    }

    fn content_delete(&self, rowid: i64) -> Result<()> {
        self.inner.content_delete(rowid)
    }

    fn content_scan(&self) -> Result<Vec<(i64, Vec<u8>)>> {
        self.inner.content_scan()
    }

    fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.inner.config_get(key)
    }

    fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.config_set(key, value)
    }

    fn begin(&self) -> Result<()> {
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.persist()
    }

    fn rollback(&self) -> Result<()> {
        if self.path.exists() {
            self.inner.import(Self::load(&self.path)?);
        } else {
            self.inner.import(Tables::default());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.sdm");
        {
            let be = FileBackend::open(&path).unwrap();
            be.data_write(10, b"structure").unwrap();
            be.idx_write(3, b"term", 4).unwrap();
            be.config_set("version", "4").unwrap();
            be.commit().unwrap();
        }
        let be = FileBackend::open(&path).unwrap();
        assert_eq!(be.data_read(10).unwrap().unwrap(), b"structure");
        assert_eq!(be.idx_scan(3).unwrap().len(), 1);
        assert_eq!(be.config_get("version").unwrap().unwrap(), "4");
    }

    #[test]
    fn test_rollback_discards_uncommitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.sdm");
        let be = FileBackend::open(&path).unwrap();
        be.data_write(1, b"kept").unwrap();
        be.commit().unwrap();
        be.data_write(2, b"dropped").unwrap();
        be.rollback().unwrap();
        assert!(be.data_read(1).unwrap().is_some());
        assert!(be.data_read(2).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_snapshot_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.sdm");
        {
            let be = FileBackend::open(&path).unwrap();
            be.data_write(1, b"x").unwrap();
            be.commit().unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(FileBackend::open(&path).is_err());
    }
}
