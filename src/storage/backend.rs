use crate::core::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The backing tables the host database provides, per the persisted
/// layout:
///
/// - `data(id, block)`:    structure, averages, leaves, dlidx pages
/// - `idx(segid, term)`:   `(leafPgno << 1) | dlidxFlag` per leaf first-term
/// - `docsize(id, sz)`:    per-row varint token counts
/// - `content(id, c0..)`:  original row values
/// - `config(k, v)`:       key/value settings
///
/// Methods take `&self`: a backend models a shared database handle, and
/// the writer/reader split is enforced a level up. The host serializes
/// writers; nothing here blocks.
pub trait StorageBackend: Send {
    fn data_read(&self, id: i64) -> Result<Option<Vec<u8>>>;
    fn data_write(&self, id: i64, block: &[u8]) -> Result<()>;
    fn data_delete(&self, id: i64) -> Result<()>;
    /// Delete every data record with `first <= id <= last`.
    fn data_delete_range(&self, first: i64, last: i64) -> Result<()>;

    fn idx_write(&self, segid: u16, term: &[u8], pgno: i64) -> Result<()>;
    /// Largest entry for `segid` with key <= `term`.
    fn idx_seek(&self, segid: u16, term: &[u8]) -> Result<Option<(Vec<u8>, i64)>>;
    /// All entries for `segid`, in term order.
    fn idx_scan(&self, segid: u16) -> Result<Vec<(Vec<u8>, i64)>>;
    fn idx_delete_segment(&self, segid: u16) -> Result<()>;
    /// Drop entries for `segid` whose leaf page number is <= `pgno`.
    fn idx_delete_upto(&self, segid: u16, pgno: u32) -> Result<()>;

    fn docsize_read(&self, rowid: i64) -> Result<Option<Vec<u8>>>;
    fn docsize_write(&self, rowid: i64, sz: &[u8]) -> Result<()>;
    fn docsize_delete(&self, rowid: i64) -> Result<()>;
    fn docsize_scan(&self) -> Result<Vec<(i64, Vec<u8>)>>;

    fn content_read(&self, rowid: i64) -> Result<Option<Vec<u8>>>;
    fn content_write(&self, rowid: i64, row: &[u8]) -> Result<()>;
    fn content_delete(&self, rowid: i64) -> Result<()>;
    fn content_scan(&self) -> Result<Vec<(i64, Vec<u8>)>>;

    fn config_get(&self, key: &str) -> Result<Option<String>>;
    fn config_set(&self, key: &str, value: &str) -> Result<()>;

    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
}

/// In-memory table set, shared by the memory and file backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub data: BTreeMap<i64, Vec<u8>>,
    pub idx: BTreeMap<(u16, Vec<u8>), i64>,
    pub docsize: BTreeMap<i64, Vec<u8>>,
    pub content: BTreeMap<i64, Vec<u8>>,
    pub config: BTreeMap<String, String>,
}

/// Purely in-memory backend. Transactions snapshot the table set.
#[derive(Default)]
pub struct MemBackend {
    state: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    tables: Tables,
    snapshot: Option<Box<Tables>>,
}

impl MemBackend {
    pub fn new() -> Self {
        MemBackend::default()
    }

    /// Clone out the current table set (file backend snapshots).
    pub fn export(&self) -> Tables {
        self.state.lock().tables.clone()
    }

    /// Replace the table set wholesale, dropping any open snapshot.
    pub fn import(&self, tables: Tables) {
        let mut state = self.state.lock();
        state.tables = tables;
        state.snapshot = None;
    }
}

impl StorageBackend for MemBackend {
    fn data_read(&self, id: i64) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().tables.data.get(&id).cloned())
    }

    fn data_write(&self, id: i64, block: &[u8]) -> Result<()> {
        self.state.lock().tables.data.insert(id, block.to_vec());
        Ok(())
    }

    fn data_delete(&self, id: i64) -> Result<()> {
        self.state.lock().tables.data.remove(&id);
        Ok(())
    }

    fn data_delete_range(&self, first: i64, last: i64) -> Result<()> {
        let mut state = self.state.lock();
        let ids: Vec<i64> = state.tables.data.range(first..=last).map(|(&k, _)| k).collect();
        for id in ids {
            state.tables.data.remove(&id);
        }
        Ok(())
    }

    fn idx_write(&self, segid: u16, term: &[u8], pgno: i64) -> Result<()> {
        self.state.lock().tables.idx.insert((segid, term.to_vec()), pgno);
        Ok(())
    }

    fn idx_seek(&self, segid: u16, term: &[u8]) -> Result<Option<(Vec<u8>, i64)>> {
        let state = self.state.lock();
        Ok(state
            .tables
            .idx
            .range((segid, Vec::new())..=(segid, term.to_vec()))
            .next_back()
            .map(|((_, t), &v)| (t.clone(), v)))
    }

    fn idx_scan(&self, segid: u16) -> Result<Vec<(Vec<u8>, i64)>> {
        let state = self.state.lock();
        Ok(state
            .tables
            .idx
            .range((segid, Vec::new())..)
            .take_while(|((s, _), _)| *s == segid)
            .map(|((_, t), &v)| (t.clone(), v))
            .collect())
    }

    fn idx_delete_segment(&self, segid: u16) -> Result<()> {
        let mut state = self.state.lock();
        let keys: Vec<(u16, Vec<u8>)> = state
            .tables
            .idx
            .range((segid, Vec::new())..)
            .take_while(|((s, _), _)| *s == segid)
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            state.tables.idx.remove(&k);
        }
        Ok(())
    }

    fn idx_delete_upto(&self, segid: u16, pgno: u32) -> Result<()> {
        let mut state = self.state.lock();
        let keys: Vec<(u16, Vec<u8>)> = state
            .tables
            .idx
            .range((segid, Vec::new())..)
            .take_while(|((s, _), _)| *s == segid)
            .filter(|&(_, &v)| (v >> 1) as u32 <= pgno)
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            state.tables.idx.remove(&k);
        }
        Ok(())
    }

    fn docsize_read(&self, rowid: i64) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().tables.docsize.get(&rowid).cloned())
    }

    fn docsize_write(&self, rowid: i64, sz: &[u8]) -> Result<()> {
        self.state.lock().tables.docsize.insert(rowid, sz.to_vec());
        Ok(())
    }

    fn docsize_delete(&self, rowid: i64) -> Result<()> {
        self.state.lock().tables.docsize.remove(&rowid);
        Ok(())
    }

    fn docsize_scan(&self) -> Result<Vec<(i64, Vec<u8>)>> {
        let state = self.state.lock();
        Ok(state.tables.docsize.iter().map(|(&k, v)| (k, v.clone())).collect())
    }

    fn content_read(&self, rowid: i64) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().tables.content.get(&rowid).cloned())
    }

    fn content_write(&self, rowid: i64, row: &[u8]) -> Result<()> {
        self.state.lock().tables.content.insert(rowid, row.to_vec());
        Ok(())
    }

    fn content_delete(&self, rowid: i64) -> Result<()> {
        self.state.lock().tables.content.remove(&rowid);
        Ok(())
    }

    fn content_scan(&self) -> Result<Vec<(i64, Vec<u8>)>> {
        let state = self.state.lock();
        Ok(state.tables.content.iter().map(|(&k, v)| (k, v.clone())).collect())
    }

    fn config_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().tables.config.get(key).cloned())
    }

    fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .tables
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.snapshot.is_none() {
            let copy = state.tables.clone();
            state.snapshot = Some(Box::new(copy));
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.state.lock().snapshot = None;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(snap) = state.snapshot.take() {
            state.tables = *snap;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idx_seek_order() {
        let be = MemBackend::new();
        be.idx_write(7, b"apple", 2 << 1).unwrap();
        be.idx_write(7, b"melon", 5 << 1 | 1).unwrap();
        be.idx_write(8, b"banana", 9 << 1).unwrap();

        assert_eq!(be.idx_seek(7, b"apple").unwrap().unwrap().0, b"apple");
        assert_eq!(be.idx_seek(7, b"banana").unwrap().unwrap().0, b"apple");
        assert_eq!(be.idx_seek(7, b"zebra").unwrap().unwrap().0, b"melon");
        assert!(be.idx_seek(7, b"aardvark").unwrap().is_none());
        assert_eq!(be.idx_scan(7).unwrap().len(), 2);
        assert_eq!(be.idx_scan(8).unwrap().len(), 1);

        be.idx_delete_upto(7, 2).unwrap();
        assert_eq!(be.idx_scan(7).unwrap().len(), 1);
        be.idx_delete_segment(7).unwrap();
        assert!(be.idx_scan(7).unwrap().is_empty());
        assert_eq!(be.idx_scan(8).unwrap().len(), 1);
    }

    #[test]
    fn test_transaction_snapshot() {
        let be = MemBackend::new();
        be.data_write(1, b"one").unwrap();
        be.begin().unwrap();
        be.data_write(2, b"two").unwrap();
        be.data_delete(1).unwrap();
        be.rollback().unwrap();
        assert_eq!(be.data_read(1).unwrap().unwrap(), b"one");
        assert!(be.data_read(2).unwrap().is_none());

        be.begin().unwrap();
        be.data_write(2, b"two").unwrap();
        be.commit().unwrap();
        assert!(be.data_read(2).unwrap().is_some());
    }

    #[test]
    fn test_data_delete_range() {
        let be = MemBackend::new();
        for id in 0..10 {
            be.data_write(id, b"x").unwrap();
        }
        be.data_delete_range(3, 6).unwrap();
        for id in 0..10 {
            let present = be.data_read(id).unwrap().is_some();
            assert_eq!(present, !(3..=6).contains(&id));
        }
    }
}
