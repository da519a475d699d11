use crate::compression::poslist::PoslistWriter;
use crate::core::types::{Position, Rowid};
use crate::index::doclist::DoclistWriter;
use std::collections::HashMap;

/// Index-id byte prefixed to every term key: `b'0'` for the main index,
/// `b'0' + i` for the i-th prefix index. Main and prefix postings share
/// one sorted keyspace, so segments and merging stay uniform.
pub const MAIN_PREFIX: u8 = b'0';

pub fn term_key(index: usize, term: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(term.len() + 1);
    key.push(MAIN_PREFIX + index as u8);
    key.extend_from_slice(term);
    key
}

/// In-memory accumulator of postings between flushes.
///
/// Each entry holds a doclist in wire format plus the open (still
/// growing) row. Rowids within an entry are non-decreasing; the caller
/// flushes before writing a rowid at or below the last one written.
#[derive(Default)]
pub struct PendingIndex {
    entries: HashMap<Vec<u8>, PendingEntry>,
    /// Approximate bytes held; drives the flush-on-size decision.
    n_bytes: usize,
}

#[derive(Default)]
struct PendingEntry {
    /// Completed rows, wire doclist format.
    list: Vec<u8>,
    writer: DoclistWriter,
    open: bool,
    open_rowid: Rowid,
    open_delete: bool,
    open_poslist: Vec<u8>,
    open_writer: PoslistWriter,
}

impl PendingEntry {
    fn close_row(&mut self) -> usize {
        if !self.open {
            return 0;
        }
        let before = self.list.len();
        let rowid = self.open_rowid;
        let delete = self.open_delete;
        let pos = std::mem::take(&mut self.open_poslist);
        self.writer.append(&mut self.list, rowid, &pos, delete);
        self.open = false;
        self.list.len() - before
    }

    fn start_row(&mut self, rowid: Rowid, delete: bool) {
        debug_assert!(!self.open);
        self.open = true;
        self.open_rowid = rowid;
        self.open_delete = delete;
        self.open_poslist.clear();
        self.open_writer = PoslistWriter::new();
    }

    /// Wire-format snapshot including the open row.
    fn snapshot(&self) -> Vec<u8> {
        let mut out = self.list.clone();
        if self.open {
            let mut w = self.writer.clone();
            w.append(&mut out, self.open_rowid, &self.open_poslist, self.open_delete);
        }
        out
    }
}

impl PendingIndex {
    pub fn new() -> Self {
        PendingIndex::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    /// Record one token occurrence.
    pub fn write(&mut self, key: &[u8], rowid: Rowid, pos: Position) {
        let mut added = 0usize;
        if !self.entries.contains_key(key) {
            added += key.len() + 32;
            self.entries.insert(key.to_vec(), PendingEntry::default());
        }
        let e = self.entries.get_mut(key).unwrap();
        if !e.open || e.open_rowid != rowid || e.open_delete {
            added += e.close_row();
            e.start_row(rowid, false);
            added += 10; // rowid delta and size prefix, roughly
        }
        let before = e.open_poslist.len();
        e.open_writer.append(&mut e.open_poslist, pos);
        added += e.open_poslist.len() - before;
        self.n_bytes += added;
    }

    /// Record a delete marker: an empty poslist with the delete flag.
    pub fn write_delete(&mut self, key: &[u8], rowid: Rowid) {
        let mut added = 0usize;
        if !self.entries.contains_key(key) {
            added += key.len() + 32;
            self.entries.insert(key.to_vec(), PendingEntry::default());
        }
        let e = self.entries.get_mut(key).unwrap();
        if e.open && e.open_rowid == rowid && e.open_delete {
            return; // idempotent
        }
        added += e.close_row();
        e.start_row(rowid, true);
        self.n_bytes += added + 10;
    }

    /// Snapshot of one term's doclist, open row included.
    pub fn doclist_for(&self, key: &[u8]) -> Option<Vec<u8>> {
        let entry = self.entries.get(key)?;
        let snap = entry.snapshot();
        if snap.is_empty() { None } else { Some(snap) }
    }

    /// Sorted snapshot of every entry, in ascending key order. This is
    /// the synthetic segment the multi-iterator and the flush walk.
    pub fn scan(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = self
            .entries
            .iter()
            .filter_map(|(k, e)| {
                let snap = e.snapshot();
                if snap.is_empty() {
                    None
                } else {
                    Some((k.clone(), snap))
                }
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Entries with keys in `[lo, hi)`, sorted; used by prefix scans.
    pub fn scan_range(&self, lo: &[u8], hi: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = self
            .entries
            .iter()
            .filter(|(k, _)| k.as_slice() >= lo && k.as_slice() < hi)
            .filter_map(|(k, e)| {
                let snap = e.snapshot();
                if snap.is_empty() {
                    None
                } else {
                    Some((k.clone(), snap))
                }
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Drop everything but keep the slot allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.n_bytes = 0;
    }
}
